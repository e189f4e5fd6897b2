//! Shared helpers for the transform integration tests: module scaffolding and
//! a small interpreter for straight-line IR.

use std::collections::HashMap;

#[allow(unused_imports)]
use prism_ir::{
    BinaryOp, Block, Capabilities, Constant, Function, Handle, InstKind, Module, PipelineStage,
    ScalarKind, Type, TypeTable, UnaryOp, Value, ValueKind, validate,
};

/// Declares a `@compute @workgroup_size(1, 1, 1)` entry point.
#[allow(dead_code)]
pub fn compute_entry(module: &mut Module, name: &str) -> (Handle<Function>, Handle<Block>) {
    let void = module.types.void();
    let f = module.new_function(name, void);
    module.function_mut(f).stage = Some(PipelineStage::Compute);
    module.function_mut(f).workgroup_size = Some([1, 1, 1]);
    let body = module.function(f).body();
    (f, body)
}

#[allow(dead_code)]
#[track_caller]
pub fn assert_valid(module: &Module, capabilities: Capabilities) {
    if let Err(e) = validate(module, "test", capabilities) {
        panic!("{e}\n{}", prism_ir::disassemble(module));
    }
}

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    Bool(bool),
    Int(i64),
    Float(f64),
    Composite(Vec<Val>),
    /// A place: the producing `var` and the access path into it.
    Pointer(Handle<Value>, Vec<usize>),
}

impl Val {
    #[allow(dead_code)]
    pub fn as_float(&self) -> f64 {
        match *self {
            Self::Float(v) => v,
            Self::Int(v) => v as f64,
            ref other => panic!("not a number: {other:?}"),
        }
    }

    /// Column-major matrix as `[column][row]`.
    #[allow(dead_code)]
    pub fn as_matrix(&self) -> Vec<Vec<f64>> {
        self.components()
            .iter()
            .map(|column| column.components().iter().map(Val::as_float).collect())
            .collect()
    }

    pub fn components(&self) -> &[Val] {
        match self {
            Self::Composite(values) => values,
            other => panic!("not a composite: {other:?}"),
        }
    }
}

/// Evaluates functions made of straight-line code: no `if` or `loop`.
pub struct Interpreter<'m> {
    module: &'m Module,
    memory: HashMap<Handle<Value>, Val>,
}

#[allow(dead_code)]
impl<'m> Interpreter<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            memory: HashMap::new(),
        }
    }

    /// Contents of the variable whose pointer is `var`.
    pub fn memory(&self, var: Handle<Value>) -> Option<&Val> {
        self.memory.get(&var)
    }

    /// Runs `function` and returns its result, if any.
    pub fn call(&mut self, function: Handle<Function>, args: Vec<Val>) -> Option<Val> {
        let module = self.module;
        let f = module.function(function);
        let mut env: HashMap<Handle<Value>, Val> = f.params().iter().map(|p| p.value).zip(args).collect();
        for &inst in module.block(f.body()).instructions() {
            let operands: Vec<Val> = module
                .operands(inst)
                .iter()
                .map(|&v| self.value(&env, v))
                .collect();
            let result = module.inst(inst).result();
            let value = match *module.kind(inst) {
                InstKind::Return => return operands.into_iter().next(),
                InstKind::Let => operands[0].clone(),
                InstKind::Construct => Val::Composite(operands),
                InstKind::Access => access(operands),
                InstKind::Binary(op) => elementwise2(&operands[0], &operands[1], &|a, b| binary(op, a, b)),
                InstKind::Unary(op) => elementwise1(&operands[0], &|a| unary(op, a)),
                InstKind::Convert => {
                    let ty = module.value_type(result.expect("convert result"));
                    let float = module.types.is_float(ty);
                    elementwise1(&operands[0], &|a| convert(a, float))
                }
                InstKind::Var { .. } => {
                    let ptr = result.expect("var result");
                    let store = module.types.store_type(module.value_type(ptr)).expect("pointer");
                    let init = operands
                        .into_iter()
                        .next()
                        .unwrap_or_else(|| zero(&module.types, store));
                    self.memory.insert(ptr, init);
                    Val::Pointer(ptr, Vec::new())
                }
                InstKind::Load => self.load(&operands[0]),
                InstKind::Store => {
                    self.store(&operands[0], operands[1].clone());
                    continue;
                }
                InstKind::UserCall(callee) => match self.call(callee, operands) {
                    Some(v) => v,
                    None => continue,
                },
                ref other => panic!("cannot interpret `{}`", other.mnemonic()),
            };
            if let Some(result) = result {
                env.insert(result, value);
            }
        }
        None
    }

    fn value(&self, env: &HashMap<Handle<Value>, Val>, value: Handle<Value>) -> Val {
        if let Some(v) = env.get(&value) {
            return v.clone();
        }
        match &self.module.value(value).kind {
            ValueKind::Constant(c) => constant(&self.module.types, c, self.module.value_type(value)),
            other => panic!("value {value:?} is not available: {other:?}"),
        }
    }

    fn load(&self, ptr: &Val) -> Val {
        let Val::Pointer(var, path) = ptr else {
            panic!("load through a non-pointer");
        };
        let mut current = &self.memory[var];
        for &i in path {
            current = &current.components()[i];
        }
        current.clone()
    }

    fn store(&mut self, ptr: &Val, value: Val) {
        let Val::Pointer(var, path) = ptr else {
            panic!("store through a non-pointer");
        };
        let mut current = self.memory.get_mut(var).expect("store to an unknown variable");
        for &i in path {
            let Val::Composite(values) = current else {
                panic!("store path through a scalar");
            };
            current = &mut values[i];
        }
        *current = value;
    }
}

fn access(mut operands: Vec<Val>) -> Val {
    let indices: Vec<usize> = operands
        .drain(1..)
        .map(|v| match v {
            Val::Int(i) => i as usize,
            other => panic!("bad index {other:?}"),
        })
        .collect();
    match operands.pop().expect("access base") {
        Val::Pointer(var, mut path) => {
            path.extend(indices);
            Val::Pointer(var, path)
        }
        mut value => {
            for i in indices {
                value = value.components()[i].clone();
            }
            value
        }
    }
}

fn elementwise1(a: &Val, f: &dyn Fn(&Val) -> Val) -> Val {
    match a {
        Val::Composite(values) => Val::Composite(values.iter().map(|v| elementwise1(v, f)).collect()),
        scalar => f(scalar),
    }
}

/// Applies `f` per component, splatting a scalar side.
fn elementwise2(a: &Val, b: &Val, f: &dyn Fn(&Val, &Val) -> Val) -> Val {
    match (a, b) {
        (Val::Composite(x), Val::Composite(y)) => {
            Val::Composite(x.iter().zip(y).map(|(x, y)| elementwise2(x, y, f)).collect())
        }
        (Val::Composite(x), scalar) => Val::Composite(x.iter().map(|x| elementwise2(x, scalar, f)).collect()),
        (scalar, Val::Composite(y)) => Val::Composite(y.iter().map(|y| elementwise2(scalar, y, f)).collect()),
        (x, y) => f(x, y),
    }
}

fn binary(op: BinaryOp, a: &Val, b: &Val) -> Val {
    match (a, b) {
        (&Val::Float(x), &Val::Float(y)) => match op {
            BinaryOp::Add => Val::Float(x + y),
            BinaryOp::Subtract => Val::Float(x - y),
            BinaryOp::Multiply => Val::Float(x * y),
            BinaryOp::Divide => Val::Float(x / y),
            BinaryOp::LessThan => Val::Bool(x < y),
            BinaryOp::GreaterThanEqual => Val::Bool(x >= y),
            _ => panic!("unsupported float op {op:?}"),
        },
        (&Val::Int(x), &Val::Int(y)) => match op {
            BinaryOp::Add => Val::Int(x + y),
            BinaryOp::Subtract => Val::Int(x - y),
            BinaryOp::Multiply => Val::Int(x * y),
            BinaryOp::Divide => Val::Int(x / y),
            BinaryOp::LessThan => Val::Bool(x < y),
            BinaryOp::GreaterThanEqual => Val::Bool(x >= y),
            _ => panic!("unsupported integer op {op:?}"),
        },
        _ => panic!("mismatched operands {a:?} {b:?}"),
    }
}

fn unary(op: UnaryOp, a: &Val) -> Val {
    match (op, a) {
        (UnaryOp::Negation, &Val::Float(x)) => Val::Float(-x),
        (UnaryOp::Negation, &Val::Int(x)) => Val::Int(-x),
        (UnaryOp::Not, &Val::Bool(x)) => Val::Bool(!x),
        _ => panic!("unsupported unary {op:?} on {a:?}"),
    }
}

fn convert(a: &Val, to_float: bool) -> Val {
    match (a, to_float) {
        (&Val::Float(x), true) => Val::Float(x),
        (&Val::Float(x), false) => Val::Int(x.trunc() as i64),
        (&Val::Int(x), true) => Val::Float(x as f64),
        (&Val::Int(x), false) => Val::Int(x),
        (&Val::Bool(x), _) => Val::Int(i64::from(x)),
        _ => panic!("cannot convert {a:?}"),
    }
}

/// Element type of a vector, matrix or array type.
fn element(types: &TypeTable, ty: Handle<Type>) -> Handle<Type> {
    let element = match types[ty] {
        Type::Vector { scalar, .. } => types.lookup(&Type::Scalar(scalar)),
        Type::Matrix { rows, scalar, .. } => types.lookup(&Type::Vector { size: rows, scalar }),
        Type::Array { base, .. } => Some(base),
        _ => None,
    };
    element.unwrap_or_else(|| panic!("no element type for {}", types.name(ty)))
}

fn components(types: &TypeTable, ty: Handle<Type>) -> Vec<Handle<Type>> {
    if let Some(def) = types.struct_def(ty) {
        return def.members.iter().map(|m| m.ty).collect();
    }
    let count = types.element_count(ty).unwrap_or(0);
    vec![element(types, ty); count as usize]
}

fn scalar(c: &Constant) -> Val {
    match *c {
        Constant::Bool(v) => Val::Bool(v),
        Constant::I32(v) => Val::Int(i64::from(v)),
        Constant::U32(v) => Val::Int(i64::from(v)),
        Constant::F32(v) | Constant::F16(v) => Val::Float(f64::from(v)),
        ref other => panic!("not a scalar constant: {other:?}"),
    }
}

fn constant(types: &TypeTable, c: &Constant, ty: Handle<Type>) -> Val {
    match c {
        Constant::Zero => zero(types, ty),
        Constant::Splat(element) => Val::Composite(
            components(types, ty)
                .into_iter()
                .map(|ty| constant(types, element, ty))
                .collect(),
        ),
        Constant::Composite(elements) => Val::Composite(
            elements
                .iter()
                .zip(components(types, ty))
                .map(|(c, ty)| constant(types, c, ty))
                .collect(),
        ),
        c => scalar(c),
    }
}

fn zero(types: &TypeTable, ty: Handle<Type>) -> Val {
    match types[ty] {
        Type::Scalar(s) => match s.kind {
            ScalarKind::Bool => Val::Bool(false),
            ScalarKind::Float => Val::Float(0.0),
            ScalarKind::Sint | ScalarKind::Uint => Val::Int(0),
        },
        _ => Val::Composite(components(types, ty).into_iter().map(|ty| zero(types, ty)).collect()),
    }
}
