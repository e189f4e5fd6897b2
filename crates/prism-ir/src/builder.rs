//! Instruction builder with an insertion cursor.

use crate::arena::Handle;
use crate::attributes::BindingPoint;
use crate::builtin::Builtin;
use crate::function::Function;
use crate::instruction::{BinaryOp, Block, InstKind, Instruction, Source, UnaryOp};
use crate::module::Module;
use crate::types::{Access, AddressSpace, Scalar, Type, TypeTable};
use crate::value::{Constant, Value};

/// Where newly built instructions are placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertionPoint {
    /// Instructions are created but not linked.
    Detached,
    /// Each instruction goes right before the anchor.
    Before(Handle<Instruction>),
    /// Instructions go after the anchor, in creation order.
    After(Handle<Instruction>),
    /// Instructions go at the start of the block, in creation order.
    Start(Handle<Block>),
    End(Handle<Block>),
}

/// Creates instructions at an [`InsertionPoint`].
///
/// Builders anchored on an instruction copy its source location onto every
/// instruction they create.
pub struct Builder<'m> {
    module: &'m mut Module,
    point: InsertionPoint,
    source: Option<Source>,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self {
            module,
            point: InsertionPoint::Detached,
            source: None,
        }
    }

    pub fn before(module: &'m mut Module, anchor: Handle<Instruction>) -> Self {
        let source = module.inst(anchor).source;
        Self {
            module,
            point: InsertionPoint::Before(anchor),
            source,
        }
    }

    pub fn after(module: &'m mut Module, anchor: Handle<Instruction>) -> Self {
        let source = module.inst(anchor).source;
        Self {
            module,
            point: InsertionPoint::After(anchor),
            source,
        }
    }

    pub fn at_start(module: &'m mut Module, block: Handle<Block>) -> Self {
        Self {
            module,
            point: InsertionPoint::Start(block),
            source: None,
        }
    }

    pub fn at_end(module: &'m mut Module, block: Handle<Block>) -> Self {
        Self {
            module,
            point: InsertionPoint::End(block),
            source: None,
        }
    }

    pub fn module(&self) -> &Module {
        self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    pub fn types(&mut self) -> &mut TypeTable {
        &mut self.module.types
    }

    pub fn point(&self) -> InsertionPoint {
        self.point
    }

    pub fn set_point(&mut self, point: InsertionPoint) {
        self.point = point;
    }

    pub fn set_source(&mut self, source: Option<Source>) {
        self.source = source;
    }

    /// Runs `f` with a temporary insertion point, restoring the current one.
    pub fn with_point<R>(&mut self, point: InsertionPoint, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = std::mem::replace(&mut self.point, point);
        let result = f(self);
        self.point = saved;
        result
    }

    /// Runs `f` appending to the end of `block`.
    pub fn append_to<R>(&mut self, block: Handle<Block>, f: impl FnOnce(&mut Self) -> R) -> R {
        self.with_point(InsertionPoint::End(block), f)
    }

    /// Links an existing instruction at the cursor.
    pub fn insert(&mut self, inst: Handle<Instruction>) -> Handle<Instruction> {
        match self.point {
            InsertionPoint::Detached => {}
            InsertionPoint::Before(anchor) => self.module.insert_before(anchor, inst),
            InsertionPoint::After(anchor) => {
                self.module.insert_after(anchor, inst);
                self.point = InsertionPoint::After(inst);
            }
            InsertionPoint::Start(block) => {
                self.module.prepend(block, inst);
                self.point = InsertionPoint::After(inst);
            }
            InsertionPoint::End(block) => self.module.append(block, inst),
        }
        inst
    }

    fn emit(
        &mut self,
        kind: InstKind,
        operands: Vec<Handle<Value>>,
        result_types: &[Handle<Type>],
    ) -> Handle<Instruction> {
        let inst = self.module.create_instruction(kind, operands, result_types);
        self.module.set_source(inst, self.source);
        self.insert(inst)
    }

    fn emit_value(
        &mut self,
        kind: InstKind,
        operands: Vec<Handle<Value>>,
        ty: Handle<Type>,
    ) -> Handle<Value> {
        let inst = self.emit(kind, operands, &[ty]);
        self.module.result(inst)
    }

    // ---- constants ----

    pub fn constant(&mut self, constant: Constant, ty: Handle<Type>) -> Handle<Value> {
        self.module.add_constant(constant, ty)
    }

    pub fn bool(&mut self, v: bool) -> Handle<Value> {
        let ty = self.module.types.bool();
        self.constant(Constant::Bool(v), ty)
    }

    pub fn i32(&mut self, v: i32) -> Handle<Value> {
        let ty = self.module.types.i32();
        self.constant(Constant::I32(v), ty)
    }

    pub fn u32(&mut self, v: u32) -> Handle<Value> {
        let ty = self.module.types.u32();
        self.constant(Constant::U32(v), ty)
    }

    pub fn f32(&mut self, v: f32) -> Handle<Value> {
        let ty = self.module.types.f32();
        self.constant(Constant::F32(v), ty)
    }

    pub fn f16(&mut self, v: f32) -> Handle<Value> {
        let ty = self.module.types.f16();
        self.constant(Constant::F16(v), ty)
    }

    pub fn str(&mut self, s: &str) -> Handle<Value> {
        let ty = self.module.types.string();
        self.constant(Constant::Str(s.to_string()), ty)
    }

    pub fn zero(&mut self, ty: Handle<Type>) -> Handle<Value> {
        self.constant(Constant::Zero, ty)
    }

    pub fn splat(&mut self, ty: Handle<Type>, element: Constant) -> Handle<Value> {
        self.constant(Constant::Splat(Box::new(element)), ty)
    }

    /// A scalar constant `1` of the given scalar type.
    pub fn one(&mut self, ty: Handle<Type>) -> Handle<Value> {
        let constant = match self.module.types.scalar_of(ty) {
            Some(s) if s == Scalar::I32 => Constant::I32(1),
            Some(s) if s == Scalar::U32 => Constant::U32(1),
            Some(s) if s == Scalar::F16 => Constant::F16(1.0),
            _ => Constant::F32(1.0),
        };
        if self.module.types.is_scalar(ty) {
            self.constant(constant, ty)
        } else {
            self.splat(ty, constant)
        }
    }

    // ---- arithmetic ----

    pub fn binary(
        &mut self,
        op: BinaryOp,
        ty: Handle<Type>,
        lhs: Handle<Value>,
        rhs: Handle<Value>,
    ) -> Handle<Value> {
        self.emit_value(InstKind::Binary(op), vec![lhs, rhs], ty)
    }

    pub fn add(&mut self, ty: Handle<Type>, lhs: Handle<Value>, rhs: Handle<Value>) -> Handle<Value> {
        self.binary(BinaryOp::Add, ty, lhs, rhs)
    }

    pub fn subtract(&mut self, ty: Handle<Type>, lhs: Handle<Value>, rhs: Handle<Value>) -> Handle<Value> {
        self.binary(BinaryOp::Subtract, ty, lhs, rhs)
    }

    pub fn multiply(&mut self, ty: Handle<Type>, lhs: Handle<Value>, rhs: Handle<Value>) -> Handle<Value> {
        self.binary(BinaryOp::Multiply, ty, lhs, rhs)
    }

    pub fn divide(&mut self, ty: Handle<Type>, lhs: Handle<Value>, rhs: Handle<Value>) -> Handle<Value> {
        self.binary(BinaryOp::Divide, ty, lhs, rhs)
    }

    pub fn equal(&mut self, ty: Handle<Type>, lhs: Handle<Value>, rhs: Handle<Value>) -> Handle<Value> {
        self.binary(BinaryOp::Equal, ty, lhs, rhs)
    }

    pub fn less_than(&mut self, ty: Handle<Type>, lhs: Handle<Value>, rhs: Handle<Value>) -> Handle<Value> {
        self.binary(BinaryOp::LessThan, ty, lhs, rhs)
    }

    pub fn unary(&mut self, op: UnaryOp, ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
        self.emit_value(InstKind::Unary(op), vec![value], ty)
    }

    pub fn negation(&mut self, ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
        self.unary(UnaryOp::Negation, ty, value)
    }

    pub fn convert(&mut self, ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
        self.emit_value(InstKind::Convert, vec![value], ty)
    }

    pub fn bitcast(&mut self, ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
        self.emit_value(InstKind::Bitcast, vec![value], ty)
    }

    // ---- composites ----

    pub fn construct(&mut self, ty: Handle<Type>, args: Vec<Handle<Value>>) -> Handle<Value> {
        self.emit_value(InstKind::Construct, args, ty)
    }

    /// `base[indices..]`. `ty` is the result type (a pointer when `base` is one).
    pub fn access(&mut self, ty: Handle<Type>, base: Handle<Value>, indices: &[Handle<Value>]) -> Handle<Value> {
        let mut operands = Vec::with_capacity(indices.len() + 1);
        operands.push(base);
        operands.extend_from_slice(indices);
        self.emit_value(InstKind::Access, operands, ty)
    }

    /// `base[index]` with a constant `u32` index.
    pub fn access_const(&mut self, ty: Handle<Type>, base: Handle<Value>, index: u32) -> Handle<Value> {
        let index = self.u32(index);
        self.access(ty, base, &[index])
    }

    pub fn swizzle(&mut self, ty: Handle<Type>, value: Handle<Value>, indices: Vec<u32>) -> Handle<Value> {
        self.emit_value(InstKind::Swizzle(indices), vec![value], ty)
    }

    // ---- memory ----

    /// Declares a `var` and returns the pointer it produces.
    pub fn var(&mut self, space: AddressSpace, store: Handle<Type>, access: Access) -> Handle<Value> {
        self.var_with(space, store, access, None, None)
    }

    pub fn var_with(
        &mut self,
        space: AddressSpace,
        store: Handle<Type>,
        access: Access,
        binding: Option<BindingPoint>,
        initializer: Option<Handle<Value>>,
    ) -> Handle<Value> {
        let ptr = self.module.types.pointer(space, store, access);
        let operands = initializer.into_iter().collect();
        self.emit_value(InstKind::Var { binding }, operands, ptr)
    }

    /// Loads through `ptr`.
    ///
    /// Panics if `ptr` is not a pointer.
    pub fn load(&mut self, ptr: Handle<Value>) -> Handle<Value> {
        let ptr_ty = self.module.value_type(ptr);
        let Some(ty) = self.module.types.store_type(ptr_ty) else {
            panic!("load from non-pointer value {ptr:?}");
        };
        self.emit_value(InstKind::Load, vec![ptr], ty)
    }

    pub fn store(&mut self, ptr: Handle<Value>, value: Handle<Value>) -> Handle<Instruction> {
        self.emit(InstKind::Store, vec![ptr, value], &[])
    }

    pub fn load_vector_element(&mut self, ptr: Handle<Value>, index: Handle<Value>) -> Handle<Value> {
        let ptr_ty = self.module.value_type(ptr);
        let store = self.module.types.store_type(ptr_ty);
        let Some(ty) = store.and_then(|s| self.module.types.element(s)) else {
            panic!("load_vector_element from non-vector pointer {ptr:?}");
        };
        self.emit_value(InstKind::LoadVectorElement, vec![ptr, index], ty)
    }

    pub fn store_vector_element(
        &mut self,
        ptr: Handle<Value>,
        index: Handle<Value>,
        value: Handle<Value>,
    ) -> Handle<Instruction> {
        self.emit(InstKind::StoreVectorElement, vec![ptr, index, value], &[])
    }

    pub fn let_(&mut self, value: Handle<Value>) -> Handle<Value> {
        let ty = self.module.value_type(value);
        self.emit_value(InstKind::Let, vec![value], ty)
    }

    // ---- calls ----

    pub fn call(&mut self, ty: Handle<Type>, builtin: impl Into<Builtin>, args: Vec<Handle<Value>>) -> Handle<Value> {
        self.call_explicit(ty, builtin, Vec::new(), args)
    }

    pub fn call_explicit(
        &mut self,
        ty: Handle<Type>,
        builtin: impl Into<Builtin>,
        explicit_types: Vec<Handle<Type>>,
        args: Vec<Handle<Value>>,
    ) -> Handle<Value> {
        let kind = InstKind::BuiltinCall {
            builtin: builtin.into(),
            explicit_types,
        };
        self.emit_value(kind, args, ty)
    }

    /// Calls a user function. The result has the function's return type
    /// (possibly void).
    pub fn call_user(&mut self, function: Handle<Function>, args: Vec<Handle<Value>>) -> Handle<Value> {
        let ty = self.module.function(function).return_type;
        self.emit_value(InstKind::UserCall(function), args, ty)
    }

    // ---- control flow ----

    /// Creates an `if` with empty true/false blocks.
    pub fn if_(&mut self, condition: Handle<Value>) -> Handle<Instruction> {
        let true_block = self.module.create_block();
        let false_block = self.module.create_block();
        self.emit(
            InstKind::If {
                true_block,
                false_block,
            },
            vec![condition],
            &[],
        )
    }

    /// Creates a `loop` with empty initializer, body and continuing blocks.
    pub fn loop_(&mut self) -> Handle<Instruction> {
        let initializer = self.module.create_block();
        let body = self.module.create_block();
        let continuing = self.module.create_block();
        self.emit(
            InstKind::Loop {
                initializer,
                body,
                continuing,
            },
            Vec::new(),
            &[],
        )
    }

    pub fn return_(&mut self, value: Option<Handle<Value>>) -> Handle<Instruction> {
        self.emit(InstKind::Return, value.into_iter().collect(), &[])
    }

    pub fn exit_if(&mut self) -> Handle<Instruction> {
        self.emit(InstKind::ExitIf, Vec::new(), &[])
    }

    pub fn exit_loop(&mut self) -> Handle<Instruction> {
        self.emit(InstKind::ExitLoop, Vec::new(), &[])
    }

    pub fn continue_(&mut self) -> Handle<Instruction> {
        self.emit(InstKind::Continue, Vec::new(), &[])
    }

    pub fn next_iteration(&mut self) -> Handle<Instruction> {
        self.emit(InstKind::NextIteration, Vec::new(), &[])
    }

    pub fn break_if(&mut self, condition: Handle<Value>) -> Handle<Instruction> {
        self.emit(InstKind::BreakIf, vec![condition], &[])
    }

    pub fn unreachable(&mut self) -> Handle<Instruction> {
        self.emit(InstKind::Unreachable, Vec::new(), &[])
    }
}
