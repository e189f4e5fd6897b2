//! Structural and type validation of a module.
//!
//! The validator runs before and after every pass. It never modifies the
//! module; all problems are collected into a [`ValidationError`].

use std::collections::HashSet;

use crate::arena::Handle;
use crate::attributes::{BindingPoint, PipelineStage};
use crate::error::{Diagnostic, IrError, ValidationError};
use crate::function::Function;
use crate::instruction::{Block, InstKind, Instruction};
use crate::module::Module;
use crate::types::{Access, AddressSpace, ArraySize, Scalar, ScalarKind, Type};
use crate::value::{Usage, Value, ValueKind};

/// Features the module is allowed to use.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const EMPTY: Self = Self(0);
    /// Two resource variables may share a binding point.
    pub const ALLOW_DUPLICATE_BINDINGS: Self = Self(1);
    /// The module may contain more than one entry point.
    pub const ALLOW_MULTIPLE_ENTRY_POINTS: Self = Self(2);
    /// Combined image/samplers and explicit-layout arrays may appear.
    pub const ALLOW_NON_CORE_TYPES: Self = Self(4);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `self | other`, usable in constants.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The innermost construct enclosing a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Construct {
    Function,
    If,
    LoopInitializer,
    LoopBody,
    LoopContinuing,
}

#[derive(Clone, Copy, Debug)]
struct Context {
    construct: Construct,
    in_loop_body: bool,
}

/// Validates `module`, attributing failures to `pass`.
pub fn validate(module: &Module, pass: &str, capabilities: Capabilities) -> Result<(), ValidationError> {
    let mut validator = Validator {
        module,
        capabilities,
        diagnostics: Vec::new(),
        visible: HashSet::new(),
        scope: Vec::new(),
        function: None,
    };
    validator.run();
    if validator.diagnostics.is_empty() {
        return Ok(());
    }
    for diagnostic in &validator.diagnostics {
        log::warn!("{pass}: {diagnostic}");
    }
    Err(ValidationError {
        pass: pass.to_string(),
        diagnostics: validator.diagnostics,
    })
}

struct Validator<'a> {
    module: &'a Module,
    capabilities: Capabilities,
    diagnostics: Vec<Diagnostic>,
    /// Values usable at the current point.
    visible: HashSet<Handle<Value>>,
    /// Values in `visible`, in definition order, for scope unwinding.
    scope: Vec<Handle<Value>>,
    function: Option<Handle<Function>>,
}

impl Validator<'_> {
    fn error(&mut self, instruction: Option<Handle<Instruction>>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            instruction,
            message: message.into(),
        });
    }

    fn define(&mut self, value: Handle<Value>) {
        if self.visible.insert(value) {
            self.scope.push(value);
        }
    }

    fn unwind(&mut self, depth: usize) {
        for value in self.scope.drain(depth..) {
            self.visible.remove(&value);
        }
    }

    fn type_name(&self, ty: Handle<Type>) -> String {
        self.module.types.name(ty)
    }

    fn run(&mut self) {
        let module = self.module;
        let entry_points = module.entry_points();
        if entry_points.len() > 1
            && !self
                .capabilities
                .contains(Capabilities::ALLOW_MULTIPLE_ENTRY_POINTS)
        {
            self.error(
                None,
                format!("module has {} entry points", entry_points.len()),
            );
        }

        self.root_block();

        for &function in module.functions() {
            self.function(function);
        }
    }

    fn root_block(&mut self) {
        let module = self.module;
        let mut bindings: HashSet<BindingPoint> = HashSet::new();
        for &inst in module.block(module.root()).instructions() {
            let InstKind::Var { binding } = module.kind(inst) else {
                self.error(Some(inst), "only `var` instructions may appear in the root block");
                continue;
            };
            self.instruction(inst, module.root());
            if let Some(binding) = binding {
                if !bindings.insert(*binding)
                    && !self
                        .capabilities
                        .contains(Capabilities::ALLOW_DUPLICATE_BINDINGS)
                {
                    self.error(
                        Some(inst),
                        format!(
                            "duplicate binding @group({}) @binding({})",
                            binding.group, binding.binding
                        ),
                    );
                }
            }
            for &r in module.results(inst) {
                self.define(r);
            }
        }
    }

    fn function(&mut self, function: Handle<Function>) {
        let module = self.module;
        let f = module.function(function);
        if !f.is_alive() {
            self.error(None, format!("function '{}' is dead but still listed", f.name));
            return;
        }
        if f.stage == Some(PipelineStage::Compute) && f.workgroup_size.is_none() {
            self.error(None, format!("compute entry point '{}' has no workgroup size", f.name));
        }
        self.function = Some(function);
        let depth = self.scope.len();
        for (index, param) in f.params().iter().enumerate() {
            match module.try_value(param.value) {
                Ok(v) if v.kind == (ValueKind::Param { function, index }) => {}
                Ok(_) => self.error(
                    None,
                    format!("parameter {index} of '{}' is not bound to it", f.name),
                ),
                Err(e) => self.error(None, e.to_string()),
            }
            self.define(param.value);
        }
        let ctx = Context {
            construct: Construct::Function,
            in_loop_body: false,
        };
        let body = f.body();
        self.block(body, ctx);
        let terminated = module
            .block(body)
            .last()
            .is_some_and(|i| matches!(module.kind(i), InstKind::Return | InstKind::Unreachable));
        if !terminated {
            self.error(None, format!("function '{}' does not end with a return", f.name));
        }
        self.unwind(depth);
        self.function = None;
    }

    fn block(&mut self, block: Handle<Block>, ctx: Context) {
        let depth = self.scope.len();
        self.block_contents(block, ctx);
        self.unwind(depth);
    }

    /// Validates the instructions of `block`, leaving its definitions visible.
    fn block_contents(&mut self, block: Handle<Block>, ctx: Context) {
        let module = self.module;
        let insts = module.block(block).instructions();
        for (position, &inst) in insts.iter().enumerate() {
            let kind = module.kind(inst);
            if kind.is_terminator() && position + 1 != insts.len() {
                self.error(Some(inst), "terminator is not the last instruction of its block");
            }
            self.instruction(inst, block);
            self.terminator(inst, ctx);
            match *kind {
                InstKind::If {
                    true_block,
                    false_block,
                } => {
                    let nested = Context {
                        construct: Construct::If,
                        ..ctx
                    };
                    self.terminated_block(inst, true_block, nested, false);
                    self.terminated_block(inst, false_block, nested, true);
                }
                InstKind::Loop {
                    initializer,
                    body,
                    continuing,
                } => {
                    let depth = self.scope.len();
                    let init_ctx = Context {
                        construct: Construct::LoopInitializer,
                        in_loop_body: false,
                    };
                    self.block_contents(initializer, init_ctx);
                    self.check_terminated(inst, initializer, true);
                    let body_ctx = Context {
                        construct: Construct::LoopBody,
                        in_loop_body: true,
                    };
                    self.block_contents(body, body_ctx);
                    self.check_terminated(inst, body, false);
                    let continuing_ctx = Context {
                        construct: Construct::LoopContinuing,
                        in_loop_body: false,
                    };
                    self.block_contents(continuing, continuing_ctx);
                    self.check_terminated(inst, continuing, true);
                    self.unwind(depth);
                }
                _ => {}
            }
            for &r in module.results(inst) {
                self.define(r);
            }
        }
    }

    fn terminated_block(&mut self, owner: Handle<Instruction>, block: Handle<Block>, ctx: Context, may_be_empty: bool) {
        self.block(block, ctx);
        self.check_terminated(owner, block, may_be_empty);
    }

    fn check_terminated(&mut self, owner: Handle<Instruction>, block: Handle<Block>, may_be_empty: bool) {
        let module = self.module;
        match module.block(block).last() {
            None if may_be_empty => {}
            None => self.error(Some(owner), "block is empty"),
            Some(last) if !module.kind(last).is_terminator() => {
                self.error(Some(owner), "block does not end with a terminator")
            }
            Some(_) => {}
        }
    }

    fn terminator(&mut self, inst: Handle<Instruction>, ctx: Context) {
        let module = self.module;
        let ok = match module.kind(inst) {
            InstKind::ExitIf => ctx.construct == Construct::If,
            InstKind::ExitLoop | InstKind::Continue => ctx.in_loop_body,
            InstKind::NextIteration => matches!(
                ctx.construct,
                Construct::LoopInitializer | Construct::LoopContinuing
            ),
            InstKind::BreakIf => ctx.construct == Construct::LoopContinuing,
            _ => true,
        };
        if !ok {
            let name = module.kind(inst).mnemonic();
            self.error(Some(inst), format!("`{name}` is not valid in this construct"));
        }
    }

    fn instruction(&mut self, inst: Handle<Instruction>, block: Handle<Block>) {
        let module = self.module;
        let instruction = match module.try_inst(inst) {
            Ok(i) => i,
            Err(e) => {
                self.error(None, e.to_string());
                return;
            }
        };
        if !instruction.is_alive() {
            self.error(Some(inst), "destroyed instruction is still linked");
            return;
        }
        if instruction.block() != Some(block) {
            self.error(Some(inst), "instruction has a stale block reference");
        }
        self.operands(inst, instruction);
        self.results(inst, instruction);
        self.types(inst, instruction);
    }

    fn operands(&mut self, inst: Handle<Instruction>, instruction: &Instruction) {
        let module = self.module;
        for (index, &op) in instruction.operands().iter().enumerate() {
            let value = match module.try_value(op) {
                Ok(v) => v,
                Err(e) => {
                    self.error(Some(inst), e.to_string());
                    continue;
                }
            };
            let usage = Usage {
                instruction: inst,
                operand: index,
            };
            if !value.uses().contains(&usage) {
                self.error(Some(inst), format!("operand {index} is missing from its use list"));
            }
            match value.kind {
                ValueKind::Constant(_) => {}
                ValueKind::Result { instruction: None } => {
                    let e = IrError::DetachedValue { index: op.index() };
                    self.error(Some(inst), e.to_string());
                }
                ValueKind::Result { .. } | ValueKind::Param { .. } => {
                    if !self.visible.contains(&op) {
                        self.error(
                            Some(inst),
                            format!("operand {index} ({op:?}) does not dominate its use"),
                        );
                    }
                }
            }
        }
    }

    fn results(&mut self, inst: Handle<Instruction>, instruction: &Instruction) {
        let module = self.module;
        let produces = !matches!(
            instruction.kind,
            InstKind::Store
                | InstKind::StoreVectorElement
                | InstKind::If { .. }
                | InstKind::Loop { .. }
        ) && !instruction.kind.is_terminator();
        let expected = usize::from(produces);
        if instruction.results().len() != expected {
            self.error(
                Some(inst),
                format!(
                    "`{}` has {} results, expected {expected}",
                    instruction.kind.mnemonic(),
                    instruction.results().len()
                ),
            );
        }
        for &r in instruction.results() {
            let value = module.value(r);
            if value.kind != (ValueKind::Result { instruction: Some(inst) }) {
                self.error(Some(inst), "result is not bound to its instruction");
            }
            for usage in value.uses() {
                let user = module.inst(usage.instruction);
                if !user.is_alive() || user.operands().get(usage.operand) != Some(&r) {
                    self.error(Some(inst), format!("stale use {usage:?} of result {r:?}"));
                }
            }
            if module.types[value.ty] == Type::Void && !value.uses().is_empty() {
                self.error(Some(inst), "void result is used");
            }
            if !self.capabilities.contains(Capabilities::ALLOW_NON_CORE_TYPES) && self.is_non_core(value.ty) {
                let name = self.type_name(value.ty);
                self.error(Some(inst), format!("non-core type {name}"));
            }
        }
    }

    fn is_non_core(&self, ty: Handle<Type>) -> bool {
        let types = &self.module.types;
        match types[ty] {
            Type::SampledImage { .. } => true,
            Type::Array { stride: Some(_), .. } => true,
            Type::Array { base, .. } => self.is_non_core(base),
            Type::Pointer { store, .. } => self.is_non_core(store),
            Type::Struct(_) => types
                .struct_def(ty)
                .is_some_and(|def| def.members.iter().any(|m| self.is_non_core(m.ty))),
            _ => false,
        }
    }

    fn expect_type(&mut self, inst: Handle<Instruction>, what: &str, expected: Handle<Type>, found: Handle<Type>) {
        if expected != found {
            let e = IrError::TypeMismatch {
                expected: self.type_name(expected),
                found: self.type_name(found),
            };
            self.error(Some(inst), format!("{what}: {e}"));
        }
    }

    fn expect_operands(&mut self, inst: Handle<Instruction>, instruction: &Instruction, count: usize) -> bool {
        if instruction.operands().len() != count {
            self.error(
                Some(inst),
                format!(
                    "`{}` has {} operands, expected {count}",
                    instruction.kind.mnemonic(),
                    instruction.operands().len()
                ),
            );
            return false;
        }
        true
    }

    fn types(&mut self, inst: Handle<Instruction>, instruction: &Instruction) {
        let module = self.module;
        let types = &module.types;
        let ty = |v: Handle<Value>| module.value_type(v);
        let result = instruction.result().map(ty);
        let ops = instruction.operands();

        match instruction.kind {
            InstKind::Binary(op) => {
                if !self.expect_operands(inst, instruction, 2) {
                    return;
                }
                let (lhs, rhs) = (ty(ops[0]), ty(ops[1]));
                let (Some(ls), Some(rs)) = (types.scalar_of(lhs), types.scalar_of(rhs)) else {
                    self.error(Some(inst), "binary operands must be scalars, vectors or matrices");
                    return;
                };
                if op.is_shift() {
                    if rs.kind != ScalarKind::Uint {
                        self.error(Some(inst), "shift amount must be unsigned");
                    }
                } else if ls != rs {
                    self.error(Some(inst), format!("binary operand scalars differ: {ls} and {rs}"));
                }
                if let Some(result) = result {
                    let rk = types.scalar_of(result).map(|s| s.kind);
                    if op.is_comparison() && rk != Some(ScalarKind::Bool) {
                        self.error(Some(inst), "comparison must produce a boolean");
                    }
                }
            }
            InstKind::Unary(_) | InstKind::Let => {
                if self.expect_operands(inst, instruction, 1) {
                    if let (InstKind::Let, Some(result)) = (&instruction.kind, result) {
                        self.expect_type(inst, "let", ty(ops[0]), result);
                    }
                }
            }
            InstKind::Convert => {
                if self.expect_operands(inst, instruction, 1) {
                    if let Some(result) = result {
                        let from = ty(ops[0]);
                        let same_shape = types.width(from) == types.width(result)
                            && types.element_count(from) == types.element_count(result);
                        if !same_shape {
                            self.error(Some(inst), "convert changes the shape of its operand");
                        }
                    }
                }
            }
            InstKind::Bitcast => {
                if self.expect_operands(inst, instruction, 1) {
                    if !types.is_scalar_or_vector(ty(ops[0])) || !result.is_some_and(|r| types.is_scalar_or_vector(r)) {
                        self.error(Some(inst), "bitcast requires scalars or vectors");
                    }
                }
            }
            InstKind::Construct => {
                if let Some(result) = result {
                    self.construct(inst, result, ops);
                }
            }
            InstKind::Access => self.access(inst, instruction),
            InstKind::Swizzle(ref indices) => {
                if self.expect_operands(inst, instruction, 1) {
                    let width = types.width(ty(ops[0]));
                    if !types.is_vector(ty(ops[0])) || indices.iter().any(|&i| i >= width) {
                        self.error(Some(inst), "swizzle index out of range");
                    }
                    if let Some(result) = result {
                        let count = u32::try_from(indices.len()).unwrap_or(u32::MAX);
                        if types.width(result) != count {
                            self.error(Some(inst), "swizzle result width mismatch");
                        }
                    }
                }
            }
            InstKind::Load => {
                if self.expect_operands(inst, instruction, 1) {
                    match (types.store_type(ty(ops[0])), result) {
                        (Some(store), Some(result)) => self.expect_type(inst, "load", store, result),
                        _ => self.error(Some(inst), "load requires a pointer"),
                    }
                }
            }
            InstKind::Store => {
                if self.expect_operands(inst, instruction, 2) {
                    match types.pointer_parts(ty(ops[0])) {
                        Some((_, store, access)) => {
                            if access == Access::Read {
                                self.error(Some(inst), "store through a read-only pointer");
                            }
                            self.expect_type(inst, "store", store, ty(ops[1]));
                        }
                        None => self.error(Some(inst), "store requires a pointer"),
                    }
                }
            }
            InstKind::LoadVectorElement | InstKind::StoreVectorElement => {
                let expected = if instruction.kind == InstKind::LoadVectorElement { 2 } else { 3 };
                if !self.expect_operands(inst, instruction, expected) {
                    return;
                }
                let store = types.store_type(ty(ops[0]));
                if !store.is_some_and(|s| types.is_vector(s)) {
                    self.error(Some(inst), "vector element access requires a pointer to a vector");
                }
            }
            InstKind::Var { binding } => self.var(inst, instruction, binding),
            InstKind::BuiltinCall { .. } => {}
            InstKind::UserCall(callee) => {
                let f = module.function(callee);
                if !f.is_alive() {
                    self.error(Some(inst), format!("call to removed function '{}'", f.name));
                    return;
                }
                if ops.len() != f.params().len() {
                    self.error(
                        Some(inst),
                        format!("call to '{}' passes {} arguments, expected {}", f.name, ops.len(), f.params().len()),
                    );
                    return;
                }
                for (index, (&arg, param)) in ops.iter().zip(f.params()).enumerate() {
                    let what = format!("argument {index} of call to '{}'", f.name);
                    self.expect_type(inst, &what, ty(param.value), ty(arg));
                }
                if let Some(result) = result {
                    self.expect_type(inst, "call result", f.return_type, result);
                }
            }
            InstKind::If { .. } | InstKind::BreakIf => {
                if self.expect_operands(inst, instruction, 1) {
                    let cond = ty(ops[0]);
                    if types[cond] != Type::Scalar(Scalar::BOOL) {
                        self.error(Some(inst), "condition must be a bool");
                    }
                }
            }
            InstKind::Return => {
                let Some(function) = self.function else {
                    return;
                };
                let expected = module.function(function).return_type;
                match (types[expected] == Type::Void, ops) {
                    (true, []) => {}
                    (false, [value]) => self.expect_type(inst, "return value", expected, ty(*value)),
                    _ => self.error(Some(inst), "return value does not match the function's return type"),
                }
            }
            InstKind::ExitIf
            | InstKind::ExitLoop
            | InstKind::Continue
            | InstKind::NextIteration
            | InstKind::Unreachable
            | InstKind::Loop { .. } => {}
        }
    }

    fn construct(&mut self, inst: Handle<Instruction>, result: Handle<Type>, ops: &[Handle<Value>]) {
        let module = self.module;
        let types = &module.types;
        let ty = |v: Handle<Value>| module.value_type(v);
        if ops.is_empty() {
            return;
        }
        match types[result] {
            Type::Vector { size, scalar } => {
                let mut total = 0;
                for &op in ops {
                    if types.scalar_of(ty(op)) != Some(scalar) || !types.is_scalar_or_vector(ty(op)) {
                        self.error(Some(inst), "vector construct argument has the wrong element type");
                        return;
                    }
                    total += types.width(ty(op));
                }
                let splat = ops.len() == 1 && types.is_scalar(ty(ops[0]));
                if !splat && total != size.count() {
                    self.error(
                        Some(inst),
                        format!("vector construct provides {total} components, expected {}", size.count()),
                    );
                }
            }
            Type::Matrix { columns, rows, .. } => {
                let n = ops.len() as u32;
                if n != columns.count() && n != columns.count() * rows.count() {
                    self.error(Some(inst), "matrix construct has the wrong number of arguments");
                }
            }
            Type::Array {
                base,
                size: ArraySize::Constant(n),
                ..
            } => {
                if ops.len() as u32 != n {
                    self.error(Some(inst), "array construct has the wrong number of elements");
                }
                for &op in ops {
                    self.expect_type(inst, "array element", base, ty(op));
                }
            }
            Type::Struct(_) => {
                let members: Vec<_> = types
                    .struct_def(result)
                    .map(|d| d.members.iter().map(|m| m.ty).collect())
                    .unwrap_or_default();
                if members.len() != ops.len() {
                    self.error(Some(inst), "struct construct has the wrong number of members");
                    return;
                }
                for (&member, &op) in members.iter().zip(ops) {
                    self.expect_type(inst, "struct member", member, ty(op));
                }
            }
            _ => {
                if ops.len() != 1 {
                    self.error(Some(inst), "scalar construct takes one argument");
                }
            }
        }
    }

    fn access(&mut self, inst: Handle<Instruction>, instruction: &Instruction) {
        let module = self.module;
        let types = &module.types;
        let ops = instruction.operands();
        let Some(&base) = ops.first() else {
            self.error(Some(inst), "access requires a base");
            return;
        };
        let base_ty = module.value_type(base);
        let pointer = types.pointer_parts(base_ty);
        let mut current = pointer.map_or(base_ty, |(_, store, _)| store);
        for &index in &ops[1..] {
            let index_ty = module.value_type(index);
            if !(types.is_integer(index_ty) && types.is_scalar(index_ty)) {
                self.error(Some(inst), "access index must be an integer scalar");
                return;
            }
            let next = match types[current] {
                Type::Struct(_) => {
                    let Some(i) = module.constant_index(index) else {
                        self.error(Some(inst), "struct access requires a constant index");
                        return;
                    };
                    types
                        .struct_def(current)
                        .and_then(|d| d.members.get(i as usize))
                        .map(|m| m.ty)
                }
                Type::Vector { scalar, .. } => types.lookup(&Type::Scalar(scalar)),
                Type::Matrix { rows, scalar, .. } => types.lookup(&Type::Vector { size: rows, scalar }),
                Type::Array { base, .. } => Some(base),
                _ => None,
            };
            let Some(next) = next else {
                self.error(Some(inst), format!("cannot index into {}", self.type_name(current)));
                return;
            };
            current = next;
        }
        let Some(result) = instruction.result() else {
            return;
        };
        let result_ty = module.value_type(result);
        match (pointer, types.pointer_parts(result_ty)) {
            (Some((space, _, _)), Some((result_space, store, _))) => {
                if space != result_space {
                    self.error(Some(inst), "access changes the address space");
                }
                self.expect_type(inst, "access", current, store);
            }
            (None, None) => self.expect_type(inst, "access", current, result_ty),
            _ => self.error(Some(inst), "access result pointer-ness does not match its base"),
        }
    }

    fn var(&mut self, inst: Handle<Instruction>, instruction: &Instruction, binding: Option<BindingPoint>) {
        let module = self.module;
        let types = &module.types;
        let Some(result) = instruction.result() else {
            return;
        };
        let Some((space, store, _)) = types.pointer_parts(module.value_type(result)) else {
            self.error(Some(inst), "var must produce a pointer");
            return;
        };
        let in_root = instruction.block() == Some(module.root());
        if in_root == (space == AddressSpace::Function) {
            self.error(Some(inst), format!("var in the {space} address space is misplaced"));
        }
        if binding.is_some() && !(space.is_host_shareable() || space == AddressSpace::Handle) {
            self.error(Some(inst), format!("var in the {space} address space cannot have a binding"));
        }
        if let Some(&init) = instruction.operands().first() {
            self.expect_type(inst, "var initializer", store, module.value_type(init));
        }
    }
}
