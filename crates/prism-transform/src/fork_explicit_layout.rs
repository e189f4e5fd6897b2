//! Explicit-layout types for host-shareable memory.
//!
//! Structs and arrays held in storage, uniform or immediate memory must carry
//! an explicit layout: struct members get offsets and arrays get a stride.
//! A type that only ever lives in host-shareable memory is rewritten in
//! place. A type that is also used elsewhere (in private or function memory,
//! or in a function signature) is forked: the host-shareable variables switch
//! to an explicit-layout copy named `<name>_tint_explicit_layout`, and every
//! load and store that crosses the boundary goes through a generated
//! conversion function.

use std::collections::{HashMap, HashSet};

use prism_ir::{
    Access, AddressSpace, ArraySize, BinaryOp, Builder, Function, Handle, InstKind, Instruction,
    IoAttributes, Module, StructFlags, StructMember, Type, TypeTable, Value, validate,
};

use crate::{Pass, SPIRV_WRITER_CAPABILITIES, TransformError};

const NAME: &str = "spirv.ForkExplicitLayoutTypes";

const FORK_SUFFIX: &str = "_tint_explicit_layout";

/// Gives host-shareable structs and arrays an explicit memory layout.
#[derive(Debug)]
pub struct ForkExplicitLayoutTypes;

impl Pass for ForkExplicitLayoutTypes {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> prism_ir::Capabilities {
        SPIRV_WRITER_CAPABILITIES
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        fork_explicit_layout_types(module)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
enum Direction {
    /// Explicit layout to the original type, after a load.
    FromExplicit,
    /// Original type to explicit layout, before a store.
    ToExplicit,
}

impl Direction {
    fn function_name(self) -> &'static str {
        match self {
            Self::FromExplicit => "tint_convert_from_explicit_layout",
            Self::ToExplicit => "tint_convert_to_explicit_layout",
        }
    }

    /// Orders `(explicit, original)` as `(source, destination)`.
    fn order(self, explicit: Handle<Type>, original: Handle<Type>) -> (Handle<Type>, Handle<Type>) {
        match self {
            Self::FromExplicit => (explicit, original),
            Self::ToExplicit => (original, explicit),
        }
    }
}

/// Runs the explicit-layout rewrite on `module`.
pub fn fork_explicit_layout_types(module: &mut Module) -> Result<(), TransformError> {
    validate(module, NAME, SPIRV_WRITER_CAPABILITIES)?;
    let host_vars: Vec<_> = module
        .root_vars()
        .into_iter()
        .filter(|&var| {
            let ty = module.value_type(module.result(var));
            module
                .types
                .pointer_parts(ty)
                .is_some_and(|(space, _, _)| space.is_host_shareable())
        })
        .collect();
    if host_vars.is_empty() {
        return Ok(());
    }

    let mut state = State::new(module);
    state.collect_shared();
    for &var in &host_vars {
        let ptr = state.module.result(var);
        if let Some(store) = state.module.types.store_type(state.module.value_type(ptr)) {
            state.explicit_type(store);
        }
    }
    state.apply_in_place();
    for var in host_vars {
        state.rewrite_var(var);
    }
    Ok(())
}

struct State<'a> {
    module: &'a mut Module,
    /// Structs and arrays used outside host-shareable memory.
    shared: HashSet<Handle<Type>>,
    forked: HashMap<Handle<Type>, bool>,
    /// Explicit-layout form of every type reachable from host memory.
    explicit: HashMap<Handle<Type>, Handle<Type>>,
    /// Arrays rewritten in place, mapped to their strided replacement.
    in_place: HashMap<Handle<Type>, Handle<Type>>,
    converters: HashMap<(Direction, Handle<Type>), Handle<Function>>,
}

impl<'a> State<'a> {
    fn new(module: &'a mut Module) -> Self {
        Self {
            module,
            shared: HashSet::new(),
            forked: HashMap::new(),
            explicit: HashMap::new(),
            in_place: HashMap::new(),
            converters: HashMap::new(),
        }
    }

    fn collect_shared(&mut self) {
        let module = &*self.module;
        let mut roots = Vec::new();
        for inst in module.instructions() {
            if !matches!(module.kind(inst), InstKind::Var { .. }) {
                continue;
            }
            let ty = module.value_type(module.result(inst));
            match module.types.pointer_parts(ty) {
                Some((space, store, _)) if !space.is_host_shareable() => roots.push(store),
                _ => {}
            }
        }
        for &f in module.functions() {
            let function = module.function(f);
            roots.push(function.return_type);
            roots.extend(function.params().iter().map(|p| module.value_type(p.value)));
        }
        for ty in roots {
            aggregates(&module.types, ty, &mut self.shared);
        }
    }

    /// A type is forked if it is used outside host memory, or holds a type
    /// that is.
    fn is_forked(&mut self, ty: Handle<Type>) -> bool {
        if let Some(&forked) = self.forked.get(&ty) {
            return forked;
        }
        let children = children(&self.module.types, ty);
        let forked = self.shared.contains(&ty) || children.into_iter().any(|c| self.is_forked(c));
        self.forked.insert(ty, forked);
        forked
    }

    fn explicit_type(&mut self, ty: Handle<Type>) -> Handle<Type> {
        if let Some(&explicit) = self.explicit.get(&ty) {
            return explicit;
        }
        let explicit = match self.module.types[ty] {
            Type::Struct(_) => self.explicit_struct(ty),
            Type::Array {
                base,
                size,
                stride: None,
            } => {
                let base = self.explicit_type(base);
                let stride = self.module.types.array_stride(base);
                let strided = self.module.types.insert(Type::Array {
                    base,
                    size,
                    stride: Some(stride),
                });
                if !self.is_forked(ty) {
                    self.in_place.insert(ty, strided);
                }
                strided
            }
            _ => ty,
        };
        self.explicit.insert(ty, explicit);
        explicit
    }

    fn explicit_struct(&mut self, ty: Handle<Type>) -> Handle<Type> {
        let Some(def) = self.module.types.struct_def(ty).cloned() else {
            unreachable!("struct type without a definition");
        };
        let mut members = Vec::with_capacity(def.members.len());
        for member in &def.members {
            let ty = self.explicit_type(member.ty);
            members.push(StructMember { ty, ..member.clone() });
        }

        if !self.is_forked(ty) {
            if let Some(def) = self.module.types.struct_def_mut(ty) {
                def.members = members;
                def.flags |= StructFlags::EXPLICIT_LAYOUT;
            }
            return ty;
        }

        let name = format!("{}{FORK_SUFFIX}", def.name);
        log::debug!("{NAME}: forking '{}' as '{name}'", def.name);
        let fork = self.module.types.new_struct(name, members);
        if let Some(fork_def) = self.module.types.struct_def_mut(fork) {
            fork_def.flags = def.flags | StructFlags::EXPLICIT_LAYOUT;
            fork_def.usage = def.usage;
        }
        fork
    }

    /// Swaps in-place arrays for their strided form on every value.
    fn apply_in_place(&mut self) {
        if self.in_place.is_empty() {
            return;
        }
        let mut values = Vec::new();
        for inst in self.module.instructions() {
            values.extend_from_slice(self.module.results(inst));
            values.extend_from_slice(self.module.operands(inst));
        }
        for &f in self.module.functions() {
            values.extend(self.module.function(f).params().iter().map(|p| p.value));
        }

        let mut seen = HashSet::new();
        for value in values {
            if !seen.insert(value) {
                continue;
            }
            let ty = self.module.value_type(value);
            if let Some(replacement) = self.in_place_type(ty) {
                self.module.set_value_type(value, replacement);
            }
        }
    }

    fn in_place_type(&mut self, ty: Handle<Type>) -> Option<Handle<Type>> {
        if let Some(&replacement) = self.in_place.get(&ty) {
            return Some(replacement);
        }
        let (space, store, access) = self.module.types.pointer_parts(ty)?;
        let &store = self.in_place.get(&store)?;
        Some(self.module.types.pointer(space, store, access))
    }

    fn rewrite_var(&mut self, var: Handle<Instruction>) {
        let ptr = self.module.result(var);
        let Some((space, store, access)) = self.module.types.pointer_parts(self.module.value_type(ptr)) else {
            return;
        };
        let explicit = self.explicit_type(store);
        if explicit != store {
            let ty = self.module.types.pointer(space, explicit, access);
            self.module.set_value_type(ptr, ty);
        }
        self.rewrite_pointer_uses(ptr);
    }

    /// Follows `root` through accesses and lets, converting at every load and
    /// store.
    fn rewrite_pointer_uses(&mut self, root: Handle<Value>) {
        let mut pending = vec![root];
        while let Some(ptr) = pending.pop() {
            for usage in self.module.uses(ptr).to_vec() {
                let inst = usage.instruction;
                match *self.module.kind(inst) {
                    InstKind::Access => {
                        let result = self.module.result(inst);
                        let ty = self.module.value_type(result);
                        let Some((space, store, access)) = self.module.types.pointer_parts(ty) else {
                            continue;
                        };
                        let explicit = self.explicit_type(store);
                        let ty = self.module.types.pointer(space, explicit, access);
                        self.module.set_value_type(result, ty);
                        pending.push(result);
                    }
                    InstKind::Let => {
                        let result = self.module.result(inst);
                        let ty = self.module.value_type(ptr);
                        self.module.set_value_type(result, ty);
                        pending.push(result);
                    }
                    InstKind::Load => self.convert_load(inst),
                    InstKind::Store if usage.operand == 0 => self.convert_store(inst),
                    _ => {}
                }
            }
        }
    }

    fn convert_load(&mut self, inst: Handle<Instruction>) {
        let ptr = self.module.operand(inst, 0);
        let Some(store) = self.module.types.store_type(self.module.value_type(ptr)) else {
            return;
        };
        let result = self.module.result(inst);
        let original = self.module.value_type(result);
        if original == store {
            return;
        }
        log::trace!("{NAME}: converting load at {inst:?}");
        self.module.set_value_type(result, store);
        let converter = self.converter(Direction::FromExplicit, original);
        let converted = Builder::after(self.module, inst).call_user(converter, vec![result]);
        let call = self.module.producer(converted);
        self.module
            .replace_all_uses_with_if(result, converted, |u| Some(u.instruction) != call);
    }

    fn convert_store(&mut self, inst: Handle<Instruction>) {
        let ptr = self.module.operand(inst, 0);
        let value = self.module.operand(inst, 1);
        let Some(store) = self.module.types.store_type(self.module.value_type(ptr)) else {
            return;
        };
        let original = self.module.value_type(value);
        if original == store {
            return;
        }
        log::trace!("{NAME}: converting store at {inst:?}");
        let converter = self.converter(Direction::ToExplicit, original);
        let converted = Builder::before(self.module, inst).call_user(converter, vec![value]);
        self.module.set_operand(inst, 1, converted);
    }

    /// The function converting `original` in `direction`, generated on first
    /// use.
    fn converter(&mut self, direction: Direction, original: Handle<Type>) -> Handle<Function> {
        if let Some(&function) = self.converters.get(&(direction, original)) {
            return function;
        }
        let explicit = self.explicit_type(original);
        let (source, destination) = direction.order(explicit, original);
        let name = self.module.symbols.new_symbol(direction.function_name());
        log::debug!(
            "{NAME}: generating '{name}' for {}",
            self.module.types.name(original)
        );
        let function = self.module.new_function(&name, destination);
        let param = self.module.add_param(function, source, IoAttributes::default());
        self.converters.insert((direction, original), function);

        match self.module.types[original] {
            Type::Struct(_) => self.struct_converter(function, param, direction, original),
            Type::Array {
                base,
                size: ArraySize::Constant(count),
                ..
            } => self.array_converter(function, param, direction, base, count),
            _ => unreachable!("no layout conversion for {}", self.module.types.name(original)),
        }
        function
    }

    fn struct_converter(
        &mut self,
        function: Handle<Function>,
        param: Handle<Value>,
        direction: Direction,
        original: Handle<Type>,
    ) {
        let members: Vec<_> = self
            .module
            .types
            .struct_def(original)
            .map(|def| def.members.iter().map(|m| m.ty).collect())
            .unwrap_or_default();
        // (source member type, nested converter)
        let mut plan = Vec::with_capacity(members.len());
        for member in members {
            let explicit = self.explicit_type(member);
            let (source, _) = direction.order(explicit, member);
            let nested = (explicit != member).then(|| self.converter(direction, member));
            plan.push((source, nested));
        }

        let destination = self.module.function(function).return_type;
        let body = self.module.function(function).body();
        let mut b = Builder::at_end(self.module, body);
        let mut converted = Vec::with_capacity(plan.len());
        for (index, (source, nested)) in (0u32..).zip(plan) {
            let member = b.access_const(source, param, index);
            converted.push(match nested {
                Some(nested) => b.call_user(nested, vec![member]),
                None => member,
            });
        }
        let result = b.construct(destination, converted);
        b.return_(Some(result));
    }

    fn array_converter(
        &mut self,
        function: Handle<Function>,
        param: Handle<Value>,
        direction: Direction,
        element: Handle<Type>,
        count: u32,
    ) {
        let explicit = self.explicit_type(element);
        let (source_element, destination_element) = direction.order(explicit, element);
        let nested = (explicit != element).then(|| self.converter(direction, element));

        let destination = self.module.function(function).return_type;
        let body = self.module.function(function).body();
        let u32_ty = self.module.types.u32();
        let bool_ty = self.module.types.bool();
        let slot_ty = self
            .module
            .types
            .pointer(AddressSpace::Function, destination_element, Access::ReadWrite);

        let mut b = Builder::at_end(self.module, body);
        let result = b.var(AddressSpace::Function, destination, Access::ReadWrite);
        let lp = b.loop_();
        let InstKind::Loop {
            initializer,
            body: loop_body,
            continuing,
        } = *b.module().kind(lp)
        else {
            unreachable!("loop_ creates a loop");
        };

        let index = b.append_to(initializer, |b| {
            let zero = b.u32(0);
            let index = b.var_with(AddressSpace::Function, u32_ty, Access::ReadWrite, None, Some(zero));
            b.next_iteration();
            index
        });
        b.append_to(loop_body, |b| {
            let i = b.load(index);
            let n = b.u32(count);
            let done = b.binary(BinaryOp::GreaterThanEqual, bool_ty, i, n);
            let exit = b.if_(done);
            let InstKind::If { true_block, .. } = *b.module().kind(exit) else {
                unreachable!("if_ creates an if");
            };
            b.append_to(true_block, |b| b.exit_loop());
            let value = b.access(source_element, param, &[i]);
            let value = match nested {
                Some(nested) => b.call_user(nested, vec![value]),
                None => value,
            };
            let slot = b.access(slot_ty, result, &[i]);
            b.store(slot, value);
            b.continue_();
        });
        b.append_to(continuing, |b| {
            let i = b.load(index);
            let one = b.u32(1);
            let next = b.add(u32_ty, i, one);
            b.store(index, next);
            b.next_iteration();
        });
        let value = b.load(result);
        b.return_(Some(value));
    }
}

/// Inserts the structs and arrays reachable from `ty` into `out`.
fn aggregates(types: &TypeTable, ty: Handle<Type>, out: &mut HashSet<Handle<Type>>) {
    if matches!(types[ty], Type::Struct(_) | Type::Array { .. }) && out.insert(ty) {
        for child in children(types, ty) {
            aggregates(types, child, out);
        }
    }
}

fn children(types: &TypeTable, ty: Handle<Type>) -> Vec<Handle<Type>> {
    match types[ty] {
        Type::Struct(_) => types
            .struct_def(ty)
            .map(|def| def.members.iter().map(|m| m.ty).collect())
            .unwrap_or_default(),
        Type::Array { base, .. } => vec![base],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{assert_valid, compute_entry};
    use prism_ir::{BindingPoint, CoreBuiltin, Scalar, VectorSize};

    fn struct_named(module: &Module, name: &str) -> Option<Handle<Type>> {
        module
            .types
            .iter()
            .map(|(ty, _)| ty)
            .find(|&ty| module.types.struct_def(ty).is_some_and(|d| d.name == name))
    }

    fn has_explicit_layout(module: &Module, ty: Handle<Type>) -> bool {
        module
            .types
            .struct_def(ty)
            .is_some_and(|d| d.flags.contains(StructFlags::EXPLICIT_LAYOUT))
    }

    fn store_of(module: &Module, ptr: Handle<Value>) -> Handle<Type> {
        module.types.store_type(module.value_type(ptr)).unwrap()
    }

    fn converters(module: &Module, direction: Direction) -> Vec<Handle<Function>> {
        module
            .functions()
            .iter()
            .copied()
            .filter(|&f| module.function(f).name.starts_with(direction.function_name()))
            .collect()
    }

    fn run(module: &mut Module) {
        fork_explicit_layout_types(module).unwrap();
        assert_valid(module, SPIRV_WRITER_CAPABILITIES);
    }

    fn storage(b: &mut Builder<'_>, ty: Handle<Type>, binding: u32) -> Handle<Value> {
        b.var_with(
            AddressSpace::Storage,
            ty,
            Access::ReadWrite,
            Some(BindingPoint::new(0, binding)),
            None,
        )
    }

    #[test]
    fn host_only_struct_is_rewritten_in_place() {
        let mut module = Module::new();
        let u32_ty = module.types.u32();
        let f32_ty = module.types.f32();
        let values_ty = module.types.runtime_array(f32_ty);
        let data = module.types.new_struct(
            "Data",
            vec![StructMember::new("count", u32_ty), StructMember::new("values", values_ty)],
        );
        let root = module.root();
        let buffer = storage(&mut Builder::at_end(&mut module, root), data, 0);

        let (_, body) = compute_entry(&mut module, "main");
        let mut b = Builder::at_end(&mut module, body);
        let values_ptr_ty = b.types().pointer(AddressSpace::Storage, values_ty, Access::ReadWrite);
        let element_ptr_ty = b.types().pointer(AddressSpace::Storage, f32_ty, Access::ReadWrite);
        let (one, two) = (b.u32(1), b.u32(2));
        let values = b.access(values_ptr_ty, buffer, &[one]);
        b.call(u32_ty, CoreBuiltin::ArrayLength, vec![values]);
        let element = b.access(element_ptr_ty, buffer, &[one, two]);
        let x = b.load(element);
        b.store(element, x);
        b.return_(None);

        run(&mut module);
        assert_eq!(store_of(&module, buffer), data);
        assert!(has_explicit_layout(&module, data));
        let member = module.types.struct_def(data).unwrap().members[1].ty;
        assert_eq!(
            module.types[member],
            Type::Array {
                base: f32_ty,
                size: ArraySize::Runtime,
                stride: Some(4),
            }
        );
        assert_eq!(module.functions().len(), 1);
        assert!(struct_named(&module, "Data_tint_explicit_layout").is_none());
    }

    #[test]
    fn shared_struct_is_forked_with_converters() {
        let mut module = Module::new();
        let f32_ty = module.types.f32();
        let vec3 = module.types.vector(VectorSize::Tri, Scalar::F32);
        let s = module.types.new_struct(
            "S",
            vec![StructMember::new("a", f32_ty), StructMember::new("b", vec3)],
        );
        let root = module.root();
        let (buffer, private) = {
            let mut b = Builder::at_end(&mut module, root);
            let buffer = storage(&mut b, s, 0);
            (buffer, b.var(AddressSpace::Private, s, Access::ReadWrite))
        };

        let (_, body) = compute_entry(&mut module, "main");
        let mut b = Builder::at_end(&mut module, body);
        let v = b.load(buffer);
        b.store(private, v);
        let w = b.load(private);
        b.store(buffer, w);
        b.return_(None);

        run(&mut module);
        let fork = struct_named(&module, "S_tint_explicit_layout").unwrap();
        assert_eq!(store_of(&module, buffer), fork);
        assert_eq!(store_of(&module, private), s);
        assert!(has_explicit_layout(&module, fork));
        assert!(!has_explicit_layout(&module, s));

        let from = converters(&module, Direction::FromExplicit);
        let to = converters(&module, Direction::ToExplicit);
        assert_eq!((from.len(), to.len()), (1, 1));
        assert_eq!(module.function(from[0]).return_type, s);
        assert_eq!(module.function(to[0]).return_type, fork);
        assert_eq!(module.user_calls_of(from[0]).len(), 1);
        assert_eq!(module.user_calls_of(to[0]).len(), 1);
    }

    #[test]
    fn nested_structs_share_converters() {
        let mut module = Module::new();
        let f32_ty = module.types.f32();
        let u32_ty = module.types.u32();
        let inner = module.types.new_struct("Inner", vec![StructMember::new("x", f32_ty)]);
        let outer = module.types.new_struct(
            "Outer",
            vec![StructMember::new("inner", inner), StructMember::new("n", u32_ty)],
        );
        let root = module.root();
        let (buffer, private) = {
            let mut b = Builder::at_end(&mut module, root);
            let buffer = storage(&mut b, outer, 0);
            (buffer, b.var(AddressSpace::Private, inner, Access::ReadWrite))
        };

        let (_, body) = compute_entry(&mut module, "main");
        let mut b = Builder::at_end(&mut module, body);
        let inner_ptr_ty = b.types().pointer(AddressSpace::Storage, inner, Access::ReadWrite);
        let zero = b.u32(0);
        let p = b.access(inner_ptr_ty, buffer, &[zero]);
        let first = b.load(p);
        b.store(private, first);
        let second = b.load(p);
        b.store(private, second);
        let whole = b.load(buffer);
        b.store(buffer, whole);
        b.return_(None);

        run(&mut module);
        let inner_fork = struct_named(&module, "Inner_tint_explicit_layout").unwrap();
        let outer_fork = struct_named(&module, "Outer_tint_explicit_layout").unwrap();
        assert_eq!(module.types.struct_def(outer_fork).unwrap().members[0].ty, inner_fork);

        let from = converters(&module, Direction::FromExplicit);
        assert_eq!(from.len(), 2);
        let inner_from = from
            .iter()
            .copied()
            .find(|&f| module.function(f).return_type == inner)
            .unwrap();
        // Two loads of the member plus the call inside the outer converter.
        assert_eq!(module.user_calls_of(inner_from).len(), 3);
        assert_eq!(converters(&module, Direction::ToExplicit).len(), 2);
    }

    #[test]
    fn shared_array_converts_in_a_loop() {
        let mut module = Module::new();
        let vec3 = module.types.vector(VectorSize::Tri, Scalar::F32);
        let arr = module.types.array(vec3, 4);
        let root = module.root();
        let uniform = Builder::at_end(&mut module, root).var_with(
            AddressSpace::Uniform,
            arr,
            Access::Read,
            Some(BindingPoint::new(0, 0)),
            None,
        );

        let (_, body) = compute_entry(&mut module, "main");
        let mut b = Builder::at_end(&mut module, body);
        let local = b.var(AddressSpace::Function, arr, Access::ReadWrite);
        let v = b.load(uniform);
        b.store(local, v);
        b.return_(None);

        run(&mut module);
        let strided = store_of(&module, uniform);
        assert_eq!(
            module.types[strided],
            Type::Array {
                base: vec3,
                size: ArraySize::Constant(4),
                stride: Some(16),
            }
        );
        assert_eq!(store_of(&module, local), arr);
        let from = converters(&module, Direction::FromExplicit);
        assert_eq!(from.len(), 1);
        let has_loop = module
            .function_instructions(from[0])
            .into_iter()
            .any(|i| matches!(module.kind(i), InstKind::Loop { .. }));
        assert!(has_loop);
    }

    #[test]
    fn module_without_host_memory_is_untouched() {
        let mut module = Module::new();
        let f32_ty = module.types.f32();
        let s = module.types.new_struct("S", vec![StructMember::new("a", f32_ty)]);
        let root = module.root();
        Builder::at_end(&mut module, root).var(AddressSpace::Private, s, Access::ReadWrite);
        let (_, body) = compute_entry(&mut module, "main");
        Builder::at_end(&mut module, body).return_(None);

        let before = prism_ir::disassemble(&module);
        run(&mut module);
        assert_eq!(prism_ir::disassemble(&module), before);
        assert!(!has_explicit_layout(&module, s));
    }
}
