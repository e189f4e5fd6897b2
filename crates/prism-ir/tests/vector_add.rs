//! Integration test: build a vector-add compute shader through the builder,
//! validate it, edit it and check the textual dump.

use prism_ir::*;

struct VectorAdd {
    module: Module,
    a: Handle<Value>,
    sum: Handle<Value>,
}

/// ```wgsl
/// @group(0) @binding(0) var<storage, read> a: array<f32>;
/// @group(0) @binding(1) var<storage, read> b: array<f32>;
/// @group(0) @binding(2) var<storage, read_write> result: array<f32>;
///
/// @compute @workgroup_size(256)
/// fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
///     let i = gid.x;
///     result[i] = a[i] + b[i];
/// }
/// ```
fn vector_add() -> VectorAdd {
    let mut module = Module::new();
    let f32_ty = module.types.f32();
    let u32_ty = module.types.u32();
    let vec3u = module.types.vector(VectorSize::Tri, Scalar::U32);
    let array = module.types.runtime_array(f32_ty);
    let element_ptr = module.types.pointer(AddressSpace::Storage, f32_ty, Access::Read);
    let result_ptr = module.types.pointer(AddressSpace::Storage, f32_ty, Access::ReadWrite);

    let root = module.root();
    let mut buffers = Vec::new();
    for (binding, (name, access)) in [("a", Access::Read), ("b", Access::Read), ("result", Access::ReadWrite)]
        .into_iter()
        .enumerate()
    {
        let mut b = Builder::at_end(&mut module, root);
        let var = b.var_with(
            AddressSpace::Storage,
            array,
            access,
            Some(BindingPoint::new(0, binding as u32)),
            None,
        );
        module.set_name(var, name);
        buffers.push(var);
    }

    let void = module.types.void();
    let main = module.new_function("main", void);
    module.function_mut(main).stage = Some(PipelineStage::Compute);
    module.function_mut(main).workgroup_size = Some([256, 1, 1]);
    let gid = module.add_param(main, vec3u, IoAttributes::builtin(BuiltinValue::GlobalInvocationId));
    module.set_name(gid, "gid");

    let body = module.function(main).body();
    let mut b = Builder::at_end(&mut module, body);
    let i = b.access_const(u32_ty, gid, 0);
    let i = b.let_(i);
    let pa = b.access(element_ptr, buffers[0], &[i]);
    let pb = b.access(element_ptr, buffers[1], &[i]);
    let (x, y) = (b.load(pa), b.load(pb));
    let sum = b.add(f32_ty, x, y);
    let out = b.access(result_ptr, buffers[2], &[i]);
    b.store(out, sum);
    b.return_(None);

    VectorAdd {
        module,
        a: buffers[0],
        sum,
    }
}

#[test]
fn vector_add_validates_and_dumps() {
    let VectorAdd { module, .. } = vector_add();
    validate(&module, "test", Capabilities::EMPTY).unwrap();

    let text = disassemble(&module);
    assert!(text.contains("@compute @workgroup_size(256, 1, 1)"), "{text}");
    assert!(text.contains("[@builtin(global_invocation_id)]"), "{text}");
    for name in ["%a", "%b", "%result", "%gid"] {
        assert!(text.contains(name), "missing {name} in\n{text}");
    }
    assert_eq!(text.matches(" load ").count(), 2, "{text}");
    assert_eq!(disassemble(&vector_add().module), text);
}

#[test]
fn use_lists_follow_edits() {
    let VectorAdd { mut module, a, sum } = vector_add();
    assert_eq!(module.uses(a).len(), 1);
    let store = module.uses(sum)[0].instruction;
    assert_eq!(*module.kind(store), InstKind::Store);

    // Every operand edge has exactly one matching use.
    for inst in module.instructions() {
        for (operand, &value) in module.operands(inst).iter().enumerate() {
            let usage = Usage {
                instruction: inst,
                operand,
            };
            assert_eq!(module.uses(value).iter().filter(|&&u| u == usage).count(), 1);
        }
    }

    // Store `a[i] * 2` instead of the sum.
    let add = module.producer(sum).unwrap();
    let lhs = module.operand(add, 0);
    let f32_ty = module.value_type(sum);
    let doubled = {
        let mut b = Builder::before(&mut module, store);
        let two = b.f32(2.0);
        b.multiply(f32_ty, lhs, two)
    };
    module.replace_all_uses_with(sum, doubled);
    assert!(module.uses(sum).is_empty());
    module.destroy(add);
    validate(&module, "test", Capabilities::EMPTY).unwrap();
    assert_eq!(module.operand(store, 1), doubled);
    assert_eq!(module.uses(lhs).len(), 1);
}

#[test]
fn misplaced_function_var_is_reported_with_the_pass_name() {
    let VectorAdd { mut module, .. } = vector_add();
    let f32_ty = module.types.f32();
    let root = module.root();
    Builder::at_end(&mut module, root).var(AddressSpace::Function, f32_ty, Access::ReadWrite);

    let err = validate(&module, "my.Pass", Capabilities::EMPTY).unwrap_err();
    assert_eq!(err.pass, "my.Pass");
    assert!(
        err.diagnostics.iter().any(|d| d.message.contains("misplaced")),
        "{err}"
    );
}
