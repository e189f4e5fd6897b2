//! End-to-end checks for the SPIR-V writer pipeline.

mod common;

use common::{Interpreter, Val, assert_valid, compute_entry, init_logging};
use prism_ir::{
    Access, AddressSpace, BindingPoint, Builder, Capabilities, Constant, Function, Handle, InstKind,
    Module, Scalar, StructFlags, StructMember, Type, Value, VectorSize,
};
use prism_transform::{Pipeline, Target};

const WRITER_CAPABILITIES: Capabilities =
    Capabilities::ALLOW_MULTIPLE_ENTRY_POINTS.union(Capabilities::ALLOW_NON_CORE_TYPES);

fn run_writer(module: &mut Module) {
    let mut pipeline = Pipeline::for_target(Target::SpirvWriter);
    pipeline.validate_outputs = true;
    pipeline.run(module).unwrap();
    assert_valid(module, WRITER_CAPABILITIES);
}

fn keep(b: &mut Builder<'_>, value: Handle<Value>) {
    let ty = b.module().value_type(value);
    let var = b.var(AddressSpace::Function, ty, Access::ReadWrite);
    b.store(var, value);
}

#[test]
fn single_scalar_constructs_get_full_width() {
    init_logging();
    for size in [VectorSize::Bi, VectorSize::Tri, VectorSize::Quad] {
        let mut module = Module::new();
        let (_, body) = compute_entry(&mut module, "main");
        let mut b = Builder::at_end(&mut module, body);
        let ty = b.types().vector(size, Scalar::F32);
        let x = b.f32(0.5);
        let v = b.construct(ty, vec![x]);
        keep(&mut b, v);
        b.return_(None);

        run_writer(&mut module);
        let construct = module
            .instructions()
            .into_iter()
            .find(|&i| *module.kind(i) == InstKind::Construct)
            .unwrap();
        let args = module.operands(construct);
        assert_eq!(args.len(), size.count() as usize);
        assert!(args.iter().all(|&a| a == x));
    }
}

struct Layout {
    module: Module,
    original: Handle<Type>,
}

/// `S { a: f32, inner: Inner { x: vec2<f32>, y: u32 } }` held both in a
/// storage buffer and in a private variable.
fn shared_struct_module() -> Layout {
    let mut module = Module::new();
    let f32_ty = module.types.f32();
    let u32_ty = module.types.u32();
    let vec2 = module.types.vector(VectorSize::Bi, Scalar::F32);
    let inner = module.types.new_struct(
        "Inner",
        vec![StructMember::new("x", vec2), StructMember::new("y", u32_ty)],
    );
    let s = module.types.new_struct(
        "S",
        vec![StructMember::new("a", f32_ty), StructMember::new("inner", inner)],
    );
    let root = module.root();
    let (buffer, private) = {
        let mut b = Builder::at_end(&mut module, root);
        let buffer = b.var_with(
            AddressSpace::Storage,
            s,
            Access::ReadWrite,
            Some(BindingPoint::new(0, 0)),
            None,
        );
        (buffer, b.var(AddressSpace::Private, s, Access::ReadWrite))
    };

    let (_, body) = compute_entry(&mut module, "main");
    let mut b = Builder::at_end(&mut module, body);
    let value = b.load(buffer);
    b.store(private, value);
    let value = b.load(private);
    b.store(buffer, value);

    let mat2 = b.types().matrix(VectorSize::Bi, VectorSize::Bi, Scalar::F32);
    let m = b.splat(mat2, Constant::F32(1.0));
    let sum = b.add(mat2, m, m);
    keep(&mut b, sum);
    b.return_(None);

    Layout { module, original: s }
}

fn converter(module: &Module, pred: impl Fn(&Function) -> bool) -> Handle<Function> {
    module
        .functions()
        .iter()
        .copied()
        .find(|&f| module.function(f).name.starts_with("tint_convert_") && pred(module.function(f)))
        .unwrap()
}

#[test]
fn layout_converters_are_inverses() {
    init_logging();
    let Layout { mut module, original } = shared_struct_module();
    run_writer(&mut module);

    let from = converter(&module, |f| f.return_type == original);
    let to = converter(&module, |f| f.params().len() == 1 && {
        let param = f.param(0);
        module.value_type(param) == original
    });
    let explicit = module.function(to).return_type;
    assert_eq!(module.value_type(module.function(from).param(0)), explicit);
    let def = module.types.struct_def(explicit).unwrap();
    assert_eq!(def.name, "S_tint_explicit_layout");
    assert!(def.flags.contains(StructFlags::EXPLICIT_LAYOUT));
    assert_eq!(def.members.len(), module.types.struct_def(original).unwrap().members.len());

    let value = Val::Composite(vec![
        Val::Float(1.5),
        Val::Composite(vec![
            Val::Composite(vec![Val::Float(2.0), Val::Float(-3.0)]),
            Val::Int(4),
        ]),
    ]);
    let mut interpreter = Interpreter::new(&module);
    let natural = interpreter.call(from, vec![value.clone()]).unwrap();
    assert_eq!(natural, value);
    let round_trip = interpreter.call(to, vec![natural]).unwrap();
    assert_eq!(round_trip, value);
}

#[test]
fn writer_pipeline_is_deterministic() {
    let Layout { module: input, .. } = shared_struct_module();
    let run = || {
        let mut module = input.clone();
        Pipeline::for_target(Target::SpirvWriter).run(&mut module).unwrap();
        prism_ir::disassemble(&module)
    };
    assert_eq!(run(), run());
}
