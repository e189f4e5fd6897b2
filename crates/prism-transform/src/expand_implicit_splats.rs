//! Makes implicit scalar-to-vector splats explicit.

use prism_ir::{
    BinaryOp, Builder, Builtin, CoreBuiltin, Handle, InstKind, Instruction, Module, SpirvBuiltin,
    Value, VectorSize, validate,
};

use crate::{Pass, SPIRV_WRITER_CAPABILITIES, TransformError};

const NAME: &str = "spirv.ExpandImplicitSplats";

/// Spells out every implicit splat as a vector construct.
#[derive(Debug)]
pub struct ExpandImplicitSplats;

impl Pass for ExpandImplicitSplats {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> prism_ir::Capabilities {
        SPIRV_WRITER_CAPABILITIES
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        expand_implicit_splats(module)
    }
}

#[derive(Clone, Copy, Debug)]
enum Splat {
    /// `vecN(s)` gets `N` arguments.
    Construct,
    /// A vector/scalar binary; `scalar` is the operand index of the scalar.
    Binary { op: BinaryOp, scalar: usize },
    /// `mix(a, b, s)` with a scalar selector.
    MixSelector,
}

/// Runs the splat expansion on `module`.
pub fn expand_implicit_splats(module: &mut Module) -> Result<(), TransformError> {
    validate(module, NAME, SPIRV_WRITER_CAPABILITIES)?;
    let worklist: Vec<_> = module
        .instructions()
        .into_iter()
        .filter_map(|inst| classify(module, inst).map(|splat| (inst, splat)))
        .collect();

    for (inst, splat) in worklist {
        log::trace!("{NAME}: {splat:?} at {inst:?}");
        let Some(size) = result_size(module, inst) else {
            unreachable!("splat without a vector result");
        };
        match splat {
            Splat::Construct => {
                let scalar = module.operand(inst, 0);
                for _ in 1..size.count() {
                    module.push_operand(inst, scalar);
                }
            }
            Splat::Binary {
                op: BinaryOp::Multiply,
                scalar,
            } if is_float_vector_result(module, inst) => {
                let vector = module.operand(inst, 1 - scalar);
                let scalar = module.operand(inst, scalar);
                let ty = module.value_type(module.result(inst));
                let mut b = Builder::before(module, inst);
                let product = b.call(ty, SpirvBuiltin::VectorTimesScalar, vec![vector, scalar]);
                module.replace_with(inst, product);
            }
            Splat::Binary { scalar, .. } => splat_operand(module, inst, scalar, size),
            Splat::MixSelector => splat_operand(module, inst, 2, size),
        }
    }
    Ok(())
}

fn classify(module: &Module, inst: Handle<Instruction>) -> Option<Splat> {
    result_size(module, inst)?;
    let is_scalar = |v: Handle<Value>| module.types.is_scalar(module.value_type(v));
    let operands = module.operands(inst);
    match *module.kind(inst) {
        InstKind::Construct if operands.len() == 1 && is_scalar(operands[0]) => Some(Splat::Construct),
        InstKind::Binary(op) => {
            let scalar = operands.iter().position(|&v| is_scalar(v))?;
            Some(Splat::Binary { op, scalar })
        }
        InstKind::BuiltinCall {
            builtin: Builtin::Core(CoreBuiltin::Mix),
            ..
        } if operands.len() == 3 && is_scalar(operands[2]) => Some(Splat::MixSelector),
        _ => None,
    }
}

/// The width of the instruction's vector result.
fn result_size(module: &Module, inst: Handle<Instruction>) -> Option<VectorSize> {
    let result = module.inst(inst).result()?;
    match module.types[module.value_type(result)] {
        prism_ir::Type::Vector { size, .. } => Some(size),
        _ => None,
    }
}

fn is_float_vector_result(module: &Module, inst: Handle<Instruction>) -> bool {
    module.types.is_float(module.value_type(module.result(inst)))
}

/// Replaces operand `index` with `vecN(operand, ..)`.
fn splat_operand(module: &mut Module, inst: Handle<Instruction>, index: usize, size: VectorSize) {
    let scalar = module.operand(inst, index);
    let Some(element) = module.types.scalar_of(module.value_type(scalar)) else {
        unreachable!("splat of a non-scalar");
    };
    let ty = module.types.vector(size, element);
    let mut b = Builder::before(module, inst);
    let splat = b.construct(ty, vec![scalar; size.count() as usize]);
    module.set_operand(inst, index, splat);
}
