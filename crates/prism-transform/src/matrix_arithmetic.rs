//! Decomposition of matrix arithmetic for SPIR-V emission.
//!
//! SPIR-V has no matrix add, subtract or convert, so those run per column.
//! Multiplies map onto the dedicated `Op*Times*` instructions, whose operand
//! order is fixed.

use prism_ir::{BinaryOp, Builder, Handle, InstKind, Instruction, Module, SpirvBuiltin, Type, validate};

use crate::{Pass, SPIRV_WRITER_CAPABILITIES, TransformError};

const NAME: &str = "spirv.HandleMatrixArithmetic";

/// Rewrites arithmetic on matrices.
#[derive(Debug)]
pub struct HandleMatrixArithmetic;

impl Pass for HandleMatrixArithmetic {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> prism_ir::Capabilities {
        SPIRV_WRITER_CAPABILITIES
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        handle_matrix_arithmetic(module)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Scalar,
    Vector,
    Matrix,
}

/// Runs the matrix arithmetic lowering on `module`.
pub fn handle_matrix_arithmetic(module: &mut Module) -> Result<(), TransformError> {
    validate(module, NAME, SPIRV_WRITER_CAPABILITIES)?;
    let worklist: Vec<_> = module
        .instructions()
        .into_iter()
        .filter(|&inst| match module.kind(inst) {
            InstKind::Binary(_) => module
                .operands(inst)
                .iter()
                .any(|&v| shape(module, module.value_type(v)) == Shape::Matrix),
            InstKind::Convert => shape(module, module.value_type(module.result(inst))) == Shape::Matrix,
            _ => false,
        })
        .collect();

    for inst in worklist {
        log::trace!("{NAME}: {} at {inst:?}", module.kind(inst).mnemonic());
        match *module.kind(inst) {
            InstKind::Binary(op @ (BinaryOp::Add | BinaryOp::Subtract)) => per_column_binary(module, inst, op),
            InstKind::Binary(BinaryOp::Multiply) => multiply(module, inst),
            InstKind::Convert => per_column_convert(module, inst),
            ref other => unreachable!("`{}` on a matrix", other.mnemonic()),
        }
    }
    Ok(())
}

fn shape(module: &Module, ty: Handle<Type>) -> Shape {
    match module.types[ty] {
        Type::Matrix { .. } => Shape::Matrix,
        Type::Vector { .. } => Shape::Vector,
        _ => Shape::Scalar,
    }
}

/// Column count and column type of a matrix type.
fn columns(module: &mut Module, ty: Handle<Type>) -> (u32, Handle<Type>) {
    let Type::Matrix {
        columns,
        rows,
        scalar,
    } = module.types[ty]
    else {
        unreachable!("expected a matrix type");
    };
    (columns.count(), module.types.vector(rows, scalar))
}

fn per_column_binary(module: &mut Module, inst: Handle<Instruction>, op: BinaryOp) {
    let (lhs, rhs) = (module.operand(inst, 0), module.operand(inst, 1));
    let result_ty = module.value_type(module.result(inst));
    let (count, column_ty) = columns(module, result_ty);
    let mut b = Builder::before(module, inst);
    let result_columns = (0..count)
        .map(|i| {
            let l = b.access_const(column_ty, lhs, i);
            let r = b.access_const(column_ty, rhs, i);
            b.binary(op, column_ty, l, r)
        })
        .collect();
    let matrix = b.construct(result_ty, result_columns);
    module.replace_with(inst, matrix);
}

fn multiply(module: &mut Module, inst: Handle<Instruction>) {
    let (lhs, rhs) = (module.operand(inst, 0), module.operand(inst, 1));
    let result_ty = module.value_type(module.result(inst));
    let shapes = (
        shape(module, module.value_type(lhs)),
        shape(module, module.value_type(rhs)),
    );
    let (builtin, args) = match shapes {
        (Shape::Matrix, Shape::Scalar) => (SpirvBuiltin::MatrixTimesScalar, vec![lhs, rhs]),
        (Shape::Scalar, Shape::Matrix) => (SpirvBuiltin::MatrixTimesScalar, vec![rhs, lhs]),
        (Shape::Matrix, Shape::Vector) => (SpirvBuiltin::MatrixTimesVector, vec![lhs, rhs]),
        (Shape::Vector, Shape::Matrix) => (SpirvBuiltin::VectorTimesMatrix, vec![lhs, rhs]),
        (Shape::Matrix, Shape::Matrix) => (SpirvBuiltin::MatrixTimesMatrix, vec![lhs, rhs]),
        _ => unreachable!("matrix multiply without a matrix operand: {shapes:?}"),
    };
    let mut b = Builder::before(module, inst);
    let product = b.call(result_ty, builtin, args);
    module.replace_with(inst, product);
}

fn per_column_convert(module: &mut Module, inst: Handle<Instruction>) {
    let source = module.operand(inst, 0);
    let source_ty = module.value_type(source);
    let result_ty = module.value_type(module.result(inst));
    let (count, source_column) = columns(module, source_ty);
    let (_, result_column) = columns(module, result_ty);
    let mut b = Builder::before(module, inst);
    let converted = (0..count)
        .map(|i| {
            let column = b.access_const(source_column, source, i);
            b.convert(result_column, column)
        })
        .collect();
    let matrix = b.construct(result_ty, converted);
    module.replace_with(inst, matrix);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{assert_valid, calls_to, compute_entry, count_kind};
    use prism_ir::{Access, AddressSpace, Constant, Scalar, Value, VectorSize};

    fn build(f: impl FnOnce(&mut Builder<'_>) -> Handle<Value>) -> Module {
        let mut module = Module::new();
        let (_, body) = compute_entry(&mut module, "main");
        let mut b = Builder::at_end(&mut module, body);
        let value = f(&mut b);
        let ty = b.module().value_type(value);
        let var = b.var(AddressSpace::Function, ty, Access::ReadWrite);
        b.store(var, value);
        b.return_(None);
        module
    }

    fn mat(b: &mut Builder<'_>, columns: VectorSize, rows: VectorSize, v: f32) -> Handle<Value> {
        let ty = b.types().matrix(columns, rows, Scalar::F32);
        b.splat(ty, Constant::F32(v))
    }

    fn run(module: &mut Module) {
        handle_matrix_arithmetic(module).unwrap();
        assert_valid(module, SPIRV_WRITER_CAPABILITIES);
    }

    #[test]
    fn add_is_done_per_column() {
        let mut module = build(|b| {
            let x = mat(b, VectorSize::Tri, VectorSize::Bi, 1.0);
            let y = mat(b, VectorSize::Tri, VectorSize::Bi, 2.0);
            let ty = b.module().value_type(x);
            b.add(ty, x, y)
        });
        run(&mut module);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Binary(BinaryOp::Add)), 3);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Access), 6);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Construct), 1);
    }

    #[test]
    fn scalar_times_matrix_puts_the_matrix_first() {
        let mut module = build(|b| {
            let m = mat(b, VectorSize::Bi, VectorSize::Bi, 1.0);
            let s = b.f32(3.0);
            let ty = b.module().value_type(m);
            b.multiply(ty, s, m)
        });
        run(&mut module);
        let calls = calls_to(&module, SpirvBuiltin::MatrixTimesScalar);
        assert_eq!(calls.len(), 1);
        let args = module.operands(calls[0]);
        assert!(module.types.is_matrix(module.value_type(args[0])));
    }

    #[test]
    fn multiplies_map_to_their_intrinsics() {
        let mut module = build(|b| {
            let m = mat(b, VectorSize::Tri, VectorSize::Quad, 1.0);
            let n = mat(b, VectorSize::Bi, VectorSize::Tri, 1.0);
            let vec3 = b.types().vector(VectorSize::Tri, Scalar::F32);
            let vec4 = b.types().vector(VectorSize::Quad, Scalar::F32);
            let v3 = b.splat(vec3, Constant::F32(1.0));
            let v4 = b.splat(vec4, Constant::F32(1.0));
            b.multiply(vec4, m, v3);
            b.multiply(vec3, v4, m);
            let mm_ty = b.types().matrix(VectorSize::Bi, VectorSize::Quad, Scalar::F32);
            b.multiply(mm_ty, m, n)
        });
        run(&mut module);
        assert_eq!(calls_to(&module, SpirvBuiltin::MatrixTimesVector).len(), 1);
        assert_eq!(calls_to(&module, SpirvBuiltin::VectorTimesMatrix).len(), 1);
        assert_eq!(calls_to(&module, SpirvBuiltin::MatrixTimesMatrix).len(), 1);
        assert_eq!(count_kind(&module, |k| matches!(k, InstKind::Binary(_))), 0);
    }

    #[test]
    fn convert_is_done_per_column() {
        let mut module = build(|b| {
            let m = mat(b, VectorSize::Quad, VectorSize::Tri, 0.5);
            let half = b.types().matrix(VectorSize::Quad, VectorSize::Tri, Scalar::F16);
            b.convert(half, m)
        });
        run(&mut module);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Convert), 4);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Construct), 1);
    }

    #[test]
    fn vector_arithmetic_is_untouched() {
        let mut module = build(|b| {
            let vec2 = b.types().vector(VectorSize::Bi, Scalar::F32);
            let v = b.splat(vec2, Constant::F32(1.0));
            b.add(vec2, v, v)
        });
        run(&mut module);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Binary(BinaryOp::Add)), 1);
    }
}
