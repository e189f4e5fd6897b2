//! Raising of SPIR-V builtins to core builtins and instructions.
//!
//! SPIR-V encodes integer signedness in the operation (`SDiv`, `UMax`, or an
//! explicit signedness type) rather than in the operand types. Operands
//! whose signedness differs from the requested one are bitcast, the core
//! operation runs in the requested signedness and the result is bitcast back
//! to the declared result type.

use std::collections::HashMap;

use prism_ir::{
    BinaryOp, Builder, Builtin, CoreBuiltin, Handle, InstKind, Instruction, Module, ScalarKind,
    SpirvBuiltin, Type, TypeTable, UnaryOp, Value, VectorSize, validate,
};

use crate::{Pass, SPIRV_READER_CAPABILITIES, TransformError};

const NAME: &str = "spirv.LowerBuiltins";

const SIGNED: Option<bool> = Some(true);
const UNSIGNED: Option<bool> = Some(false);

/// Replaces SPIR-V builtins with core equivalents.
#[derive(Debug)]
pub struct LowerSpirvBuiltins;

impl Pass for LowerSpirvBuiltins {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> prism_ir::Capabilities {
        SPIRV_READER_CAPABILITIES
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        lower_spirv_builtins(module)
    }
}

/// Runs the SPIR-V builtin lowering on `module`.
pub fn lower_spirv_builtins(module: &mut Module) -> Result<(), TransformError> {
    validate(module, NAME, SPIRV_READER_CAPABILITIES)?;
    let worklist: Vec<_> = module
        .instructions()
        .into_iter()
        .filter_map(|inst| match module.kind(inst).builtin() {
            Some(Builtin::Spirv(builtin)) if is_lowered(builtin) => Some((inst, builtin)),
            _ => None,
        })
        .collect();

    let mut state = State { module };
    for (call, builtin) in worklist {
        log::trace!("{NAME}: {builtin:?} at {call:?}");
        state.lower(call, builtin);
    }
    Ok(())
}

/// Image operations belong to the texture lowering and the `*Times*`
/// intrinsics only exist on the way out to SPIR-V.
fn is_lowered(builtin: SpirvBuiltin) -> bool {
    !builtin.is_image_op()
        && !matches!(
            builtin,
            SpirvBuiltin::SampledImage
                | SpirvBuiltin::Image
                | SpirvBuiltin::MatrixTimesMatrix
                | SpirvBuiltin::MatrixTimesScalar
                | SpirvBuiltin::MatrixTimesVector
                | SpirvBuiltin::VectorTimesMatrix
                | SpirvBuiltin::VectorTimesScalar
        )
}

/// The core operation a signedness-parameterized builtin maps to.
#[derive(Clone, Copy, Debug)]
enum Op {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Convert,
    Call(CoreBuiltin),
}

struct State<'a> {
    module: &'a mut Module,
}

impl State<'_> {
    fn lower(&mut self, call: Handle<Instruction>, builtin: SpirvBuiltin) {
        use SpirvBuiltin as S;

        let same = Some(self.requested_signedness(call));
        match builtin {
            S::Add => self.rewrite(call, Op::Binary(BinaryOp::Add), &[same, same], same),
            S::Sub => self.rewrite(call, Op::Binary(BinaryOp::Subtract), &[same, same], same),
            S::Mul => self.rewrite(call, Op::Binary(BinaryOp::Multiply), &[same, same], same),
            S::BitwiseAnd => self.rewrite(call, Op::Binary(BinaryOp::And), &[same, same], same),
            S::BitwiseOr => self.rewrite(call, Op::Binary(BinaryOp::Or), &[same, same], same),
            S::BitwiseXor => self.rewrite(call, Op::Binary(BinaryOp::Xor), &[same, same], same),
            S::SDiv => self.rewrite(call, Op::Binary(BinaryOp::Divide), &[SIGNED, SIGNED], SIGNED),
            S::UDiv => self.rewrite(call, Op::Binary(BinaryOp::Divide), &[UNSIGNED, UNSIGNED], UNSIGNED),
            S::SMod => self.rewrite(call, Op::Binary(BinaryOp::Modulo), &[SIGNED, SIGNED], SIGNED),
            S::UMod => self.rewrite(call, Op::Binary(BinaryOp::Modulo), &[UNSIGNED, UNSIGNED], UNSIGNED),

            S::Equal => self.rewrite(call, Op::Binary(BinaryOp::Equal), &[same, same], None),
            S::NotEqual => self.rewrite(call, Op::Binary(BinaryOp::NotEqual), &[same, same], None),
            S::SGreaterThan => self.compare(call, BinaryOp::GreaterThan, SIGNED),
            S::SGreaterThanEqual => self.compare(call, BinaryOp::GreaterThanEqual, SIGNED),
            S::SLessThan => self.compare(call, BinaryOp::LessThan, SIGNED),
            S::SLessThanEqual => self.compare(call, BinaryOp::LessThanEqual, SIGNED),
            S::UGreaterThan => self.compare(call, BinaryOp::GreaterThan, UNSIGNED),
            S::UGreaterThanEqual => self.compare(call, BinaryOp::GreaterThanEqual, UNSIGNED),
            S::ULessThan => self.compare(call, BinaryOp::LessThan, UNSIGNED),
            S::ULessThanEqual => self.compare(call, BinaryOp::LessThanEqual, UNSIGNED),

            S::ShiftLeftLogical => self.rewrite(call, Op::Binary(BinaryOp::ShiftLeft), &[same, UNSIGNED], same),
            S::ShiftRightArithmetic => {
                self.rewrite(call, Op::Binary(BinaryOp::ShiftRight), &[SIGNED, UNSIGNED], SIGNED)
            }
            S::ShiftRightLogical => {
                self.rewrite(call, Op::Binary(BinaryOp::ShiftRight), &[UNSIGNED, UNSIGNED], UNSIGNED)
            }

            S::Not => self.rewrite(call, Op::Unary(UnaryOp::Complement), &[same], same),
            S::SNegate => self.rewrite(call, Op::Unary(UnaryOp::Negation), &[SIGNED], SIGNED),

            S::SAbs => self.rewrite(call, Op::Call(CoreBuiltin::Abs), &[SIGNED], SIGNED),
            S::SMax => self.rewrite(call, Op::Call(CoreBuiltin::Max), &[SIGNED, SIGNED], SIGNED),
            S::SMin => self.rewrite(call, Op::Call(CoreBuiltin::Min), &[SIGNED, SIGNED], SIGNED),
            S::UMax => self.rewrite(call, Op::Call(CoreBuiltin::Max), &[UNSIGNED, UNSIGNED], UNSIGNED),
            S::UMin => self.rewrite(call, Op::Call(CoreBuiltin::Min), &[UNSIGNED, UNSIGNED], UNSIGNED),
            S::SClamp => self.rewrite(call, Op::Call(CoreBuiltin::Clamp), &[SIGNED; 3], SIGNED),
            S::UClamp => self.rewrite(call, Op::Call(CoreBuiltin::Clamp), &[UNSIGNED; 3], UNSIGNED),
            S::FindILsb => self.rewrite(call, Op::Call(CoreBuiltin::FirstTrailingBit), &[same], same),
            S::FindSMsb => self.rewrite(call, Op::Call(CoreBuiltin::FirstLeadingBit), &[SIGNED], SIGNED),
            S::FindUMsb => self.rewrite(call, Op::Call(CoreBuiltin::FirstLeadingBit), &[UNSIGNED], UNSIGNED),
            S::BitCount => {
                // Counted in the argument's own type.
                let own = Some(self.operand_signed(call, 0));
                self.rewrite(call, Op::Call(CoreBuiltin::CountOneBits), &[], own)
            }
            S::BitFieldInsert => self.rewrite(
                call,
                Op::Call(CoreBuiltin::InsertBits),
                &[same, same, UNSIGNED, UNSIGNED],
                same,
            ),
            S::BitFieldSExtract => self.rewrite(
                call,
                Op::Call(CoreBuiltin::ExtractBits),
                &[SIGNED, UNSIGNED, UNSIGNED],
                SIGNED,
            ),
            S::BitFieldUExtract => self.rewrite(
                call,
                Op::Call(CoreBuiltin::ExtractBits),
                &[UNSIGNED, UNSIGNED, UNSIGNED],
                UNSIGNED,
            ),

            S::ConvertFToS => self.rewrite(call, Op::Convert, &[], SIGNED),
            S::ConvertSToF => self.rewrite(call, Op::Convert, &[SIGNED], None),
            S::ConvertUToF => self.rewrite(call, Op::Convert, &[UNSIGNED], None),
            S::Ldexp => self.rewrite(call, Op::Call(CoreBuiltin::Ldexp), &[None, SIGNED], None),

            S::Normalize => {
                let result_ty = self.result_type(call);
                let core = if self.module.types.is_scalar(result_ty) {
                    CoreBuiltin::Sign
                } else {
                    CoreBuiltin::Normalize
                };
                self.rewrite(call, Op::Call(core), &[], None);
            }
            S::FaceForward => self.vector_only(call, CoreBuiltin::FaceForward, 3),
            S::Reflect => self.vector_only(call, CoreBuiltin::Reflect, 2),
            S::Refract => self.vector_only(call, CoreBuiltin::Refract, 2),
            S::FMod => self.fmod(call),
            S::Inverse => self.inverse(call),
            S::Modf => self.out_param(call, CoreBuiltin::Modf),
            S::Frexp => self.out_param(call, CoreBuiltin::Frexp),
            S::OuterProduct => self.outer_product(call),

            S::SampledImage
            | S::Image
            | S::ImageDrefGather
            | S::ImageFetch
            | S::ImageGather
            | S::ImageQueryLevels
            | S::ImageQuerySamples
            | S::ImageQuerySize
            | S::ImageQuerySizeLod
            | S::ImageRead
            | S::ImageSampleDrefExplicitLod
            | S::ImageSampleDrefImplicitLod
            | S::ImageSampleExplicitLod
            | S::ImageSampleImplicitLod
            | S::ImageSampleProjDrefExplicitLod
            | S::ImageSampleProjDrefImplicitLod
            | S::ImageSampleProjExplicitLod
            | S::ImageSampleProjImplicitLod
            | S::ImageWrite
            | S::MatrixTimesMatrix
            | S::MatrixTimesScalar
            | S::MatrixTimesVector
            | S::VectorTimesMatrix
            | S::VectorTimesScalar => unreachable!("{builtin:?} is not lowered by {NAME}"),
        }
    }

    fn result_type(&self, call: Handle<Instruction>) -> Handle<Type> {
        self.module.value_type(self.module.result(call))
    }

    fn operand_signed(&self, call: Handle<Instruction>, index: usize) -> bool {
        let ty = self.module.value_type(self.module.operand(call, index));
        self.module.types.is_signed_integer(ty)
    }

    /// The signedness named by the first explicit type, or else the
    /// signedness of the first argument.
    fn requested_signedness(&self, call: Handle<Instruction>) -> bool {
        let module = &*self.module;
        let explicit = match module.kind(call) {
            InstKind::BuiltinCall { explicit_types, .. } => explicit_types.first().copied(),
            _ => None,
        };
        match explicit {
            Some(ty) => module
                .types
                .scalar_of(ty)
                .is_some_and(|s| s.kind == ScalarKind::Sint),
            None => self.operand_signed(call, 0),
        }
    }

    fn compare(&mut self, call: Handle<Instruction>, op: BinaryOp, signed: Option<bool>) {
        self.rewrite(call, Op::Binary(op), &[signed, signed], None);
    }

    /// Emits `op` with operand `i` cast to `operand_signs[i]` and the
    /// operation typed with `result_sign`, then casts to the call's type.
    fn rewrite(
        &mut self,
        call: Handle<Instruction>,
        op: Op,
        operand_signs: &[Option<bool>],
        result_sign: Option<bool>,
    ) {
        let operands = self.module.operands(call).to_vec();
        let result_ty = self.result_type(call);
        let mut b = Builder::before(self.module, call);
        let args: Vec<_> = operands
            .iter()
            .enumerate()
            .map(|(i, &v)| match operand_signs.get(i).copied().flatten() {
                Some(signed) => cast_signedness(&mut b, v, signed),
                None => v,
            })
            .collect();
        let op_ty = match result_sign {
            Some(signed) => with_signedness(b.types(), result_ty, signed),
            None => result_ty,
        };
        let value = match op {
            Op::Binary(op) => b.binary(op, op_ty, args[0], args[1]),
            Op::Unary(op) => b.unary(op, op_ty, args[0]),
            Op::Convert => b.convert(op_ty, args[0]),
            Op::Call(core) => b.call(op_ty, core, args),
        };
        let value = if op_ty == result_ty {
            value
        } else {
            b.bitcast(result_ty, value)
        };
        self.module.replace_with(call, value);
    }

    /// Builtins that only exist for vectors. A scalar call runs on
    /// `vec2(x, 0)` for each of the first `embedded` arguments and takes the
    /// first component.
    fn vector_only(&mut self, call: Handle<Instruction>, core: CoreBuiltin, embedded: usize) {
        let result_ty = self.result_type(call);
        let Some(scalar) = self.module.types.scalar_of(result_ty) else {
            unreachable!("{core:?} on a non-numeric type");
        };
        if !self.module.types.is_scalar(result_ty) {
            self.rewrite(call, Op::Call(core), &[], None);
            return;
        }
        let vec2 = self.module.types.vector(VectorSize::Bi, scalar);
        let operands = self.module.operands(call).to_vec();
        let mut b = Builder::before(self.module, call);
        let zero = b.zero(result_ty);
        let args = operands
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                if i < embedded {
                    b.construct(vec2, vec![v, zero])
                } else {
                    v
                }
            })
            .collect();
        let vector = b.call(vec2, core, args);
        let x = b.access_const(result_ty, vector, 0);
        self.module.replace_with(call, x);
    }

    /// `x - y * floor(x / y)`.
    fn fmod(&mut self, call: Handle<Instruction>) {
        let ty = self.result_type(call);
        let (x, y) = (self.module.operand(call, 0), self.module.operand(call, 1));
        let mut b = Builder::before(self.module, call);
        let quotient = b.divide(ty, x, y);
        let floor = b.call(ty, CoreBuiltin::Floor, vec![quotient]);
        let product = b.multiply(ty, y, floor);
        let result = b.subtract(ty, x, product);
        self.module.replace_with(call, result);
    }

    /// `modf`/`frexp` storing their second result through a pointer become
    /// the struct-returning core builtin.
    fn out_param(&mut self, call: Handle<Instruction>, core: CoreBuiltin) {
        let operands = self.module.operands(call).to_vec();
        let &[x, ptr] = operands.as_slice() else {
            // Already the struct form.
            self.rewrite(call, Op::Call(core), &[], None);
            return;
        };
        let x_ty = self.module.value_type(x);
        let types = &mut self.module.types;
        let result_ty = match core {
            CoreBuiltin::Modf => types.modf_result(x_ty),
            _ => types.frexp_result(x_ty),
        };
        let Some(second_ty) = types.member(result_ty, Some(1)) else {
            unreachable!("builtin result struct without a second member");
        };
        let ptr_ty = self.module.value_type(ptr);
        let Some(pointee) = self.module.types.store_type(ptr_ty) else {
            unreachable!("{core:?} output operand is not a pointer");
        };

        let mut b = Builder::before(self.module, call);
        let result = b.call(result_ty, core, vec![x]);
        let mut second = b.access_const(second_ty, result, 1);
        if pointee != second_ty {
            second = b.bitcast(pointee, second);
        }
        b.store(ptr, second);
        let first = b.access_const(x_ty, result, 0);
        self.module.replace_with(call, first);
    }

    /// Column `j` of `outerProduct(c, r)` is `c * r[j]`, built per element.
    fn outer_product(&mut self, call: Handle<Instruction>) {
        let result_ty = self.result_type(call);
        let Type::Matrix {
            columns,
            rows,
            scalar,
        } = self.module.types[result_ty]
        else {
            unreachable!("outer product does not produce a matrix");
        };
        let (c, r) = (self.module.operand(call, 0), self.module.operand(call, 1));
        let element_ty = self.module.types.scalar(scalar);
        let column_ty = self.module.types.vector(rows, scalar);

        let mut b = Builder::before(self.module, call);
        let mut matrix_columns = Vec::with_capacity(columns.count() as usize);
        for j in 0..columns.count() {
            let rj = b.access_const(element_ty, r, j);
            let elements = (0..rows.count())
                .map(|i| {
                    let ci = b.access_const(element_ty, c, i);
                    b.multiply(element_ty, ci, rj)
                })
                .collect();
            matrix_columns.push(b.construct(column_ty, elements));
        }
        let matrix = b.construct(result_ty, matrix_columns);
        self.module.replace_with(call, matrix);
    }

    /// Closed-form inverse: the adjugate scaled by `1 / det`, with every
    /// minor expanded from scalar elements.
    fn inverse(&mut self, call: Handle<Instruction>) {
        let result_ty = self.result_type(call);
        let Type::Matrix {
            columns,
            rows,
            scalar,
        } = self.module.types[result_ty]
        else {
            unreachable!("inverse of a non-matrix");
        };
        assert_eq!(columns, rows, "inverse of a non-square matrix");
        let n = columns.count() as usize;
        let m = self.module.operand(call, 0);
        let element_ty = self.module.types.scalar(scalar);
        let column_ty = self.module.types.vector(rows, scalar);

        let mut b = Builder::before(self.module, call);
        let mut elements = vec![Vec::with_capacity(n); n];
        for col in 0..n {
            let column = b.access_const(column_ty, m, col as u32);
            for (row, element_row) in elements.iter_mut().enumerate() {
                element_row.push(b.access_const(element_ty, column, row as u32));
            }
        }
        let mut minors = Minors {
            element_ty,
            elements,
            cache: HashMap::new(),
        };
        let all = (1u8 << n) - 1;
        let det = minors.det(&mut b, all, all);
        let one = b.one(element_ty);
        let inv_det = b.divide(element_ty, one, det);

        let mut inverse_columns = Vec::with_capacity(n);
        for j in 0..n {
            let components = (0..n)
                .map(|i| {
                    // inverse[i][j] = cofactor(j, i) / det
                    let minor = minors.det(&mut b, all & !(1 << j), all & !(1 << i));
                    let cofactor = if (i + j) % 2 == 1 {
                        b.negation(element_ty, minor)
                    } else {
                        minor
                    };
                    b.multiply(element_ty, cofactor, inv_det)
                })
                .collect();
            inverse_columns.push(b.construct(column_ty, components));
        }
        let inverse = b.construct(result_ty, inverse_columns);
        self.module.replace_with(call, inverse);
    }
}

/// Determinants of square submatrices, keyed by (row mask, column mask).
struct Minors {
    element_ty: Handle<Type>,
    /// `elements[row][col]`.
    elements: Vec<Vec<Handle<Value>>>,
    cache: HashMap<(u8, u8), Handle<Value>>,
}

impl Minors {
    /// Laplace expansion along the first remaining row.
    fn det(&mut self, b: &mut Builder<'_>, rows: u8, cols: u8) -> Handle<Value> {
        if let Some(&det) = self.cache.get(&(rows, cols)) {
            return det;
        }
        let row = rows.trailing_zeros() as usize;
        let det = if rows.count_ones() == 1 {
            self.elements[row][cols.trailing_zeros() as usize]
        } else {
            let mut sum = None;
            for (k, col) in (0..8).filter(|c| cols & (1 << c) != 0).enumerate() {
                let minor = self.det(b, rows & !(1 << row), cols & !(1 << col));
                let term = b.multiply(self.element_ty, self.elements[row][col], minor);
                sum = Some(match sum {
                    None => term,
                    Some(acc) if k % 2 == 0 => b.add(self.element_ty, acc, term),
                    Some(acc) => b.subtract(self.element_ty, acc, term),
                });
            }
            let Some(sum) = sum else {
                unreachable!("determinant of an empty submatrix");
            };
            sum
        };
        self.cache.insert((rows, cols), det);
        det
    }
}

/// `ty` with its integer scalar switched to the requested signedness.
fn with_signedness(types: &mut TypeTable, ty: Handle<Type>, signed: bool) -> Handle<Type> {
    match types.scalar_of(ty) {
        Some(scalar) if scalar.is_integer() && types.is_scalar_or_vector(ty) => {
            types.with_scalar(ty, scalar.with_signedness(signed))
        }
        _ => ty,
    }
}

fn cast_signedness(b: &mut Builder<'_>, value: Handle<Value>, signed: bool) -> Handle<Value> {
    let ty = b.module().value_type(value);
    let target = with_signedness(b.types(), ty, signed);
    if target == ty {
        value
    } else {
        b.bitcast(target, value)
    }
}
