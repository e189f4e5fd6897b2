//! GLSL builtin polyfill.
//!
//! Rewrites core builtins that GLSL lacks or spells differently into
//! equivalent instruction sequences, GLSL builtins, or calls to helper
//! functions generated once per argument type.

use std::collections::HashMap;

use prism_ir::{
    Access, AddressSpace, Builder, Capabilities, CoreBuiltin, Function, GlslBuiltin, Handle,
    InstKind, Instruction, IoAttributes, Module, Scalar, Type, Value, validate,
};

use crate::config::PolyfillConfig;
use crate::{Pass, TransformError};

const NAME: &str = "glsl.BuiltinPolyfill";

/// Replaces core builtins with GLSL-compatible forms.
#[derive(Debug, Default)]
pub struct BuiltinPolyfill {
    config: PolyfillConfig,
}

impl BuiltinPolyfill {
    pub fn new(config: PolyfillConfig) -> Self {
        Self { config }
    }
}

impl Pass for BuiltinPolyfill {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        builtin_polyfill(module, &self.config)
    }
}

/// Runs the GLSL builtin polyfill on `module`.
pub fn builtin_polyfill(module: &mut Module, config: &PolyfillConfig) -> Result<(), TransformError> {
    validate(module, NAME, Capabilities::EMPTY)?;
    let mut state = State {
        module,
        config,
        int_dot: HashMap::new(),
        quantize: HashMap::new(),
    };
    state.process();
    Ok(())
}

/// The rewrite applied to a collected call.
#[derive(Clone, Copy, Debug)]
enum Polyfill {
    /// The call is a no-op on its first argument.
    Identity,
    IntDot,
    Frexp,
    Modf,
    Fma,
    CountOneBits,
    AtomicCompareExchange,
    AtomicSub,
    AtomicLoad,
    /// `barrier()`, followed by a memory barrier if one is given.
    Barrier(Option<GlslBuiltin>),
    Select,
    QuantizeToF16,
    /// Bitfield builtins taking signed offset and count.
    Bitfield(GlslBuiltin),
    /// Same operands, different name.
    Rename(GlslBuiltin),
}

struct State<'a> {
    module: &'a mut Module,
    config: &'a PolyfillConfig,
    /// `tint_int_dot` helpers by vector type.
    int_dot: HashMap<Handle<Type>, Handle<Function>>,
    /// `tint_quantize_to_f16` helpers by argument type.
    quantize: HashMap<Handle<Type>, Handle<Function>>,
}

impl State<'_> {
    fn process(&mut self) {
        let worklist: Vec<(Handle<Instruction>, Polyfill)> = self
            .module
            .instructions()
            .into_iter()
            .filter_map(|inst| self.classify(inst).map(|p| (inst, p)))
            .collect();

        for (call, polyfill) in worklist {
            log::trace!("{NAME}: {polyfill:?} at {call:?}");
            match polyfill {
                Polyfill::Identity => {
                    let arg = self.module.operand(call, 0);
                    self.module.replace_with(call, arg);
                }
                Polyfill::IntDot => self.int_dot_call(call),
                Polyfill::Frexp => self.out_param_call(call, GlslBuiltin::Frexp),
                Polyfill::Modf => self.out_param_call(call, GlslBuiltin::Modf),
                Polyfill::Fma => self.fma(call),
                Polyfill::CountOneBits => self.count_one_bits(call),
                Polyfill::AtomicCompareExchange => self.atomic_compare_exchange(call),
                Polyfill::AtomicSub => self.atomic_sub(call),
                Polyfill::AtomicLoad => self.atomic_load(call),
                Polyfill::Barrier(memory) => self.barrier(call, memory),
                Polyfill::Select => self.select(call),
                Polyfill::QuantizeToF16 => self.quantize_call(call),
                Polyfill::Bitfield(glsl) => self.bitfield(call, glsl),
                Polyfill::Rename(glsl) => {
                    *self.module.kind_mut(call) = InstKind::BuiltinCall {
                        builtin: glsl.into(),
                        explicit_types: Vec::new(),
                    };
                }
            }
        }
    }

    fn classify(&self, inst: Handle<Instruction>) -> Option<Polyfill> {
        let module = &*self.module;
        let InstKind::BuiltinCall {
            builtin: prism_ir::Builtin::Core(builtin),
            ..
        } = *module.kind(inst)
        else {
            return None;
        };
        let types = &module.types;
        let arg = module.operands(inst).first().map(|&v| module.value_type(v));
        let polyfill = match builtin {
            CoreBuiltin::Abs if arg.is_some_and(|t| types.is_unsigned_integer(t)) => Polyfill::Identity,
            CoreBuiltin::Any | CoreBuiltin::All if arg.is_some_and(|t| types.is_scalar(t)) => {
                Polyfill::Identity
            }
            CoreBuiltin::Dot if arg.is_some_and(|t| types.is_vector(t) && types.is_integer(t)) => {
                Polyfill::IntDot
            }
            CoreBuiltin::Fma if self.config.fma => Polyfill::Fma,
            CoreBuiltin::Frexp => Polyfill::Frexp,
            CoreBuiltin::Modf => Polyfill::Modf,
            CoreBuiltin::CountOneBits => Polyfill::CountOneBits,
            CoreBuiltin::AtomicCompareExchangeWeak => Polyfill::AtomicCompareExchange,
            CoreBuiltin::AtomicSub => Polyfill::AtomicSub,
            CoreBuiltin::AtomicLoad => Polyfill::AtomicLoad,
            CoreBuiltin::WorkgroupBarrier => Polyfill::Barrier(None),
            CoreBuiltin::StorageBarrier => Polyfill::Barrier(Some(GlslBuiltin::MemoryBarrierBuffer)),
            CoreBuiltin::TextureBarrier => Polyfill::Barrier(Some(GlslBuiltin::MemoryBarrierImage)),
            CoreBuiltin::Select => Polyfill::Select,
            CoreBuiltin::QuantizeToF16 => Polyfill::QuantizeToF16,
            CoreBuiltin::ExtractBits => Polyfill::Bitfield(GlslBuiltin::BitfieldExtract),
            CoreBuiltin::InsertBits => Polyfill::Bitfield(GlslBuiltin::BitfieldInsert),
            CoreBuiltin::Pack2x16Float => Polyfill::Rename(GlslBuiltin::PackHalf2X16),
            CoreBuiltin::Unpack2x16Float => Polyfill::Rename(GlslBuiltin::UnpackHalf2X16),
            _ => return None,
        };
        Some(polyfill)
    }

    fn result_type(&self, call: Handle<Instruction>) -> Handle<Type> {
        self.module.value_type(self.module.result(call))
    }

    fn int_dot_call(&mut self, call: Handle<Instruction>) {
        let (lhs, rhs) = (self.module.operand(call, 0), self.module.operand(call, 1));
        let vec_ty = self.module.value_type(lhs);
        let helper = self.int_dot_helper(vec_ty);
        let value = Builder::before(self.module, call).call_user(helper, vec![lhs, rhs]);
        self.module.replace_with(call, value);
    }

    fn int_dot_helper(&mut self, vec_ty: Handle<Type>) -> Handle<Function> {
        if let Some(&f) = self.int_dot.get(&vec_ty) {
            return f;
        }
        let module = &mut *self.module;
        let elem = element_type(module, vec_ty);
        let width = module.types.width(vec_ty);
        let name = module.symbols.new_symbol("tint_int_dot");
        log::debug!("{NAME}: creating {name} for {}", module.types.name(vec_ty));
        let f = module.new_function(&name, elem);
        let lhs = module.add_param(f, vec_ty, IoAttributes::default());
        let rhs = module.add_param(f, vec_ty, IoAttributes::default());
        module.set_name(lhs, "lhs");
        module.set_name(rhs, "rhs");

        let body = module.function(f).body();
        let mut b = Builder::at_end(module, body);
        let mut sum = None;
        for i in 0..width {
            let l = b.access_const(elem, lhs, i);
            let r = b.access_const(elem, rhs, i);
            let product = b.multiply(elem, l, r);
            sum = Some(match sum {
                Some(acc) => b.add(elem, acc, product),
                None => product,
            });
        }
        b.return_(sum);
        self.int_dot.insert(vec_ty, f);
        f
    }

    /// `frexp`/`modf`: the GLSL form returns the first member and writes the
    /// second through a pointer.
    fn out_param_call(&mut self, call: Handle<Instruction>, glsl: GlslBuiltin) {
        let module = &mut *self.module;
        let arg = module.operand(call, 0);
        let arg_ty = module.value_type(arg);
        let result_ty = module.value_type(module.result(call));
        let Some(second_ty) = module.types.member(result_ty, Some(1)) else {
            unreachable!("{glsl:?} result is not a two-member struct");
        };
        let mut b = Builder::before(module, call);
        let out = b.var(AddressSpace::Function, second_ty, Access::ReadWrite);
        let first = b.call(arg_ty, glsl, vec![arg, out]);
        let second = b.load(out);
        let value = b.construct(result_ty, vec![first, second]);
        module.replace_with(call, value);
    }

    fn fma(&mut self, call: Handle<Instruction>) {
        let ty = self.result_type(call);
        let ops = self.module.operands(call).to_vec();
        let mut b = Builder::before(self.module, call);
        let product = b.multiply(ty, ops[0], ops[1]);
        let sum = b.add(ty, product, ops[2]);
        self.module.replace_with(call, sum);
    }

    /// GLSL `bitCount` always returns a signed integer.
    fn count_one_bits(&mut self, call: Handle<Instruction>) {
        let ty = self.result_type(call);
        let arg = self.module.operand(call, 0);
        let signed_ty = self.module.types.with_scalar(ty, Scalar::I32);
        let mut b = Builder::before(self.module, call);
        let mut value = b.call(signed_ty, GlslBuiltin::BitCount, vec![arg]);
        if signed_ty != ty {
            value = b.convert(ty, value);
        }
        self.module.replace_with(call, value);
    }

    fn atomic_compare_exchange(&mut self, call: Handle<Instruction>) {
        let result_ty = self.result_type(call);
        let ops = self.module.operands(call).to_vec();
        let (ptr, compare, value) = (ops[0], ops[1], ops[2]);
        let scalar_ty = self.module.value_type(compare);
        let bool_ty = self.module.types.bool();
        let mut b = Builder::before(self.module, call);
        let old = b.call(scalar_ty, GlslBuiltin::AtomicCompSwap, vec![ptr, compare, value]);
        let exchanged = b.equal(bool_ty, old, compare);
        let result = b.construct(result_ty, vec![old, exchanged]);
        self.module.replace_with(call, result);
    }

    /// Signed subtraction is an add of the negation; there is no unsigned
    /// negation, so `u32` uses the GLSL builtin.
    fn atomic_sub(&mut self, call: Handle<Instruction>) {
        let ty = self.result_type(call);
        let (ptr, value) = (self.module.operand(call, 0), self.module.operand(call, 1));
        let signed = self.module.types.is_signed_integer(ty);
        let mut b = Builder::before(self.module, call);
        let result = if signed {
            let negated = b.negation(ty, value);
            b.call(ty, CoreBuiltin::AtomicAdd, vec![ptr, negated])
        } else {
            b.call(ty, GlslBuiltin::AtomicSub, vec![ptr, value])
        };
        self.module.replace_with(call, result);
    }

    fn atomic_load(&mut self, call: Handle<Instruction>) {
        let ty = self.result_type(call);
        let ptr = self.module.operand(call, 0);
        let mut b = Builder::before(self.module, call);
        let zero = b.zero(ty);
        let result = b.call(ty, CoreBuiltin::AtomicOr, vec![ptr, zero]);
        self.module.replace_with(call, result);
    }

    fn barrier(&mut self, call: Handle<Instruction>, memory: Option<GlslBuiltin>) {
        let mut b = Builder::before(self.module, call);
        let void = b.types().void();
        b.call(void, GlslBuiltin::Barrier, Vec::new());
        if let Some(memory) = memory {
            b.call(void, memory, Vec::new());
        }
        self.module.destroy(call);
    }

    /// `select(f, t, cond)` is `mix(f, t, cond)` with a condition as wide as
    /// the result.
    fn select(&mut self, call: Handle<Instruction>) {
        let ty = self.result_type(call);
        let ops = self.module.operands(call).to_vec();
        let (on_false, on_true, mut cond) = (ops[0], ops[1], ops[2]);
        let width = self.module.types.width(ty);
        let cond_ty = self.module.value_type(cond);
        let splat_ty = (width > 1 && self.module.types.is_scalar(cond_ty))
            .then(|| self.module.types.vec_or_scalar(width, Scalar::BOOL));
        let mut b = Builder::before(self.module, call);
        if let Some(splat_ty) = splat_ty {
            cond = b.construct(splat_ty, vec![cond; width as usize]);
        }
        let result = b.call(ty, GlslBuiltin::Mix, vec![on_false, on_true, cond]);
        self.module.replace_with(call, result);
    }

    fn quantize_call(&mut self, call: Handle<Instruction>) {
        let arg = self.module.operand(call, 0);
        let ty = self.module.value_type(arg);
        let helper = self.quantize_helper(ty);
        let value = Builder::before(self.module, call).call_user(helper, vec![arg]);
        self.module.replace_with(call, value);
    }

    fn quantize_helper(&mut self, ty: Handle<Type>) -> Handle<Function> {
        if let Some(&f) = self.quantize.get(&ty) {
            return f;
        }
        let module = &mut *self.module;
        let width = module.types.width(ty);
        let name = module.symbols.new_symbol("tint_quantize_to_f16");
        log::debug!("{NAME}: creating {name} for {}", module.types.name(ty));
        let f = module.new_function(&name, ty);
        let value = module.add_param(f, ty, IoAttributes::default());
        module.set_name(value, "value");
        let f32_ty = module.types.f32();
        let vec2_ty = module.types.vec_or_scalar(2, Scalar::F32);

        let body = module.function(f).body();
        let mut b = Builder::at_end(module, body);
        let result = match width {
            1 => {
                let zero = b.f32(0.0);
                let pair = b.construct(vec2_ty, vec![value, zero]);
                let rounded = round_trip_f16(&mut b, pair);
                b.access_const(f32_ty, rounded, 0)
            }
            2 => round_trip_f16(&mut b, value),
            3 => {
                let xy = b.swizzle(vec2_ty, value, vec![0, 1]);
                let zz = b.swizzle(vec2_ty, value, vec![2, 2]);
                let xy = round_trip_f16(&mut b, xy);
                let zz = round_trip_f16(&mut b, zz);
                let z = b.access_const(f32_ty, zz, 0);
                b.construct(ty, vec![xy, z])
            }
            4 => {
                let xy = b.swizzle(vec2_ty, value, vec![0, 1]);
                let zw = b.swizzle(vec2_ty, value, vec![2, 3]);
                let xy = round_trip_f16(&mut b, xy);
                let zw = round_trip_f16(&mut b, zw);
                b.construct(ty, vec![xy, zw])
            }
            _ => unreachable!("quantizeToF16 of a non-numeric type"),
        };
        b.return_(Some(result));
        self.quantize.insert(ty, f);
        f
    }

    /// The last two operands (offset, count) become `i32`.
    fn bitfield(&mut self, call: Handle<Instruction>, glsl: GlslBuiltin) {
        let ty = self.result_type(call);
        let mut args = self.module.operands(call).to_vec();
        let i32_ty = self.module.types.i32();
        let split = args.len().saturating_sub(2);
        let mut b = Builder::before(self.module, call);
        for arg in &mut args[split..] {
            if b.module().value_type(*arg) != i32_ty {
                *arg = b.convert(i32_ty, *arg);
            }
        }
        let result = b.call(ty, glsl, args);
        self.module.replace_with(call, result);
    }
}

/// `unpackHalf2x16(packHalf2x16(pair))`.
fn round_trip_f16(b: &mut Builder<'_>, pair: Handle<Value>) -> Handle<Value> {
    let u32_ty = b.types().u32();
    let vec2_ty = b.module().value_type(pair);
    let packed = b.call(u32_ty, GlslBuiltin::PackHalf2X16, vec![pair]);
    b.call(vec2_ty, GlslBuiltin::UnpackHalf2X16, vec![packed])
}

fn element_type(module: &mut Module, vec_ty: Handle<Type>) -> Handle<Type> {
    match module.types.element(vec_ty) {
        Some(elem) => elem,
        None => unreachable!("integer dot of a non-vector type"),
    }
}
