//! Lowering of SPIR-V image operations to core texture builtins.
//!
//! Runs in two phases. The first finds every texture and sampler used for a
//! depth comparison, promotes the variables they come from to depth and
//! comparison types, and pushes the new types through loads, lets and user
//! calls, forking callees whose parameter types change. The second rewrites
//! each image operation into its core builtin: combined image/samplers are
//! split and coordinates are reshaped for the texture's dimensionality.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use prism_ir::{
    Builder, Builtin, CoreBuiltin, Function, Handle, ImageOperands, InstKind, Instruction, Module,
    SamplerKind, Scalar, SpirvBuiltin, TextureDimension, Type, Value, ValueKind, validate,
};

use crate::{Pass, SPIRV_READER_CAPABILITIES, TransformError};

const NAME: &str = "spirv.LowerTexture";

/// Splits combined image/samplers and raises image operations.
#[derive(Debug)]
pub struct LowerSpirvTexture;

impl Pass for LowerSpirvTexture {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> prism_ir::Capabilities {
        SPIRV_READER_CAPABILITIES
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        lower_spirv_texture(module)
    }
}

/// Runs the SPIR-V texture lowering on `module`.
pub fn lower_spirv_texture(module: &mut Module) -> Result<(), TransformError> {
    validate(module, NAME, SPIRV_READER_CAPABILITIES)?;
    check_image_operands(module)?;
    let mut state = State {
        module,
        values: VecDeque::new(),
        lets: VecDeque::new(),
        calls: Vec::new(),
        forks: HashMap::new(),
    };
    state.promote_depth_handles();
    state.replace_image_extractions();
    state.lower_image_ops();
    state.remove_sampled_images();
    Ok(())
}

struct State<'a> {
    module: &'a mut Module,
    /// Values whose type changed; their users may need new types too.
    values: VecDeque<Handle<Value>>,
    /// Lets of a retyped value. Inlined so that users see the new type.
    lets: VecDeque<Handle<Instruction>>,
    /// Calls whose arguments may no longer match the callee's parameters.
    calls: Vec<Handle<Instruction>>,
    /// Forked callees keyed by the original and the changed parameter indices.
    forks: HashMap<(Handle<Function>, Vec<usize>), Handle<Function>>,
}

impl State<'_> {
    // ---- depth promotion ----

    fn promote_depth_handles(&mut self) {
        let mut textures = BTreeSet::new();
        let mut samplers = BTreeSet::new();
        for inst in self.module.instructions() {
            let Some(Builtin::Spirv(builtin)) = self.module.kind(inst).builtin() else {
                continue;
            };
            if !builtin.is_depth_compare() {
                continue;
            }
            let (texture, sampler) = self.split_sampled_image(self.module.operand(inst, 0));
            textures.extend(self.origin_vars(texture));
            samplers.extend(self.origin_vars(sampler));
        }

        for var in textures {
            self.promote_var(var, depth_texture);
        }
        for var in samplers {
            self.promote_var(var, comparison_sampler);
        }
        self.propagate();
    }

    /// The module-scope vars a handle value may have been loaded from,
    /// following lets and function parameters back to every caller.
    fn origin_vars(&self, value: Handle<Value>) -> Vec<Handle<Instruction>> {
        let mut vars = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![value];
        while let Some(value) = pending.pop() {
            if !seen.insert(value) {
                continue;
            }
            match self.module.value(value).kind {
                ValueKind::Param { function, index } => pending.extend(
                    self.module
                        .user_calls_of(function)
                        .into_iter()
                        .map(|call| self.module.operand(call, index)),
                ),
                ValueKind::Result {
                    instruction: Some(inst),
                } => match self.module.kind(inst) {
                    InstKind::Var { .. } => vars.push(inst),
                    InstKind::Load | InstKind::Let => pending.push(self.module.operand(inst, 0)),
                    InstKind::BuiltinCall {
                        builtin: Builtin::Spirv(SpirvBuiltin::Image),
                        ..
                    } => pending.push(self.split_sampled_image(self.module.operand(inst, 0)).0),
                    _ => {}
                },
                _ => {}
            }
        }
        vars
    }

    fn promote_var(&mut self, var: Handle<Instruction>, promote: fn(&Type) -> Option<Type>) {
        let ptr = self.module.result(var);
        let ptr_ty = self.module.value_type(ptr);
        let types = &mut self.module.types;
        let Some((space, store, access)) = types.pointer_parts(ptr_ty) else {
            unreachable!("var without a pointer type");
        };
        let Some(promoted) = promote(&types[store]) else {
            return;
        };
        let store = types.insert(promoted);
        let ptr_ty = types.pointer(space, store, access);
        log::trace!("{NAME}: promoting {var:?} to {}", types.name(store));
        self.retype(ptr, ptr_ty);
    }

    fn retype(&mut self, value: Handle<Value>, ty: Handle<Type>) {
        if self.module.value_type(value) != ty {
            self.module.set_value_type(value, ty);
            self.values.push_back(value);
        }
    }

    /// Drains the three queues until no value, let or call needs work.
    fn propagate(&mut self) {
        loop {
            if let Some(value) = self.values.pop_front() {
                self.retype_uses(value);
                continue;
            }
            if let Some(inst) = self.lets.pop_front() {
                self.inline_let(inst);
                continue;
            }
            if self.calls.is_empty() {
                break;
            }
            let mut calls = std::mem::take(&mut self.calls);
            calls.sort_unstable();
            calls.dedup();
            for call in calls {
                self.fork_callee(call);
            }
        }
    }

    fn retype_uses(&mut self, value: Handle<Value>) {
        let ty = self.module.value_type(value);
        for usage in self.module.uses(value).to_vec() {
            let inst = usage.instruction;
            match self.module.kind(inst).clone() {
                InstKind::Load => {
                    if let Some(store) = self.module.types.store_type(ty) {
                        self.retype(self.module.result(inst), store);
                    }
                }
                InstKind::Let => self.lets.push_back(inst),
                InstKind::UserCall(_) => self.calls.push(inst),
                InstKind::BuiltinCall {
                    builtin: Builtin::Spirv(SpirvBuiltin::SampledImage),
                    ..
                } if usage.operand == 0 => {
                    let sampled = self.module.types.insert(Type::SampledImage { image: ty });
                    self.retype(self.module.result(inst), sampled);
                }
                InstKind::BuiltinCall {
                    builtin: Builtin::Spirv(SpirvBuiltin::Image),
                    ..
                } => {
                    if let Type::SampledImage { image } = self.module.types[ty] {
                        self.retype(self.module.result(inst), image);
                    }
                }
                _ => {}
            }
        }
    }

    fn inline_let(&mut self, inst: Handle<Instruction>) {
        if !self.module.inst(inst).is_alive() {
            return;
        }
        let value = self.module.operand(inst, 0);
        self.module.replace_with(inst, value);
        self.values.push_back(value);
    }

    /// Redirects `call` to a copy of its callee whose parameters take the
    /// argument types, removing the callee once nothing calls it.
    fn fork_callee(&mut self, call: Handle<Instruction>) {
        if !self.module.inst(call).is_alive() {
            return;
        }
        let InstKind::UserCall(callee) = *self.module.kind(call) else {
            return;
        };
        let args = self.module.operands(call).to_vec();
        let changed: Vec<usize> = args
            .iter()
            .zip(self.module.function(callee).params())
            .enumerate()
            .filter(|&(_, (&arg, param))| {
                self.module.value_type(arg) != self.module.value_type(param.value)
            })
            .map(|(index, _)| index)
            .collect();
        if changed.is_empty() {
            return;
        }

        let key = (callee, changed);
        let cached = self.forks.get(&key).copied();
        let fork = match cached {
            Some(fork) => fork,
            None => {
                let base = self.module.function(callee).name.clone();
                let name = self.module.symbols.new_symbol(&base);
                let (fork, _) = self.module.clone_function(callee, &name);
                log::debug!("{NAME}: forked '{base}' as '{name}' for parameters {:?}", key.1);
                for &index in &key.1 {
                    let param = self.module.function(fork).param(index);
                    let ty = self.module.value_type(args[index]);
                    self.retype(param, ty);
                }
                self.forks.insert(key, fork);
                fork
            }
        };
        *self.module.kind_mut(call) = InstKind::UserCall(fork);

        if !self.module.function(callee).is_entry_point() && self.module.user_calls_of(callee).is_empty() {
            log::debug!("{NAME}: removing '{}'", self.module.function(callee).name);
            self.module.remove_function(callee);
        }
    }

    // ---- combined image/samplers ----

    /// The texture and sampler a sampled image was built from.
    ///
    /// Panics if the value does not come from `OpSampledImage`.
    fn split_sampled_image(&self, mut value: Handle<Value>) -> (Handle<Value>, Handle<Value>) {
        loop {
            let Some(inst) = self.module.producer(value) else {
                panic!("sampled image {value:?} has no producing instruction");
            };
            match self.module.kind(inst) {
                InstKind::Let => value = self.module.operand(inst, 0),
                InstKind::BuiltinCall {
                    builtin: Builtin::Spirv(SpirvBuiltin::SampledImage),
                    ..
                } => return (self.module.operand(inst, 0), self.module.operand(inst, 1)),
                other => panic!("sampled image produced by `{}`", other.mnemonic()),
            }
        }
    }

    /// `OpImage(sampled_image)` becomes the texture it was built from.
    fn replace_image_extractions(&mut self) {
        for inst in self.module.instructions() {
            if let Some(Builtin::Spirv(SpirvBuiltin::Image)) = self.module.kind(inst).builtin() {
                let (texture, _) = self.split_sampled_image(self.module.operand(inst, 0));
                self.module.replace_with(inst, texture);
            }
        }
    }

    /// Drops the now unused combined handles and lets of them.
    fn remove_sampled_images(&mut self) {
        for inst in self.module.instructions().into_iter().rev() {
            let removable = match self.module.kind(inst) {
                InstKind::Let => true,
                kind => kind.builtin() == Some(Builtin::Spirv(SpirvBuiltin::SampledImage)),
            };
            let Some(result) = self.module.inst(inst).result() else {
                continue;
            };
            let ty = self.module.value_type(result);
            if removable
                && matches!(self.module.types[ty], Type::SampledImage { .. })
                && self.module.uses(result).is_empty()
            {
                self.module.destroy(inst);
            }
        }
    }

    // ---- image operations ----

    fn lower_image_ops(&mut self) {
        let worklist: Vec<_> = self
            .module
            .instructions()
            .into_iter()
            .filter_map(|inst| match self.module.kind(inst).builtin() {
                Some(Builtin::Spirv(builtin)) if builtin.is_image_op() => Some((inst, builtin)),
                _ => None,
            })
            .collect();
        for (call, builtin) in worklist {
            log::trace!("{NAME}: {builtin:?} at {call:?}");
            self.lower(call, builtin);
        }
    }

    fn lower(&mut self, call: Handle<Instruction>, builtin: SpirvBuiltin) {
        use SpirvBuiltin as S;

        match builtin {
            S::ImageSampleImplicitLod
            | S::ImageSampleExplicitLod
            | S::ImageSampleProjImplicitLod
            | S::ImageSampleProjExplicitLod
            | S::ImageSampleDrefImplicitLod
            | S::ImageSampleDrefExplicitLod
            | S::ImageSampleProjDrefImplicitLod
            | S::ImageSampleProjDrefExplicitLod => self.sample(call, builtin),
            S::ImageGather | S::ImageDrefGather => self.gather(call, builtin),
            S::ImageFetch | S::ImageRead => self.load(call),
            S::ImageWrite => self.store(call),
            S::ImageQuerySize | S::ImageQuerySizeLod => self.query_size(call),
            S::ImageQueryLevels => self.query_count(call, CoreBuiltin::TextureNumLevels),
            S::ImageQuerySamples => self.query_count(call, CoreBuiltin::TextureNumSamples),
            _ => unreachable!("{builtin:?} is not an image operation"),
        }
    }

    fn texture_type(&self, texture: Handle<Value>) -> Type {
        self.module.types[self.module.value_type(texture)].clone()
    }

    fn sample(&mut self, call: Handle<Instruction>, builtin: SpirvBuiltin) {
        use SpirvBuiltin as S;

        let projective = matches!(
            builtin,
            S::ImageSampleProjImplicitLod
                | S::ImageSampleProjExplicitLod
                | S::ImageSampleProjDrefImplicitLod
                | S::ImageSampleProjDrefExplicitLod
        );
        let explicit = matches!(
            builtin,
            S::ImageSampleExplicitLod
                | S::ImageSampleProjExplicitLod
                | S::ImageSampleDrefExplicitLod
                | S::ImageSampleProjDrefExplicitLod
        );
        let compare = builtin.is_depth_compare();

        let operands = self.module.operands(call).to_vec();
        let (texture, sampler) = self.split_sampled_image(operands[0]);
        let fixed = if compare { 3 } else { 2 };
        let image = ImageArgs::parse(self.module, &operands[fixed..]);
        let texture_ty = self.texture_type(texture);
        let dim = dimension(&texture_ty);
        let depth = texture_ty.is_depth_texture();
        let result_ty = self.module.value_type(self.module.result(call));

        let mut b = Builder::before(self.module, call);
        let (coords, layer) = coordinates(&mut b, operands[1], dim, projective);
        let mut args = vec![texture, sampler, coords];
        args.extend(layer);
        let (core, core_ty) = if compare {
            // Explicit-lod comparisons always sample level zero.
            args.push(operands[2]);
            let core = if explicit {
                CoreBuiltin::TextureSampleCompareLevel
            } else {
                CoreBuiltin::TextureSampleCompare
            };
            (core, result_ty)
        } else {
            let core = if let Some(bias) = image.bias {
                args.push(bias);
                CoreBuiltin::TextureSampleBias
            } else if let Some((ddx, ddy)) = image.grad {
                args.extend([ddx, ddy]);
                CoreBuiltin::TextureSampleGrad
            } else if let Some(lod) = image.lod {
                let lod = if depth {
                    let i32_ty = b.types().i32();
                    b.convert(i32_ty, lod)
                } else {
                    lod
                };
                args.push(lod);
                CoreBuiltin::TextureSampleLevel
            } else {
                CoreBuiltin::TextureSample
            };
            let core_ty = if depth { b.types().f32() } else { result_ty };
            (core, core_ty)
        };
        if let Some(offset) = image.offset {
            args.push(signed(&mut b, offset));
        }
        let value = b.call(core_ty, core, args);
        let value = widen_depth(&mut b, result_ty, value);
        self.module.replace_with(call, value);
    }

    fn gather(&mut self, call: Handle<Instruction>, builtin: SpirvBuiltin) {
        let operands = self.module.operands(call).to_vec();
        let (texture, sampler) = self.split_sampled_image(operands[0]);
        let image = ImageArgs::parse(self.module, &operands[3..]);
        let texture_ty = self.texture_type(texture);
        let dim = dimension(&texture_ty);
        let result_ty = self.module.value_type(self.module.result(call));

        let mut b = Builder::before(self.module, call);
        let (coords, layer) = coordinates(&mut b, operands[1], dim, false);
        let mut args = Vec::with_capacity(6);
        let core = if builtin == SpirvBuiltin::ImageDrefGather {
            CoreBuiltin::TextureGatherCompare
        } else {
            // Depth textures have a single channel to gather.
            if !texture_ty.is_depth_texture() {
                args.push(operands[2]);
            }
            CoreBuiltin::TextureGather
        };
        args.extend([texture, sampler, coords]);
        args.extend(layer);
        if core == CoreBuiltin::TextureGatherCompare {
            args.push(operands[2]);
        }
        if let Some(offset) = image.offset {
            args.push(signed(&mut b, offset));
        }
        let value = b.call(result_ty, core, args);
        self.module.replace_with(call, value);
    }

    /// `OpImageFetch` and `OpImageRead` both become `textureLoad`.
    fn load(&mut self, call: Handle<Instruction>) {
        let operands = self.module.operands(call).to_vec();
        let texture = operands[0];
        let image = ImageArgs::parse(self.module, &operands[2..]);
        let texture_ty = self.texture_type(texture);
        let dim = dimension(&texture_ty);
        let result_ty = self.module.value_type(self.module.result(call));

        let mut b = Builder::before(self.module, call);
        let (mut coords, layer) = coordinates(&mut b, operands[1], dim, false);
        if let Some(offset) = image.offset {
            // textureLoad has no offset operand.
            let coords_ty = b.module().value_type(coords);
            let offset = if b.module().value_type(offset) == coords_ty {
                offset
            } else {
                b.bitcast(coords_ty, offset)
            };
            coords = b.add(coords_ty, coords, offset);
        }
        let mut args = vec![texture, coords];
        args.extend(layer);
        match texture_ty {
            Type::StorageTexture { .. } => {}
            Type::MultisampledTexture { .. } | Type::DepthMultisampledTexture { .. } => {
                let sample = match image.sample {
                    Some(sample) => sample,
                    None => b.i32(0),
                };
                args.push(sample);
            }
            _ => {
                let level = match image.lod {
                    Some(lod) => lod,
                    None => b.i32(0),
                };
                args.push(level);
            }
        }
        let core_ty = if texture_ty.is_depth_texture() {
            b.types().f32()
        } else {
            result_ty
        };
        let value = b.call(core_ty, CoreBuiltin::TextureLoad, args);
        let value = widen_depth(&mut b, result_ty, value);
        self.module.replace_with(call, value);
    }

    fn store(&mut self, call: Handle<Instruction>) {
        let operands = self.module.operands(call).to_vec();
        let texture = operands[0];
        let texture_ty = self.texture_type(texture);
        let dim = dimension(&texture_ty);

        let mut b = Builder::before(self.module, call);
        let (coords, layer) = coordinates(&mut b, operands[1], dim, false);
        let mut args = vec![texture, coords];
        args.extend(layer);
        args.push(operands[2]);
        let void = b.types().void();
        b.call(void, CoreBuiltin::TextureStore, args);
        self.module.destroy(call);
    }

    /// Dimensions with the layer count appended for arrayed textures.
    fn query_size(&mut self, call: Handle<Instruction>) {
        let operands = self.module.operands(call).to_vec();
        let texture = operands[0];
        let dim = dimension(&self.texture_type(texture));
        let result_ty = self.module.value_type(self.module.result(call));
        let count = match dim {
            TextureDimension::D1 => 1,
            TextureDimension::D3 => 3,
            TextureDimension::D2
            | TextureDimension::D2Array
            | TextureDimension::Cube
            | TextureDimension::CubeArray => 2,
        };

        let mut b = Builder::before(self.module, call);
        let dims_ty = b.types().vec_or_scalar(count, Scalar::U32);
        let mut args = vec![texture];
        args.extend(operands.get(1).copied());
        let mut value = b.call(dims_ty, CoreBuiltin::TextureDimensions, args);
        if dim.is_arrayed() {
            let u32_ty = b.types().u32();
            let layers = b.call(u32_ty, CoreBuiltin::TextureNumLayers, vec![texture]);
            let ty = b.types().vec_or_scalar(count + 1, Scalar::U32);
            value = b.construct(ty, vec![value, layers]);
        }
        let value = match_signedness(&mut b, result_ty, value);
        self.module.replace_with(call, value);
    }

    fn query_count(&mut self, call: Handle<Instruction>, core: CoreBuiltin) {
        let texture = self.module.operand(call, 0);
        let result_ty = self.module.value_type(self.module.result(call));
        let mut b = Builder::before(self.module, call);
        let u32_ty = b.types().u32();
        let value = b.call(u32_ty, core, vec![texture]);
        let value = match_signedness(&mut b, result_ty, value);
        self.module.replace_with(call, value);
    }
}

/// Index of the image operand mask in the operands of `builtin`, for the
/// operations that take one.
fn image_operands_start(builtin: SpirvBuiltin) -> Option<usize> {
    use SpirvBuiltin as S;

    match builtin {
        S::ImageSampleImplicitLod
        | S::ImageSampleExplicitLod
        | S::ImageSampleProjImplicitLod
        | S::ImageSampleProjExplicitLod
        | S::ImageFetch
        | S::ImageRead => Some(2),
        S::ImageSampleDrefImplicitLod
        | S::ImageSampleDrefExplicitLod
        | S::ImageSampleProjDrefImplicitLod
        | S::ImageSampleProjDrefExplicitLod
        | S::ImageGather
        | S::ImageDrefGather => Some(3),
        _ => None,
    }
}

/// Rejects image operands the core builtins have no form for, such as
/// `ConstOffsets` or `MinLod`, before anything is rewritten.
fn check_image_operands(module: &Module) -> Result<(), TransformError> {
    for inst in module.instructions() {
        let Some(Builtin::Spirv(builtin)) = module.kind(inst).builtin() else {
            continue;
        };
        let Some(start) = image_operands_start(builtin) else {
            continue;
        };
        let operands = module.operands(inst);
        let Some((&mask, rest)) = operands.get(start..).and_then(<[_]>::split_first) else {
            continue;
        };
        let Some(bits) = module.constant_index(mask) else {
            return Err(TransformError::Unsupported(format!(
                "{builtin:?} with a non-constant image operand mask"
            )));
        };
        let mask = ImageOperands::from_bits(bits);
        if !mask.unsupported().is_empty() {
            return Err(TransformError::Unsupported(format!(
                "{builtin:?} with image operands {:#x}",
                mask.unsupported().bits()
            )));
        }
        if rest.len() != mask.operand_count() {
            return Err(TransformError::Unsupported(format!(
                "{builtin:?} with {} image operands for mask {bits:#x}",
                rest.len()
            )));
        }
    }
    Ok(())
}

/// Optional trailing operands of an image operation, in mask bit order.
#[derive(Debug, Default)]
struct ImageArgs {
    bias: Option<Handle<Value>>,
    lod: Option<Handle<Value>>,
    grad: Option<(Handle<Value>, Handle<Value>)>,
    offset: Option<Handle<Value>>,
    sample: Option<Handle<Value>>,
}

impl ImageArgs {
    /// Parses `[mask, operands..]`. An empty slice means no operands. The
    /// mask was already checked by [`check_image_operands`].
    fn parse(module: &Module, operands: &[Handle<Value>]) -> Self {
        let Some((&mask, rest)) = operands.split_first() else {
            return Self::default();
        };
        let Some(bits) = module.constant_index(mask) else {
            unreachable!("image operand mask {mask:?} is not a constant");
        };
        let mask = ImageOperands::from_bits(bits);
        let mut rest = rest.iter().copied();
        let mut args = Self::default();
        if mask.contains(ImageOperands::BIAS) {
            args.bias = rest.next();
        }
        if mask.contains(ImageOperands::LOD) {
            args.lod = rest.next();
        }
        if mask.contains(ImageOperands::GRAD) {
            args.grad = rest.next().zip(rest.next());
        }
        if mask.contains(ImageOperands::CONST_OFFSET) {
            args.offset = rest.next();
        }
        if mask.contains(ImageOperands::OFFSET) {
            args.offset = rest.next();
        }
        if mask.contains(ImageOperands::SAMPLE) {
            args.sample = rest.next();
        }
        if rest.next().is_some() {
            unreachable!("image operands left over for mask {bits:#x}");
        }
        args
    }
}

fn depth_texture(ty: &Type) -> Option<Type> {
    match *ty {
        Type::SampledTexture { dim, .. } => Some(Type::DepthTexture { dim }),
        Type::MultisampledTexture { dim, .. } => Some(Type::DepthMultisampledTexture { dim }),
        _ => None,
    }
}

fn comparison_sampler(ty: &Type) -> Option<Type> {
    match *ty {
        Type::Sampler(SamplerKind::Sampler) => Some(Type::Sampler(SamplerKind::Comparison)),
        _ => None,
    }
}

fn dimension(texture: &Type) -> TextureDimension {
    match texture.texture_dimension() {
        Some(dim) => dim,
        None => unreachable!("image operation on a non-texture"),
    }
}

/// Splits a source coordinate into the texture coordinates and, for arrayed
/// textures, a signed array index. Projective coordinates are divided by
/// their last component.
fn coordinates(
    b: &mut Builder<'_>,
    coords: Handle<Value>,
    dim: TextureDimension,
    projective: bool,
) -> (Handle<Value>, Option<Handle<Value>>) {
    let count = dim.coordinate_count();
    let base = leading(b, coords, count);
    if projective {
        let q = component(b, coords, count);
        let base_ty = b.module().value_type(base);
        return (b.divide(base_ty, base, q), None);
    }
    if !dim.is_arrayed() {
        return (base, None);
    }
    let layer = component(b, coords, count);
    let layer_ty = b.module().value_type(layer);
    let layer = if b.module().types.is_signed_integer(layer_ty) {
        layer
    } else {
        let i32_ty = b.types().i32();
        b.convert(i32_ty, layer)
    };
    (base, Some(layer))
}

/// The first `count` components of `value`.
fn leading(b: &mut Builder<'_>, value: Handle<Value>, count: u32) -> Handle<Value> {
    let ty = b.module().value_type(value);
    let width = b.module().types.width(ty);
    if width == count {
        return value;
    }
    let Some(scalar) = b.module().types.scalar_of(ty) else {
        unreachable!("coordinates must be numeric");
    };
    if count == 1 {
        return component(b, value, 0);
    }
    let sliced = b.types().vec_or_scalar(count, scalar);
    b.swizzle(sliced, value, (0..count).collect())
}

fn component(b: &mut Builder<'_>, value: Handle<Value>, index: u32) -> Handle<Value> {
    let ty = b.module().value_type(value);
    if b.module().types.is_scalar(ty) {
        return value;
    }
    let Some(scalar) = b.module().types.scalar_of(ty) else {
        unreachable!("coordinates must be numeric");
    };
    let element = b.types().scalar(scalar);
    b.access_const(element, value, index)
}

/// Bitcasts unsigned offsets to signed.
fn signed(b: &mut Builder<'_>, value: Handle<Value>) -> Handle<Value> {
    let ty = b.module().value_type(value);
    if !b.module().types.is_unsigned_integer(ty) {
        return value;
    }
    let signed = b.types().with_scalar(ty, Scalar::I32);
    b.bitcast(signed, value)
}

/// Depth results are scalar; the source expects `vec4(depth, 0, 0, 0)`.
fn widen_depth(b: &mut Builder<'_>, result_ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
    let ty = b.module().value_type(value);
    if ty == result_ty {
        return value;
    }
    let zero = b.zero(ty);
    b.construct(result_ty, vec![value, zero, zero, zero])
}

/// Queries return unsigned values; convert when the source asked for signed.
fn match_signedness(b: &mut Builder<'_>, result_ty: Handle<Type>, value: Handle<Value>) -> Handle<Value> {
    if b.module().value_type(value) == result_ty {
        value
    } else {
        b.convert(result_ty, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{assert_valid, calls_to, compute_entry, count_kind};
    use prism_ir::{Access, AddressSpace, BindingPoint, Block, Capabilities, Constant, VectorSize};

    struct Handles {
        texture: Handle<Value>,
        sampler: Handle<Value>,
    }

    fn handles(module: &mut Module, texture: Type, group: u32) -> Handles {
        let texture_ty = module.types.insert(texture);
        let sampler_ty = module.types.sampler(SamplerKind::Sampler);
        let root = module.root();
        let mut b = Builder::at_end(module, root);
        let texture = b.var_with(
            AddressSpace::Handle,
            texture_ty,
            Access::Read,
            Some(BindingPoint::new(group, 0)),
            None,
        );
        let sampler = b.var_with(
            AddressSpace::Handle,
            sampler_ty,
            Access::Read,
            Some(BindingPoint::new(group, 1)),
            None,
        );
        Handles { texture, sampler }
    }

    fn sampled_2d() -> Type {
        Type::SampledTexture {
            dim: TextureDimension::D2,
            sampled: Scalar::F32,
        }
    }

    /// Loads both handles and combines them.
    fn combine(b: &mut Builder<'_>, handles: &Handles) -> Handle<Value> {
        let texture = b.load(handles.texture);
        let sampler = b.load(handles.sampler);
        let texture_ty = b.module().value_type(texture);
        let sampled = b.types().insert(Type::SampledImage { image: texture_ty });
        b.call(sampled, SpirvBuiltin::SampledImage, vec![texture, sampler])
    }

    fn keep(b: &mut Builder<'_>, value: Handle<Value>) {
        let ty = b.module().value_type(value);
        let var = b.var(AddressSpace::Function, ty, Access::ReadWrite);
        b.store(var, value);
    }

    fn vec4f(b: &mut Builder<'_>) -> Handle<Type> {
        b.types().vector(VectorSize::Quad, Scalar::F32)
    }

    fn coords(b: &mut Builder<'_>, size: VectorSize, v: f32) -> Handle<Value> {
        let ty = b.types().vector(size, Scalar::F32);
        b.splat(ty, Constant::F32(v))
    }

    fn run(module: &mut Module) {
        lower_spirv_texture(module).unwrap();
        assert_valid(module, Capabilities::EMPTY);
        let left = module
            .instructions()
            .into_iter()
            .filter(|&i| matches!(module.kind(i).builtin(), Some(Builtin::Spirv(_))))
            .count();
        assert_eq!(left, 0, "SPIR-V image builtins left behind");
    }

    fn entry(module: &mut Module) -> Handle<Block> {
        compute_entry(module, "main").1
    }

    fn store_type(module: &Module, var: Handle<Value>) -> &Type {
        let ptr = module.value_type(var);
        let store = module.types.store_type(ptr).unwrap();
        &module.types[store]
    }

    #[test]
    fn implicit_lod_sample_becomes_texture_sample() {
        let mut module = Module::new();
        let h = handles(&mut module, sampled_2d(), 0);
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let si = combine(&mut b, &h);
        let uv = coords(&mut b, VectorSize::Bi, 0.5);
        let vec4 = vec4f(&mut b);
        let texel = b.call(vec4, SpirvBuiltin::ImageSampleImplicitLod, vec![si, uv]);
        keep(&mut b, texel);
        b.return_(None);

        run(&mut module);
        let calls = calls_to(&module, CoreBuiltin::TextureSample);
        assert_eq!(calls.len(), 1);
        let args = module.operands(calls[0]);
        assert_eq!(args.len(), 3);
        assert_eq!(args[2], uv);
        assert!(matches!(module.kind(module.producer(args[0]).unwrap()), InstKind::Load));
        assert!(matches!(store_type(&module, h.texture), Type::SampledTexture { .. }));
    }

    #[test]
    fn depth_comparison_promotes_handles() {
        let mut module = Module::new();
        let h = handles(&mut module, sampled_2d(), 0);
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let si = combine(&mut b, &h);
        let uv = coords(&mut b, VectorSize::Bi, 0.5);
        let dref = b.f32(0.25);
        let f32_ty = b.types().f32();
        let depth = b.call(f32_ty, SpirvBuiltin::ImageSampleDrefImplicitLod, vec![si, uv, dref]);
        keep(&mut b, depth);
        let vec4 = vec4f(&mut b);
        let si = combine(&mut b, &h);
        let texel = b.call(vec4, SpirvBuiltin::ImageSampleImplicitLod, vec![si, uv]);
        keep(&mut b, texel);
        b.return_(None);

        run(&mut module);
        assert_eq!(
            *store_type(&module, h.texture),
            Type::DepthTexture {
                dim: TextureDimension::D2
            }
        );
        assert_eq!(
            *store_type(&module, h.sampler),
            Type::Sampler(SamplerKind::Comparison)
        );
        let compare = calls_to(&module, CoreBuiltin::TextureSampleCompare);
        assert_eq!(compare.len(), 1);
        assert_eq!(module.operands(compare[0])[3], dref);

        // The plain sample now reads a depth texture and is widened back.
        let sample = calls_to(&module, CoreBuiltin::TextureSample);
        assert_eq!(sample.len(), 1);
        let result = module.result(sample[0]);
        assert_eq!(module.types[module.value_type(result)], Type::Scalar(Scalar::F32));
        assert_eq!(count_kind(&module, |k| *k == InstKind::Construct), 1);
    }

    /// `fn sample_depth(t, s) -> f32` comparing against a fixed reference.
    fn depth_helper(module: &mut Module) -> Handle<Function> {
        let f32_ty = module.types.f32();
        let texture_ty = module.types.insert(sampled_2d());
        let sampler_ty = module.types.sampler(SamplerKind::Sampler);
        let f = module.new_function("sample_depth", f32_ty);
        let t = module.add_param(f, texture_ty, Default::default());
        let s = module.add_param(f, sampler_ty, Default::default());
        let body = module.function(f).body();
        let mut b = Builder::at_end(module, body);
        let sampled = b.types().insert(Type::SampledImage { image: texture_ty });
        let si = b.call(sampled, SpirvBuiltin::SampledImage, vec![t, s]);
        let uv = coords(&mut b, VectorSize::Bi, 0.5);
        let dref = b.f32(0.5);
        let mask = b.u32(ImageOperands::LOD.bits());
        let lod = b.f32(0.0);
        let depth = b.call(
            f32_ty,
            SpirvBuiltin::ImageSampleDrefExplicitLod,
            vec![si, uv, dref, mask, lod],
        );
        b.return_(Some(depth));
        f
    }

    #[test]
    fn comparison_through_a_parameter_forks_the_callee() {
        let mut module = Module::new();
        let h = handles(&mut module, sampled_2d(), 0);
        let helper = depth_helper(&mut module);
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        for _ in 0..2 {
            let t = b.load(h.texture);
            let s = b.load(h.sampler);
            let depth = b.call_user(helper, vec![t, s]);
            keep(&mut b, depth);
        }
        b.return_(None);

        run(&mut module);
        assert!(!module.function(helper).is_alive());
        let fork = module.function_by_name("sample_depth_1").unwrap();
        assert_eq!(module.user_calls_of(fork).len(), 2);
        let param = module.function(fork).param(0);
        assert!(module.types[module.value_type(param)].is_depth_texture());
        assert_eq!(calls_to(&module, CoreBuiltin::TextureSampleCompareLevel).len(), 1);
    }

    #[test]
    fn forks_are_keyed_by_changed_parameters() {
        let mut module = Module::new();
        let depth = handles(&mut module, sampled_2d(), 0);
        let plain = handles(&mut module, sampled_2d(), 1);

        let vec4_ty = module.types.vector(VectorSize::Quad, Scalar::F32);
        let texture_ty = module.types.insert(sampled_2d());
        let fetch = module.new_function("fetch", vec4_ty);
        let t = module.add_param(fetch, texture_ty, Default::default());
        let fetch_body = module.function(fetch).body();
        let mut b = Builder::at_end(&mut module, fetch_body);
        let ivec2 = b.types().vector(VectorSize::Bi, Scalar::I32);
        let xy = b.splat(ivec2, Constant::I32(1));
        let texel = b.call(vec4_ty, SpirvBuiltin::ImageFetch, vec![t, xy]);
        b.return_(Some(texel));

        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let si = combine(&mut b, &depth);
        let uv = coords(&mut b, VectorSize::Bi, 0.5);
        let dref = b.f32(0.25);
        let f32_ty = b.types().f32();
        let compared = b.call(f32_ty, SpirvBuiltin::ImageSampleDrefImplicitLod, vec![si, uv, dref]);
        keep(&mut b, compared);
        for h in [&depth, &depth, &plain] {
            let t = b.load(h.texture);
            let texel = b.call_user(fetch, vec![t]);
            keep(&mut b, texel);
        }
        b.return_(None);

        run(&mut module);
        let fork = module.function_by_name("fetch_1").unwrap();
        assert_eq!(module.user_calls_of(fork).len(), 2);
        assert_eq!(module.user_calls_of(fetch).len(), 1);
        // Only the fork widens its depth texel.
        let loads = calls_to(&module, CoreBuiltin::TextureLoad);
        assert_eq!(loads.len(), 2);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Construct), 1);
    }

    #[test]
    fn arrayed_coordinates_split_off_a_signed_layer() {
        let mut module = Module::new();
        let h = handles(
            &mut module,
            Type::SampledTexture {
                dim: TextureDimension::D2Array,
                sampled: Scalar::F32,
            },
            0,
        );
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let si = combine(&mut b, &h);
        let uvw = coords(&mut b, VectorSize::Tri, 2.0);
        let vec4 = vec4f(&mut b);
        let texel = b.call(vec4, SpirvBuiltin::ImageSampleImplicitLod, vec![si, uvw]);
        keep(&mut b, texel);
        b.return_(None);

        run(&mut module);
        let calls = calls_to(&module, CoreBuiltin::TextureSample);
        let args = module.operands(calls[0]);
        assert_eq!(args.len(), 4);
        assert!(matches!(module.kind(module.producer(args[2]).unwrap()), InstKind::Swizzle(_)));
        assert_eq!(module.types[module.value_type(args[3])], Type::Scalar(Scalar::I32));
        assert_eq!(count_kind(&module, |k| *k == InstKind::Convert), 1);
    }

    #[test]
    fn projective_coordinates_are_divided() {
        let mut module = Module::new();
        let h = handles(&mut module, sampled_2d(), 0);
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let si = combine(&mut b, &h);
        let uvq = coords(&mut b, VectorSize::Tri, 2.0);
        let vec4 = vec4f(&mut b);
        let texel = b.call(vec4, SpirvBuiltin::ImageSampleProjImplicitLod, vec![si, uvq]);
        keep(&mut b, texel);
        b.return_(None);

        run(&mut module);
        let calls = calls_to(&module, CoreBuiltin::TextureSample);
        assert_eq!(module.operands(calls[0]).len(), 3);
        assert_eq!(
            count_kind(&module, |k| *k == InstKind::Binary(prism_ir::BinaryOp::Divide)),
            1
        );
    }

    #[test]
    fn explicit_lod_with_unsigned_offset() {
        let mut module = Module::new();
        let h = handles(&mut module, sampled_2d(), 0);
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let si = combine(&mut b, &h);
        let uv = coords(&mut b, VectorSize::Bi, 0.5);
        let mask = b.u32((ImageOperands::LOD | ImageOperands::CONST_OFFSET).bits());
        let lod = b.f32(1.0);
        let uvec2 = b.types().vector(VectorSize::Bi, Scalar::U32);
        let offset = b.splat(uvec2, Constant::U32(1));
        let vec4 = vec4f(&mut b);
        let texel = b.call(
            vec4,
            SpirvBuiltin::ImageSampleExplicitLod,
            vec![si, uv, mask, lod, offset],
        );
        keep(&mut b, texel);
        b.return_(None);

        run(&mut module);
        let calls = calls_to(&module, CoreBuiltin::TextureSampleLevel);
        assert_eq!(calls.len(), 1);
        let args = module.operands(calls[0]);
        assert_eq!(args.len(), 5);
        assert_eq!(args[3], lod);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Bitcast), 1);
    }

    #[test]
    fn size_query_appends_layers_and_converts_to_signed() {
        let mut module = Module::new();
        let h = handles(
            &mut module,
            Type::SampledTexture {
                dim: TextureDimension::D2Array,
                sampled: Scalar::F32,
            },
            0,
        );
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let t = b.load(h.texture);
        let ivec3 = b.types().vector(VectorSize::Tri, Scalar::I32);
        let level = b.i32(0);
        let size = b.call(ivec3, SpirvBuiltin::ImageQuerySizeLod, vec![t, level]);
        keep(&mut b, size);
        let i32_ty = b.types().i32();
        let levels = b.call(i32_ty, SpirvBuiltin::ImageQueryLevels, vec![t]);
        keep(&mut b, levels);
        b.return_(None);

        run(&mut module);
        assert_eq!(calls_to(&module, CoreBuiltin::TextureDimensions).len(), 1);
        assert_eq!(calls_to(&module, CoreBuiltin::TextureNumLayers).len(), 1);
        assert_eq!(calls_to(&module, CoreBuiltin::TextureNumLevels).len(), 1);
        assert_eq!(count_kind(&module, |k| *k == InstKind::Convert), 2);
    }

    #[test]
    fn image_extraction_uses_the_original_texture() {
        let mut module = Module::new();
        let h = handles(&mut module, sampled_2d(), 0);
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let si = combine(&mut b, &h);
        let texture_ty = b.types().insert(sampled_2d());
        let image = b.call(texture_ty, SpirvBuiltin::Image, vec![si]);
        let ivec2 = b.types().vector(VectorSize::Bi, Scalar::I32);
        let xy = b.splat(ivec2, Constant::I32(3));
        let vec4 = vec4f(&mut b);
        let texel = b.call(vec4, SpirvBuiltin::ImageFetch, vec![image, xy]);
        keep(&mut b, texel);
        b.return_(None);

        run(&mut module);
        let loads = calls_to(&module, CoreBuiltin::TextureLoad);
        assert_eq!(loads.len(), 1);
        // texture, coords, level 0.
        assert_eq!(module.operands(loads[0]).len(), 3);
    }

    #[test]
    fn depth_promotion_inlines_lets_of_the_texture() {
        let mut module = Module::new();
        let h = handles(&mut module, sampled_2d(), 0);
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let t = b.load(h.texture);
        let t = b.let_(t);
        let s = b.load(h.sampler);
        let texture_ty = b.module().value_type(t);
        let sampled = b.types().insert(Type::SampledImage { image: texture_ty });
        let si = b.call(sampled, SpirvBuiltin::SampledImage, vec![t, s]);
        let uv = coords(&mut b, VectorSize::Bi, 0.5);
        let dref = b.f32(0.25);
        let f32_ty = b.types().f32();
        let depth = b.call(f32_ty, SpirvBuiltin::ImageSampleDrefImplicitLod, vec![si, uv, dref]);
        keep(&mut b, depth);
        b.return_(None);

        run(&mut module);
        assert!(store_type(&module, h.texture).is_depth_texture());
        assert_eq!(count_kind(&module, |k| *k == InstKind::Let), 0);
        let compare = calls_to(&module, CoreBuiltin::TextureSampleCompare);
        assert_eq!(compare.len(), 1);
        let texture = module.operands(compare[0])[0];
        let load = module.producer(texture).unwrap();
        assert_eq!(*module.kind(load), InstKind::Load);
        assert!(module.types[module.value_type(texture)].is_depth_texture());
    }

    /// A multisampled fetch carrying the given mask and operand values.
    fn fetch_with_operands(bits: u32, extra: &[Constant]) -> Module {
        let mut module = Module::new();
        let h = handles(
            &mut module,
            Type::MultisampledTexture {
                dim: TextureDimension::D2,
                sampled: Scalar::F32,
            },
            0,
        );
        let body = entry(&mut module);
        let mut b = Builder::at_end(&mut module, body);
        let t = b.load(h.texture);
        let ivec2 = b.types().vector(VectorSize::Bi, Scalar::I32);
        let xy = b.splat(ivec2, Constant::I32(1));
        let mut args = vec![t, xy, b.u32(bits)];
        for constant in extra {
            let value = match *constant {
                Constant::I32(v) => b.i32(v),
                Constant::F32(v) => b.f32(v),
                ref other => panic!("no operand for {other:?}"),
            };
            args.push(value);
        }
        let vec4 = vec4f(&mut b);
        let texel = b.call(vec4, SpirvBuiltin::ImageFetch, args);
        keep(&mut b, texel);
        b.return_(None);
        module
    }

    #[test]
    fn unknown_image_operands_are_rejected() {
        // ConstOffsets (0x20) precedes Sample; MinLod (0x80) has no core form.
        let cases = [
            (0x20 | ImageOperands::SAMPLE.bits(), vec![Constant::I32(0), Constant::I32(2)]),
            (0x80, vec![Constant::F32(1.0)]),
        ];
        for (bits, extra) in cases {
            let mut module = fetch_with_operands(bits, &extra);
            let before = prism_ir::disassemble(&module);
            let err = lower_spirv_texture(&mut module).unwrap_err();
            assert!(matches!(err, TransformError::Unsupported(_)), "{bits:#x}: {err}");
            assert_eq!(prism_ir::disassemble(&module), before);
        }
    }

    #[test]
    fn image_operand_count_must_match_the_mask() {
        let bits = ImageOperands::SAMPLE.bits();
        let mut module = fetch_with_operands(bits, &[Constant::I32(1), Constant::I32(2)]);
        let err = lower_spirv_texture(&mut module).unwrap_err();
        assert!(matches!(err, TransformError::Unsupported(_)), "{err}");

        let mut module = fetch_with_operands(bits, &[Constant::I32(3)]);
        run(&mut module);
        let loads = calls_to(&module, CoreBuiltin::TextureLoad);
        assert_eq!(module.constant(module.operands(loads[0])[2]), Some(&Constant::I32(3)));
    }
}
