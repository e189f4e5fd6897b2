//! Entry point IO restructuring.
//!
//! Every entry point is split into an `<name>_inner` function holding the
//! original body and a new entry point that gathers its inputs from a single
//! input struct, calls the inner function and returns a single output struct.
//! A [`ShaderIoBackend`] decides how each input and output is served; the
//! HLSL backend also serves subgroup builtins through wave intrinsics, adds
//! first-index offsets and splits clip distances.

use prism_ir::{
    Access, AddressSpace, BindingPoint, Builder, BuiltinValue, Capabilities, Function, Handle,
    HlslBuiltin, IoAttributes, Module, PipelineStage, PipelineUsage, Scalar, StructFlags,
    StructMember, Type, Value, VectorSize, validate,
};

use crate::config::{FirstIndexOffset, ShaderIoConfig};
use crate::{Pass, TransformError};

const NAME: &str = "hlsl.ShaderIO";

/// Name of the uniform holding the first vertex and instance indices.
const FIRST_INDEX_OFFSET: &str = "tint_first_index_offset";
const IMMEDIATE_DATA: &str = "tint_immediate_data";
const NUM_WORKGROUPS: &str = "tint_num_workgroups";

/// One shader input or output, after IO structs are flattened.
#[derive(Clone, Debug)]
pub struct IoEntry {
    pub name: String,
    pub ty: Handle<Type>,
    pub attributes: IoAttributes,
}

/// The flattened interface of an entry point.
#[derive(Clone, Debug)]
pub struct EntryPointIo {
    pub name: String,
    pub stage: PipelineStage,
    pub inputs: Vec<IoEntry>,
    pub outputs: Vec<IoEntry>,
}

/// Target-specific handling of entry point inputs and outputs.
///
/// Calls happen in order: `finalize_inputs`, `finalize_outputs`, then
/// `get_input` for every input, `set_output` for every output and a single
/// `make_return_value` while the new entry point body is built.
pub trait ShaderIoBackend {
    /// Adds the parameters of the new entry point `entry`.
    fn finalize_inputs(&mut self, module: &mut Module, entry: Handle<Function>);

    /// Returns the return type of the new entry point.
    fn finalize_outputs(&mut self, module: &mut Module) -> Handle<Type>;

    /// Produces the value of input `index`.
    fn get_input(&mut self, b: &mut Builder<'_>, index: usize) -> Handle<Value>;

    /// Records the value of output `index`.
    fn set_output(&mut self, b: &mut Builder<'_>, index: usize, value: Handle<Value>);

    /// Builds the value returned by the new entry point, if any.
    fn make_return_value(&mut self, b: &mut Builder<'_>) -> Option<Handle<Value>>;
}

/// Restructures entry point IO for HLSL.
#[derive(Debug, Default)]
pub struct ShaderIo {
    config: ShaderIoConfig,
}

impl ShaderIo {
    pub fn new(config: ShaderIoConfig) -> Self {
        Self { config }
    }
}

impl Pass for ShaderIo {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALLOW_MULTIPLE_ENTRY_POINTS
    }

    fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        shader_io(module, &self.config)
    }
}

/// Runs the HLSL shader IO transform on `module`.
pub fn shader_io(module: &mut Module, config: &ShaderIoConfig) -> Result<(), TransformError> {
    validate(module, NAME, Capabilities::ALLOW_MULTIPLE_ENTRY_POINTS)?;
    run_shader_io(module, |io| HlslShaderIo::new(*config, io));
    Ok(())
}

/// How a parameter or return value of the original entry point maps onto
/// the flattened IO list.
enum Mapping {
    Direct(usize),
    Struct {
        ty: Handle<Type>,
        first: usize,
        members: Vec<Handle<Type>>,
    },
}

/// Wraps every entry point of `module`, using a backend per entry point.
pub fn run_shader_io<B: ShaderIoBackend>(module: &mut Module, mut make_backend: impl FnMut(&EntryPointIo) -> B) {
    for entry in module.entry_points() {
        let (io, params, result) = gather(module, entry);
        log::debug!(
            "{NAME}: {} has {} inputs and {} outputs",
            io.name,
            io.inputs.len(),
            io.outputs.len()
        );
        let mut backend = make_backend(&io);
        wrap(module, entry, &io, &params, result.as_ref(), &mut backend);
    }
}

fn gather(module: &Module, entry: Handle<Function>) -> (EntryPointIo, Vec<Mapping>, Option<Mapping>) {
    let f = module.function(entry);
    let Some(stage) = f.stage else {
        unreachable!("gathering IO of a function that is not an entry point");
    };
    let mut inputs = Vec::new();
    let mut params = Vec::new();
    for (index, param) in f.params().iter().enumerate() {
        let ty = module.value_type(param.value);
        let name = module
            .name_of(param.value)
            .map_or_else(|| format!("input_{index}"), str::to_string);
        params.push(flatten(module, ty, name, param.attributes, &mut inputs));
    }

    let mut outputs = Vec::new();
    let result = (module.types[f.return_type] != Type::Void)
        .then(|| flatten(module, f.return_type, "value".into(), f.return_attributes, &mut outputs));

    let io = EntryPointIo {
        name: f.name.clone(),
        stage,
        inputs,
        outputs,
    };
    (io, params, result)
}

/// Appends the IO entries of one value: one per member of an IO struct,
/// otherwise one for the value itself.
fn flatten(
    module: &Module,
    ty: Handle<Type>,
    name: String,
    attributes: IoAttributes,
    entries: &mut Vec<IoEntry>,
) -> Mapping {
    let types = &module.types;
    if let (true, Some(def)) = (attributes.is_empty(), types.struct_def(ty)) {
        let first = entries.len();
        let members = def.members.iter().map(|m| m.ty).collect();
        entries.extend(def.members.iter().map(|m| IoEntry {
            name: m.name.clone(),
            ty: m.ty,
            attributes: m.attributes,
        }));
        return Mapping::Struct { ty, first, members };
    }
    entries.push(IoEntry { name, ty, attributes });
    Mapping::Direct(entries.len() - 1)
}

fn wrap<B: ShaderIoBackend>(
    module: &mut Module,
    entry: Handle<Function>,
    io: &EntryPointIo,
    params: &[Mapping],
    result: Option<&Mapping>,
    backend: &mut B,
) {
    let inner_name = module.symbols.new_symbol(&format!("{}_inner", io.name));
    let workgroup_size = module.function(entry).workgroup_size;
    {
        let inner = module.function_mut(entry);
        inner.name = inner_name;
        inner.stage = None;
        inner.workgroup_size = None;
        inner.return_attributes = IoAttributes::default();
        for index in 0..inner.params().len() {
            *inner.param_attributes_mut(index) = IoAttributes::default();
        }
    }

    let void = module.types.void();
    let wrapper = module.new_function(&io.name, void);
    module.function_mut(wrapper).stage = Some(io.stage);
    module.function_mut(wrapper).workgroup_size = workgroup_size;

    backend.finalize_inputs(module, wrapper);
    let return_type = backend.finalize_outputs(module);
    module.function_mut(wrapper).return_type = return_type;

    let body = module.function(wrapper).body();
    let mut b = Builder::at_end(module, body);
    let mut args = Vec::with_capacity(params.len());
    for mapping in params {
        let arg = match *mapping {
            Mapping::Direct(index) => backend.get_input(&mut b, index),
            Mapping::Struct {
                ty,
                first,
                ref members,
            } => {
                let values = (first..first + members.len())
                    .map(|index| backend.get_input(&mut b, index))
                    .collect();
                b.construct(ty, values)
            }
        };
        args.push(arg);
    }
    let value = b.call_user(entry, args);
    match result {
        None => {}
        Some(&Mapping::Direct(index)) => backend.set_output(&mut b, index, value),
        Some(Mapping::Struct { first, members, .. }) => {
            for (offset, &member_ty) in members.iter().enumerate() {
                let member = b.access_const(member_ty, value, offset as u32);
                backend.set_output(&mut b, first + offset, member);
            }
        }
    }
    let ret = backend.make_return_value(&mut b);
    b.return_(ret);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InputSlot {
    Member(u32),
    LaneIndex,
    LaneCount,
    NumWorkgroups,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputSlot {
    Member(u32),
    /// Not consumed by the next stage.
    Truncated,
    ClipDistances {
        count: u32,
        first: u32,
        second: Option<u32>,
    },
}

/// A member of the output struct before sorting.
struct OutputMember {
    output: usize,
    /// 1 for the second half of a split clip distance array.
    part: u32,
    entry: IoEntry,
}

/// The HLSL [`ShaderIoBackend`].
#[derive(Debug)]
pub struct HlslShaderIo {
    config: ShaderIoConfig,
    name: String,
    stage: PipelineStage,
    inputs: Vec<IoEntry>,
    outputs: Vec<IoEntry>,
    input_param: Option<Handle<Value>>,
    input_slots: Vec<InputSlot>,
    first_index_offset: Option<Handle<Value>>,
    immediate_data: Option<Handle<Value>>,
    num_workgroups: Option<Handle<Value>>,
    output_type: Option<Handle<Type>>,
    output_slots: Vec<OutputSlot>,
    output_values: Vec<Option<Handle<Value>>>,
}

impl HlslShaderIo {
    pub fn new(config: ShaderIoConfig, io: &EntryPointIo) -> Self {
        Self {
            config,
            name: io.name.clone(),
            stage: io.stage,
            inputs: io.inputs.clone(),
            outputs: io.outputs.clone(),
            input_param: None,
            input_slots: Vec::new(),
            first_index_offset: None,
            immediate_data: None,
            num_workgroups: None,
            output_type: None,
            output_slots: Vec::new(),
            output_values: Vec::new(),
        }
    }

    fn reads_index_builtin(&self) -> bool {
        self.inputs.iter().any(|i| {
            matches!(
                i.attributes.builtin,
                Some(BuiltinValue::VertexIndex | BuiltinValue::InstanceIndex)
            )
        })
    }

    fn is_truncated(&self, attributes: &IoAttributes) -> bool {
        if !self.config.truncate_interstage_variables || self.stage != PipelineStage::Vertex {
            return false;
        }
        attributes
            .location
            .is_some_and(|l| l >= 32 || self.config.interstage_locations & (1 << l) == 0)
    }

    fn create_offset_vars(&mut self, module: &mut Module) {
        match self.config.first_index_offset {
            Some(FirstIndexOffset::Uniform(binding)) => {
                self.first_index_offset = Some(first_index_offset_var(module, binding));
            }
            Some(FirstIndexOffset::Immediate {
                first_vertex,
                first_instance,
            }) => {
                // Nothing to offset without a field, so no block is declared.
                if let Some(last) = first_vertex.max(first_instance) {
                    self.immediate_data = Some(immediate_data_var(module, last / 4 + 1));
                }
            }
            None => {}
        }
    }

    /// Adds the first vertex (`field` 0) or first instance (`field` 1) to an
    /// index builtin.
    fn offset_index(&self, b: &mut Builder<'_>, index: Handle<Value>, field: u32) -> Handle<Value> {
        let u32_ty = b.types().u32();
        let (var, space, element) = match (self.first_index_offset, self.immediate_data, self.config.first_index_offset) {
            (Some(var), _, _) => (var, AddressSpace::Uniform, field),
            (
                None,
                Some(var),
                Some(FirstIndexOffset::Immediate {
                    first_vertex,
                    first_instance,
                }),
            ) => {
                let offset = if field == 0 { first_vertex } else { first_instance };
                let Some(offset) = offset else {
                    return index;
                };
                (var, AddressSpace::Immediate, offset / 4)
            }
            _ => return index,
        };
        let ptr_ty = b.types().pointer(space, u32_ty, Access::Read);
        let ptr = b.access_const(ptr_ty, var, element);
        let offset = b.load(ptr);
        b.add(u32_ty, index, offset)
    }
}

impl ShaderIoBackend for HlslShaderIo {
    fn finalize_inputs(&mut self, module: &mut Module, entry: Handle<Function>) {
        let has_position = self
            .inputs
            .iter()
            .any(|i| i.attributes.builtin == Some(BuiltinValue::Position));
        if self.config.add_input_position && self.stage == PipelineStage::Fragment && !has_position {
            let vec4 = module.types.vector(VectorSize::Quad, Scalar::F32);
            self.inputs.push(IoEntry {
                name: "pos".into(),
                ty: vec4,
                attributes: IoAttributes::builtin(BuiltinValue::Position),
            });
        }

        let mut members = Vec::new();
        let num_workgroups_binding = self.config.num_workgroups_binding;
        self.input_slots = self
            .inputs
            .iter()
            .enumerate()
            .map(|(index, input)| match input.attributes.builtin {
                Some(BuiltinValue::SubgroupInvocationId) => InputSlot::LaneIndex,
                Some(BuiltinValue::SubgroupSize) => InputSlot::LaneCount,
                Some(BuiltinValue::NumWorkgroups) if num_workgroups_binding.is_some() => {
                    InputSlot::NumWorkgroups
                }
                _ => {
                    members.push(index);
                    InputSlot::Member(0)
                }
            })
            .collect();

        if let Some(binding) = num_workgroups_binding {
            if self.input_slots.contains(&InputSlot::NumWorkgroups) {
                self.num_workgroups = Some(num_workgroups_var(module, binding));
            }
        }
        if self.stage == PipelineStage::Vertex && self.reads_index_builtin() {
            self.create_offset_vars(module);
        }

        members.sort_by_key(|&index| member_order(&self.inputs[index].attributes));
        if members.is_empty() {
            return;
        }
        let struct_members = members
            .iter()
            .map(|&index| {
                let input = &self.inputs[index];
                StructMember::with_attributes(input.name.clone(), input.ty, input.attributes)
            })
            .collect();
        let name = module.symbols.new_symbol(&format!("{}_inputs", self.name));
        let ty = module.types.new_struct(name, struct_members);
        if let Some(def) = module.types.struct_def_mut(ty) {
            def.usage = match self.stage {
                PipelineStage::Vertex => PipelineUsage::VERTEX_INPUT,
                PipelineStage::Fragment => PipelineUsage::FRAGMENT_INPUT,
                PipelineStage::Compute => PipelineUsage::COMPUTE_INPUT,
            };
        }
        for (member, &index) in members.iter().enumerate() {
            self.input_slots[index] = InputSlot::Member(member as u32);
        }
        let param = module.add_param(entry, ty, IoAttributes::default());
        module.set_name(param, "inputs");
        self.input_param = Some(param);
    }

    fn finalize_outputs(&mut self, module: &mut Module) -> Handle<Type> {
        let mut members = Vec::new();
        let mut slots = Vec::with_capacity(self.outputs.len());
        for (index, output) in self.outputs.iter().enumerate() {
            if output.attributes.builtin == Some(BuiltinValue::ClipDistances) {
                let count = module.types.element_count(output.ty).unwrap_or(1);
                let first = count.min(4);
                let first_ty = module.types.vec_or_scalar(first, Scalar::F32);
                members.push(OutputMember {
                    output: index,
                    part: 0,
                    entry: IoEntry {
                        name: "clip_distances_0".into(),
                        ty: first_ty,
                        attributes: output.attributes,
                    },
                });
                if count > 4 {
                    let second_ty = module.types.vec_or_scalar(count - 4, Scalar::F32);
                    members.push(OutputMember {
                        output: index,
                        part: 1,
                        entry: IoEntry {
                            name: "clip_distances_1".into(),
                            ty: second_ty,
                            attributes: output.attributes,
                        },
                    });
                }
                slots.push(OutputSlot::ClipDistances {
                    count,
                    first: 0,
                    second: None,
                });
            } else if self.is_truncated(&output.attributes) {
                slots.push(OutputSlot::Truncated);
            } else {
                members.push(OutputMember {
                    output: index,
                    part: 0,
                    entry: output.clone(),
                });
                slots.push(OutputSlot::Member(0));
            }
        }

        members.sort_by_key(|m| member_order(&m.entry.attributes));
        for (position, member) in members.iter().enumerate() {
            let position = position as u32;
            match &mut slots[member.output] {
                OutputSlot::Member(m) => *m = position,
                OutputSlot::ClipDistances { first, .. } if member.part == 0 => *first = position,
                OutputSlot::ClipDistances { second, .. } => *second = Some(position),
                OutputSlot::Truncated => unreachable!("truncated outputs have no member"),
            }
        }
        self.output_slots = slots;

        if members.is_empty() {
            return module.types.void();
        }
        self.output_values = vec![None; members.len()];
        let struct_members = members
            .into_iter()
            .map(|m| StructMember::with_attributes(m.entry.name, m.entry.ty, m.entry.attributes))
            .collect();
        let name = module.symbols.new_symbol(&format!("{}_outputs", self.name));
        let ty = module.types.new_struct(name, struct_members);
        if let Some(def) = module.types.struct_def_mut(ty) {
            def.usage = match self.stage {
                PipelineStage::Vertex => PipelineUsage::VERTEX_OUTPUT,
                PipelineStage::Fragment => PipelineUsage::FRAGMENT_OUTPUT,
                PipelineStage::Compute => PipelineUsage::EMPTY,
            };
        }
        self.output_type = Some(ty);
        ty
    }

    fn get_input(&mut self, b: &mut Builder<'_>, index: usize) -> Handle<Value> {
        let u32_ty = b.types().u32();
        let member = match self.input_slots[index] {
            InputSlot::LaneIndex => return b.call(u32_ty, HlslBuiltin::WaveGetLaneIndex, Vec::new()),
            InputSlot::LaneCount => return b.call(u32_ty, HlslBuiltin::WaveGetLaneCount, Vec::new()),
            InputSlot::NumWorkgroups => {
                let Some(var) = self.num_workgroups else {
                    unreachable!("num_workgroups input without a uniform");
                };
                return b.load(var);
            }
            InputSlot::Member(member) => member,
        };
        let Some(param) = self.input_param else {
            unreachable!("struct input without an input parameter");
        };
        let input = &self.inputs[index];
        let value = b.access_const(input.ty, param, member);
        match input.attributes.builtin {
            Some(BuiltinValue::Position) if self.stage == PipelineStage::Fragment => invert_w(b, value),
            Some(BuiltinValue::VertexIndex) => self.offset_index(b, value, 0),
            Some(BuiltinValue::InstanceIndex) => self.offset_index(b, value, 1),
            _ => value,
        }
    }

    fn set_output(&mut self, b: &mut Builder<'_>, index: usize, value: Handle<Value>) {
        match self.output_slots[index] {
            OutputSlot::Truncated => {}
            OutputSlot::Member(member) => self.output_values[member as usize] = Some(value),
            OutputSlot::ClipDistances { count, first, second } => {
                let head = clip_distance_slice(b, value, 0, count.min(4));
                self.output_values[first as usize] = Some(head);
                if let Some(second) = second {
                    let tail = clip_distance_slice(b, value, 4, count - 4);
                    self.output_values[second as usize] = Some(tail);
                }
            }
        }
    }

    fn make_return_value(&mut self, b: &mut Builder<'_>) -> Option<Handle<Value>> {
        let ty = self.output_type?;
        let values: Vec<_> = self.output_values.iter().copied().flatten().collect();
        assert_eq!(
            values.len(),
            self.output_values.len(),
            "output struct member was never written"
        );
        Some(b.construct(ty, values))
    }
}

/// Sort key of a struct member: color, location, blend source, then the
/// builtin order. Absent attributes sort last.
fn member_order(attributes: &IoAttributes) -> [u32; 4] {
    [
        attributes.color.unwrap_or(u32::MAX),
        attributes.location.unwrap_or(u32::MAX),
        attributes.blend_src.unwrap_or(u32::MAX),
        attributes.builtin.map_or(u32::MAX, builtin_order),
    ]
}

fn builtin_order(builtin: BuiltinValue) -> u32 {
    match builtin {
        BuiltinValue::Position => 0,
        BuiltinValue::VertexIndex => 1,
        BuiltinValue::InstanceIndex => 2,
        BuiltinValue::FrontFacing => 3,
        BuiltinValue::FragDepth => 4,
        BuiltinValue::LocalInvocationId => 5,
        BuiltinValue::LocalInvocationIndex => 6,
        BuiltinValue::GlobalInvocationId => 7,
        BuiltinValue::WorkgroupId => 8,
        BuiltinValue::SampleIndex => 9,
        BuiltinValue::SampleMask => 10,
        BuiltinValue::PointSize => 11,
        BuiltinValue::ClipDistances => 12,
        BuiltinValue::NumWorkgroups => 13,
        BuiltinValue::SubgroupInvocationId | BuiltinValue::SubgroupSize => {
            unreachable!("{builtin:?} is never a struct member")
        }
    }
}

/// `vec4(pos.xyz, 1 / pos.w)`.
fn invert_w(b: &mut Builder<'_>, position: Handle<Value>) -> Handle<Value> {
    let vec4 = b.module().value_type(position);
    let f32_ty = b.types().f32();
    let vec3 = b.types().vector(VectorSize::Tri, Scalar::F32);
    let xyz = b.swizzle(vec3, position, vec![0, 1, 2]);
    let w = b.access_const(f32_ty, position, 3);
    let one = b.f32(1.0);
    let inverse = b.divide(f32_ty, one, w);
    b.construct(vec4, vec![xyz, inverse])
}

/// Elements `start..start + len` of a clip distance array, as a scalar or
/// vector.
fn clip_distance_slice(b: &mut Builder<'_>, array: Handle<Value>, start: u32, len: u32) -> Handle<Value> {
    let f32_ty = b.types().f32();
    let elements: Vec<_> = (start..start + len)
        .map(|i| b.access_const(f32_ty, array, i))
        .collect();
    if len == 1 {
        return elements[0];
    }
    let ty = b.types().vec_or_scalar(len, Scalar::F32);
    b.construct(ty, elements)
}

fn find_root_var(module: &Module, name: &str) -> Option<Handle<Value>> {
    module
        .root_vars()
        .into_iter()
        .map(|inst| module.result(inst))
        .find(|&v| module.name_of(v) == Some(name))
}

fn first_index_offset_var(module: &mut Module, binding: BindingPoint) -> Handle<Value> {
    if let Some(var) = find_root_var(module, FIRST_INDEX_OFFSET) {
        return var;
    }
    let u32_ty = module.types.u32();
    let struct_name = module.symbols.new_symbol("tint_first_index_offset_struct");
    let ty = module.types.new_struct(
        struct_name,
        vec![
            StructMember::new("first_vertex", u32_ty),
            StructMember::new("first_instance", u32_ty),
        ],
    );
    if let Some(def) = module.types.struct_def_mut(ty) {
        def.flags |= StructFlags::BLOCK;
    }
    let root = module.root();
    let var = Builder::at_end(module, root).var_with(AddressSpace::Uniform, ty, Access::Read, Some(binding), None);
    let name = module.symbols.new_symbol(FIRST_INDEX_OFFSET);
    module.set_name(var, name);
    var
}

fn immediate_data_var(module: &mut Module, words: u32) -> Handle<Value> {
    if let Some(var) = find_root_var(module, IMMEDIATE_DATA) {
        return var;
    }
    let u32_ty = module.types.u32();
    let ty = module.types.array(u32_ty, words);
    let root = module.root();
    let var = Builder::at_end(module, root).var(AddressSpace::Immediate, ty, Access::Read);
    let name = module.symbols.new_symbol(IMMEDIATE_DATA);
    module.set_name(var, name);
    var
}

fn num_workgroups_var(module: &mut Module, binding: BindingPoint) -> Handle<Value> {
    if let Some(var) = find_root_var(module, NUM_WORKGROUPS) {
        return var;
    }
    let uvec3 = module.types.vector(VectorSize::Tri, Scalar::U32);
    let root = module.root();
    let var = Builder::at_end(module, root).var_with(AddressSpace::Uniform, uvec3, Access::Read, Some(binding), None);
    let name = module.symbols.new_symbol(NUM_WORKGROUPS);
    module.set_name(var, name);
    var
}
