//! Per-target pass configuration.

use prism_ir::BindingPoint;

/// Options for the GLSL builtin polyfill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolyfillConfig {
    /// Emulate `fma` with a multiply and an add.
    pub fma: bool,
}

/// Where the vertex/instance index offsets come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirstIndexOffset {
    /// A uniform buffer `{ first_vertex: u32, first_instance: u32 }` at
    /// the given binding.
    Uniform(BindingPoint),
    /// Byte offsets into the immediate data block. `None` means the index
    /// needs no offset.
    Immediate {
        first_vertex: Option<u32>,
        first_instance: Option<u32>,
    },
}

/// Options for the HLSL-style shader IO transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderIoConfig {
    pub first_index_offset: Option<FirstIndexOffset>,
    /// Binding of the uniform buffer that serves `num_workgroups`.
    pub num_workgroups_binding: Option<BindingPoint>,
    /// Drop vertex outputs whose location is not set in `interstage_locations`.
    pub truncate_interstage_variables: bool,
    /// Bitset of interstage locations consumed by the next stage.
    pub interstage_locations: u32,
    /// Give fragment shaders a position input even if they do not read one.
    pub add_input_position: bool,
}

impl Default for ShaderIoConfig {
    fn default() -> Self {
        Self {
            first_index_offset: None,
            num_workgroups_binding: None,
            truncate_interstage_variables: false,
            interstage_locations: u32::MAX,
            add_input_position: false,
        }
    }
}

/// Configuration for every pass of a [`Pipeline`](crate::Pipeline).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub polyfill: PolyfillConfig,
    pub shader_io: ShaderIoConfig,
}
