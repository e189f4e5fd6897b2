//! Pipeline stages, shader IO attributes and resource bindings.

use std::fmt;

/// The pipeline stage of an entry point.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum PipelineStage {
    Vertex,
    Fragment,
    Compute,
}

/// Built-in shader inputs/outputs.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum BuiltinValue {
    /// `@builtin(position)`: vec4<f32>
    Position,
    /// `@builtin(vertex_index)`: u32
    VertexIndex,
    /// `@builtin(instance_index)`: u32
    InstanceIndex,
    /// `@builtin(front_facing)`: bool
    FrontFacing,
    /// `@builtin(frag_depth)`: f32
    FragDepth,
    /// `@builtin(sample_index)`: u32
    SampleIndex,
    /// `@builtin(sample_mask)`: u32
    SampleMask,
    /// `@builtin(local_invocation_id)`: vec3<u32>
    LocalInvocationId,
    /// `@builtin(local_invocation_index)`: u32
    LocalInvocationIndex,
    /// `@builtin(global_invocation_id)`: vec3<u32>
    GlobalInvocationId,
    /// `@builtin(workgroup_id)`: vec3<u32>
    WorkgroupId,
    /// `@builtin(num_workgroups)`: vec3<u32>
    NumWorkgroups,
    /// `@builtin(subgroup_invocation_id)`: u32
    SubgroupInvocationId,
    /// `@builtin(subgroup_size)`: u32
    SubgroupSize,
    /// `@builtin(clip_distances)`: array<f32, N>
    ClipDistances,
    /// `@builtin(point_size)`: f32
    PointSize,
}

/// Interpolation qualifier of a user-defined interstage value.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Interpolation {
    Perspective,
    Linear,
    Flat,
}

/// IO attributes attached to entry point parameters, return values and
/// struct members.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct IoAttributes {
    pub builtin: Option<BuiltinValue>,
    pub location: Option<u32>,
    /// Framebuffer-fetch color attachment index.
    pub color: Option<u32>,
    /// Dual-source blending index.
    pub blend_src: Option<u32>,
    pub interpolation: Option<Interpolation>,
    pub invariant: bool,
}

impl IoAttributes {
    /// Attributes carrying only a builtin.
    pub fn builtin(builtin: BuiltinValue) -> Self {
        Self {
            builtin: Some(builtin),
            ..Self::default()
        }
    }

    /// Attributes carrying only a location.
    pub fn location(location: u32) -> Self {
        Self {
            location: Some(location),
            ..Self::default()
        }
    }

    /// Attributes carrying only a color attachment index.
    pub fn color(color: u32) -> Self {
        Self {
            color: Some(color),
            ..Self::default()
        }
    }

    /// Returns `true` if no IO attribute is present.
    pub fn is_empty(&self) -> bool {
        self.builtin.is_none()
            && self.location.is_none()
            && self.color.is_none()
            && self.blend_src.is_none()
    }
}

/// `@group(N) @binding(N)` resource binding.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BindingPoint {
    pub group: u32,
    pub binding: u32,
}

impl BindingPoint {
    pub const fn new(group: u32, binding: u32) -> Self {
        Self { group, binding }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
            Self::Compute => "compute",
        })
    }
}

impl fmt::Display for BuiltinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Position => "position",
            Self::VertexIndex => "vertex_index",
            Self::InstanceIndex => "instance_index",
            Self::FrontFacing => "front_facing",
            Self::FragDepth => "frag_depth",
            Self::SampleIndex => "sample_index",
            Self::SampleMask => "sample_mask",
            Self::LocalInvocationId => "local_invocation_id",
            Self::LocalInvocationIndex => "local_invocation_index",
            Self::GlobalInvocationId => "global_invocation_id",
            Self::WorkgroupId => "workgroup_id",
            Self::NumWorkgroups => "num_workgroups",
            Self::SubgroupInvocationId => "subgroup_invocation_id",
            Self::SubgroupSize => "subgroup_size",
            Self::ClipDistances => "clip_distances",
            Self::PointSize => "point_size",
        })
    }
}

impl fmt::Display for IoAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(b) = self.builtin {
            parts.push(format!("@builtin({b})"));
        }
        if let Some(l) = self.location {
            parts.push(format!("@location({l})"));
        }
        if let Some(c) = self.color {
            parts.push(format!("@color({c})"));
        }
        if let Some(s) = self.blend_src {
            parts.push(format!("@blend_src({s})"));
        }
        if let Some(i) = self.interpolation {
            let name = match i {
                Interpolation::Perspective => "perspective",
                Interpolation::Linear => "linear",
                Interpolation::Flat => "flat",
            };
            parts.push(format!("@interpolate({name})"));
        }
        if self.invariant {
            parts.push("@invariant".into());
        }
        write!(f, "{}", parts.join(" "))
    }
}
