//! Dialect lowering and raising passes for prism-ir modules.
//!
//! Provides a [`Pass`] trait, a validating [`Pipeline`] with per-target
//! presets, and the passes themselves. Every pass validates its input,
//! collects a worklist in module order and rewrites it in place.

mod builtin_polyfill;
mod config;
mod expand_implicit_splats;
mod fork_explicit_layout;
mod matrix_arithmetic;
mod print_to_log;
mod shader_io;
mod spirv_builtins;
mod spirv_texture;
#[cfg(test)]
mod test_helpers;

pub use builtin_polyfill::{BuiltinPolyfill, builtin_polyfill};
pub use config::{FirstIndexOffset, PipelineConfig, PolyfillConfig, ShaderIoConfig};
pub use expand_implicit_splats::{ExpandImplicitSplats, expand_implicit_splats};
pub use fork_explicit_layout::{ForkExplicitLayoutTypes, fork_explicit_layout_types};
pub use matrix_arithmetic::{HandleMatrixArithmetic, handle_matrix_arithmetic};
pub use print_to_log::{ConvertPrintToLog, convert_print_to_log};
pub use shader_io::{
    EntryPointIo, HlslShaderIo, IoEntry, ShaderIo, ShaderIoBackend, run_shader_io, shader_io,
};
pub use spirv_builtins::{LowerSpirvBuiltins, lower_spirv_builtins};
pub use spirv_texture::{LowerSpirvTexture, lower_spirv_texture};

use std::fmt::Debug;

use prism_ir::{Capabilities, Module, ValidationError, validate};

/// Modules read from SPIR-V may share bindings, hold several entry points
/// and use combined image/samplers.
pub(crate) const SPIRV_READER_CAPABILITIES: Capabilities = Capabilities::ALLOW_DUPLICATE_BINDINGS
    .union(Capabilities::ALLOW_MULTIPLE_ENTRY_POINTS)
    .union(Capabilities::ALLOW_NON_CORE_TYPES);

/// Modules prepared for SPIR-V emission hold explicit-layout types.
pub(crate) const SPIRV_WRITER_CAPABILITIES: Capabilities =
    Capabilities::ALLOW_MULTIPLE_ENTRY_POINTS.union(Capabilities::ALLOW_NON_CORE_TYPES);

/// Errors produced while transforming a module.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The module failed validation before or after a pass.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The module uses a feature the pass cannot handle.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// A transform that rewrites an IR module in place.
pub trait Pass: Debug {
    /// Human-readable name of the pass, used in validation diagnostics.
    fn name(&self) -> &str;

    /// Capabilities the module may use around this pass.
    fn capabilities(&self) -> Capabilities {
        Capabilities::EMPTY
    }

    /// Run the pass on a module.
    fn run(&self, module: &mut Module) -> Result<(), TransformError>;
}

/// The backend a pipeline prepares a module for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Glsl,
    Hlsl,
    Msl,
    /// Raise a module read from SPIR-V to the core dialect.
    SpirvReader,
    /// Prepare a core module for SPIR-V emission.
    SpirvWriter,
}

/// Runs passes in a fixed order, validating after each one.
#[derive(Debug)]
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
    /// Validate the module after every pass, not only before.
    pub validate_outputs: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            validate_outputs: cfg!(debug_assertions),
        }
    }

    /// Creates the pass sequence used for `target` with default options.
    pub fn for_target(target: Target) -> Self {
        Self::for_target_with(target, &PipelineConfig::default())
    }

    /// Creates the pass sequence used for `target`.
    pub fn for_target_with(target: Target, config: &PipelineConfig) -> Self {
        let mut pipeline = Self::new();
        match target {
            Target::Glsl => {
                pipeline.add_pass(Box::new(BuiltinPolyfill::new(config.polyfill)));
            }
            Target::Hlsl => {
                pipeline.add_pass(Box::new(ShaderIo::new(config.shader_io)));
            }
            Target::Msl => {
                pipeline.add_pass(Box::new(ConvertPrintToLog));
            }
            Target::SpirvReader => {
                pipeline.add_pass(Box::new(LowerSpirvTexture));
                pipeline.add_pass(Box::new(LowerSpirvBuiltins));
            }
            Target::SpirvWriter => {
                pipeline.add_pass(Box::new(ExpandImplicitSplats));
                pipeline.add_pass(Box::new(HandleMatrixArithmetic));
                pipeline.add_pass(Box::new(ForkExplicitLayoutTypes));
            }
        }
        pipeline
    }

    /// Appends a pass.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Names of the passes, in run order.
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Runs every pass once, stopping at the first failure.
    pub fn run(&self, module: &mut Module) -> Result<(), TransformError> {
        for pass in &self.passes {
            log::debug!("running pass {}", pass.name());
            pass.run(module)?;
            if self.validate_outputs {
                validate(module, pass.name(), pass.capabilities())?;
            }
        }
        Ok(())
    }
}
