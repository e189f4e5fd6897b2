//! Prism shader intermediate representation.
//!
//! An arena-based SSA IR with explicit use lists, structured control flow
//! and builtin calls tagged per dialect. Passes in `prism-transform` rewrite
//! modules of this IR in place; [`validate`] gates every pass.

pub mod arena;
mod attributes;
mod builder;
mod builtin;
mod display;
mod error;
mod function;
mod instruction;
mod module;
mod symbols;
mod types;
mod validator;
mod value;

pub use arena::{Arena, Handle, UniqueArena};
pub use attributes::{BindingPoint, BuiltinValue, Interpolation, IoAttributes, PipelineStage};
pub use builder::{Builder, InsertionPoint};
pub use builtin::{
    Builtin, CoreBuiltin, GlslBuiltin, HlslBuiltin, ImageOperands, MslBuiltin, SpirvBuiltin,
};
pub use display::disassemble;
pub use error::{Diagnostic, IrError, ValidationError};
pub use function::{Function, Param};
pub use instruction::{BinaryOp, Block, BlockParent, InstKind, Instruction, Source, UnaryOp};
pub use module::Module;
pub use symbols::SymbolTable;
pub use types::{
    Access, AddressSpace, ArraySize, Bytes, PipelineUsage, SamplerKind, Scalar, ScalarKind,
    StructDef, StructFlags, StructMember, TexelFormat, TextureDimension, Type, TypeTable,
    VectorSize,
};
pub use validator::{Capabilities, validate};
pub use value::{Constant, Usage, Value, ValueKind};
