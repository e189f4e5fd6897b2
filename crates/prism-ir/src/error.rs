//! Error types for the IR.

use std::fmt;

use crate::arena::Handle;
use crate::instruction::Instruction;

/// Errors raised when inspecting a malformed module.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A handle index is out of bounds for its arena.
    #[error("{arena} handle index {index} out of bounds (arena size: {size})")]
    BadHandle {
        arena: &'static str,
        index: usize,
        size: usize,
    },

    /// A value whose producing instruction was destroyed is still in use.
    #[error("value {index} is used after its producer was destroyed")]
    DetachedValue { index: usize },

    /// A type mismatch was detected.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

/// A single problem found by the validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// The offending instruction, if the problem is attached to one.
    pub instruction: Option<Handle<Instruction>>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instruction {
            Some(inst) => write!(f, "instruction {inst:?}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// The module failed validation.
#[derive(Debug, thiserror::Error)]
#[error("{pass}: {} validation error(s): {}", .diagnostics.len(), first(.diagnostics))]
pub struct ValidationError {
    /// The pass whose pre- or post-condition failed.
    pub pass: String,
    pub diagnostics: Vec<Diagnostic>,
}

fn first(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}
