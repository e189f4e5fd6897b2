//! Values, constants and use edges.

use crate::arena::Handle;
use crate::function::Function;
use crate::instruction::Instruction;
use crate::types::Type;

/// A single use of a value: operand `operand` of `instruction`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Usage {
    pub instruction: Handle<Instruction>,
    pub operand: usize,
}

/// A constant value.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Bool(bool),
    I32(i32),
    U32(u32),
    F32(f32),
    /// An f16 constant, stored widened to f32.
    F16(f32),
    Str(String),
    /// A composite built from per-element constants.
    Composite(Vec<Constant>),
    /// A composite with every element equal to the given constant.
    Splat(Box<Constant>),
    /// The zero value of the value's type.
    Zero,
}

impl Constant {
    /// Returns the constant as an integer index, if it is one.
    pub fn as_index(&self) -> Option<u32> {
        match *self {
            Self::U32(v) => Some(v),
            Self::I32(v) => u32::try_from(v).ok(),
            _ => None,
        }
    }
}

/// Where a value comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    /// Produced by an instruction. `None` once the producer was destroyed.
    Result {
        instruction: Option<Handle<Instruction>>,
    },
    /// Parameter `index` of `function`.
    Param {
        function: Handle<Function>,
        index: usize,
    },
    Constant(Constant),
}

/// A value with its type and its use list.
///
/// The use list is maintained exclusively by [`Module`](crate::Module);
/// every operand edge of a live instruction has exactly one matching [`Usage`].
#[derive(Clone, Debug)]
pub struct Value {
    pub ty: Handle<Type>,
    pub kind: ValueKind,
    pub(crate) uses: Vec<Usage>,
}

impl Value {
    pub(crate) fn new(ty: Handle<Type>, kind: ValueKind) -> Self {
        Self {
            ty,
            kind,
            uses: Vec::new(),
        }
    }

    pub fn uses(&self) -> &[Usage] {
        &self.uses
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ValueKind::Constant(_))
    }

    pub fn constant(&self) -> Option<&Constant> {
        match &self.kind {
            ValueKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// The instruction producing this value, if it is a live result.
    pub fn producer(&self) -> Option<Handle<Instruction>> {
        match self.kind {
            ValueKind::Result { instruction } => instruction,
            _ => None,
        }
    }
}
