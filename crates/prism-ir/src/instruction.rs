//! Instructions and blocks.

use std::fmt;

use crate::arena::Handle;
use crate::attributes::BindingPoint;
use crate::builtin::Builtin;
use crate::function::Function;
use crate::types::Type;
use crate::value::Value;

/// Binary operators.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    Xor,
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    ShiftLeft,
    ShiftRight,
}

impl BinaryOp {
    /// Returns `true` for comparison operators, whose result is boolean.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Equal
                | Self::NotEqual
                | Self::LessThan
                | Self::LessThanEqual
                | Self::GreaterThan
                | Self::GreaterThanEqual
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, Self::ShiftLeft | Self::ShiftRight)
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum UnaryOp {
    Negation,
    /// Bitwise complement.
    Complement,
    /// Logical not.
    Not,
}

/// A source location, propagated to instructions generated from an anchor.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct Source {
    pub line: u32,
    pub column: u32,
}

/// What an instruction does.
///
/// Operand layout per kind:
/// - `Binary`: `[lhs, rhs]`; `Unary`, `Convert`, `Bitcast`, `Swizzle`, `Let`: `[value]`
/// - `Construct`, `BuiltinCall`, `UserCall`: the arguments
/// - `Access`: `[base, indices..]`
/// - `Load`: `[ptr]`; `Store`: `[ptr, value]`
/// - `LoadVectorElement`: `[ptr, index]`; `StoreVectorElement`: `[ptr, index, value]`
/// - `Var`: `[]` or `[initializer]`
/// - `If`: `[condition]`; `BreakIf`: `[condition]`; `Return`: `[]` or `[value]`
#[derive(Clone, Debug, PartialEq)]
pub enum InstKind {
    Binary(BinaryOp),
    Unary(UnaryOp),
    Convert,
    Bitcast,
    Construct,
    Access,
    Swizzle(Vec<u32>),
    Load,
    Store,
    LoadVectorElement,
    StoreVectorElement,
    Var {
        binding: Option<BindingPoint>,
    },
    Let,
    BuiltinCall {
        builtin: Builtin,
        explicit_types: Vec<Handle<Type>>,
    },
    UserCall(Handle<Function>),
    If {
        true_block: Handle<Block>,
        false_block: Handle<Block>,
    },
    /// `initializer` runs once, then `body` repeats; `continuing` runs
    /// between iterations.
    Loop {
        initializer: Handle<Block>,
        body: Handle<Block>,
        continuing: Handle<Block>,
    },
    Return,
    ExitIf,
    ExitLoop,
    Continue,
    NextIteration,
    BreakIf,
    Unreachable,
}

impl InstKind {
    /// Returns `true` for block terminators.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Return
                | Self::ExitIf
                | Self::ExitLoop
                | Self::Continue
                | Self::NextIteration
                | Self::BreakIf
                | Self::Unreachable
        )
    }

    /// Blocks owned by a control flow instruction, in execution order.
    pub fn blocks(&self) -> Vec<Handle<Block>> {
        match *self {
            Self::If {
                true_block,
                false_block,
            } => vec![true_block, false_block],
            Self::Loop {
                initializer,
                body,
                continuing,
            } => vec![initializer, body, continuing],
            _ => Vec::new(),
        }
    }

    /// The builtin tag, for builtin calls.
    pub fn builtin(&self) -> Option<Builtin> {
        match *self {
            Self::BuiltinCall { builtin, .. } => Some(builtin),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> String {
        match self {
            Self::Binary(op) => format!("{op}"),
            Self::Unary(op) => format!("{op}"),
            Self::Convert => "convert".into(),
            Self::Bitcast => "bitcast".into(),
            Self::Construct => "construct".into(),
            Self::Access => "access".into(),
            Self::Swizzle(_) => "swizzle".into(),
            Self::Load => "load".into(),
            Self::Store => "store".into(),
            Self::LoadVectorElement => "load_vector_element".into(),
            Self::StoreVectorElement => "store_vector_element".into(),
            Self::Var { .. } => "var".into(),
            Self::Let => "let".into(),
            Self::BuiltinCall { builtin, .. } => format!("{builtin}"),
            Self::UserCall(_) => "call".into(),
            Self::If { .. } => "if".into(),
            Self::Loop { .. } => "loop".into(),
            Self::Return => "ret".into(),
            Self::ExitIf => "exit_if".into(),
            Self::ExitLoop => "exit_loop".into(),
            Self::Continue => "continue".into(),
            Self::NextIteration => "next_iteration".into(),
            Self::BreakIf => "break_if".into(),
            Self::Unreachable => "unreachable".into(),
        }
    }
}

/// An instruction. Operands and results are maintained by the module.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub kind: InstKind,
    pub source: Option<Source>,
    pub(crate) operands: Vec<Handle<Value>>,
    pub(crate) results: Vec<Handle<Value>>,
    pub(crate) block: Option<Handle<Block>>,
    pub(crate) alive: bool,
}

impl Instruction {
    pub fn operands(&self) -> &[Handle<Value>] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Handle<Value> {
        self.operands[index]
    }

    pub fn results(&self) -> &[Handle<Value>] {
        &self.results
    }

    /// The single result, if any.
    pub fn result(&self) -> Option<Handle<Value>> {
        self.results.first().copied()
    }

    /// The block this instruction is linked into.
    pub fn block(&self) -> Option<Handle<Block>> {
        self.block
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

/// The owner of a block.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BlockParent {
    /// The module-scope block holding `var`s.
    Root,
    /// The body of a function.
    Function(Handle<Function>),
    /// A block of a control flow instruction.
    Instruction(Handle<Instruction>),
}

/// An ordered list of instructions.
#[derive(Clone, Debug)]
pub struct Block {
    pub(crate) instructions: Vec<Handle<Instruction>>,
    pub(crate) parent: BlockParent,
}

impl Block {
    pub(crate) fn new(parent: BlockParent) -> Self {
        Self {
            instructions: Vec::new(),
            parent,
        }
    }

    pub fn instructions(&self) -> &[Handle<Instruction>] {
        &self.instructions
    }

    pub fn parent(&self) -> BlockParent {
        self.parent
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn first(&self) -> Option<Handle<Instruction>> {
        self.instructions.first().copied()
    }

    pub fn last(&self) -> Option<Handle<Instruction>> {
        self.instructions.last().copied()
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Subtract => "sub",
            Self::Multiply => "mul",
            Self::Divide => "div",
            Self::Modulo => "mod",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Equal => "eq",
            Self::NotEqual => "neq",
            Self::LessThan => "lt",
            Self::LessThanEqual => "lte",
            Self::GreaterThan => "gt",
            Self::GreaterThanEqual => "gte",
            Self::ShiftLeft => "shl",
            Self::ShiftRight => "shr",
        })
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Negation => "negation",
            Self::Complement => "complement",
            Self::Not => "not",
        })
    }
}
