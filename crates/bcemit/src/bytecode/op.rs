//! Opcode definitions and their static encoding and stack-effect table.

use strum::{Display, FromRepr, IntoStaticStr};

use super::buffer::{get_i16, get_u16};

/// Length in bytes of a narrow jump offset immediate.
pub const JUMP_OFFSET_LEN: usize = 2;
/// Length in bytes of a wide jump offset immediate.
pub const JUMPX_OFFSET_LEN: usize = 4;
/// Length in bytes of a literal, local-slot or count immediate.
pub const INDEX_LEN: usize = 2;

pub const JUMP_OFFSET_MIN: isize = i16::MIN as isize;
pub const JUMP_OFFSET_MAX: isize = i16::MAX as isize;
pub const JUMPX_OFFSET_MIN: isize = i32::MIN as isize;
pub const JUMPX_OFFSET_MAX: isize = i32::MAX as isize;

/// Bytecode instruction opcodes.
///
/// Jump-format opcodes carry an i16 offset relative to their own first byte;
/// their `*X` twins carry an i32 and only appear once the span-dependency
/// resolver has promoted them.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr)]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    Nop,
    /// Pushes `undefined`.
    Push,
    Pop,
    /// Pops the number of values given by its u16 operand.
    PopN,
    Dup,
    Dup2,
    Null,
    True,
    False,
    Zero,
    One,
    Int8,
    Uint16,
    Int32,
    Double,
    String,
    Name,
    SetName,
    GetLocal,
    SetLocal,
    SetLocalPop,
    GetProp,
    SetProp,
    GetElem,
    SetElem,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitOr,
    BitXor,
    BitAnd,
    Lsh,
    Rsh,
    Ursh,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    InstanceOf,
    Not,
    BitNot,
    Neg,
    Pos,
    TypeOf,
    Void,
    Call,
    New,
    Lambda,
    DefFun,
    DefVar,
    Return,
    SetRval,
    RetRval,
    Stop,
    Throw,
    Try,
    Finally,
    RetSub,
    Exception,
    EnterWith,
    LeaveWith,
    EnterBlock,
    LeaveBlock,
    Iter,
    IterNext,
    MoreIter,
    EndIter,
    CondSwitch,
    Goto,
    IfEq,
    IfNe,
    Or,
    And,
    Gosub,
    Case,
    Default,
    /// Placeholder for a pending jump whose chain is resolved by `backpatch`.
    Backpatch,
    /// Like `Backpatch`, but pops its operand (pending `and`/`or`).
    BackpatchPop,
    TableSwitch,
    LookupSwitch,
    GotoX,
    IfEqX,
    IfNeX,
    OrX,
    AndX,
    GosubX,
    CaseX,
    DefaultX,
    TableSwitchX,
    LookupSwitchX,
}

/// Immediate-operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFormat {
    Byte,
    Uint8,
    Uint16,
    /// u16 index into the literal table.
    Atom,
    /// u16 index into the nested-function list.
    Object,
    Int32,
    Jump,
    JumpX,
    TableSwitch,
    TableSwitchX,
    LookupSwitch,
    LookupSwitchX,
}

impl OpFormat {
    /// Width of each jump offset immediate for jump and switch formats.
    #[must_use]
    pub fn jump_len(self) -> Option<usize> {
        match self {
            Self::Jump | Self::TableSwitch | Self::LookupSwitch => Some(JUMP_OFFSET_LEN),
            Self::JumpX | Self::TableSwitchX | Self::LookupSwitchX => Some(JUMPX_OFFSET_LEN),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_switch(self) -> bool {
        matches!(
            self,
            Self::TableSwitch | Self::TableSwitchX | Self::LookupSwitch | Self::LookupSwitchX
        )
    }
}

/// Static description of one opcode.
///
/// A negative `length` means the instruction is variable length. A negative
/// `uses` means the count comes from the immediate operand, and a negative
/// `defs` means the emitter supplies it out of band (block entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSpec {
    pub length: i8,
    pub uses: i8,
    pub defs: i8,
    pub format: OpFormat,
    /// Extra stack slots the instruction needs as scratch space while it runs.
    pub tmp_slots: u8,
    /// Jump placeholder resolved through a backpatch chain.
    pub backpatch: bool,
}

const fn spec(length: i8, uses: i8, defs: i8, format: OpFormat) -> OpSpec {
    OpSpec {
        length,
        uses,
        defs,
        format,
        tmp_slots: 0,
        backpatch: false,
    }
}

impl Opcode {
    /// Returns the static encoding and stack-effect description.
    #[must_use]
    pub const fn spec(self) -> OpSpec {
        use OpFormat as F;
        match self {
            Self::Nop => spec(1, 0, 0, F::Byte),
            Self::Push | Self::Null | Self::True | Self::False | Self::Zero | Self::One => spec(1, 0, 1, F::Byte),
            Self::Pop => spec(1, 1, 0, F::Byte),
            Self::PopN => spec(3, -1, 0, F::Uint16),
            Self::Dup => spec(1, 1, 2, F::Byte),
            Self::Dup2 => spec(1, 2, 4, F::Byte),
            Self::Int8 => spec(2, 0, 1, F::Uint8),
            Self::Uint16 => spec(3, 0, 1, F::Uint16),
            Self::Int32 => spec(5, 0, 1, F::Int32),
            Self::Double | Self::String | Self::Name => spec(3, 0, 1, F::Atom),
            Self::SetName | Self::GetProp => spec(3, 1, 1, F::Atom),
            Self::GetLocal => spec(3, 0, 1, F::Uint16),
            Self::SetLocal => spec(3, 1, 1, F::Uint16),
            Self::SetLocalPop => spec(3, 1, 0, F::Uint16),
            Self::SetProp => spec(3, 2, 1, F::Atom),
            Self::GetElem => spec(1, 2, 1, F::Byte),
            Self::SetElem => spec(1, 3, 1, F::Byte),
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::BitOr
            | Self::BitXor
            | Self::BitAnd
            | Self::Lsh
            | Self::Rsh
            | Self::Ursh
            | Self::Eq
            | Self::Ne
            | Self::StrictEq
            | Self::StrictNe
            | Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::In
            | Self::InstanceOf => spec(1, 2, 1, F::Byte),
            Self::Not | Self::BitNot | Self::Neg | Self::Pos | Self::TypeOf | Self::Void => spec(1, 1, 1, F::Byte),
            Self::Call | Self::New => spec(3, -1, 1, F::Uint16),
            Self::Lambda => spec(3, 0, 1, F::Object),
            Self::DefFun => spec(3, 0, 0, F::Object),
            Self::DefVar => spec(3, 0, 0, F::Atom),
            Self::Return | Self::SetRval | Self::Throw => spec(1, 1, 0, F::Byte),
            Self::RetRval | Self::Stop | Self::Try | Self::CondSwitch => spec(1, 0, 0, F::Byte),
            Self::Finally => spec(1, 0, 2, F::Byte),
            Self::RetSub => spec(1, 2, 0, F::Byte),
            Self::Exception => spec(1, 0, 1, F::Byte),
            Self::EnterWith => spec(1, 1, 1, F::Byte),
            Self::LeaveWith | Self::EndIter => spec(1, 1, 0, F::Byte),
            Self::EnterBlock => spec(3, 0, -1, F::Uint16),
            Self::LeaveBlock => spec(3, -1, 0, F::Uint16),
            Self::Iter => spec(2, 1, 1, F::Uint8),
            Self::IterNext => OpSpec {
                tmp_slots: 1,
                ..spec(1, 1, 2, F::Byte)
            },
            Self::MoreIter => spec(1, 1, 2, F::Byte),
            Self::Goto | Self::Gosub => spec(3, 0, 0, F::Jump),
            Self::IfEq | Self::IfNe | Self::Or | Self::And => spec(3, 1, 0, F::Jump),
            Self::Case => spec(3, 2, 1, F::Jump),
            Self::Default => spec(3, 1, 0, F::Jump),
            Self::Backpatch => OpSpec {
                backpatch: true,
                ..spec(3, 0, 0, F::Jump)
            },
            Self::BackpatchPop => OpSpec {
                backpatch: true,
                ..spec(3, 1, 0, F::Jump)
            },
            Self::TableSwitch => spec(-1, 1, 0, F::TableSwitch),
            Self::LookupSwitch => spec(-1, 1, 0, F::LookupSwitch),
            Self::GotoX | Self::GosubX => spec(5, 0, 0, F::JumpX),
            Self::IfEqX | Self::IfNeX | Self::OrX | Self::AndX => spec(5, 1, 0, F::JumpX),
            Self::CaseX => spec(5, 2, 1, F::JumpX),
            Self::DefaultX => spec(5, 1, 0, F::JumpX),
            Self::TableSwitchX => spec(-1, 1, 0, F::TableSwitchX),
            Self::LookupSwitchX => spec(-1, 1, 0, F::LookupSwitchX),
        }
    }

    #[must_use]
    pub fn format(self) -> OpFormat {
        self.spec().format
    }

    /// Returns the wide form used when a span no longer fits 16 bits.
    ///
    /// `None` for opcodes that have no wide form, including the backpatch
    /// placeholders and opcodes that are already wide.
    #[must_use]
    pub fn widened(self) -> Option<Self> {
        Some(match self {
            Self::Goto => Self::GotoX,
            Self::IfEq => Self::IfEqX,
            Self::IfNe => Self::IfNeX,
            Self::Or => Self::OrX,
            Self::And => Self::AndX,
            Self::Gosub => Self::GosubX,
            Self::Case => Self::CaseX,
            Self::Default => Self::DefaultX,
            Self::TableSwitch => Self::TableSwitchX,
            Self::LookupSwitch => Self::LookupSwitchX,
            _ => return None,
        })
    }

    /// True for jump and switch opcodes that carry wide offsets.
    #[must_use]
    pub fn is_wide(self) -> bool {
        matches!(self.format().jump_len(), Some(JUMPX_OFFSET_LEN))
    }
}

/// Returns the length of the instruction starting at `pc`, decoding switch
/// tables as needed.
///
/// `None` if `pc` does not start a valid instruction inside `code`.
#[must_use]
pub fn instruction_length(code: &[u8], pc: usize) -> Option<usize> {
    let op = Opcode::from_repr(*code.get(pc)?)?;
    let spec = op.spec();
    if let Ok(length) = usize::try_from(spec.length) {
        return (pc + length <= code.len()).then_some(length);
    }
    let jump_len = spec.format.jump_len()?;
    let mut cursor = pc + 1 + jump_len;
    let length = if matches!(spec.format, OpFormat::TableSwitch | OpFormat::TableSwitchX) {
        if cursor + 2 * JUMP_OFFSET_LEN > code.len() {
            return None;
        }
        let low = i32::from(get_i16(code, cursor));
        let high = i32::from(get_i16(code, cursor + JUMP_OFFSET_LEN));
        cursor += 2 * JUMP_OFFSET_LEN;
        let count = usize::try_from(high - low + 1).unwrap_or(0);
        cursor + count * jump_len - pc
    } else {
        if cursor + INDEX_LEN > code.len() {
            return None;
        }
        let count = usize::from(get_u16(code, cursor));
        cursor += INDEX_LEN;
        cursor + count * (INDEX_LEN + jump_len) - pc
    };
    (pc + length <= code.len()).then_some(length)
}

/// Number of stack slots consumed by the instruction at `pc`.
#[must_use]
pub fn stack_uses(code: &[u8], pc: usize) -> u32 {
    let op = Opcode::from_repr(code[pc]).unwrap_or(Opcode::Nop);
    let spec = op.spec();
    if let Ok(uses) = u32::try_from(spec.uses) {
        return uses;
    }
    let operand = u32::from(get_u16(code, pc + 1));
    match op {
        // callee plus arguments
        Opcode::Call | Opcode::New => operand + 1,
        _ => operand,
    }
}
