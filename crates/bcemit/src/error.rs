use std::{collections::TryReserveError, fmt};

/// Result type used by every fallible emitter operation.
pub type EmitResult<T> = Result<T, EmitError>;

/// Error returned when bytecode emission for a compilation unit fails.
///
/// Every variant is terminal for the unit being compiled: no partial output
/// is usable and the caller decides whether to try again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// Growing the code buffer, note buffer, span-dependency table or one of
    /// the emitter arenas failed.
    OutOfMemory,
    /// A jump span or note operand no longer fits even the widest encoding.
    ///
    /// `statement` names the innermost construct being emitted, or `"script"`.
    StatementTooLarge { statement: &'static str },
    /// The literal table would overflow its 16-bit index space.
    TooManyLiterals,
    /// The emitter nesting guard tripped before the native stack could.
    TooMuchRecursion { limit: usize, depth: usize },
    /// An emitter consistency check failed.
    Internal(&'static str),
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::StatementTooLarge { statement } => write!(f, "{statement} too large"),
            Self::TooManyLiterals => write!(f, "too many literals"),
            Self::TooMuchRecursion { limit, depth } => {
                write!(f, "too much recursion: depth {depth} exceeds limit {limit}")
            }
            Self::Internal(msg) => write!(f, "internal emitter error: {msg}"),
        }
    }
}

impl std::error::Error for EmitError {}

impl From<TryReserveError> for EmitError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<indexmap::TryReserveError> for EmitError {
    fn from(_: indexmap::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// A non-fatal diagnostic raised while emitting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EmitWarning {
    /// The modelled operand stack went negative after the instruction at `offset`.
    ///
    /// Compilation continues. The depth is reported as it stood right after
    /// the instruction's uses were subtracted; the model then restarts from
    /// an empty stack.
    StackUnderflow {
        filename: String,
        line: u32,
        offset: usize,
        depth: i32,
    },
}

impl fmt::Display for EmitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow {
                filename,
                line,
                offset,
                depth,
            } => write!(
                f,
                "{filename}:{line}: stack underflow at bytecode offset {offset} (depth {depth})"
            ),
        }
    }
}
