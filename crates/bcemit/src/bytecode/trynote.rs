//! Exception-region records.

use std::fmt;

use crate::error::{EmitError, EmitResult};

/// What the interpreter does when unwinding reaches a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TryNoteKind {
    /// Jump to the catch block.
    Catch,
    /// Run the finally subroutine.
    Finally,
    /// Close the for-in iterator left on the stack.
    Iter,
}

impl fmt::Display for TryNoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Catch => "catch",
            Self::Finally => "finally",
            Self::Iter => "iter",
        })
    }
}

/// One exception-handling region of the main section.
///
/// `start` is relative to the first byte of main code; `stack_depth` is the
/// operand-stack depth the interpreter unwinds to before handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TryNote {
    pub kind: TryNoteKind,
    pub stack_depth: u16,
    pub start: u32,
    pub length: u32,
}

impl TryNote {
    /// Offset one past the end of the region.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.start + self.length
    }
}

/// Try notes in the order their regions closed.
#[derive(Debug, Default, Clone)]
pub(crate) struct TryNotes {
    notes: Vec<TryNote>,
}

impl TryNotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: TryNoteKind, stack_depth: i32, start: usize, end: usize) -> EmitResult<()> {
        let stack_depth = u16::try_from(stack_depth).map_err(|_| EmitError::Internal("try note stack depth out of range"))?;
        if start > end {
            return Err(EmitError::Internal("try note ends before it starts"));
        }
        let too_large = |_| EmitError::StatementTooLarge { statement: "script" };
        let start = u32::try_from(start).map_err(too_large)?;
        let length = u32::try_from(end).map_err(too_large)? - start;
        self.notes.try_reserve(1)?;
        self.notes.push(TryNote {
            kind,
            stack_depth,
            start,
            length,
        });
        Ok(())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[TryNote] {
        &self.notes
    }

    pub fn as_mut_slice(&mut self) -> &mut [TryNote] {
        &mut self.notes
    }

    pub fn into_vec(self) -> Vec<TryNote> {
        self.notes
    }
}
