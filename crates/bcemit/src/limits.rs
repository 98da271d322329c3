use crate::error::{EmitError, EmitResult};

/// Recommended maximum emitter nesting depth if not otherwise specified.
///
/// Each nested syntax form costs one level, and nested function literals
/// continue counting from their parent.
#[cfg(not(debug_assertions))]
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// In debug builds stack frames are much larger, so the default is lower.
#[cfg(debug_assertions)]
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 200;

/// Literal indexes are encoded as u16 immediates.
pub const MAX_LITERALS: usize = 1 << 16;

/// Limits applied while emitting one compilation unit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmitLimits {
    /// Maximum emitter nesting depth. `None` selects [`DEFAULT_MAX_RECURSION_DEPTH`].
    pub max_recursion_depth: Option<usize>,
    /// Maximum number of distinct literals (names, strings, non-immediate numbers).
    pub max_literals: usize,
}

impl Default for EmitLimits {
    fn default() -> Self {
        Self {
            max_recursion_depth: None,
            max_literals: MAX_LITERALS,
        }
    }
}

impl EmitLimits {
    /// Creates limits with the default recursion depth and the full literal index range.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum emitter nesting depth.
    #[must_use]
    pub fn max_recursion_depth(mut self, limit: Option<usize>) -> Self {
        self.max_recursion_depth = limit;
        self
    }

    /// Sets the maximum number of literals, clamped to the u16 index range.
    #[must_use]
    pub fn max_literals(mut self, limit: usize) -> Self {
        self.max_literals = limit.min(MAX_LITERALS);
        self
    }

    /// Returns an error if entering one more level would exceed the recursion limit.
    pub(crate) fn check_recursion_depth(&self, current_depth: usize) -> EmitResult<()> {
        let limit = self.max_recursion_depth.unwrap_or(DEFAULT_MAX_RECURSION_DEPTH);
        if current_depth >= limit {
            Err(EmitError::TooMuchRecursion {
                limit,
                depth: current_depth + 1,
            })
        } else {
            Ok(())
        }
    }
}
