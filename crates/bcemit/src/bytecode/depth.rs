//! Operand-stack depth model updated after every emitted instruction.

/// Running operand-stack depth and its high-water mark.
///
/// The depth is signed so that an instruction popping more than was pushed
/// can be reported as a warning; the depth then restarts from zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackDepth {
    depth: i32,
    max: u32,
}

/// Underflow observed while applying one instruction's effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Underflow {
    pub depth: i32,
}

impl StackDepth {
    pub fn depth(self) -> i32 {
        self.depth
    }

    pub fn max(self) -> u32 {
        self.max
    }

    /// Applies `uses` pops then `defs` pushes.
    ///
    /// `tmp_slots` raises the high-water mark above the pre-instruction depth
    /// without changing the depth itself.
    pub fn apply(&mut self, uses: u32, defs: u32, tmp_slots: u32) -> Option<Underflow> {
        if tmp_slots > 0 {
            self.raise_max(self.depth.saturating_add_unsigned(tmp_slots));
        }
        self.depth = self.depth.saturating_sub_unsigned(uses);
        let underflow = (self.depth < 0).then_some(Underflow { depth: self.depth });
        // one report per offending instruction; later code starts from empty
        self.depth = self.depth.max(0).saturating_add_unsigned(defs);
        self.raise_max(self.depth);
        underflow
    }

    /// Overrides the depth, used where control flow joins or a fixup sequence
    /// must not disturb the model.
    pub fn set(&mut self, depth: i32) {
        self.depth = depth;
        self.raise_max(depth);
    }

    fn raise_max(&mut self, depth: i32) {
        if let Ok(depth) = u32::try_from(depth) {
            self.max = self.max.max(depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_partial_sum_maximum() {
        let mut depth = StackDepth::default();
        for (uses, defs) in [(0, 1), (0, 1), (2, 1), (0, 1), (0, 1), (3, 0)] {
            assert_eq!(depth.apply(uses, defs, 0), None);
        }
        assert_eq!(depth.depth(), 0);
        assert_eq!(depth.max(), 3);
    }

    #[test]
    fn temporary_slots_only_raise_the_maximum() {
        let mut depth = StackDepth::default();
        depth.apply(0, 1, 0);
        depth.apply(1, 2, 1);
        assert_eq!(depth.depth(), 2);
        assert_eq!(depth.max(), 2);
        depth.apply(1, 1, 3);
        assert_eq!(depth.depth(), 2);
        assert_eq!(depth.max(), 5);
    }

    #[test]
    fn underflow_is_reported_once_and_depth_restarts_at_zero() {
        let mut depth = StackDepth::default();
        assert_eq!(depth.apply(1, 0, 0), Some(Underflow { depth: -1 }));
        assert_eq!(depth.depth(), 0);
        assert_eq!(depth.apply(0, 0, 0), None);
        assert_eq!(depth.apply(0, 2, 0), None);
        assert_eq!(depth.depth(), 2);
        assert_eq!(depth.max(), 2);
        // a pop of three from two reports the shortfall of that instruction alone
        assert_eq!(depth.apply(3, 1, 0), Some(Underflow { depth: -1 }));
        assert_eq!(depth.depth(), 1);
    }
}
