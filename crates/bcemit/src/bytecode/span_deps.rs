//! Span dependencies: one record per jump-offset immediate in main code.
//!
//! The table is built lazily, the first time a jump offset does not fit the
//! narrow encoding or a backpatch delta needs more room than the immediate
//! offers. From then on each jump immediate holds the index of its record
//! rather than an offset, and the record says where the jump goes: a node in
//! the [`JumpTargets`] tree once the target is known, or the delta to the
//! previous link of a pending backpatch chain. The widening pass in `relax`
//! consumes the table and writes real offsets back.

use tracing::debug;

use super::{
    builder::{CodeGenerator, SectionKind},
    jump_targets::{JumpTargets, TargetId},
    op::{INDEX_LEN, JUMP_OFFSET_LEN, JUMP_OFFSET_MAX, JUMP_OFFSET_MIN, JUMPX_OFFSET_MAX, JUMPX_OFFSET_MIN, OpFormat, Opcode, instruction_length},
};
use crate::error::{EmitError, EmitResult};

/// Largest table index stored directly in an immediate.
pub(super) const SPANDEP_INDEX_MAX: usize = 0xfffe;
/// Immediate marker for records found by binary search instead.
pub(super) const SPANDEP_INDEX_HUGE: u16 = 0xffff;
/// Largest backpatch delta a record can carry.
pub(super) const BPDELTA_MAX: isize = i32::MAX as isize;

/// Where a span dependency's jump goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SpanTarget {
    /// Not known yet; the offset will be set directly.
    Unset,
    Target(TargetId),
    /// Link in a pending backpatch chain, holding the distance back to the
    /// previous link.
    Backpatch(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct SpanDep {
    /// Offset of the owning opcode before widening. Switches own several
    /// consecutive records with the same `top`.
    pub top: usize,
    /// Offset of the immediate before widening.
    pub before: usize,
    /// Offset of the immediate as widening moves it.
    pub offset: usize,
    pub target: SpanTarget,
}

impl SpanDep {
    /// Bytes this record's immediate has moved so far.
    pub fn moved(&self) -> usize {
        self.offset - self.before
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct SpanDeps {
    pub deps: Vec<SpanDep>,
    pub targets: JumpTargets,
    /// Set from the first table build until the widening pass has run.
    pub active: bool,
    /// Main-code offset where the next table build starts scanning.
    pub todo: usize,
}

impl SpanDeps {
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Index of the first record at or above `offset`, searching from `lo`.
    ///
    /// Returns `len()` when every record lies below `offset`; callers treat
    /// that position as an end-of-code guard.
    pub fn nearest(&self, offset: usize, lo: usize) -> usize {
        let lo = lo.min(self.deps.len());
        lo + self.deps[lo..].partition_point(|dep| dep.before < offset)
    }

    /// Resolved jump span measured from `pivot`, the current offset of the
    /// owning opcode.
    pub fn span(&self, dep: &SpanDep, pivot: usize) -> EmitResult<isize> {
        match dep.target {
            SpanTarget::Unset => Ok(0),
            SpanTarget::Target(id) => Ok(offset_diff(self.targets.offset(id), pivot)),
            SpanTarget::Backpatch(_) => Err(EmitError::Internal("unresolved jump")),
        }
    }

    /// Drops every record and target, ready for the next top-level statement.
    pub fn reset(&mut self, todo: usize) {
        self.deps.clear();
        self.targets.clear();
        self.active = false;
        self.todo = todo;
    }
}

/// `to - from` as a signed span; offsets never exceed `isize::MAX`.
pub(super) fn offset_diff(to: usize, from: usize) -> isize {
    to.cast_signed() - from.cast_signed()
}

impl CodeGenerator {
    /// Whether the span-dependency table is live.
    #[must_use]
    pub fn span_deps_active(&self) -> bool {
        self.spans.is_active()
    }

    /// Emits a jump whose offset, relative to the jump itself, is `off`.
    ///
    /// An offset outside the narrow range builds the span-dependency table
    /// so the widening pass can give the jump a wide form later.
    pub fn emit_jump(&mut self, op: Opcode, off: isize) -> EmitResult<usize> {
        if self.current_section() != SectionKind::Main {
            return Err(EmitError::Internal("jumps are only emitted into main code"));
        }
        let extend = !(JUMP_OFFSET_MIN..=JUMP_OFFSET_MAX).contains(&off);
        if extend && !self.spans.active {
            self.build_span_dep_table()?;
        }
        // an oversized offset is recorded in the table instead
        let narrow = i16::try_from(off).unwrap_or(0);
        let pc = self.emit_u16(op, u16::from_le_bytes(narrow.to_le_bytes()))?;
        if extend || self.spans.active {
            self.add_span_dep(pc, pc + 1, off)?;
        }
        Ok(pc)
    }

    /// Offset of the jump at `pc`: its span once resolved, or its link delta
    /// while it sits on a backpatch chain.
    pub fn jump_offset(&self, pc: usize) -> EmitResult<isize> {
        self.jump_offset_at(pc + 1)
    }

    /// Points the jump at `pc` at `pc + off`.
    pub fn set_jump_offset(&mut self, pc: usize, off: isize) -> EmitResult<()> {
        self.set_jump_offset_at(pc + 1, off)
    }

    /// Stores `delta` as the chain link of the pending jump at `pc`.
    pub fn set_backpatch_delta(&mut self, pc: usize, delta: isize) -> EmitResult<()> {
        let imm = pc + 1;
        if !self.spans.active && delta < JUMP_OFFSET_MAX {
            let delta = i16::try_from(delta).map_err(|_| EmitError::Internal("negative backpatch delta"))?;
            self.main_section_mut().code.write_i16(imm, delta);
            return Ok(());
        }
        if delta > BPDELTA_MAX {
            return Err(self.statement_too_large());
        }
        if !self.spans.active {
            self.build_span_dep_table()?;
        }
        let index = self.span_dep_index(imm)?;
        let delta = usize::try_from(delta).map_err(|_| EmitError::Internal("negative backpatch delta"))?;
        self.spans.deps[index].target = SpanTarget::Backpatch(delta);
        Ok(())
    }

    /// Reads the offset held by the jump immediate at `imm`.
    pub(super) fn jump_offset_at(&self, imm: usize) -> EmitResult<isize> {
        if !self.spans.active {
            return Ok(isize::from(self.main_section().code.read_i16(imm)));
        }
        let dep = self.spans.deps[self.span_dep_index(imm)?];
        Ok(match dep.target {
            SpanTarget::Unset => 0,
            SpanTarget::Backpatch(delta) => delta.cast_signed(),
            // the table only lives during emission, so `top` is still current
            SpanTarget::Target(id) => offset_diff(self.spans.targets.offset(id), dep.top),
        })
    }

    /// Sets the jump immediate at `imm` to `off`, relative to its opcode.
    pub(super) fn set_jump_offset_at(&mut self, imm: usize, off: isize) -> EmitResult<()> {
        if !self.spans.active {
            if let Ok(off) = i16::try_from(off) {
                self.main_section_mut().code.write_i16(imm, off);
                return Ok(());
            }
            self.build_span_dep_table()?;
        }
        let index = self.span_dep_index(imm)?;
        self.set_span_dep_target(index, off)
    }

    /// Scans main code emitted since the last resolution and records every
    /// jump and switch immediate.
    pub(super) fn build_span_dep_table(&mut self) -> EmitResult<()> {
        self.spans.active = true;
        let mut pc = self.spans.todo;
        let end = self.main_section().code.len();
        while pc < end {
            let code = self.main_section().code.as_slice();
            let op = Opcode::from_repr(code[pc]).ok_or(EmitError::Internal("unknown opcode in span-dependency scan"))?;
            match op.format() {
                OpFormat::Jump => {
                    let off = isize::from(self.main_section().code.read_i16(pc + 1));
                    self.add_span_dep(pc, pc + 1, off)?;
                    pc += 1 + JUMP_OFFSET_LEN;
                }
                OpFormat::TableSwitch | OpFormat::LookupSwitch => pc = self.add_switch_span_deps(pc)?,
                _ => pc += instruction_length(code, pc).ok_or(EmitError::Internal("truncated instruction in span-dependency scan"))?,
            }
        }
        debug!(
            filename = %self.filename(),
            from = self.spans.todo,
            to = end,
            deps = self.spans.len(),
            targets = self.spans.targets.len(),
            "built span-dependency table"
        );
        Ok(())
    }

    /// Records the default and case immediates of the switch at `top`,
    /// returning the offset just past the switch.
    pub(super) fn add_switch_span_deps(&mut self, top: usize) -> EmitResult<usize> {
        let code = &self.main_section().code;
        let op = Opcode::from_repr(code.byte(top)).ok_or(EmitError::Internal("unknown switch opcode"))?;
        let mut imm = top + 1;
        let off = isize::from(code.read_i16(imm));
        self.add_span_dep(top, imm, off)?;
        imm += JUMP_OFFSET_LEN;

        let code = &self.main_section().code;
        let (count, index_len) = if op.format() == OpFormat::TableSwitch {
            let low = i32::from(code.read_i16(imm));
            let high = i32::from(code.read_i16(imm + JUMP_OFFSET_LEN));
            imm += 2 * JUMP_OFFSET_LEN;
            (usize::try_from(high - low + 1).unwrap_or(0), 0)
        } else {
            let npairs = usize::from(code.read_u16(imm));
            imm += INDEX_LEN;
            (npairs, INDEX_LEN)
        };
        for _ in 0..count {
            imm += index_len;
            let off = isize::from(self.main_section().code.read_i16(imm));
            self.add_span_dep(top, imm, off)?;
            imm += JUMP_OFFSET_LEN;
        }
        Ok(imm)
    }

    fn add_span_dep(&mut self, top: usize, imm: usize, off: isize) -> EmitResult<()> {
        let index = self.spans.deps.len();
        self.spans.deps.try_reserve(1)?;
        self.spans.deps.push(SpanDep {
            top,
            before: imm,
            offset: imm,
            target: SpanTarget::Unset,
        });

        let op = Opcode::from_repr(self.main_section().code.byte(top)).ok_or(EmitError::Internal("unknown jump opcode"))?;
        if op.spec().backpatch {
            if off > BPDELTA_MAX {
                return Err(self.statement_too_large());
            }
            let delta = usize::try_from(off).map_err(|_| EmitError::Internal("negative backpatch delta"))?;
            self.spans.deps[index].target = SpanTarget::Backpatch(delta);
        } else if off != 0 {
            self.set_span_dep_target(index, off)?;
        }

        let marker = if index > SPANDEP_INDEX_MAX {
            SPANDEP_INDEX_HUGE
        } else {
            u16::try_from(index).unwrap_or(SPANDEP_INDEX_HUGE)
        };
        self.main_section_mut().code.write_u16(imm, marker);
        Ok(())
    }

    fn set_span_dep_target(&mut self, index: usize, off: isize) -> EmitResult<()> {
        if !(JUMPX_OFFSET_MIN..=JUMPX_OFFSET_MAX).contains(&off) {
            return Err(self.statement_too_large());
        }
        let top = self.spans.deps[index].top;
        let target = top.checked_add_signed(off).ok_or_else(|| self.statement_too_large())?;
        let id = self.spans.targets.insert(target)?;
        self.spans.deps[index].target = SpanTarget::Target(id);
        Ok(())
    }

    /// Finds the record for the immediate at `imm`.
    fn span_dep_index(&self, imm: usize) -> EmitResult<usize> {
        let marker = self.main_section().code.read_u16(imm);
        let index = if marker == SPANDEP_INDEX_HUGE {
            self.spans.deps.binary_search_by_key(&imm, |dep| dep.before).ok()
        } else {
            Some(usize::from(marker))
        };
        index
            .filter(|&index| self.spans.deps.get(index).is_some_and(|dep| dep.before == imm))
            .ok_or(EmitError::Internal("no span dependency for jump"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::EmitLimits;

    fn generator() -> CodeGenerator {
        CodeGenerator::new("spans.js", 1, EmitLimits::new())
    }

    fn nops(cg: &mut CodeGenerator, count: usize) {
        for _ in 0..count {
            cg.emit(Opcode::Nop).unwrap();
        }
    }

    #[test]
    fn narrow_jumps_do_not_build_the_table() {
        let mut cg = generator();
        let jump = cg.begin_jump(Opcode::Goto).unwrap();
        nops(&mut cg, 10);
        cg.patch_jump_here(jump).unwrap();
        assert!(!cg.span_deps_active());
        assert_eq!(cg.jump_offset(jump.offset()).unwrap(), 13);
    }

    #[test]
    fn oversized_offset_builds_the_table_from_earlier_code() {
        let mut cg = generator();
        cg.emit(Opcode::True).unwrap();
        let early = cg.begin_jump(Opcode::IfEq).unwrap();
        cg.emit(Opcode::Nop).unwrap();
        cg.patch_jump_here(early).unwrap();
        assert!(!cg.span_deps_active());

        let far = cg.emit_jump(Opcode::Goto, 40_000).unwrap();
        assert!(cg.span_deps_active());
        assert_eq!(cg.spans.len(), 2);
        // immediates now hold table indexes
        assert_eq!(cg.main_section().code.read_u16(early.offset() + 1), 0);
        assert_eq!(cg.main_section().code.read_u16(far + 1), 1);
        assert_eq!(cg.jump_offset(early.offset()).unwrap(), 4);
        assert_eq!(cg.jump_offset(far).unwrap(), 40_000);
        assert_eq!(cg.spans.targets.offsets(), vec![5, far + 40_000]);
    }

    #[test]
    fn backpatch_deltas_live_in_the_table_once_active() {
        let mut cg = generator();
        cg.emit_jump(Opcode::Goto, 50_000).unwrap();
        let first = cg.emit_backpatch_op(Opcode::Backpatch, None).unwrap();
        nops(&mut cg, 2);
        let second = cg.emit_backpatch_op(Opcode::Backpatch, Some(first)).unwrap();
        assert_eq!(cg.jump_offset(first).unwrap(), (first + 1).cast_signed());
        assert_eq!(cg.jump_offset(second).unwrap(), 5);
        cg.set_backpatch_delta(second, 70_000).unwrap();
        assert_eq!(cg.jump_offset(second).unwrap(), 70_000);
    }

    #[test]
    fn backpatch_delta_past_the_limit_is_too_large() {
        let mut cg = generator();
        let pc = cg.emit_backpatch_op(Opcode::Backpatch, None).unwrap();
        assert_eq!(
            cg.set_backpatch_delta(pc, BPDELTA_MAX + 1),
            Err(EmitError::StatementTooLarge { statement: "script" })
        );
    }

    #[test]
    fn huge_tables_fall_back_to_binary_search() {
        let mut cg = generator();
        cg.emit_jump(Opcode::Goto, 100_000).unwrap();
        let mut last = 0;
        for _ in 0..=SPANDEP_INDEX_MAX {
            last = cg.emit_jump(Opcode::Goto, -1).unwrap();
        }
        assert_eq!(cg.main_section().code.read_u16(last + 1), SPANDEP_INDEX_HUGE);
        assert_eq!(cg.jump_offset(last).unwrap(), -1);
        cg.set_jump_offset(last, -2).unwrap();
        assert_eq!(cg.jump_offset(last).unwrap(), -2);
    }

    #[test]
    fn jumps_into_the_prolog_are_rejected() {
        let mut cg = generator();
        cg.switch_to_prolog();
        assert!(matches!(cg.emit_jump(Opcode::Goto, 3), Err(EmitError::Internal(_))));
    }

    #[test]
    fn nearest_returns_the_guard_position_past_the_end() {
        let mut spans = SpanDeps::default();
        for before in [4, 9, 20] {
            spans.deps.push(SpanDep {
                top: before - 1,
                before,
                offset: before,
                target: SpanTarget::Unset,
            });
        }
        assert_eq!(spans.nearest(0, 0), 0);
        assert_eq!(spans.nearest(9, 0), 1);
        assert_eq!(spans.nearest(10, 0), 2);
        assert_eq!(spans.nearest(10, 3), 3);
        assert_eq!(spans.nearest(21, 0), 3);
    }
}
