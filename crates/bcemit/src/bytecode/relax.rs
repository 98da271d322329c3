//! Jump widening: promotes narrow jumps whose spans outgrew 16 bits, moves
//! the code to make room and fixes up everything that records offsets.
//!
//! Promotion decisions are made on a side table of [`JumpSite`]s, one per
//! jump or switch opcode; the opcode bytes and immediates are written once,
//! after the final layout is known.

use tracing::{debug, trace};

use super::{
    builder::CodeGenerator,
    op::{JUMP_OFFSET_LEN, JUMPX_OFFSET_LEN, Opcode},
    span_deps::{SpanDep, SpanDeps, SpanTarget, offset_diff},
    srcnote::{SN_OPERAND_LIMIT, SrcNotes},
    trynote::TryNotes,
};
use crate::error::{EmitError, EmitResult};

/// Bytes a jump immediate grows by when widened.
const WIDTH_DELTA: usize = JUMPX_OFFSET_LEN - JUMP_OFFSET_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Narrow,
    Wide,
}

/// A jump or switch opcode together with its span-dependency records
/// `first..end`.
#[derive(Debug, Clone, Copy)]
struct JumpSite {
    top: usize,
    first: usize,
    end: usize,
    op: Opcode,
    width: Width,
}

impl JumpSite {
    /// Current offset of the opcode, given the site's records.
    fn pivot(&self, deps: &[SpanDep]) -> usize {
        let first = &deps[self.first];
        first.offset - (first.before - self.top)
    }
}

impl CodeGenerator {
    /// Widens every jump whose span no longer fits, then rewrites the jump
    /// immediates and shifts note and try-note offsets to match.
    ///
    /// Does nothing unless the span-dependency table was built since the
    /// last call.
    pub fn resolve_span_deps(&mut self) -> EmitResult<()> {
        if !self.spans.is_active() {
            return Ok(());
        }
        let too_large = self.statement_too_large();
        let old_len = self.main.code.len();

        let mut sites = collect_sites(&self.spans, self.main.code.as_slice())?;
        let (growth, passes) = widen(&mut self.spans, &mut sites, &too_large)?;
        self.relocate(&sites, old_len, growth, &too_large)?;

        if growth > 0 {
            let guard = SpanDep {
                top: old_len,
                before: old_len,
                offset: old_len + growth,
                target: SpanTarget::Unset,
            };
            let fixed = fix_notes(&self.spans, &guard, &mut self.main.notes, &too_large)?;
            self.main.last_note_offset += fixed;
            fix_try_notes(&self.spans, &guard, &mut self.try_notes, &too_large)?;
        }

        debug!(
            filename = %self.filename(),
            jumps = self.spans.len(),
            extended = growth / WIDTH_DELTA,
            passes,
            length = old_len + growth,
            growth,
            "resolved span dependencies"
        );
        self.spans.reset(self.main.code.len());
        Ok(())
    }

    /// Moves code between widened immediates to its final position and
    /// writes every opcode and offset.
    fn relocate(&mut self, sites: &[JumpSite], old_len: usize, growth: usize, too_large: &EmitError) -> EmitResult<()> {
        let spans = &self.spans;
        let code = &mut self.main.code;
        code.grow_to(old_len + growth)?;

        // walk backward so every chunk moves before anything lands on it
        let mut cursor = old_len;
        for site in sites.iter().rev().filter(|site| site.width == Width::Wide) {
            for dep in spans.deps[site.first..site.end].iter().rev() {
                let from = dep.before + JUMP_OFFSET_LEN;
                code.copy_within(from..cursor, dep.offset + JUMPX_OFFSET_LEN);
                cursor = dep.before;
            }
        }

        for site in sites {
            let pivot = site.pivot(&spans.deps);
            code.set_byte(pivot, site.op as u8);
            for dep in &spans.deps[site.first..site.end] {
                let span = spans.span(dep, pivot)?;
                match site.width {
                    Width::Narrow => {
                        let span = i16::try_from(span).map_err(|_| EmitError::Internal("narrow jump span out of range"))?;
                        code.write_i16(dep.offset, span);
                    }
                    Width::Wide => {
                        let span = i32::try_from(span).map_err(|_| too_large.clone())?;
                        code.write_i32(dep.offset, span);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Groups consecutive records that share an opcode.
fn collect_sites(spans: &SpanDeps, code: &[u8]) -> EmitResult<Vec<JumpSite>> {
    let deps = &spans.deps;
    let mut sites = Vec::new();
    let mut first = 0;
    while first < deps.len() {
        let top = deps[first].top;
        let end = deps[first..].iter().position(|dep| dep.top != top).map_or(deps.len(), |n| first + n);
        let op = Opcode::from_repr(code[top]).ok_or(EmitError::Internal("span dependency on an unknown opcode"))?;
        sites.try_reserve(1)?;
        sites.push(JumpSite {
            top,
            first,
            end,
            op,
            width: if op.is_wide() { Width::Wide } else { Width::Narrow },
        });
        first = end;
    }
    Ok(sites)
}

/// Promotes sites until every narrow span fits, returning the total growth
/// and the number of passes.
///
/// Widening one jump can push another out of range, so this repeats until a
/// pass changes nothing. Promotion is one-way, which bounds the number of
/// passes by the number of sites.
fn widen(spans: &mut SpanDeps, sites: &mut [JumpSite], too_large: &EmitError) -> EmitResult<(usize, usize)> {
    let mut growth = 0;
    let mut passes = 0;
    loop {
        passes += 1;
        let mut delta = 0;
        let mut done = true;
        for site in sites.iter_mut() {
            for dep in &mut spans.deps[site.first..site.end] {
                dep.offset += delta;
            }
            if site.width == Width::Wide {
                continue;
            }

            let pivot = site.pivot(&spans.deps);
            let mut overflow = false;
            for dep in &spans.deps[site.first..site.end] {
                if i16::try_from(spans.span(dep, pivot)?).is_err() {
                    overflow = true;
                    break;
                }
            }
            if !overflow {
                continue;
            }

            let wide = site.op.widened().ok_or_else(|| too_large.clone())?;
            trace!(top = site.top, from = %site.op, to = %wide, "widening jump");
            site.op = wide;
            site.width = Width::Wide;
            done = false;
            let SpanDeps { deps, targets, .. } = &mut *spans;
            for (k, dep) in deps[site.first..site.end].iter_mut().enumerate() {
                dep.offset += k * WIDTH_DELTA;
                targets.shift_above(dep.offset, WIDTH_DELTA);
                delta += WIDTH_DELTA;
            }
        }
        growth += delta;
        if done {
            return Ok((growth, passes));
        }
    }
}

fn dep_or_guard<'a>(spans: &'a SpanDeps, index: usize, guard: &'a SpanDep) -> &'a SpanDep {
    spans.deps.get(index).unwrap_or(guard)
}

/// Adds the growth in front of each main note to its delta and rewrites
/// operands that measure code distances. Returns the total growth applied.
fn fix_notes(spans: &SpanDeps, guard: &SpanDep, notes: &mut SrcNotes, too_large: &EmitError) -> EmitResult<usize> {
    let deps = &spans.deps;
    let mut offset = 0;
    let mut growth = 0;
    let mut sd = 0;
    let mut index = 0;
    while index < notes.len() {
        offset += notes.delta(index);
        while sd < deps.len() && deps[sd].before < offset {
            // the next record's displacement tells how much this one's
            // instruction grew
            let next = dep_or_guard(spans, sd + 1, guard);
            let delta = next.moved() - growth;
            if delta > 0 {
                index = notes.add_to_delta(index, delta)?;
                growth += delta;
            }
            sd += 1;
        }

        let ty = notes.note_type(index).ok_or(EmitError::Internal("unknown source note type"))?;
        let spec = ty.spec();
        if spec.span_dir != 0 {
            let pivot = offset + spec.offset_bias;
            for which in 0..spec.arity {
                let span = notes.get_offset(index, which);
                if span == 0 {
                    continue;
                }
                let target = if spec.span_dir > 0 {
                    pivot + span
                } else {
                    pivot.checked_sub(span).ok_or(EmitError::Internal("source note spans before the script"))?
                };
                let lo = if target >= pivot { sd } else { 0 };
                let near = dep_or_guard(spans, spans.nearest(target, lo), guard);
                let target = target + near.moved();
                let span = offset_diff(target, pivot + growth) * spec.span_dir;
                let span = usize::try_from(span).map_err(|_| EmitError::Internal("source note span changed direction"))?;
                if span >= SN_OPERAND_LIMIT {
                    return Err(too_large.clone());
                }
                notes.set_offset(index, which, span)?;
            }
        }
        index += notes.note_len(index);
    }
    Ok(growth)
}

/// Shifts each try region's start and length by the growth in front of and
/// inside it.
fn fix_try_notes(spans: &SpanDeps, guard: &SpanDep, try_notes: &mut TryNotes, too_large: &EmitError) -> EmitResult<()> {
    for note in try_notes.as_mut_slice() {
        let start = note.start as usize;
        let length = note.length as usize;
        let sd = spans.nearest(start, 0);
        let delta = dep_or_guard(spans, sd, guard).moved();
        note.start = u32::try_from(start + delta).map_err(|_| too_large.clone())?;

        let sd2 = spans.nearest(start + length, sd);
        if sd2 != sd {
            let grown = dep_or_guard(spans, sd2, guard).moved() - delta;
            note.length = u32::try_from(length + grown).map_err(|_| too_large.clone())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bytecode::{srcnote::SrcNoteType, trynote::TryNoteKind},
        limits::EmitLimits,
    };

    fn generator() -> CodeGenerator {
        CodeGenerator::new("relax.js", 1, EmitLimits::new())
    }

    fn nops(cg: &mut CodeGenerator, count: usize) {
        for _ in 0..count {
            cg.emit(Opcode::Nop).unwrap();
        }
    }

    #[test]
    fn far_forward_branch_is_widened_in_place() {
        let mut cg = generator();
        cg.emit(Opcode::True).unwrap();
        let branch = cg.begin_jump(Opcode::IfEq).unwrap();
        nops(&mut cg, 40_000);
        cg.patch_jump_here(branch).unwrap();
        cg.emit(Opcode::Stop).unwrap();
        cg.resolve_span_deps().unwrap();

        let code = cg.code();
        assert_eq!(code.len(), 1 + 5 + 40_000 + 1);
        assert_eq!(code[1], Opcode::IfEqX as u8);
        assert_eq!(crate::bytecode::buffer::get_i32(code, 2), 40_005);
        assert_eq!(code[1 + 40_005], Opcode::Stop as u8);
        assert!(!cg.span_deps_active());
    }

    #[test]
    fn resolving_twice_is_a_no_op() {
        let mut cg = generator();
        let jump = cg.begin_jump(Opcode::Goto).unwrap();
        nops(&mut cg, 33_000);
        cg.patch_jump_here(jump).unwrap();
        cg.resolve_span_deps().unwrap();
        let once = cg.code().to_vec();
        cg.resolve_span_deps().unwrap();
        assert_eq!(cg.code(), once.as_slice());
    }

    #[test]
    fn widening_cascades_to_a_jump_pushed_out_of_range() {
        let mut cg = generator();
        // `inner` spans exactly i16::MAX until `outer` grows inside it
        let inner = cg.begin_jump(Opcode::Goto).unwrap();
        cg.emit(Opcode::True).unwrap();
        let outer = cg.begin_jump(Opcode::IfEq).unwrap();
        nops(&mut cg, 40_000);
        cg.patch_jump_here(outer).unwrap();
        let target = inner.offset() + 32_767;
        let here = cg.offset();
        cg.set_jump_offset(inner.offset(), 32_767).unwrap();
        assert!(target < here);
        cg.resolve_span_deps().unwrap();

        let code = cg.code();
        assert_eq!(code[0], Opcode::GotoX as u8);
        assert_eq!(crate::bytecode::buffer::get_i32(code, 1), 32_767 + 2 + 2);
        assert_eq!(code[6], Opcode::IfEqX as u8);
    }

    #[test]
    fn notes_and_try_regions_follow_the_growth() {
        let mut cg = generator();
        let try_start = cg.offset();
        cg.emit(Opcode::True).unwrap();
        cg.new_src_note(SrcNoteType::Hidden).unwrap();
        let branch = cg.begin_jump(Opcode::IfEq).unwrap();
        nops(&mut cg, 40_000);
        cg.patch_jump_here(branch).unwrap();
        let after = cg.offset();
        cg.new_src_note(SrcNoteType::Hidden).unwrap();
        cg.emit(Opcode::Nop).unwrap();
        let try_end = cg.offset();
        cg.record_try_region_at_depth(TryNoteKind::Catch, 0, try_start, try_end).unwrap();
        cg.resolve_span_deps().unwrap();

        let mut at = 0;
        let mut seen = Vec::new();
        for note in cg.main.notes.iter() {
            at += note.delta;
            if note.ty == SrcNoteType::Hidden {
                seen.push(at);
            }
        }
        assert_eq!(seen, vec![1, after + 2]);
        assert_eq!(cg.main.last_note_offset, after + 2);

        let region = cg.try_notes.as_slice()[0];
        assert_eq!((region.start, region.length), (0, u32::try_from(try_end + 2).unwrap()));
    }
}
