//! Code generator state for one compilation unit.
//!
//! `CodeGenerator` owns everything emission needs: the prolog and main code
//! sections with their source notes, the stack-depth model, the span-dependency
//! table, try notes, the statement stack and the literal table. The AST walker
//! in `compiler` drives it; the span-dependency operations live in
//! `span_deps` and the widening pass in `relax`.

use tracing::warn;

use super::{
    buffer::Bytecode,
    code::Script,
    depth::{StackDepth, Underflow},
    op::{Opcode, stack_uses},
    span_deps::SpanDeps,
    srcnote::{SN_OPERAND_LIMIT, SN_XDELTA_MASK, SrcNoteType, SrcNotes},
    stmt::{BlockScope, Chain, StmtKind, StmtStack},
    trynote::{TryNoteKind, TryNotes},
};
use crate::{
    atoms::{AtomList, Literal},
    error::{EmitError, EmitResult, EmitWarning},
    limits::EmitLimits,
};

/// Largest line number a `setline` note can carry.
const MAX_LINE: usize = SN_OPERAND_LIMIT - 1;

/// Code and notes for one of the two sections of a script.
#[derive(Debug, Default, Clone)]
pub(crate) struct Section {
    pub code: Bytecode,
    pub notes: SrcNotes,
    /// Code offset annotated by the most recent note.
    pub last_note_offset: usize,
    pub current_line: u32,
}

impl Section {
    fn new(line: u32) -> Self {
        Self {
            current_line: line,
            ..Self::default()
        }
    }
}

/// Which section instructions are currently appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Declarations hoisted ahead of the body.
    Prolog,
    Main,
}

/// Label for a forward jump that needs patching.
///
/// Stores the bytecode offset where the jump instruction was emitted.
/// Pass this to `patch_jump_here()` once the target location is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpLabel(usize);

impl JumpLabel {
    /// Offset of the jump instruction.
    #[must_use]
    pub fn offset(self) -> usize {
        self.0
    }
}

/// Emitter context for one script or function body.
///
/// Nested function literals get a child generator from [`CodeGenerator::child`],
/// which shares the filename, limits and recursion budget but none of the
/// code state.
#[derive(Debug)]
pub struct CodeGenerator {
    filename: String,
    limits: EmitLimits,
    first_line: u32,

    prolog: Section,
    pub(super) main: Section,
    current: SectionKind,

    depth: StackDepth,
    pub(super) spans: SpanDeps,
    pub(super) try_notes: TryNotes,
    pub(super) stmts: StmtStack,
    atoms: AtomList,
    functions: Vec<Script>,

    /// Current emitter nesting level, counted from `level_base`.
    level: usize,
    /// Nesting level of the parent context when this one was created.
    level_base: usize,
    warnings: Vec<EmitWarning>,
}

impl CodeGenerator {
    /// Creates a generator for a top-level unit starting at `first_line`.
    #[must_use]
    pub fn new(filename: &str, first_line: u32, limits: EmitLimits) -> Self {
        let atoms = AtomList::new(limits.max_literals);
        Self {
            filename: filename.to_owned(),
            limits,
            first_line,
            prolog: Section::new(first_line),
            main: Section::new(first_line),
            current: SectionKind::Main,
            depth: StackDepth::default(),
            spans: SpanDeps::default(),
            try_notes: TryNotes::new(),
            stmts: StmtStack::new(),
            atoms,
            functions: Vec::new(),
            level: 0,
            level_base: 0,
            warnings: Vec::new(),
        }
    }

    /// Creates the generator for a function literal nested in this one.
    ///
    /// The child continues counting nesting levels from the parent's current
    /// level, so deeply nested functions hit the same recursion limit as
    /// deeply nested expressions.
    #[must_use]
    pub fn child(&self, first_line: u32) -> Self {
        let mut child = Self::new(&self.filename, first_line, self.limits.clone());
        child.level_base = self.level_base + self.level;
        child
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Runs `f` one nesting level deeper, failing cleanly once the configured
    /// recursion limit is reached.
    pub fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> EmitResult<T>) -> EmitResult<T> {
        self.enter_level()?;
        let result = f(self);
        self.exit_level();
        result
    }

    /// Enters one nesting level; pair with [`CodeGenerator::exit_level`].
    pub fn enter_level(&mut self) -> EmitResult<()> {
        self.limits.check_recursion_depth(self.level_base + self.level)?;
        self.level += 1;
        Ok(())
    }

    pub fn exit_level(&mut self) {
        self.level = self.level.saturating_sub(1);
    }

    /// Total nesting level including enclosing function contexts.
    #[must_use]
    pub fn nesting_level(&self) -> usize {
        self.level_base + self.level
    }

    // --- sections ---

    pub(super) fn section(&self) -> &Section {
        match self.current {
            SectionKind::Prolog => &self.prolog,
            SectionKind::Main => &self.main,
        }
    }

    pub(super) fn section_mut(&mut self) -> &mut Section {
        match self.current {
            SectionKind::Prolog => &mut self.prolog,
            SectionKind::Main => &mut self.main,
        }
    }

    pub(super) fn main_section(&self) -> &Section {
        &self.main
    }

    pub(super) fn main_section_mut(&mut self) -> &mut Section {
        &mut self.main
    }

    #[must_use]
    pub fn current_section(&self) -> SectionKind {
        self.current
    }

    pub fn switch_to_prolog(&mut self) {
        self.current = SectionKind::Prolog;
    }

    pub fn switch_to_main(&mut self) {
        self.current = SectionKind::Main;
    }

    /// Offset of the next instruction in the current section.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.section().code.len()
    }

    /// Code emitted so far into the current section.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        self.section().code.as_slice()
    }

    // --- stack depth ---

    #[must_use]
    pub fn stack_depth(&self) -> i32 {
        self.depth.depth()
    }

    #[must_use]
    pub fn max_stack_depth(&self) -> u32 {
        self.depth.max()
    }

    /// Overrides the modelled depth where control flow joins.
    pub fn set_stack_depth(&mut self, depth: i32) {
        self.depth.set(depth);
    }

    #[must_use]
    pub fn warnings(&self) -> &[EmitWarning] {
        &self.warnings
    }

    /// Applies the stack effect of the instruction at `pc`.
    ///
    /// `block_count` supplies the push count for opcodes whose definitions
    /// are not encoded in the instruction.
    fn update_depth(&mut self, op: Opcode, pc: usize, block_count: Option<u32>) {
        let spec = op.spec();
        let uses = stack_uses(self.code(), pc);
        let defs = u32::try_from(spec.defs).unwrap_or_else(|_| block_count.unwrap_or(0));
        if let Some(Underflow { depth }) = self.depth.apply(uses, defs, u32::from(spec.tmp_slots)) {
            let line = self.section().current_line;
            warn!(filename = %self.filename, line, offset = pc, depth, "stack underflow");
            self.warnings.push(EmitWarning::StackUnderflow {
                filename: self.filename.clone(),
                line,
                offset: pc,
                depth,
            });
        }
    }

    // --- instruction emission ---

    fn emit_bytes(&mut self, op: Opcode, bytes: &[u8]) -> EmitResult<usize> {
        let pc = self.section_mut().code.push(bytes)?;
        self.update_depth(op, pc, None);
        Ok(pc)
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) -> EmitResult<usize> {
        self.emit_bytes(op, &[op as u8])
    }

    /// Emits an instruction with a u8 operand.
    pub fn emit_u8(&mut self, op: Opcode, operand: u8) -> EmitResult<usize> {
        self.emit_bytes(op, &[op as u8, operand])
    }

    /// Emits an instruction with a u16 operand.
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) -> EmitResult<usize> {
        let [lo, hi] = operand.to_le_bytes();
        self.emit_bytes(op, &[op as u8, lo, hi])
    }

    /// Emits an instruction with an i32 operand.
    pub fn emit_i32(&mut self, op: Opcode, operand: i32) -> EmitResult<usize> {
        let [a, b, c, d] = operand.to_le_bytes();
        self.emit_bytes(op, &[op as u8, a, b, c, d])
    }

    /// Emits `op` followed by `extra` zero bytes for the caller to fill in.
    ///
    /// The stack effect is applied now unless the use count comes from an
    /// operand that is not written yet.
    pub fn emit_n(&mut self, op: Opcode, extra: usize) -> EmitResult<usize> {
        let section = self.section_mut();
        let pc = section.code.push(&[op as u8])?;
        section.code.push_zeroed(extra)?;
        if op.spec().uses >= 0 {
            self.update_depth(op, pc, None);
        }
        Ok(pc)
    }

    /// Emits an instruction whose operand is the index of `literal`.
    pub fn emit_atom_op(&mut self, op: Opcode, literal: Literal) -> EmitResult<usize> {
        let index = self.atom_index(literal)?;
        self.emit_u16(op, index)
    }

    pub fn atom_index(&mut self, literal: Literal) -> EmitResult<u16> {
        self.atoms.index_of(literal)
    }

    /// Number of distinct literals referenced so far.
    #[must_use]
    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    /// Most literals this unit may hold.
    #[must_use]
    pub fn atom_limit(&self) -> usize {
        self.atoms.limit()
    }

    pub fn emit_popn(&mut self, count: u16) -> EmitResult<usize> {
        self.emit_u16(Opcode::PopN, count)
    }

    /// Emits block entry, pushing `count` block-local slots.
    pub fn emit_enter_block(&mut self, count: u16) -> EmitResult<usize> {
        let [lo, hi] = count.to_le_bytes();
        let pc = self.section_mut().code.push(&[Opcode::EnterBlock as u8, lo, hi])?;
        self.update_depth(Opcode::EnterBlock, pc, Some(u32::from(count)));
        Ok(pc)
    }

    pub fn emit_leave_block(&mut self, count: u16) -> EmitResult<usize> {
        self.emit_u16(Opcode::LeaveBlock, count)
    }

    /// Rewrites the opcode byte at `pc` in the current section.
    pub fn set_op(&mut self, pc: usize, op: Opcode) {
        self.section_mut().code.set_byte(pc, op as u8);
    }

    /// Writes a u16 immediate at `at`, used to fill in `emit_n` operands.
    pub fn set_u16(&mut self, at: usize, value: u16) {
        self.section_mut().code.write_u16(at, value);
    }

    pub fn set_i16(&mut self, at: usize, value: i16) {
        self.section_mut().code.write_i16(at, value);
    }

    /// Registers a compiled nested function and returns its index.
    pub fn add_function(&mut self, script: Script) -> EmitResult<u16> {
        let index = u16::try_from(self.functions.len()).map_err(|_| EmitError::TooManyLiterals)?;
        self.functions.try_reserve(1)?;
        self.functions.push(script);
        Ok(index)
    }

    // --- jumps ---

    /// Emits a forward jump with a placeholder offset.
    pub fn begin_jump(&mut self, op: Opcode) -> EmitResult<JumpLabel> {
        self.emit_jump(op, 0).map(JumpLabel)
    }

    /// Points a jump from `begin_jump` at the current offset.
    pub fn patch_jump_here(&mut self, label: JumpLabel) -> EmitResult<()> {
        let off = self.span_between(label.0, self.offset())?;
        self.set_jump_offset(label.0, off)
    }

    /// Emits a jump to an already-emitted `target`.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) -> EmitResult<usize> {
        let off = self.span_between(self.offset(), target)?;
        self.emit_jump(op, off)
    }

    /// Signed distance from `from` to `to`.
    pub(super) fn span_between(&self, from: usize, to: usize) -> EmitResult<isize> {
        let from = isize::try_from(from).map_err(|_| self.statement_too_large())?;
        let to = isize::try_from(to).map_err(|_| self.statement_too_large())?;
        Ok(to - from)
    }

    /// Emits a placeholder jump that joins a backpatch chain whose latest
    /// link is `last`, returning the new latest link.
    pub fn emit_backpatch_op(&mut self, op: Opcode, last: Option<usize>) -> EmitResult<usize> {
        let offset = self.offset();
        // the first link's delta steps past offset 0 so the chain walk stops
        let delta = match last {
            Some(last) => offset - last,
            None => offset + 1,
        };
        let delta = isize::try_from(delta).map_err(|_| self.statement_too_large())?;
        self.emit_jump(op, delta)
    }

    /// Resolves every jump in the chain ending at `last` to `target`,
    /// rewriting each placeholder opcode to `op`.
    pub fn backpatch(&mut self, last: Option<usize>, target: usize, op: Opcode) -> EmitResult<()> {
        let mut cursor = last;
        while let Some(pc) = cursor {
            let delta = self.jump_offset(pc)?;
            let span = self.span_between(pc, target)?;
            self.set_jump_offset(pc, span)?;
            // after the offset, so a table build still sees the placeholder
            self.main.code.set_byte(pc, op as u8);
            let delta = usize::try_from(delta).map_err(|_| EmitError::Internal("backpatch chain link is not positive"))?;
            cursor = pc.checked_sub(delta);
        }
        Ok(())
    }

    // --- statements ---

    /// Error naming the innermost open statement.
    #[must_use]
    pub fn statement_too_large(&self) -> EmitError {
        EmitError::StatementTooLarge {
            statement: self.stmts.innermost_name(),
        }
    }

    /// Opens a statement starting at `top` and returns its index.
    pub fn push_statement(&mut self, kind: StmtKind, top: usize) -> usize {
        self.stmts.push(kind, top, None)
    }

    /// Opens a statement that introduces block-scoped `names`, whose slots
    /// start at the current stack depth.
    pub fn push_block_scope(&mut self, kind: StmtKind, top: usize, names: Vec<Box<str>>) -> usize {
        let depth = u32::try_from(self.stack_depth()).unwrap_or(0);
        self.stmts.push(kind, top, Some(BlockScope { depth, names }))
    }

    /// Number of bindings of the scope statement at `index`.
    #[must_use]
    pub fn block_count(&self, index: usize) -> u16 {
        self.stmts.get(index).scope.as_ref().map_or(0, BlockScope::count)
    }

    /// Closes the innermost statement, resolving its breaks to the current
    /// offset and its continues to its update offset.
    pub fn pop_statement(&mut self) -> EmitResult<()> {
        let Some(stmt) = self.stmts.top() else {
            return Err(EmitError::Internal("statement stack underflow"));
        };
        if !stmt.kind.is_trying() {
            let (breaks, continues, update) = (stmt.breaks, stmt.continues, stmt.update);
            let end = self.offset();
            self.backpatch(breaks, end, Opcode::Goto)?;
            self.backpatch(continues, update, Opcode::Goto)?;
        }
        self.stmts.pop();
        Ok(())
    }

    pub fn set_statement_update(&mut self, index: usize, update: usize) {
        self.stmts.get_mut(index).update = update;
    }

    /// Moves a loop's head to `top`, which also becomes its continue target
    /// until the update clause is known.
    pub fn set_statement_top(&mut self, index: usize, top: usize) {
        let stmt = self.stmts.get_mut(index);
        stmt.top = top;
        stmt.update = top;
    }

    /// Sets the continue target of the loop at `index` and of the labels
    /// directly enclosing it.
    pub fn set_loop_update(&mut self, index: usize, update: usize) {
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            self.stmts.get_mut(i).update = update;
            cursor = i.checked_sub(1).filter(|&down| self.stmts.get(down).kind == StmtKind::Label);
        }
    }

    pub fn set_statement_label(&mut self, index: usize, label: &str) {
        self.stmts.get_mut(index).label = Some(label.into());
    }

    /// Innermost statement index, if any.
    #[must_use]
    pub fn top_statement(&self) -> Option<usize> {
        self.stmts.top_index()
    }

    #[must_use]
    pub fn statement_kind(&self, index: usize) -> StmtKind {
        self.stmts.get(index).kind
    }

    /// Innermost statement a `break` without a label leaves.
    #[must_use]
    pub fn find_break_target(&self) -> Option<usize> {
        self.stmts.find(|stmt| stmt.kind.is_loop() || stmt.kind == StmtKind::Switch)
    }

    /// Innermost loop a `continue` without a label restarts.
    #[must_use]
    pub fn find_continue_target(&self) -> Option<usize> {
        self.stmts.find(|stmt| stmt.kind.is_loop())
    }

    #[must_use]
    pub fn find_label(&self, label: &str) -> Option<usize> {
        self.stmts.find_label(label)
    }

    /// Loop a `continue label` restarts: the outermost loop above the label.
    #[must_use]
    pub fn find_labeled_loop(&self, label: &str) -> Option<usize> {
        let label = self.stmts.find_label(label)?;
        (label + 1..self.stmts.len()).find(|&i| self.stmts.get(i).kind.is_loop())
    }

    /// Stack slot of a block-scoped name, if one is in scope.
    #[must_use]
    pub fn lexical_lookup(&self, name: &str) -> Option<u32> {
        self.stmts.lexical_lookup(name).map(|(_, slot)| slot)
    }

    /// Emits the cleanup needed to leave every statement above `to`
    /// (all of them when `to` is `None`).
    ///
    /// The stack depth is restored afterward since the cleanup replicates
    /// code that the normal exit path also runs.
    pub fn emit_nonlocal_jump_fixup(&mut self, to: Option<usize>) -> EmitResult<()> {
        let depth = self.stack_depth();
        let stop = to.map_or(0, |to| to + 1);
        let mut npops: u16 = 0;
        let mut index = self.stmts.len();
        while index > stop {
            index -= 1;
            let kind = self.stmts.get(index).kind;
            match kind {
                StmtKind::Finally => {
                    self.flush_pops(&mut npops)?;
                    self.new_src_note(SrcNoteType::Hidden)?;
                    let last = self.stmts.get(index).gosubs;
                    let pc = self.emit_backpatch_op(Opcode::Backpatch, last)?;
                    self.stmts.get_mut(index).gosubs = Some(pc);
                }
                StmtKind::With => {
                    self.flush_pops(&mut npops)?;
                    self.new_src_note(SrcNoteType::Hidden)?;
                    self.emit(Opcode::LeaveWith)?;
                }
                StmtKind::ForInLoop => {
                    self.flush_pops(&mut npops)?;
                    self.new_src_note(SrcNoteType::Hidden)?;
                    self.emit(Opcode::EndIter)?;
                }
                // [exception or hole, retsub index] pair
                StmtKind::Subroutine => npops += 2,
                _ => {}
            }
            if self.stmts.get(index).scope.is_some() {
                self.flush_pops(&mut npops)?;
                self.new_src_note(SrcNoteType::Hidden)?;
                let count = self.block_count(index);
                self.emit_leave_block(count)?;
            }
        }
        self.flush_pops(&mut npops)?;
        self.set_stack_depth(depth);
        Ok(())
    }

    fn flush_pops(&mut self, npops: &mut u16) -> EmitResult<()> {
        if *npops > 0 {
            self.new_src_note(SrcNoteType::Hidden)?;
            self.emit_popn(*npops)?;
            *npops = 0;
        }
        Ok(())
    }

    /// Emits a non-local jump to statement `to`, joining its `chain`.
    ///
    /// `label` is the literal index of the label for labeled jumps, annotated
    /// with `note`.
    pub fn emit_goto(&mut self, to: usize, chain: Chain, label: Option<u16>, note: Option<SrcNoteType>) -> EmitResult<usize> {
        self.emit_nonlocal_jump_fixup(Some(to))?;
        match (label, note) {
            (Some(label), Some(note)) => {
                self.new_src_note2(note, usize::from(label))?;
            }
            (None, Some(note)) => {
                self.new_src_note(note)?;
            }
            _ => {}
        }
        let last = self.stmts.get(to).chain(chain);
        let pc = self.emit_backpatch_op(Opcode::Backpatch, last)?;
        self.stmts.get_mut(to).set_chain(chain, Some(pc));
        Ok(pc)
    }

    /// Pending gosub chain of the try statement at `index`.
    #[must_use]
    pub fn gosubs(&self, index: usize) -> Option<usize> {
        self.stmts.get(index).gosubs
    }

    pub fn set_gosubs(&mut self, index: usize, last: Option<usize>) {
        self.stmts.get_mut(index).gosubs = last;
    }

    pub fn set_statement_kind(&mut self, index: usize, kind: StmtKind) {
        self.stmts.get_mut(index).kind = kind;
    }

    // --- source notes ---

    /// Appends a note annotating the current offset and returns its index.
    pub fn new_src_note(&mut self, ty: SrcNoteType) -> EmitResult<usize> {
        let section = self.section_mut();
        let offset = section.code.len();
        let delta = offset - section.last_note_offset;
        section.last_note_offset = offset;
        section.notes.new_note(ty, delta)
    }

    pub fn new_src_note2(&mut self, ty: SrcNoteType, operand: usize) -> EmitResult<usize> {
        let index = self.new_src_note(ty)?;
        self.set_src_note_offset(index, 0, operand)?;
        Ok(index)
    }

    pub fn new_src_note3(&mut self, ty: SrcNoteType, first: usize, second: usize) -> EmitResult<usize> {
        let index = self.new_src_note(ty)?;
        self.set_src_note_offset(index, 1, second)?;
        self.set_src_note_offset(index, 0, first)?;
        Ok(index)
    }

    /// Encoded length of the current section's notes.
    ///
    /// Setting an operand can grow an earlier note; callers holding the
    /// index of a later note shift it by the change in this length.
    #[must_use]
    pub fn note_count(&self) -> usize {
        self.section().notes.len()
    }

    /// Sets operand `which` of note `index` in the current section.
    pub fn set_src_note_offset(&mut self, index: usize, which: usize, value: usize) -> EmitResult<()> {
        if value >= SN_OPERAND_LIMIT {
            return Err(self.statement_too_large());
        }
        self.section_mut().notes.set_offset(index, which, value)
    }

    /// Records a change of source line with `newline` notes or one `setline`,
    /// whichever is shorter.
    pub fn update_line_number(&mut self, line: u32) -> EmitResult<()> {
        let current = self.section().current_line;
        if line == current {
            return Ok(());
        }
        self.section_mut().current_line = line;
        // backward moves wrap to a huge delta and take the setline path
        let delta = line.wrapping_sub(current);
        let setline_cost = if line as usize > 127 { 4 } else { 2 };
        if delta >= setline_cost {
            let line = (line as usize).min(MAX_LINE);
            self.new_src_note2(SrcNoteType::SetLine, line)?;
        } else {
            for _ in 0..delta {
                self.new_src_note(SrcNoteType::Newline)?;
            }
        }
        Ok(())
    }

    // --- try notes ---

    /// Records an exception region of the main section at the current depth.
    pub fn record_try_region(&mut self, kind: TryNoteKind, start: usize, end: usize) -> EmitResult<()> {
        let depth = self.stack_depth();
        self.record_try_region_at_depth(kind, depth, start, end)
    }

    pub fn record_try_region_at_depth(&mut self, kind: TryNoteKind, depth: i32, start: usize, end: usize) -> EmitResult<()> {
        self.try_notes.record(kind, depth, start, end)
    }

    // --- finishing ---

    /// Resolves any pending span dependencies, joins the sections and hands
    /// the result over as a [`Script`].
    pub fn finish(mut self) -> EmitResult<Script> {
        self.switch_to_main();
        self.resolve_span_deps()?;
        let notes = self.take_notes()?;

        let main_offset = self.prolog.code.len();
        let mut code = self.prolog.code.into_vec();
        code.try_reserve_exact(self.main.code.len())?;
        code.extend_from_slice(self.main.code.as_slice());

        Ok(Script::new(
            self.filename,
            code,
            main_offset,
            notes,
            self.try_notes.into_vec(),
            self.atoms.into_vec(),
            self.functions,
            self.depth.max(),
            self.first_line,
            self.warnings,
        ))
    }

    /// Concatenates prolog and main notes so that main note offsets count
    /// from the start of the prolog.
    fn take_notes(&mut self) -> EmitResult<Vec<u8>> {
        if !self.prolog.notes.is_empty() && self.prolog.current_line != self.first_line {
            self.switch_to_prolog();
            self.new_src_note2(SrcNoteType::SetLine, self.first_line as usize)?;
            self.switch_to_main();
        } else {
            let mut offset = self.prolog.code.len() - self.prolog.last_note_offset;
            if offset > 0 && !self.main.notes.is_empty() {
                let notes = &mut self.main.notes;
                let mut delta = notes.delta_headroom(0).min(offset);
                loop {
                    notes.add_to_delta(0, delta)?;
                    offset -= delta;
                    if offset == 0 {
                        break;
                    }
                    delta = offset.min(SN_XDELTA_MASK);
                }
            }
        }

        let mut notes = Vec::new();
        notes.try_reserve_exact(self.prolog.notes.len() + self.main.notes.len() + 1)?;
        notes.extend_from_slice(self.prolog.notes.as_slice());
        notes.extend_from_slice(self.main.notes.as_slice());
        notes.push(0);
        Ok(notes)
    }
}
