//! Syntax-tree walker that drives a [`CodeGenerator`].
//!
//! One method per node kind. Every visit goes through [`Compiler::emit_tree`],
//! which charges one level against the recursion limit, so arbitrarily deep
//! trees fail with [`EmitError::TooMuchRecursion`] instead of overflowing the
//! native stack. Statements get line-number notes; expressions do not.
//!
//! Top-level statements are resolved one at a time: the span-dependency
//! table built while emitting a statement is widened and discarded before
//! the next statement starts.

use ahash::AHashSet;
use tracing::debug;

use super::{
    builder::CodeGenerator,
    code::Script,
    op::{INDEX_LEN, JUMP_OFFSET_LEN, Opcode},
    srcnote::SrcNoteType,
    stmt::{Chain, StmtKind},
    trynote::TryNoteKind,
};
use crate::{
    ast::{Ast, BinaryOp, Binding, Case, CatchClause, Function, LogicalOp, NodeId, NodeKind, UnaryOp},
    atoms::Literal,
    error::{EmitError, EmitResult},
    limits::EmitLimits,
};

/// Compiles the top-level statements of `ast` into a script.
pub fn compile_script(ast: &Ast, filename: &str, limits: EmitLimits) -> EmitResult<Script> {
    let mut compiler = Compiler::new(ast, CodeGenerator::new(filename, 1, limits), false);
    for &stmt in ast.body() {
        compiler.emit_tree(stmt)?;
        compiler.cg.resolve_span_deps()?;
    }
    compiler.cg.emit(Opcode::Stop)?;
    let script = compiler.cg.finish()?;
    debug!(
        filename,
        length = script.code().len(),
        max_stack_depth = script.max_stack_depth(),
        functions = script.functions().len(),
        "compiled script"
    );
    Ok(script)
}

/// Walks one script or function body.
#[derive(Debug)]
pub struct Compiler<'a> {
    ast: &'a Ast,
    cg: CodeGenerator,
    /// Expression statements pop their value instead of saving it as the
    /// script's completion value.
    in_function: bool,
}

/// Which switch instruction a switch statement lowers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchPlan {
    /// Dense integer keys in `low..=high`.
    Table { low: i32, high: i32 },
    /// Constant keys looked up through the literal table.
    Lookup,
    /// Any other keys: each case is tested in order.
    Cond,
}

impl<'a> Compiler<'a> {
    #[must_use]
    pub fn new(ast: &'a Ast, cg: CodeGenerator, in_function: bool) -> Self {
        Self { ast, cg, in_function }
    }

    /// Hands back the generator, for callers that finish it themselves.
    #[must_use]
    pub fn into_generator(self) -> CodeGenerator {
        self.cg
    }

    /// Emits `id` one nesting level deeper.
    pub fn emit_tree(&mut self, id: NodeId) -> EmitResult<()> {
        self.cg.enter_level()?;
        let result = self.emit_node(id);
        self.cg.exit_level();
        result
    }

    fn emit_stmts(&mut self, stmts: &[NodeId]) -> EmitResult<()> {
        for &stmt in stmts {
            self.emit_tree(stmt)?;
        }
        Ok(())
    }

    fn emit_node(&mut self, id: NodeId) -> EmitResult<()> {
        let ast = self.ast;
        let node = ast.get(id);
        if is_statement(&node.kind) && !matches!(node.kind, NodeKind::FunctionDecl(_)) {
            self.cg.update_line_number(node.line)?;
        }
        match &node.kind {
            NodeKind::Empty => Ok(()),
            NodeKind::Block(stmts) => {
                let top = self.cg.offset();
                self.cg.push_statement(StmtKind::Block, top);
                self.emit_stmts(stmts)?;
                self.cg.pop_statement()
            }
            NodeKind::Expr(expr) => {
                self.emit_tree(*expr)?;
                let op = if self.in_function { Opcode::Pop } else { Opcode::SetRval };
                self.cg.emit(op)?;
                Ok(())
            }
            NodeKind::Var(bindings) => self.emit_var(bindings),
            NodeKind::If { cond, then, otherwise } => self.emit_if(*cond, *then, *otherwise),
            NodeKind::While { cond, body } => self.emit_while(*cond, *body),
            NodeKind::DoWhile { body, cond } => self.emit_do_while(*body, *cond),
            NodeKind::For {
                init,
                cond,
                update,
                body,
            } => self.emit_for(*init, *cond, *update, *body),
            NodeKind::ForIn {
                declare,
                target,
                object,
                body,
            } => self.emit_for_in(*declare, *target, *object, *body),
            NodeKind::Switch { discriminant, cases } => self.emit_switch(*discriminant, cases),
            NodeKind::Labeled { label, body } => self.emit_labeled(label, *body),
            NodeKind::Break(label) => self.emit_break(label.as_deref()),
            NodeKind::Continue(label) => self.emit_continue(label.as_deref()),
            NodeKind::Return(value) => self.emit_return(*value),
            NodeKind::Throw(value) => {
                self.emit_tree(*value)?;
                self.cg.emit(Opcode::Throw)?;
                Ok(())
            }
            NodeKind::Try { block, catch, finally } => self.emit_try(block, catch.as_ref(), finally.as_deref()),
            NodeKind::With { object, body } => {
                self.emit_tree(*object)?;
                let top = self.cg.offset();
                self.cg.push_statement(StmtKind::With, top);
                self.cg.emit(Opcode::EnterWith)?;
                self.emit_tree(*body)?;
                self.cg.emit(Opcode::LeaveWith)?;
                self.cg.pop_statement()
            }
            NodeKind::Let { bindings, body } => self.emit_let(bindings, body),
            NodeKind::FunctionDecl(func) => {
                let index = self.compile_function(func, node.line)?;
                self.cg.switch_to_prolog();
                let defined = self.emit_function_definition(index);
                self.cg.switch_to_main();
                defined
            }
            _ => self.emit_expr(id),
        }
    }

    // --- statements ---

    /// Hoists a definition of each name into the prolog and assigns
    /// initializers in place.
    fn emit_var(&mut self, bindings: &[Binding]) -> EmitResult<()> {
        for binding in bindings {
            self.cg.switch_to_prolog();
            let defined = self.cg.emit_atom_op(Opcode::DefVar, Literal::from(&*binding.name));
            self.cg.switch_to_main();
            defined?;
            if let Some(init) = binding.init {
                self.emit_tree(init)?;
                self.emit_store_name(&binding.name)?;
                self.cg.emit(Opcode::Pop)?;
            }
        }
        Ok(())
    }

    fn emit_function_definition(&mut self, index: u16) -> EmitResult<()> {
        self.cg.new_src_note2(SrcNoteType::FuncDef, usize::from(index))?;
        self.cg.emit_u16(Opcode::DefFun, index)?;
        Ok(())
    }

    fn emit_if(&mut self, cond: NodeId, then: NodeId, otherwise: Option<NodeId>) -> EmitResult<()> {
        let top = self.cg.offset();
        self.emit_tree(cond)?;
        let index = self.cg.push_statement(StmtKind::If, top);
        let note_type = if otherwise.is_some() { SrcNoteType::IfElse } else { SrcNoteType::If };
        let note = self.cg.new_src_note(note_type)?;
        let beq = self.cg.begin_jump(Opcode::IfEq)?;
        self.emit_tree(then)?;
        if let Some(otherwise) = otherwise {
            // the jump over the else part joins the statement's break chain
            self.cg.set_statement_kind(index, StmtKind::Else);
            let jmp = self.cg.emit_goto(index, Chain::Breaks, None, None)?;
            self.cg.patch_jump_here(beq)?;
            self.emit_tree(otherwise)?;
            self.cg.set_src_note_offset(note, 0, jmp - beq.offset())?;
        } else {
            self.cg.patch_jump_here(beq)?;
        }
        self.cg.pop_statement()
    }

    /// `goto cond; top: body; cond: ifne top`.
    fn emit_while(&mut self, cond: NodeId, body: NodeId) -> EmitResult<()> {
        let top = self.cg.offset();
        self.cg.push_statement(StmtKind::WhileLoop, top);
        let note = self.cg.new_src_note(SrcNoteType::While)?;
        let jmp = self.cg.begin_jump(Opcode::Goto)?;
        let loop_top = self.cg.offset();
        self.emit_tree(body)?;
        self.cg.patch_jump_here(jmp)?;
        self.emit_tree(cond)?;
        let beq = self.cg.emit_jump_to(Opcode::IfNe, loop_top)?;
        self.cg.set_src_note_offset(note, 0, beq - jmp.offset())?;
        self.cg.pop_statement()
    }

    fn emit_do_while(&mut self, body: NodeId, cond: NodeId) -> EmitResult<()> {
        let note = self.cg.new_src_note(SrcNoteType::While)?;
        self.cg.emit(Opcode::Nop)?;
        let top = self.cg.offset();
        let index = self.cg.push_statement(StmtKind::DoLoop, top);
        self.emit_tree(body)?;
        let update = self.cg.offset();
        self.cg.set_loop_update(index, update);
        self.emit_tree(cond)?;
        self.cg.emit_jump_to(Opcode::IfNe, top)?;
        self.cg.set_src_note_offset(note, 0, 1 + (update - top))?;
        self.cg.pop_statement()
    }

    /// `init; goto cond; top: body; update; cond: ifne top`, with the
    /// condition test replaced by `goto top` when there is none.
    fn emit_for(&mut self, init: Option<NodeId>, cond: Option<NodeId>, update: Option<NodeId>, body: NodeId) -> EmitResult<()> {
        let start = self.cg.offset();
        let index = self.cg.push_statement(StmtKind::ForLoop, start);
        let op = match init {
            None => Opcode::Nop,
            Some(init) => {
                self.emit_tree(init)?;
                if matches!(self.ast.kind(init), NodeKind::Var(_)) { Opcode::Nop } else { Opcode::Pop }
            }
        };
        let note = self.cg.new_src_note(SrcNoteType::For)?;
        self.cg.emit(op)?;
        let head = self.cg.offset();
        let jmp = cond.map(|_| self.cg.begin_jump(Opcode::Goto)).transpose()?;

        let top = self.cg.offset();
        self.cg.set_statement_top(index, top);
        self.emit_tree(body)?;

        let update_start = self.cg.offset();
        self.cg.set_loop_update(index, update_start);
        if let Some(update) = update {
            self.emit_tree(update)?;
            self.cg.emit(Opcode::Pop)?;
        }
        let cond_start = self.cg.offset();
        if let (Some(jmp), Some(cond)) = (jmp, cond) {
            self.cg.patch_jump_here(jmp)?;
            self.emit_tree(cond)?;
        }

        let end = self.cg.offset();
        self.cg.set_src_note_offset(note, 0, cond_start - head)?;
        self.cg.set_src_note_offset(note, 1, update_start - head)?;
        self.cg.set_src_note_offset(note, 2, end - head)?;
        let back = if cond.is_some() { Opcode::IfNe } else { Opcode::Goto };
        self.cg.emit_jump_to(back, top)?;
        self.cg.pop_statement()
    }

    /// Iterates with the iterator left on the stack, covered by an `iter`
    /// try note so unwinding closes it.
    fn emit_for_in(&mut self, declare: bool, target: NodeId, object: NodeId, body: NodeId) -> EmitResult<()> {
        let ast = self.ast;
        let NodeKind::Name(name) = ast.kind(target) else {
            return Err(EmitError::Internal("for-in target must be a name"));
        };
        let start = self.cg.offset();
        let index = self.cg.push_statement(StmtKind::ForInLoop, start);
        if declare {
            self.cg.switch_to_prolog();
            let defined = self.cg.emit_atom_op(Opcode::DefVar, Literal::from(&**name));
            self.cg.switch_to_main();
            defined?;
        }
        self.emit_tree(object)?;
        self.cg.emit_u8(Opcode::Iter, 1)?;
        let note = self.cg.new_src_note(SrcNoteType::ForIn)?;
        let jmp = self.cg.begin_jump(Opcode::Goto)?;

        let top = self.cg.offset();
        self.cg.set_statement_top(index, top);
        self.cg.emit(Opcode::IterNext)?;
        self.emit_store_name(name)?;
        let assigned = self.cg.offset();
        self.cg.emit(Opcode::Pop)?;
        self.emit_tree(body)?;

        let update = self.cg.offset();
        self.cg.set_loop_update(index, update);
        self.cg.patch_jump_here(jmp)?;
        self.cg.emit(Opcode::MoreIter)?;
        let beq = self.cg.emit_jump_to(Opcode::IfNe, top)?;
        self.cg.set_src_note_offset(note, 1, beq - jmp.offset())?;
        self.cg.set_src_note_offset(note, 0, assigned - jmp.offset())?;
        self.cg.pop_statement()?;

        let end = self.cg.offset();
        self.cg.record_try_region(TryNoteKind::Iter, top, end)?;
        self.cg.emit(Opcode::EndIter)?;
        Ok(())
    }

    fn emit_labeled(&mut self, label: &str, body: NodeId) -> EmitResult<()> {
        let index = self.cg.atom_index(Literal::from(label))?;
        self.cg.new_src_note2(SrcNoteType::Label, usize::from(index))?;
        self.cg.emit(Opcode::Nop)?;
        let top = self.cg.offset();
        let stmt = self.cg.push_statement(StmtKind::Label, top);
        self.cg.set_statement_label(stmt, label);
        self.emit_tree(body)?;
        self.cg.pop_statement()
    }

    fn emit_break(&mut self, label: Option<&str>) -> EmitResult<()> {
        let (to, label_index, note) = if let Some(label) = label {
            let to = self.cg.find_label(label).ok_or(EmitError::Internal("break to an unknown label"))?;
            (to, Some(self.cg.atom_index(Literal::from(label))?), SrcNoteType::Break2Label)
        } else {
            let to = self.cg.find_break_target().ok_or(EmitError::Internal("break outside a loop or switch"))?;
            let note = if self.cg.statement_kind(to) == StmtKind::Switch {
                SrcNoteType::SwitchBreak
            } else {
                SrcNoteType::Break
            };
            (to, None, note)
        };
        self.cg.emit_goto(to, Chain::Breaks, label_index, Some(note))?;
        Ok(())
    }

    fn emit_continue(&mut self, label: Option<&str>) -> EmitResult<()> {
        let (to, label_index, note) = if let Some(label) = label {
            let to = self.cg.find_labeled_loop(label).ok_or(EmitError::Internal("continue to a label without a loop"))?;
            (to, Some(self.cg.atom_index(Literal::from(label))?), SrcNoteType::Cont2Label)
        } else {
            let to = self.cg.find_continue_target().ok_or(EmitError::Internal("continue outside a loop"))?;
            (to, None, SrcNoteType::Continue)
        };
        self.cg.emit_goto(to, Chain::Continues, label_index, Some(note))?;
        Ok(())
    }

    /// A return that must run cleanup first saves its value, runs the
    /// cleanup, and returns the saved value.
    fn emit_return(&mut self, value: Option<NodeId>) -> EmitResult<()> {
        match value {
            Some(value) => self.emit_tree(value)?,
            None => {
                self.cg.emit(Opcode::Push)?;
            }
        }
        let top = self.cg.emit(Opcode::Return)?;
        self.cg.emit_nonlocal_jump_fixup(None)?;
        if self.cg.offset() != top + 1 {
            self.cg.set_op(top, Opcode::SetRval);
            self.cg.emit(Opcode::RetRval)?;
        }
        Ok(())
    }

    fn emit_try(&mut self, block: &[NodeId], catch: Option<&CatchClause>, finally: Option<&[NodeId]>) -> EmitResult<()> {
        let kind = if finally.is_some() { StmtKind::Finally } else { StmtKind::Try };
        let top = self.cg.offset();
        let index = self.cg.push_statement(kind, top);
        let depth = self.cg.stack_depth();
        self.cg.emit(Opcode::Try)?;
        let try_start = self.cg.offset();
        self.emit_stmts(block)?;
        if finally.is_some() {
            self.emit_gosub(index)?;
        }
        self.cg.new_src_note(SrcNoteType::Hidden)?;
        let mut catch_jump = Some(self.cg.emit_backpatch_op(Opcode::Backpatch, None)?);
        let try_end = self.cg.offset();

        if let Some(clause) = catch {
            self.emit_catch(clause)?;
            if finally.is_some() {
                self.emit_gosub(index)?;
            }
            self.cg.new_src_note(SrcNoteType::Hidden)?;
            catch_jump = Some(self.cg.emit_backpatch_op(Opcode::Backpatch, catch_jump)?);
        }

        let mut finally_start = try_end;
        if let Some(body) = finally {
            finally_start = self.cg.offset();
            let gosubs = self.cg.gosubs(index);
            self.cg.backpatch(gosubs, finally_start, Opcode::Gosub)?;
            self.cg.set_gosubs(index, None);
            self.cg.set_statement_kind(index, StmtKind::Subroutine);
            if let Some(&first) = body.first() {
                self.cg.update_line_number(self.ast.get(first).line)?;
            }
            self.cg.emit(Opcode::Finally)?;
            self.emit_stmts(body)?;
            self.cg.emit(Opcode::RetSub)?;
        }
        self.cg.pop_statement()?;

        self.cg.new_src_note(SrcNoteType::EndBrace)?;
        self.cg.emit(Opcode::Nop)?;
        let end = self.cg.offset();
        self.cg.backpatch(catch_jump, end, Opcode::Goto)?;

        if catch.is_some() {
            self.cg.record_try_region_at_depth(TryNoteKind::Catch, depth, try_start, try_end)?;
        }
        if finally.is_some() {
            self.cg.record_try_region_at_depth(TryNoteKind::Finally, depth, try_start, finally_start)?;
        }
        Ok(())
    }

    /// Calls the finally subroutine of the try statement at `index`.
    fn emit_gosub(&mut self, index: usize) -> EmitResult<()> {
        self.cg.new_src_note(SrcNoteType::Hidden)?;
        let last = self.cg.gosubs(index);
        let pc = self.cg.emit_backpatch_op(Opcode::Backpatch, last)?;
        self.cg.set_gosubs(index, Some(pc));
        Ok(())
    }

    /// The catch parameter lives in a one-slot block scope.
    fn emit_catch(&mut self, clause: &CatchClause) -> EmitResult<()> {
        let note = self.cg.new_src_note2(SrcNoteType::Catch, 0)?;
        let start = self.cg.offset();
        let index = self.cg.push_block_scope(StmtKind::Catch, start, vec![clause.param.clone()]);
        let count = self.cg.block_count(index);
        self.cg.emit_enter_block(count)?;
        self.cg.emit(Opcode::Exception)?;
        let slot = self.local_slot(&clause.param)?.ok_or(EmitError::Internal("catch parameter out of scope"))?;
        self.cg.emit_u16(Opcode::SetLocalPop, slot)?;
        self.emit_stmts(&clause.body)?;
        self.cg.emit_leave_block(count)?;
        self.cg.pop_statement()?;
        let length = self.cg.offset() - start;
        self.cg.set_src_note_offset(note, 0, length)
    }

    fn emit_let(&mut self, bindings: &[Binding], body: &[NodeId]) -> EmitResult<()> {
        let top = self.cg.offset();
        let names = bindings.iter().map(|binding| binding.name.clone()).collect();
        let index = self.cg.push_block_scope(StmtKind::Block, top, names);
        let count = self.cg.block_count(index);
        self.cg.emit_enter_block(count)?;
        for binding in bindings {
            if let Some(init) = binding.init {
                self.emit_tree(init)?;
                let slot = self.local_slot(&binding.name)?.ok_or(EmitError::Internal("let binding out of scope"))?;
                self.cg.emit_u16(Opcode::SetLocalPop, slot)?;
            }
        }
        self.emit_stmts(body)?;
        self.cg.emit_leave_block(count)?;
        self.cg.pop_statement()
    }

    // --- switch ---

    fn emit_switch(&mut self, discriminant: NodeId, cases: &[Case]) -> EmitResult<()> {
        self.emit_tree(discriminant)?;
        let top = self.cg.offset();
        self.cg.push_statement(StmtKind::Switch, top);

        let case_count = cases.iter().filter(|case| case.test.is_some()).count();
        let has_default = case_count < cases.len();
        let plan = self.plan_switch(cases, case_count);
        let (op, size, table_len) = match plan {
            SwitchPlan::Table { low, high } => {
                let len = usize::try_from(i64::from(high) - i64::from(low) + 1).unwrap_or(0);
                (Opcode::TableSwitch, JUMP_OFFSET_LEN * (3 + len), len)
            }
            SwitchPlan::Lookup => (
                Opcode::LookupSwitch,
                JUMP_OFFSET_LEN + INDEX_LEN + (INDEX_LEN + JUMP_OFFSET_LEN) * case_count,
                0,
            ),
            SwitchPlan::Cond => (Opcode::CondSwitch, 0, 0),
        };

        let note = self.cg.new_src_note3(SrcNoteType::Switch, 0, 0)?;
        self.cg.emit_n(op, size)?;

        let mut case_jumps = vec![None; cases.len()];
        let mut default_jump = None;
        match plan {
            SwitchPlan::Cond => {
                let mut case_note: Option<usize> = None;
                let mut last_case = top;
                for (slot, case) in case_jumps.iter_mut().zip(cases) {
                    if let Some(test) = case.test {
                        self.emit_tree(test)?;
                    }
                    if let Some(n) = case_note {
                        let delta = self.cg.offset() - last_case;
                        self.cg.set_src_note_offset(n, 0, delta)?;
                    }
                    if case.test.is_none() {
                        continue;
                    }
                    let mut n = self.cg.new_src_note2(SrcNoteType::PcDelta, 0)?;
                    last_case = self.cg.emit_jump(Opcode::Case, 0)?;
                    *slot = Some(last_case);
                    if case_note.is_none() {
                        // widening the switch note moves the case note along
                        let before = self.cg.note_count();
                        self.cg.set_src_note_offset(note, 1, last_case - top)?;
                        n += self.cg.note_count() - before;
                    }
                    case_note = Some(n);
                }
                if !has_default && let Some(n) = case_note {
                    let delta = self.cg.offset() - last_case;
                    self.cg.set_src_note_offset(n, 0, delta)?;
                }
                default_jump = Some(self.cg.emit_jump(Opcode::Default, 0)?);
            }
            SwitchPlan::Table { low, high } => {
                let at = top + 1 + JUMP_OFFSET_LEN;
                let bound = |value: i32| i16::try_from(value).map_err(|_| EmitError::Internal("switch table bound out of range"));
                self.cg.set_i16(at, bound(low)?);
                self.cg.set_i16(at + JUMP_OFFSET_LEN, bound(high)?);
                if self.cg.span_deps_active() {
                    self.cg.add_switch_span_deps(top)?;
                }
            }
            SwitchPlan::Lookup => {
                let npairs = u16::try_from(case_count).map_err(|_| self.cg.statement_too_large())?;
                self.cg.set_u16(top + 1 + JUMP_OFFSET_LEN, npairs);
                if self.cg.span_deps_active() {
                    self.cg.add_switch_span_deps(top)?;
                }
            }
        }

        let mut case_offsets = vec![0; cases.len()];
        let mut default_offset = None;
        for (c, case) in cases.iter().enumerate() {
            if let Some(pc) = case_jumps[c] {
                let here = self.cg.offset();
                let span = self.cg.span_between(pc, here)?;
                self.cg.set_jump_offset(pc, span)?;
            }
            case_offsets[c] = self.cg.offset();
            self.emit_stmts(&case.body)?;
            if case.test.is_none() {
                default_offset = Some(case_offsets[c]);
            }
        }
        let default_target = default_offset.unwrap_or_else(|| self.cg.offset());
        let jump = default_jump.unwrap_or(top);
        let span = self.cg.span_between(jump, default_target)?;
        self.cg.set_jump_offset(jump, span)?;

        let length = self.cg.offset() - top;
        self.cg.set_src_note_offset(note, 0, length)?;

        match plan {
            SwitchPlan::Table { low, .. } => {
                let mut table = vec![None; table_len];
                for (c, case) in cases.iter().enumerate() {
                    let Some(key) = case.test.and_then(|test| self.table_key(test)) else {
                        continue;
                    };
                    let slot = usize::try_from(i64::from(key) - i64::from(low)).map_err(|_| EmitError::Internal("switch key below table"))?;
                    table[slot] = Some(c);
                }
                let mut imm = top + 1 + 3 * JUMP_OFFSET_LEN;
                for entry in table {
                    let span = match entry {
                        Some(c) => self.cg.span_between(top, case_offsets[c])?,
                        None => 0,
                    };
                    self.cg.set_jump_offset_at(imm, span)?;
                    imm += JUMP_OFFSET_LEN;
                }
            }
            SwitchPlan::Lookup => {
                let mut at = top + 1 + JUMP_OFFSET_LEN + INDEX_LEN;
                for (c, case) in cases.iter().enumerate() {
                    let Some(test) = case.test else { continue };
                    let key = self.case_key(test).ok_or(EmitError::Internal("lookup switch key is not constant"))?;
                    let index = self.cg.atom_index(key)?;
                    self.cg.set_u16(at, index);
                    at += INDEX_LEN;
                    let span = self.cg.span_between(top, case_offsets[c])?;
                    self.cg.set_jump_offset_at(at, span)?;
                    at += JUMP_OFFSET_LEN;
                }
            }
            SwitchPlan::Cond => {}
        }
        self.cg.pop_statement()
    }

    /// Picks a table when every key is a distinct small integer and the
    /// table is at most half empty, a lookup when every key is a constant,
    /// and a case-by-case test otherwise.
    fn plan_switch(&self, cases: &[Case], case_count: usize) -> SwitchPlan {
        if case_count == 0 {
            return SwitchPlan::Table { low: 0, high: -1 };
        }
        let mut table = true;
        let (mut low, mut high) = (i32::MAX, i32::MIN);
        let mut seen = AHashSet::new();
        for test in cases.iter().filter_map(|case| case.test) {
            if self.case_key(test).is_none() {
                return SwitchPlan::Cond;
            }
            if !table {
                continue;
            }
            match self.table_key(test) {
                Some(key) if seen.insert(key) => {
                    low = low.min(key);
                    high = high.max(key);
                }
                _ => table = false,
            }
        }
        if table {
            let len = i64::from(high) - i64::from(low) + 1;
            let limit = i64::try_from(case_count).unwrap_or(i64::MAX).saturating_mul(2);
            if len < 1 << 16 && len <= limit {
                return SwitchPlan::Table { low, high };
            }
        }
        if case_count + self.cg.atom_count() > self.cg.atom_limit() {
            return SwitchPlan::Cond;
        }
        SwitchPlan::Lookup
    }

    fn case_key(&self, test: NodeId) -> Option<Literal> {
        match self.ast.kind(test) {
            NodeKind::Number(value) => Some(Literal::number(*value)),
            NodeKind::Str(value) => Some(Literal::String(value.clone())),
            NodeKind::Bool(value) => Some(Literal::Bool(*value)),
            NodeKind::Null => Some(Literal::Null),
            _ => None,
        }
    }

    fn table_key(&self, test: NodeId) -> Option<i32> {
        match self.ast.kind(test) {
            NodeKind::Number(value) => exact_int(*value).filter(|int| i16::try_from(*int).is_ok()),
            _ => None,
        }
    }

    // --- expressions ---

    fn emit_expr(&mut self, id: NodeId) -> EmitResult<()> {
        let ast = self.ast;
        let node = ast.get(id);
        match &node.kind {
            NodeKind::Undefined => self.emit_op(Opcode::Push),
            NodeKind::Null => self.emit_op(Opcode::Null),
            NodeKind::Bool(true) => self.emit_op(Opcode::True),
            NodeKind::Bool(false) => self.emit_op(Opcode::False),
            NodeKind::Number(value) => self.emit_number(*value),
            NodeKind::Str(value) => {
                self.cg.emit_atom_op(Opcode::String, Literal::String(value.clone()))?;
                Ok(())
            }
            NodeKind::Name(name) => {
                match self.local_slot(name)? {
                    Some(slot) => self.cg.emit_u16(Opcode::GetLocal, slot)?,
                    None => self.cg.emit_atom_op(Opcode::Name, Literal::from(&**name))?,
                };
                Ok(())
            }
            NodeKind::Member { object, property } => {
                self.emit_tree(*object)?;
                self.cg.emit_atom_op(Opcode::GetProp, Literal::from(&**property))?;
                Ok(())
            }
            NodeKind::Index { object, index } => {
                self.emit_tree(*object)?;
                self.emit_tree(*index)?;
                self.emit_op(Opcode::GetElem)
            }
            NodeKind::Assign { op, target, value } => self.emit_assign(*op, *target, *value),
            NodeKind::Unary { op, operand } => {
                self.emit_tree(*operand)?;
                self.emit_op(unary_opcode(*op))
            }
            NodeKind::Binary { op, left, right } => {
                self.emit_tree(*left)?;
                self.emit_tree(*right)?;
                self.emit_op(binary_opcode(*op))
            }
            NodeKind::Logical { op, operands } => self.emit_logical(*op, operands),
            NodeKind::Conditional { test, then, otherwise } => self.emit_conditional(*test, *then, *otherwise),
            NodeKind::Call { callee, args } => self.emit_call(Opcode::Call, *callee, args),
            NodeKind::New { callee, args } => self.emit_call(Opcode::New, *callee, args),
            NodeKind::Function(func) => {
                let index = self.compile_function(func, node.line)?;
                self.cg.emit_u16(Opcode::Lambda, index)?;
                Ok(())
            }
            NodeKind::Comma(exprs) => self.emit_comma(exprs),
            _ => Err(EmitError::Internal("statement in expression position")),
        }
    }

    fn emit_op(&mut self, op: Opcode) -> EmitResult<()> {
        self.cg.emit(op)?;
        Ok(())
    }

    /// Uses the shortest immediate form, falling back to a literal.
    fn emit_number(&mut self, value: f64) -> EmitResult<()> {
        let Some(int) = exact_int(value) else {
            self.cg.emit_atom_op(Opcode::Double, Literal::number(value))?;
            return Ok(());
        };
        match int {
            0 => self.cg.emit(Opcode::Zero)?,
            1 => self.cg.emit(Opcode::One)?,
            _ => {
                if let Ok(small) = i8::try_from(int) {
                    self.cg.emit_u8(Opcode::Int8, small.cast_unsigned())?
                } else if let Ok(unsigned) = u16::try_from(int) {
                    self.cg.emit_u16(Opcode::Uint16, unsigned)?
                } else {
                    self.cg.emit_i32(Opcode::Int32, int)?
                }
            }
        };
        Ok(())
    }

    fn local_slot(&self, name: &str) -> EmitResult<Option<u16>> {
        self.cg
            .lexical_lookup(name)
            .map(|slot| u16::try_from(slot).map_err(|_| self.cg.statement_too_large()))
            .transpose()
    }

    /// Stores the top of stack into `name`, leaving the value in place.
    fn emit_store_name(&mut self, name: &str) -> EmitResult<()> {
        match self.local_slot(name)? {
            Some(slot) => self.cg.emit_u16(Opcode::SetLocal, slot)?,
            None => self.cg.emit_atom_op(Opcode::SetName, Literal::from(name))?,
        };
        Ok(())
    }

    /// Plain and compound assignment. Compound forms duplicate the target's
    /// object and key so each is evaluated once.
    fn emit_assign(&mut self, op: Option<BinaryOp>, target: NodeId, value: NodeId) -> EmitResult<()> {
        let ast = self.ast;
        match ast.kind(target) {
            NodeKind::Name(name) => {
                if op.is_some() {
                    self.emit_tree(target)?;
                }
                self.emit_tree(value)?;
                self.emit_compound_op(op)?;
                self.emit_store_name(name)
            }
            NodeKind::Member { object, property } => {
                self.emit_tree(*object)?;
                if op.is_some() {
                    self.cg.emit(Opcode::Dup)?;
                    self.cg.emit_atom_op(Opcode::GetProp, Literal::from(&**property))?;
                }
                self.emit_tree(value)?;
                self.emit_compound_op(op)?;
                self.cg.emit_atom_op(Opcode::SetProp, Literal::from(&**property))?;
                Ok(())
            }
            NodeKind::Index { object, index } => {
                self.emit_tree(*object)?;
                self.emit_tree(*index)?;
                if op.is_some() {
                    self.cg.emit(Opcode::Dup2)?;
                    self.cg.emit(Opcode::GetElem)?;
                }
                self.emit_tree(value)?;
                self.emit_compound_op(op)?;
                self.emit_op(Opcode::SetElem)
            }
            _ => Err(EmitError::Internal("invalid assignment target")),
        }
    }

    fn emit_compound_op(&mut self, op: Option<BinaryOp>) -> EmitResult<()> {
        if let Some(op) = op {
            self.cg.new_src_note(SrcNoteType::AssignOp)?;
            self.cg.emit(binary_opcode(op))?;
        }
        Ok(())
    }

    /// `a && b` jumps over `b` with the left value kept; longer chains thread
    /// their placeholders into one backpatch chain and resolve it forward.
    fn emit_logical(&mut self, op: LogicalOp, operands: &[NodeId]) -> EmitResult<()> {
        let jump_op = match op {
            LogicalOp::And => Opcode::And,
            LogicalOp::Or => Opcode::Or,
        };
        let [first, middle @ .., last] = operands else {
            return Err(EmitError::Internal("logical expression needs two operands"));
        };
        self.emit_tree(*first)?;
        let top = self.cg.emit_jump(Opcode::BackpatchPop, 0)?;
        let mut jmp = top;
        for &operand in middle {
            self.emit_tree(operand)?;
            let next = self.cg.emit_jump(Opcode::BackpatchPop, 0)?;
            let delta = self.cg.span_between(jmp, next)?;
            self.cg.set_backpatch_delta(jmp, delta)?;
            jmp = next;
        }
        self.emit_tree(*last)?;

        let end = self.cg.offset();
        let mut pc = top;
        for _ in 0..=middle.len() {
            let link = self.cg.jump_offset(pc)?;
            let span = self.cg.span_between(pc, end)?;
            self.cg.set_jump_offset(pc, span)?;
            self.cg.set_op(pc, jump_op);
            pc = pc.checked_add_signed(link).ok_or(EmitError::Internal("broken logical chain"))?;
        }
        Ok(())
    }

    fn emit_conditional(&mut self, test: NodeId, then: NodeId, otherwise: NodeId) -> EmitResult<()> {
        self.emit_tree(test)?;
        let note = self.cg.new_src_note(SrcNoteType::Cond)?;
        let beq = self.cg.begin_jump(Opcode::IfEq)?;
        self.emit_tree(then)?;
        let jmp = self.cg.begin_jump(Opcode::Goto)?;
        self.cg.patch_jump_here(beq)?;
        // only one arm's value is on the stack at the join
        let depth = self.cg.stack_depth();
        self.cg.set_stack_depth(depth - 1);
        self.emit_tree(otherwise)?;
        self.cg.patch_jump_here(jmp)?;
        self.cg.set_src_note_offset(note, 0, jmp.offset() - beq.offset())
    }

    fn emit_call(&mut self, op: Opcode, callee: NodeId, args: &[NodeId]) -> EmitResult<()> {
        let start = self.cg.offset();
        self.emit_tree(callee)?;
        for &arg in args {
            self.emit_tree(arg)?;
        }
        let argc = u16::try_from(args.len()).map_err(|_| self.cg.statement_too_large())?;
        let base = self.cg.offset() - start;
        self.cg.new_src_note2(SrcNoteType::PcBase, base)?;
        self.cg.emit_u16(op, argc)?;
        Ok(())
    }

    fn emit_comma(&mut self, exprs: &[NodeId]) -> EmitResult<()> {
        if exprs.is_empty() {
            return self.emit_op(Opcode::Push);
        }
        let mut note: Option<usize> = None;
        let mut previous = 0;
        for (i, &expr) in exprs.iter().enumerate() {
            self.emit_tree(expr)?;
            let here = self.cg.offset();
            if let Some(note) = note {
                self.cg.set_src_note_offset(note, 0, here - previous)?;
            }
            if i + 1 == exprs.len() {
                break;
            }
            previous = here;
            note = Some(self.cg.new_src_note2(SrcNoteType::PcDelta, 0)?);
            self.cg.emit(Opcode::Pop)?;
        }
        Ok(())
    }

    // --- functions ---

    /// Compiles a function body in a child generator and registers it.
    ///
    /// Parameters are bound by the runtime when the function is called.
    fn compile_function(&mut self, func: &Function, line: u32) -> EmitResult<u16> {
        let mut inner = Compiler::new(self.ast, self.cg.child(line), true);
        inner.emit_stmts(&func.body)?;
        inner.cg.emit(Opcode::Stop)?;
        let script = inner.cg.finish()?;
        debug!(
            name = func.name.as_deref().unwrap_or("<anonymous>"),
            line,
            length = script.code().len(),
            "compiled function"
        );
        self.cg.add_function(script)
    }
}

fn is_statement(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Empty
            | NodeKind::Block(_)
            | NodeKind::Expr(_)
            | NodeKind::Var(_)
            | NodeKind::If { .. }
            | NodeKind::While { .. }
            | NodeKind::DoWhile { .. }
            | NodeKind::For { .. }
            | NodeKind::ForIn { .. }
            | NodeKind::Switch { .. }
            | NodeKind::Labeled { .. }
            | NodeKind::Break(_)
            | NodeKind::Continue(_)
            | NodeKind::Return(_)
            | NodeKind::Throw(_)
            | NodeKind::Try { .. }
            | NodeKind::With { .. }
            | NodeKind::Let { .. }
            | NodeKind::FunctionDecl(_)
    )
}

/// `value` as an i32 if it is one exactly; negative zero is not.
fn exact_int(value: f64) -> Option<i32> {
    let int = value as i32;
    (f64::from(int).to_bits() == value.to_bits()).then_some(int)
}

fn unary_opcode(op: UnaryOp) -> Opcode {
    match op {
        UnaryOp::Not => Opcode::Not,
        UnaryOp::BitNot => Opcode::BitNot,
        UnaryOp::Neg => Opcode::Neg,
        UnaryOp::Pos => Opcode::Pos,
        UnaryOp::TypeOf => Opcode::TypeOf,
        UnaryOp::Void => Opcode::Void,
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::BitXor => Opcode::BitXor,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::Lsh => Opcode::Lsh,
        BinaryOp::Rsh => Opcode::Rsh,
        BinaryOp::Ursh => Opcode::Ursh,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::StrictEq => Opcode::StrictEq,
        BinaryOp::StrictNe => Opcode::StrictNe,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::In => Opcode::In,
        BinaryOp::InstanceOf => Opcode::InstanceOf,
    }
}
