//! Source notes as a decompiler or debugger reads them back.

mod common;

use bcemit::{Ast, NodeId, NodeKind, Opcode, SrcNoteType};
use common::{compile, ops};
use pretty_assertions::assert_eq;

fn assign_stmt(ast: &mut Ast, name: &str) -> NodeId {
    let target = ast.name(name);
    let one = ast.number(1.0);
    let assign = ast.assign(target, one);
    ast.expr_stmt(assign)
}

#[test]
fn line_changes_pick_the_shorter_encoding() {
    let mut ast = Ast::new();
    for line in [1, 126, 128, 127] {
        ast.set_line(line);
        let stmt = assign_stmt(&mut ast, "x");
        ast.push(stmt);
    }

    let script = compile(&ast);
    // two newlines are cheaper than a four-byte setline past line 127
    assert_eq!(script.note_offsets(SrcNoteType::Newline), vec![10, 10]);
    // moving backward always resets the line
    assert_eq!(script.note_offsets(SrcNoteType::SetLine), vec![5, 15]);
    let lines: Vec<_> = [0, 4, 5, 9, 10, 15].map(|pc| script.line_for_pc(pc)).to_vec();
    assert_eq!(lines, vec![1, 1, 126, 126, 128, 127]);
}

/// `function g() {}` on line 1, then `x = 1;` on line 4.
#[test]
fn main_notes_count_from_the_start_of_the_prolog() {
    let mut ast = Ast::new();
    let decl = ast.function_decl("g", &[], vec![]);
    ast.push(decl);
    ast.set_line(4);
    let stmt = assign_stmt(&mut ast, "x");
    ast.push(stmt);

    let script = compile(&ast);
    assert_eq!(script.main_offset(), 3);
    assert_eq!(ops(&script), vec![Opcode::DefFun, Opcode::One, Opcode::SetName, Opcode::SetRval, Opcode::Stop]);
    assert_eq!(script.note_offsets(SrcNoteType::FuncDef), vec![0]);
    assert_eq!(script.note_offsets(SrcNoteType::SetLine), vec![3]);
    assert_eq!(script.line_for_pc(0), 1);
    assert_eq!(script.line_for_pc(3), 4);
    assert_eq!(script.functions().len(), 1);
}

/// `while (a) f();` and `do f(); while (a);`
#[test]
fn loop_notes_measure_to_the_backward_branch() {
    let mut ast = Ast::new();
    let cond = ast.name("a");
    let call = ast.call_name("f", vec![]);
    let body = ast.expr_stmt(call);
    let stmt = ast.while_loop(cond, body);
    ast.push(stmt);

    let script = compile(&ast);
    let note = script.src_notes().find(|note| note.ty == SrcNoteType::While).unwrap();
    assert_eq!(note.delta, 0);
    assert_eq!(note.operands.to_vec(), vec![13]);
    assert_eq!(script.code()[13], Opcode::IfNe as u8);

    let mut ast = Ast::new();
    let call = ast.call_name("f", vec![]);
    let body = ast.expr_stmt(call);
    let cond = ast.name("a");
    let stmt = ast.add(NodeKind::DoWhile { body, cond });
    ast.push(stmt);

    let script = compile(&ast);
    assert_eq!(&ops(&script)[..2], &[Opcode::Nop, Opcode::Name]);
    let note = script.src_notes().find(|note| note.ty == SrcNoteType::While).unwrap();
    // from the nop to the condition
    assert_eq!(note.operands.to_vec(), vec![8]);
    assert_eq!(script.jump_target(11), Some(1));
}

/// `a, b, c;`
#[test]
fn comma_expressions_note_each_pop() {
    let mut ast = Ast::new();
    let exprs = ["a", "b", "c"].map(|name| ast.name(name)).to_vec();
    let comma = ast.add(NodeKind::Comma(exprs));
    let stmt = ast.expr_stmt(comma);
    ast.push(stmt);

    let script = compile(&ast);
    assert_eq!(script.note_offsets(SrcNoteType::PcDelta), vec![3, 7]);
    let deltas: Vec<_> = script
        .src_notes()
        .filter(|note| note.ty == SrcNoteType::PcDelta)
        .map(|note| note.operands[0])
        .collect();
    assert_eq!(deltas, vec![4, 4]);
    assert_eq!(script.max_stack_depth(), 1);
}
