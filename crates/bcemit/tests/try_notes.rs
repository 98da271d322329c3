//! Exception regions: inner regions are recorded first, and regions follow
//! the code when jumps in front of them widen.

mod common;

use bcemit::{Ast, CatchClause, NodeId, NodeKind, Opcode, TryNote, TryNoteKind};
use common::{compile, ops};
use pretty_assertions::assert_eq;

fn catch(param: &str, body: Vec<NodeId>) -> Option<CatchClause> {
    Some(CatchClause {
        param: param.into(),
        body,
    })
}

fn call_stmt(ast: &mut Ast, name: &str) -> NodeId {
    let call = ast.call_name(name, vec![]);
    ast.expr_stmt(call)
}

/// `x = 1;` repeated `count` times: five bytes of code each.
fn filler(ast: &mut Ast, count: usize) -> Vec<NodeId> {
    (0..count)
        .map(|_| {
            let x = ast.name("x");
            let one = ast.number(1.0);
            let assign = ast.assign(x, one);
            ast.expr_stmt(assign)
        })
        .collect()
}

/// `try { a(); } catch (e) { try { b(); } catch (f) {} }`
#[test]
fn nested_regions_are_recorded_inner_first() {
    let mut ast = Ast::new();
    let a = call_stmt(&mut ast, "a");
    let b = call_stmt(&mut ast, "b");
    let inner = ast.try_stmt(vec![b], catch("f", vec![]), None);
    let outer = ast.try_stmt(vec![a], catch("e", vec![inner]), None);
    ast.push(outer);

    let script = compile(&ast);
    assert_eq!(
        script.try_notes(),
        &[
            // the catch parameter `e` occupies one slot under the inner try
            TryNote {
                kind: TryNoteKind::Catch,
                stack_depth: 1,
                start: 19,
                length: 10,
            },
            TryNote {
                kind: TryNoteKind::Catch,
                stack_depth: 0,
                start: 1,
                length: 10,
            },
        ]
    );
    assert_eq!(script.code()[18], Opcode::Try as u8);
    assert_eq!(script.code()[29], Opcode::EnterBlock as u8);

    // both ends of each try block jump past its catch
    assert_eq!(script.jump_target(26), Some(43));
    assert_eq!(script.jump_target(39), Some(43));
    assert_eq!(script.jump_target(8), Some(50));
    assert_eq!(script.jump_target(46), Some(50));
    assert_eq!(script.max_stack_depth(), 3);
}

/// `try { a(); } catch (e) { <35000 bytes> }`
#[test]
fn regions_follow_widened_jumps() {
    let mut ast = Ast::new();
    let a = call_stmt(&mut ast, "a");
    let body = filler(&mut ast, 7000);
    let stmt = ast.try_stmt(vec![a], catch("e", body), None);
    ast.push(stmt);

    let script = compile(&ast);
    assert_eq!(&ops(&script)[..6], &[Opcode::Try, Opcode::Name, Opcode::Call, Opcode::SetRval, Opcode::GotoX, Opcode::EnterBlock]);

    let [note] = script.try_notes() else {
        panic!("expected one try note, got {:?}", script.try_notes());
    };
    assert_eq!((note.kind, note.start, note.end()), (TryNoteKind::Catch, 1, 13));
    assert_eq!(script.code()[13], Opcode::EnterBlock as u8);
    assert_eq!(script.jump_target(8), Some(script.code().len() - 1));
}

/// `try { if (c) { <35000 bytes> } try { a(); } catch (f) {} } catch (e) {}`
#[test]
fn nested_regions_move_past_a_widened_branch() {
    let mut ast = Ast::new();
    let cond = ast.name("c");
    let body = filler(&mut ast, 7000);
    let block = ast.block(body);
    let branch = ast.if_else(cond, block, None);
    let a = call_stmt(&mut ast, "a");
    let inner = ast.try_stmt(vec![a], catch("f", vec![]), None);
    let outer = ast.try_stmt(vec![branch, inner], catch("e", vec![]), None);
    ast.push(outer);

    let script = compile(&ast);
    let code = script.code();
    assert_eq!(code[4], Opcode::IfEqX as u8);
    assert_eq!(script.jump_target(4), Some(35_009));

    let [inner, outer] = script.try_notes() else {
        panic!("expected two try notes, got {:?}", script.try_notes());
    };
    // the inner region sits wholly past the growth, the outer one spans it
    assert_eq!((inner.kind, inner.stack_depth, inner.start, inner.length), (TryNoteKind::Catch, 0, 35_010, 10));
    assert_eq!((outer.kind, outer.stack_depth, outer.start, outer.length), (TryNoteKind::Catch, 0, 1, 35_036));
    for note in [inner, outer] {
        assert_eq!(code[note.start as usize - 1], Opcode::Try as u8);
        assert_eq!(code[note.end() as usize], Opcode::EnterBlock as u8);
    }

    // both ends of the inner try still skip to the outer try's exit jump
    assert_eq!(script.jump_target(35_017), Some(35_034));
    assert_eq!(script.jump_target(35_030), Some(35_034));
    assert_eq!(script.jump_target(35_034), Some(code.len() - 1));
}

/// `for (x in o) f();`
#[test]
fn for_in_loops_cover_their_iterator() {
    let mut ast = Ast::new();
    let target = ast.name("x");
    let object = ast.name("o");
    let body = call_stmt(&mut ast, "f");
    let stmt = ast.add(NodeKind::ForIn {
        declare: false,
        target,
        object,
        body,
    });
    ast.push(stmt);

    let script = compile(&ast);
    let next = script.instructions().find(|insn| insn.op == Opcode::IterNext).unwrap().pc;
    let end = script.instructions().find(|insn| insn.op == Opcode::EndIter).unwrap().pc;
    assert_eq!((next, end), (8, 24));
    assert_eq!(
        script.try_notes(),
        &[TryNote {
            kind: TryNoteKind::Iter,
            stack_depth: 1,
            start: 8,
            length: 16,
        }]
    );
    // the loop test jumps back to the `iternext`
    assert_eq!(script.jump_target(21), Some(next));
    assert_eq!(script.max_stack_depth(), 2);
}

/// `try { a(); } finally { b(); }`
#[test]
fn finally_regions_end_at_the_subroutine() {
    let mut ast = Ast::new();
    let a = call_stmt(&mut ast, "a");
    let b = call_stmt(&mut ast, "b");
    let stmt = ast.try_stmt(vec![a], None, Some(vec![b]));
    ast.push(stmt);

    let script = compile(&ast);
    let finally = script.instructions().find(|insn| insn.op == Opcode::Finally).unwrap().pc;
    assert_eq!(finally, 14);
    assert_eq!(
        script.try_notes(),
        &[TryNote {
            kind: TryNoteKind::Finally,
            stack_depth: 0,
            start: 1,
            length: 13,
        }]
    );
    assert_eq!(script.code()[8], Opcode::Gosub as u8);
    assert_eq!(script.jump_target(8), Some(finally));
}

/// Regions keep their field names when handed to external tooling as JSON.
#[test]
fn regions_serialize_by_name() {
    let mut ast = Ast::new();
    let a = call_stmt(&mut ast, "a");
    let stmt = ast.try_stmt(vec![a], catch("e", vec![]), None);
    ast.push(stmt);

    let script = compile(&ast);
    let json = serde_json::to_value(script.try_notes()).unwrap();
    assert_eq!(
        json,
        serde_json::json!([{ "kind": "Catch", "stack_depth": 0, "start": 1, "length": 10 }])
    );
    let back: Vec<TryNote> = serde_json::from_value(json).unwrap();
    assert_eq!(back, script.try_notes());
}
