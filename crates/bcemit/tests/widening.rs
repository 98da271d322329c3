//! Jump widening end to end: spans that outgrow 16 bits get wide opcodes
//! whose decoded targets still land on the right instruction.

mod common;

use bcemit::{Ast, Case, CaseKey, CodeGenerator, EmitLimits, NodeId, NodeKind, Opcode, Script, SrcNoteType};
use common::{compile, ops};
use pretty_assertions::assert_eq;

/// `x = 1;` repeated `count` times: five bytes of code each.
fn filler(ast: &mut Ast, count: usize) -> Vec<NodeId> {
    (0..count)
        .map(|_| {
            let target = ast.name("x");
            let one = ast.number(1.0);
            let assign = ast.assign(target, one);
            ast.expr_stmt(assign)
        })
        .collect()
}

/// Offset of the first `name` instruction that loads `name`.
fn name_pc(script: &Script, name: &str) -> usize {
    let code = script.code();
    script
        .instructions()
        .filter(|insn| insn.op == Opcode::Name)
        .find(|insn| {
            let index = u16::from_le_bytes([code[insn.pc + 1], code[insn.pc + 2]]);
            script.atoms()[usize::from(index)].as_str() == Some(name)
        })
        .map(|insn| insn.pc)
        .expect("name is loaded somewhere")
}

/// Code offset and operands of every note of type `ty`.
fn notes_of(script: &Script, ty: SrcNoteType) -> Vec<(usize, Vec<usize>)> {
    let mut pc = 0;
    let mut found = Vec::new();
    for note in script.src_notes() {
        pc += note.delta;
        if note.ty == ty {
            found.push((pc, note.operands.to_vec()));
        }
    }
    found
}

fn generator() -> CodeGenerator {
    common::init_test_logging();
    CodeGenerator::new("edge.js", 1, EmitLimits::default())
}

fn forward_jump_over(nops: usize) -> Script {
    let mut cg = generator();
    let jump = cg.begin_jump(Opcode::Goto).unwrap();
    for _ in 0..nops {
        cg.emit(Opcode::Nop).unwrap();
    }
    cg.patch_jump_here(jump).unwrap();
    cg.emit(Opcode::Stop).unwrap();
    cg.finish().unwrap()
}

fn backward_jump_over(nops: usize) -> Script {
    let mut cg = generator();
    for _ in 0..nops {
        cg.emit(Opcode::Nop).unwrap();
    }
    cg.emit_jump_to(Opcode::Goto, 0).unwrap();
    cg.emit(Opcode::Stop).unwrap();
    cg.finish().unwrap()
}

/// `if (false) { <35000 bytes> } after();`
#[test]
fn far_conditional_branch_lands_on_the_following_statement() {
    let mut ast = Ast::new();
    let cond = ast.boolean(false);
    let body = filler(&mut ast, 7000);
    let block = ast.block(body);
    let stmt = ast.if_else(cond, block, None);
    ast.push(stmt);
    let call = ast.call_name("after", vec![]);
    let after = ast.expr_stmt(call);
    ast.push(after);

    let script = compile(&ast);
    let ops = ops(&script);
    assert_eq!(&ops[..2], &[Opcode::False, Opcode::IfEqX]);
    assert_eq!(&ops[ops.len() - 4..], &[Opcode::Name, Opcode::Call, Opcode::SetRval, Opcode::Stop]);

    let after_pc = name_pc(&script, "after");
    assert_eq!(after_pc, 1 + 5 + 7000 * 5);
    assert_eq!(script.jump_target(1), Some(after_pc));
    assert!(script.warnings().is_empty());
}

#[test]
fn forward_span_at_the_short_limit_stays_narrow() {
    let script = forward_jump_over(32_764);
    assert_eq!(script.code()[0], Opcode::Goto as u8);
    assert_eq!(script.jump_target(0), Some(32_767));
    assert_eq!(script.code().len(), 32_768);
}

#[test]
fn forward_span_one_past_the_short_limit_is_widened() {
    let script = forward_jump_over(32_765);
    assert_eq!(script.code()[0], Opcode::GotoX as u8);
    // two bytes of growth move the target along
    assert_eq!(script.jump_target(0), Some(32_770));
    assert_eq!(script.code()[32_770], Opcode::Stop as u8);
}

#[test]
fn backward_span_boundary() {
    let narrow = backward_jump_over(32_768);
    assert_eq!(narrow.code()[32_768], Opcode::Goto as u8);
    assert_eq!(narrow.jump_target(32_768), Some(0));

    let wide = backward_jump_over(32_769);
    assert_eq!(wide.code()[32_769], Opcode::GotoX as u8);
    assert_eq!(wide.jump_target(32_769), Some(0));
    assert_eq!(wide.code()[32_769 + 5], Opcode::Stop as u8);
}

#[test]
fn resolving_an_already_resolved_unit_changes_nothing() {
    let mut cg = generator();
    let jump = cg.begin_jump(Opcode::Goto).unwrap();
    for _ in 0..40_000 {
        cg.emit(Opcode::Nop).unwrap();
    }
    cg.patch_jump_here(jump).unwrap();
    cg.resolve_span_deps().unwrap();
    let first = cg.code().to_vec();
    assert_eq!(first[0], Opcode::GotoX as u8);
    assert_eq!(first.len(), 40_005);

    cg.resolve_span_deps().unwrap();
    assert_eq!(cg.code(), first.as_slice());
}

/// `switch (s) { case 0: <35000 bytes> break; case 1: g(); }`
#[test]
fn switch_tables_widen_with_their_cases() {
    let mut ast = Ast::new();
    let discriminant = ast.name("s");
    let zero = ast.number(0.0);
    let one = ast.number(1.0);
    let mut big = filler(&mut ast, 7000);
    big.push(ast.break_stmt(None));
    let call = ast.call_name("g", vec![]);
    let small = ast.expr_stmt(call);
    let cases = vec![
        Case {
            test: Some(zero),
            body: big,
        },
        Case {
            test: Some(one),
            body: vec![small],
        },
    ];
    let stmt = ast.switch(discriminant, cases);
    ast.push(stmt);

    let script = compile(&ast);
    assert_eq!(script.code()[3], Opcode::TableSwitchX as u8);
    let switch = script.switch_targets(3).unwrap();
    let stop = script.code().len() - 1;
    assert_eq!(switch.default, stop);
    let targets: Vec<_> = switch.cases.iter().map(|case| (case.key, case.target)).collect();
    // opcode, wide default, low, high and two wide arms
    let first_case = 3 + 1 + 4 + 2 + 2 + 2 * 4;
    assert_eq!(targets, vec![(CaseKey::Int(0), first_case), (CaseKey::Int(1), name_pc(&script, "g"))]);

    // the break only hops over the second case
    let brk = name_pc(&script, "g") - 3;
    assert_eq!(script.code()[brk], Opcode::Goto as u8);
    assert_eq!(script.jump_target(brk), Some(stop));
}

/// A loop whose body outgrows 16 bits widens both the entry jump and the
/// backward branch, and a `continue` inside still finds the condition.
#[test]
fn long_loops_widen_in_both_directions() {
    let mut ast = Ast::new();
    let cond = ast.name("more");
    let mut body = filler(&mut ast, 7000);
    let flag = ast.name("skip");
    let cont = ast.continue_stmt(None);
    body.insert(0, ast.if_else(flag, cont, None));
    let block = ast.block(body);
    let stmt = ast.while_loop(cond, block);
    ast.push(stmt);

    let script = compile(&ast);
    let ops = ops(&script);
    assert_eq!(ops[0], Opcode::GotoX);
    assert_eq!(ops[ops.len() - 2], Opcode::IfNeX);

    let cond_pc = name_pc(&script, "more");
    assert_eq!(script.jump_target(0), Some(cond_pc));
    let back = script.instructions().find(|insn| insn.op == Opcode::IfNeX).unwrap().pc;
    assert_eq!(script.jump_target(back), Some(5));

    // `continue` restarts at the loop's entry jump
    let skip = name_pc(&script, "skip");
    let ifeq = skip + 3;
    let cont = ifeq + 3;
    assert_eq!(script.code()[cont], Opcode::Goto as u8);
    assert_eq!(script.jump_target(cont), Some(0));
    assert_eq!(script.jump_target(ifeq), Some(cont + 3));
}

/// `if (c) { <35000 bytes> } else { g(); }`
#[test]
fn if_else_note_still_finds_the_jump_over_the_else_part() {
    let mut ast = Ast::new();
    let cond = ast.name("c");
    let body = filler(&mut ast, 7000);
    let then = ast.block(body);
    let call = ast.call_name("g", vec![]);
    let otherwise = ast.expr_stmt(call);
    let stmt = ast.if_else(cond, then, Some(otherwise));
    ast.push(stmt);

    let script = compile(&ast);
    let code = script.code();
    assert_eq!(code[3], Opcode::IfEqX as u8);
    let else_pc = name_pc(&script, "g");
    assert_eq!(else_pc, 3 + 5 + 7000 * 5 + 3);
    assert_eq!(script.jump_target(3), Some(else_pc));

    let notes = notes_of(&script, SrcNoteType::IfElse);
    assert_eq!(notes, vec![(3, vec![35_005])]);
    let goto = notes[0].0 + notes[0].1[0];
    assert_eq!(code[goto], Opcode::Goto as u8);
    assert_eq!(goto + 3, else_pc);
    assert_eq!(script.jump_target(goto), Some(code.len() - 1));
}

/// `while (more) { <35000 bytes> }`
#[test]
fn while_note_reaches_the_widened_loop_branch() {
    let mut ast = Ast::new();
    let cond = ast.name("more");
    let body = filler(&mut ast, 7000);
    let block = ast.block(body);
    let stmt = ast.while_loop(cond, block);
    ast.push(stmt);

    let script = compile(&ast);
    let code = script.code();
    let notes = notes_of(&script, SrcNoteType::While);
    assert_eq!(notes, vec![(0, vec![35_008])]);
    let branch = notes[0].1[0];
    assert_eq!(code[branch], Opcode::IfNeX as u8);
    assert_eq!(script.jump_target(branch), Some(5));
    assert_eq!(script.jump_target(0), Some(name_pc(&script, "more")));
}

/// `switch (s) { case a: <35000 bytes> break; case b: g(); break; default: h(); }`
#[test]
fn case_by_case_switch_widens_its_case_and_default_jumps() {
    let mut ast = Ast::new();
    let discriminant = ast.name("s");
    let a = ast.name("a");
    let b = ast.name("b");
    let mut big = filler(&mut ast, 7000);
    big.push(ast.break_stmt(None));
    let call = ast.call_name("g", vec![]);
    let g = ast.expr_stmt(call);
    let brk = ast.break_stmt(None);
    let call = ast.call_name("h", vec![]);
    let h = ast.expr_stmt(call);
    let cases = vec![
        Case {
            test: Some(a),
            body: big,
        },
        Case {
            test: Some(b),
            body: vec![g, brk],
        },
        Case { test: None, body: vec![h] },
    ];
    let stmt = ast.switch(discriminant, cases);
    ast.push(stmt);

    let script = compile(&ast);
    let code = script.code();
    assert_eq!(
        &ops(&script)[..7],
        &[Opcode::Name, Opcode::CondSwitch, Opcode::Name, Opcode::Case, Opcode::Name, Opcode::CaseX, Opcode::DefaultX]
    );
    let stop = code.len() - 1;
    let g_pc = name_pc(&script, "g");
    let h_pc = name_pc(&script, "h");
    assert_eq!((g_pc, h_pc, stop), (35_026, 35_036, 35_043));

    // the first body starts right after the wide default
    assert_eq!(script.jump_target(7), Some(23));
    assert_eq!(script.jump_target(13), Some(g_pc));
    assert_eq!(script.jump_target(18), Some(h_pc));
    assert_eq!(script.jump_target(g_pc - 3), Some(stop));
    assert_eq!(script.jump_target(h_pc - 3), Some(stop));

    // length of the whole switch, then the first case test
    let switch = notes_of(&script, SrcNoteType::Switch);
    assert_eq!(switch, vec![(3, vec![35_040, 4])]);
    assert_eq!(3 + switch[0].1[0], stop);
    assert_eq!(code[3 + switch[0].1[1]], Opcode::Case as u8);

    // each case note measures to the next case test
    let cases = notes_of(&script, SrcNoteType::PcDelta);
    assert_eq!(cases, vec![(7, vec![6]), (13, vec![5])]);
    assert_eq!(code[7 + 6], Opcode::CaseX as u8);
    assert_eq!(code[13 + 5], Opcode::DefaultX as u8);
}

/// `switch (s) { case "a": <35000 bytes> break; case "b": g(); }`
#[test]
fn lookup_switch_widens_every_entry() {
    let mut ast = Ast::new();
    let discriminant = ast.name("s");
    let a = ast.string("a");
    let b = ast.string("b");
    let mut big = filler(&mut ast, 7000);
    big.push(ast.break_stmt(None));
    let call = ast.call_name("g", vec![]);
    let small = ast.expr_stmt(call);
    let cases = vec![
        Case {
            test: Some(a),
            body: big,
        },
        Case {
            test: Some(b),
            body: vec![small],
        },
    ];
    let stmt = ast.switch(discriminant, cases);
    ast.push(stmt);

    let script = compile(&ast);
    assert_eq!(script.code()[3], Opcode::LookupSwitchX as u8);
    let switch = script.switch_targets(3).unwrap();
    let stop = script.code().len() - 1;
    assert_eq!(switch.default, stop);
    let targets: Vec<_> = switch
        .cases
        .iter()
        .map(|case| {
            let CaseKey::Literal(index) = case.key else {
                panic!("lookup keys are literal indexes");
            };
            (script.atoms()[usize::from(index)].as_str(), case.target)
        })
        .collect();
    // opcode, wide default, pair count and two pairs of index and wide offset
    let first_case = 3 + 1 + 4 + 2 + 2 * (2 + 4);
    assert_eq!(targets, vec![(Some("a"), first_case), (Some("b"), name_pc(&script, "g"))]);

    let brk = name_pc(&script, "g") - 3;
    assert_eq!(script.code()[brk], Opcode::Goto as u8);
    assert_eq!(script.jump_target(brk), Some(stop));
    assert_eq!(notes_of(&script, SrcNoteType::Switch), vec![(3, vec![stop - 3, 0])]);
}

/// `f(c ? (x = 1, x = 1, ...) : 0);` with a 35000-byte first arm.
#[test]
fn call_base_note_reaches_back_over_a_widened_argument() {
    let mut ast = Ast::new();
    let test = ast.name("c");
    let exprs = (0..7000)
        .map(|_| {
            let x = ast.name("x");
            let one = ast.number(1.0);
            ast.assign(x, one)
        })
        .collect();
    let then = ast.add(NodeKind::Comma(exprs));
    let zero = ast.number(0.0);
    let arg = ast.conditional(test, then, zero);
    let call = ast.call_name("f", vec![arg]);
    let stmt = ast.expr_stmt(call);
    ast.push(stmt);

    let script = compile(&ast);
    let code = script.code();
    assert_eq!(code[6], Opcode::IfEqX as u8);
    let call = script.instructions().find(|insn| insn.op == Opcode::Call).unwrap().pc;
    assert_eq!(call, 35_014);

    // measured back from the call to the callee load
    let base = notes_of(&script, SrcNoteType::PcBase);
    assert_eq!(base, vec![(call, vec![call])]);
    assert_eq!(call - base[0].1[0], name_pc(&script, "f"));

    let cond = notes_of(&script, SrcNoteType::Cond);
    assert_eq!(cond, vec![(6, vec![35_004])]);
    let goto = 6 + cond[0].1[0];
    assert_eq!(code[goto], Opcode::Goto as u8);
    assert_eq!(script.jump_target(6), Some(goto + 3));
    assert_eq!(script.jump_target(goto), Some(call));
}
