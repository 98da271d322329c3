//! The nesting budget across function boundaries.

mod common;

use bcemit::{Ast, EmitError, EmitLimits, Opcode, Script, UnaryOp, compile_script};
use common::{compile, ops};
use pretty_assertions::assert_eq;

/// `function f0() { function f1() { ... } }`, `count` deep.
fn nested_functions(count: usize) -> Ast {
    let mut ast = Ast::new();
    let mut body = Vec::new();
    for i in (0..count).rev() {
        let decl = ast.function_decl(&format!("f{i}"), &[], body);
        body = vec![decl];
    }
    for stmt in body {
        ast.push(stmt);
    }
    ast
}

fn compile_with_limit(ast: &Ast, limit: usize) -> Result<Script, EmitError> {
    common::init_test_logging();
    compile_script(ast, "nested.js", EmitLimits::new().max_recursion_depth(Some(limit)))
}

#[test]
fn nested_functions_share_the_budget() {
    let err = compile_with_limit(&nested_functions(11), 10).unwrap_err();
    assert_eq!(err, EmitError::TooMuchRecursion { limit: 10, depth: 11 });
}

#[test]
fn nesting_up_to_the_limit_compiles() {
    let script = compile_with_limit(&nested_functions(10), 10).unwrap();
    let mut depth = 0;
    let mut unit = &script;
    while let [inner] = unit.functions() {
        assert_eq!(ops(unit), vec![Opcode::DefFun, Opcode::Stop]);
        unit = inner;
        depth += 1;
    }
    assert_eq!(depth, 10);
    assert_eq!(ops(unit), vec![Opcode::Stop]);
}

/// Sibling statements each start again from the top level.
#[test]
fn siblings_do_not_accumulate_depth() {
    let mut ast = Ast::new();
    for _ in 0..100 {
        let one = ast.number(1.0);
        let neg = ast.unary(UnaryOp::Neg, one);
        let twice = ast.unary(UnaryOp::Neg, neg);
        let stmt = ast.expr_stmt(twice);
        ast.push(stmt);
    }
    assert!(compile_with_limit(&ast, 4).is_ok());
    assert!(matches!(compile_with_limit(&ast, 3), Err(EmitError::TooMuchRecursion { limit: 3, depth: 4 })));

    let script = compile(&ast);
    assert_eq!(ops(&script).len(), 100 * 4 + 1);
}
