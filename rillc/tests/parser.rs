use rillc::ast::{Expr, SelectClause, Stmt};
use rillc::parser::parse;

#[test]
fn parses_declarations_and_statements() {
    let statements = parse(
        "let x = 1;\n\
         fn add(a, b) { return a + b; }\n\
         struct P { fn init(v) { self.v = v; } }\n\
         disp add(x, 2);",
    )
    .expect("parse");
    assert_eq!(statements.len(), 4);
}

#[test]
fn missing_semicolon_is_reported() {
    let errors = parse("let x = 1").expect_err("should fail");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("';'"));
}

#[test]
fn recovers_at_statement_boundaries_and_reports_all_errors() {
    let errors = parse(
        "let = 1;\n\
         let ok = 2;\n\
         disp ;\n",
    )
    .expect_err("should fail");
    assert!(errors.len() >= 2);
}

#[test]
fn for_desugars_to_a_while_loop() {
    let statements = parse("for (let i = 0; i < 3; i = i + 1) { disp i; }").expect("parse");
    assert_eq!(statements.len(), 1);
    match &statements[0] {
        Stmt::Block(items) => {
            assert!(matches!(items[0], Stmt::Let { .. }));
            assert!(matches!(items[1], Stmt::While { .. }));
        }
        other => panic!("expected a block, got {:?}", other),
    }
}

#[test]
fn for_clauses_are_optional() {
    let statements = parse("for (;;) { break_out(); }").expect("parse");
    match &statements[0] {
        Stmt::While { cond, .. } => {
            assert!(matches!(cond, Expr::Literal(_)));
        }
        other => panic!("expected a while loop, got {:?}", other),
    }
}

#[test]
fn parses_pipe_operators() {
    let statements = parse("ch <- 1;\nlet v = <-ch;").expect("parse");
    assert!(matches!(&statements[0], Stmt::Expr(Expr::Send { .. })));
    match &statements[1] {
        Stmt::Let { init: Some(Expr::Recv(_)), .. } => {}
        other => panic!("expected a receive initializer, got {:?}", other),
    }
}

#[test]
fn parses_select_clause_forms() {
    let statements = parse(
        "select {\n\
             v <- a => disp v;\n\
             <- b => disp 0;\n\
             default => disp 1;\n\
         }",
    )
    .expect("parse");
    match &statements[0] {
        Stmt::Select { clauses, .. } => {
            assert_eq!(clauses.len(), 3);
            assert!(matches!(clauses[0], SelectClause::Arrow { .. }));
            assert!(matches!(clauses[1], SelectClause::Discard { .. }));
            assert!(matches!(clauses[2], SelectClause::Default { .. }));
        }
        other => panic!("expected select, got {:?}", other),
    }
}

#[test]
fn parses_spawn_with_and_without_count() {
    let statements = parse("spawn { disp 1; };\nspawn 4 { disp 2; };").expect("parse");
    match &statements[0] {
        Stmt::Expr(Expr::Spawn { count: None, .. }) => {}
        other => panic!("expected spawn, got {:?}", other),
    }
    match &statements[1] {
        Stmt::Expr(Expr::Spawn { count: Some(_), .. }) => {}
        other => panic!("expected counted spawn, got {:?}", other),
    }
}

#[test]
fn parses_lambda_forms() {
    let statements =
        parse("let f = fn(x) -> x + 1;\nlet g = fn() { return 2; };\nlet h = fn() -> { disp 3; };")
            .expect("parse");
    for stmt in &statements {
        match stmt {
            Stmt::Let { init: Some(Expr::Lambda { .. }), .. } => {}
            other => panic!("expected lambda initializer, got {:?}", other),
        }
    }
}

#[test]
fn rejects_invalid_assignment_targets() {
    assert!(parse("1 = 2;").is_err());
    assert!(parse("f() = 2;").is_err());
}

#[test]
fn parses_close_statement() {
    let statements = parse("close(ch);").expect("parse");
    assert!(matches!(&statements[0], Stmt::Close(_)));
}

#[test]
fn rejects_lexical_errors() {
    assert!(parse("let s = \"unterminated;").is_err());
    assert!(parse("let x = 1 @ 2;").is_err());
}

#[test]
fn ternary_and_compound_assignment_nest() {
    let statements = parse("x += a > b ? 1 : 2;").expect("parse");
    match &statements[0] {
        Stmt::Expr(Expr::Assign { value, .. }) => {
            assert!(matches!(**value, Expr::Ternary { .. }));
        }
        other => panic!("expected assignment, got {:?}", other),
    }
}
