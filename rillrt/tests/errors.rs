use rillc::{compile, parse};
use rillrt::{Value, Vm};

fn run(source: &str) -> Result<Value, rillrt::RuntimeError> {
    let statements = parse(source).expect("parse");
    let program = compile(&statements).expect("compile");
    let mut vm = Vm::new(false, false);
    vm.interpret(&program)
}

fn expect_error(source: &str, needle: &str) {
    let err = run(source).expect_err("expected a runtime error");
    assert!(
        err.message.contains(needle),
        "error {:?} does not mention {:?}",
        err.message,
        needle
    );
}

#[test]
fn undefined_global_variable() {
    expect_error("return missing;", "Undefined global variable");
}

#[test]
fn arity_mismatch_on_closures_and_natives() {
    expect_error("fn f(a) { return a; } f(1, 2);", "Expected 1 arguments");
    expect_error("len(1, 2);", "expected 1 arguments");
}

#[test]
fn division_and_modulo_by_zero() {
    expect_error("let a = 1; let b = 0; return a / b;", "Division by zero");
    expect_error("let a = 1; let b = 0; return a % b;", "Modulo by zero");
    // literal folding must not hide the runtime error
    expect_error("return 1 / 0;", "Division by zero");
}

#[test]
fn type_mismatches() {
    expect_error("return 1 - \"x\";", "Unsupported types");
    expect_error("return 1.5 % 2;", "Unsupported types");
    expect_error("return 1 & 2.0;", "Unsupported types");
}

#[test]
fn index_errors() {
    expect_error("let a = [1]; return a[3];", "Index out of range");
    expect_error("let a = [1]; return a[0 - 1];", "Index out of range");
    expect_error("let o = {a: 1}; return o[\"b\"];", "Undefined key");
    expect_error("return 5[0];", "Cannot index");
}

#[test]
fn invalid_call_targets() {
    expect_error("let x = 1; x();", "Can only call functions");
    expect_error("\"s\"();", "Can only call functions");
}

#[test]
fn undefined_properties() {
    expect_error("let o = {a: 1}; return o.b;", "Undefined property");
    expect_error(
        "struct P { fn init() { self.x = 1; } } return P().y;",
        "Undefined property",
    );
}

#[test]
fn unknown_string_method() {
    expect_error("return \"s\".frobnicate();", "Undefined method");
}

#[test]
fn runtime_errors_carry_a_backtrace() {
    let err = run("fn inner() { return 1 / 0; }\nfn outer() { return inner(); }\nreturn outer();")
        .expect_err("expected a runtime error");
    assert_eq!(err.message, "Division by zero");
    let functions: Vec<&str> = err.frames.iter().map(|f| f.function.as_str()).collect();
    assert!(functions.contains(&"inner"));
    assert!(functions.contains(&"outer"));
}

#[test]
fn error_in_a_child_thread_does_not_abort_main() {
    let value = run(
        "let trip = 0;\n\
         let h = spawn { let z = 0; return 1 / z; };\n\
         h.join();\n\
         return 5;",
    )
    .expect("main should survive a child error");
    assert_eq!(value, Value::Int(5));
}

#[test]
fn error_in_main_aborts_the_run() {
    expect_error(
        "spawn { sleep(1); return 0; };\nlet z = 0;\nreturn 1 / z;",
        "Division by zero",
    );
}

#[test]
fn stack_depth_is_bounded() {
    expect_error(
        "fn loop_forever() { return loop_forever(); }\nloop_forever();",
        "overflow",
    );
}
