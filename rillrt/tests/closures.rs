use rillc::{compile, parse};
use rillrt::{Value, Vm};

fn run_value(source: &str) -> Value {
    let statements = parse(source).expect("parse");
    let program = compile(&statements).expect("compile");
    let mut vm = Vm::new(false, false);
    vm.interpret(&program).expect("run")
}

#[test]
fn counter_closure_keeps_state_across_calls() {
    let value = run_value(
        "fn mkc() {\n\
             let c = 0;\n\
             return fn() -> { c = c + 1; return c; };\n\
         }\n\
         let f = mkc();\n\
         let a = f();\n\
         let b = f();\n\
         let c = f();\n\
         return a * 100 + b * 10 + c;",
    );
    assert_eq!(value, Value::Int(123));
}

#[test]
fn two_closures_share_one_upvalue() {
    let value = run_value(
        "fn mk() {\n\
             let c = 0;\n\
             let inc = fn() -> { c = c + 1; return c; };\n\
             let get = fn() -> c;\n\
             return [inc, get];\n\
         }\n\
         let fns = mk();\n\
         fns[0]();\n\
         fns[0]();\n\
         return fns[1]();",
    );
    assert_eq!(value, Value::Int(2));
}

#[test]
fn block_exit_closes_captured_locals() {
    let value = run_value(
        "fn f() {\n\
             let g = null;\n\
             {\n\
                 let x = 10;\n\
                 g = fn() -> x;\n\
             }\n\
             return g();\n\
         }\n\
         return f();",
    );
    assert_eq!(value, Value::Int(10));
}

#[test]
fn capture_reaches_through_two_function_levels() {
    let value = run_value(
        "fn outer() {\n\
             let x = 7;\n\
             fn middle() {\n\
                 fn inner() { return x; }\n\
                 return inner;\n\
             }\n\
             return middle();\n\
         }\n\
         let f = outer();\n\
         return f();",
    );
    assert_eq!(value, Value::Int(7));
}

#[test]
fn independent_instances_do_not_share_state() {
    let value = run_value(
        "fn mkc() {\n\
             let c = 0;\n\
             return fn() -> { c = c + 1; return c; };\n\
         }\n\
         let f = mkc();\n\
         let g = mkc();\n\
         f();\n\
         f();\n\
         return g();",
    );
    assert_eq!(value, Value::Int(1));
}

#[test]
fn loop_variable_capture_sees_final_value() {
    // the loop variable is a single local captured by every closure
    let value = run_value(
        "fn f() {\n\
             let fns = [];\n\
             for (let i = 0; i < 3; i = i + 1) {\n\
                 fns.push(fn() -> i);\n\
             }\n\
             return fns[0]() + fns[1]() + fns[2]();\n\
         }\n\
         return f();",
    );
    assert_eq!(value, Value::Int(9));
}

#[test]
fn closure_passed_to_spawned_thread_still_reads_its_upvalue() {
    let value = run_value(
        "fn mk() {\n\
             let x = 21;\n\
             return fn() -> x * 2;\n\
         }\n\
         let f = mk();\n\
         let h = spawn { return f(); };\n\
         return h.join();",
    );
    assert_eq!(value, Value::Int(42));
}
