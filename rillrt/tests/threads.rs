use rillc::{compile, parse};
use rillrt::{Value, Vm};

fn run(source: &str) -> Result<Value, rillrt::RuntimeError> {
    let statements = parse(source).expect("parse");
    let program = compile(&statements).expect("compile");
    let mut vm = Vm::new(false, false);
    vm.interpret(&program)
}

fn run_value(source: &str) -> Value {
    run(source).expect("run")
}

#[test]
fn spawn_and_join_returns_the_thread_value() {
    let value = run_value(
        "let h = spawn { return 2 + 3; };\n\
         return h.join();",
    );
    assert_eq!(value, Value::Int(5));
}

#[test]
fn join_on_an_already_finished_thread_returns_immediately() {
    let value = run_value(
        "let h = spawn { return 9; };\n\
         sleep(5);\n\
         return h.join();",
    );
    assert_eq!(value, Value::Int(9));
}

#[test]
fn spawn_count_yields_an_array_of_handles() {
    let value = run_value(
        "let hs = spawn 3 { return 5; };\n\
         let total = 0;\n\
         for (let i = 0; i < 3; i = i + 1) {\n\
             total = total + hs[i].join();\n\
         }\n\
         return total;",
    );
    assert_eq!(value, Value::Int(15));
}

#[test]
fn spawned_threads_interleave_with_sleep() {
    let value = run_value(
        "let order = [];\n\
         let slow = spawn { sleep(20); order.push(2); return 0; };\n\
         let fast = spawn { order.push(1); return 0; };\n\
         slow.join();\n\
         fast.join();\n\
         return order[0] * 10 + order[1];",
    );
    assert_eq!(value, Value::Int(12));
}

#[test]
fn thread_id_is_zero_on_the_main_thread() {
    assert_eq!(run_value("return thread_id();"), Value::Int(0));
}

#[test]
fn spawned_threads_get_distinct_ids() {
    let value = run_value(
        "let a = spawn { return thread_id(); };\n\
         let b = spawn { return thread_id(); };\n\
         return a.join() != b.join();",
    );
    assert_eq!(value, Value::Bool(true));
}

#[test]
fn spawn_block_captures_enclosing_locals() {
    let value = run_value(
        "fn f() {\n\
             let x = 5;\n\
             let h = spawn { return x; };\n\
             return h.join();\n\
         }\n\
         return f();",
    );
    assert_eq!(value, Value::Int(5));
}

#[test]
fn threads_communicate_through_globals() {
    let value = run_value(
        "let flag = 0;\n\
         let h = spawn { flag = 1; return 0; };\n\
         h.join();\n\
         return flag;",
    );
    assert_eq!(value, Value::Int(1));
}

#[test]
fn main_exit_cancels_sleeping_children() {
    // the child would sleep for a minute; cancellation on main exit must
    // end the program immediately
    let value = run_value(
        "spawn { sleep(60000); return 0; };\n\
         return 3;",
    );
    assert_eq!(value, Value::Int(3));
}

#[test]
fn blocked_threads_with_no_waker_are_a_deadlock_error() {
    let result = run(
        "let ch = pipe(0);\n\
         return <-ch;",
    );
    assert!(result.is_err());
}

#[test]
fn sleep_zero_yields_without_blocking() {
    let value = run_value(
        "let h = spawn { return 1; };\n\
         sleep(0);\n\
         return h.join() + 1;",
    );
    assert_eq!(value, Value::Int(2));
}
