use rillc::{compile, parse};
use rillrt::object::array_value;
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
fn buffered_pipe_delivers_in_send_order() {
    let value = run_value(
        "let ch = pipe(1);\n\
         spawn { ch <- 7; ch <- 8; };\n\
         let a = <-ch;\n\
         let b = <-ch;\n\
         return a * 10 + b;",
    );
    assert_eq!(value, Value::Int(78));
}

#[test]
fn buffered_pipe_accepts_capacity_sends_without_blocking() {
    let value = run_value(
        "let ch = pipe(3);\n\
         ch <- 1;\n\
         ch <- 2;\n\
         ch <- 3;\n\
         return <-ch;",
    );
    assert_eq!(value, Value::Int(1));
}

#[test]
fn rendezvous_pipe_blocks_sender_until_receiver() {
    let value = run_value(
        "let ch = pipe(0);\n\
         let h = spawn { return <-ch; };\n\
         ch <- 99;\n\
         return h.join();",
    );
    assert_eq!(value, Value::Int(99));
}

#[test]
fn receiver_blocks_until_a_value_arrives() {
    let value = run_value(
        "let ch = pipe(0);\n\
         spawn { sleep(5); ch <- 13; };\n\
         return <-ch;",
    );
    assert_eq!(value, Value::Int(13));
}

#[test]
fn many_values_arrive_in_send_order_across_capacities() {
    for capacity in [0, 1, 4] {
        let source = format!(
            "let ch = pipe({});\n\
             let out = [];\n\
             spawn {{\n\
                 for (let i = 0; i < 10; i = i + 1) {{ ch <- i; }}\n\
             }};\n\
             for (let i = 0; i < 10; i = i + 1) {{ out.push(<-ch); }}\n\
             let sorted = true;\n\
             for (let i = 1; i < 10; i = i + 1) {{\n\
                 if (out[i - 1] >= out[i]) {{ sorted = false; }}\n\
             }}\n\
             return sorted;",
            capacity
        );
        assert_eq!(run_value(&source), Value::Bool(true), "capacity {}", capacity);
    }
}

#[test]
fn close_drains_buffer_then_yields_null() {
    let value = run_value(
        "let ch = pipe(2);\n\
         ch <- 1;\n\
         close(ch);\n\
         let a = <-ch;\n\
         let b = <-ch;\n\
         let c = <-ch;\n\
         return [a, b, c];",
    );
    assert_eq!(
        value,
        array_value(vec![Value::Int(1), Value::Null, Value::Null])
    );
}

#[test]
fn close_wakes_blocked_receivers_with_null() {
    let value = run_value(
        "let ch = pipe(0);\n\
         let h = spawn { return <-ch; };\n\
         sleep(5);\n\
         close(ch);\n\
         return h.join();",
    );
    assert_eq!(value, Value::Null);
}

#[test]
fn send_on_closed_pipe_is_a_runtime_error() {
    let result = run(
        "let ch = pipe(1);\n\
         close(ch);\n\
         ch <- 1;",
    );
    assert!(result.is_err());
}

#[test]
fn send_expression_yields_the_sent_value() {
    let value = run_value(
        "let ch = pipe(1);\n\
         return ch <- 42;",
    );
    assert_eq!(value, Value::Int(42));
}

#[test]
fn pipe_values_can_carry_composites() {
    let value = run_value(
        "let ch = pipe(1);\n\
         spawn { ch <- [1, 2, 3]; };\n\
         let a = <-ch;\n\
         return a.sum();",
    );
    assert_eq!(value, Value::Float(6.0));
}
