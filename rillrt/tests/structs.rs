use rillc::{compile, parse};
use rillrt::{Value, Vm};

fn run_value(source: &str) -> Value {
    let statements = parse(source).expect("parse");
    let program = compile(&statements).expect("compile");
    let mut vm = Vm::new(false, false);
    vm.interpret(&program).expect("run")
}

#[test]
fn init_stores_and_method_reads_a_field() {
    let value = run_value(
        "struct P {\n\
             fn init(x) { self.x = x; }\n\
             fn get() { return self.x; }\n\
         }\n\
         let p = P(42);\n\
         return p.get();",
    );
    assert_eq!(value, Value::Int(42));
}

#[test]
fn construction_without_init_takes_no_arguments() {
    let value = run_value(
        "struct Bag {\n\
             fn put(v) { self.v = v; }\n\
             fn take() { return self.v; }\n\
         }\n\
         let b = Bag();\n\
         b.put(7);\n\
         return b.take();",
    );
    assert_eq!(value, Value::Int(7));
}

#[test]
fn methods_mutate_instance_state() {
    let value = run_value(
        "struct Counter {\n\
             fn init() { self.n = 0; }\n\
             fn bump() { self.n = self.n + 1; return self.n; }\n\
         }\n\
         let c = Counter();\n\
         c.bump();\n\
         c.bump();\n\
         return c.bump();",
    );
    assert_eq!(value, Value::Int(3));
}

#[test]
fn fields_are_readable_and_writable_from_outside() {
    let value = run_value(
        "struct P {\n\
             fn init(x) { self.x = x; }\n\
         }\n\
         let p = P(1);\n\
         p.x += 9;\n\
         return p.x;",
    );
    assert_eq!(value, Value::Int(10));
}

#[test]
fn instances_are_shared_by_reference() {
    let value = run_value(
        "struct P {\n\
             fn init(x) { self.x = x; }\n\
         }\n\
         let p = P(1);\n\
         let q = p;\n\
         q.x = 5;\n\
         return p.x;",
    );
    assert_eq!(value, Value::Int(5));
}

#[test]
fn bound_methods_can_be_stored_and_called_later() {
    let value = run_value(
        "struct P {\n\
             fn init(x) { self.x = x; }\n\
             fn get() { return self.x; }\n\
         }\n\
         let p = P(9);\n\
         let m = p.get;\n\
         return m() + m();",
    );
    assert_eq!(value, Value::Int(18));
}

#[test]
fn type_of_an_instance_is_its_struct_name() {
    let value = run_value(
        "struct Point {\n\
             fn init() { self.x = 0; }\n\
         }\n\
         return type(Point());",
    );
    assert_eq!(value.to_string(), "Point");
}

#[test]
fn methods_of_different_instances_see_their_own_fields() {
    let value = run_value(
        "struct P {\n\
             fn init(x) { self.x = x; }\n\
             fn get() { return self.x; }\n\
         }\n\
         let a = P(1);\n\
         let b = P(2);\n\
         return a.get() * 10 + b.get();",
    );
    assert_eq!(value, Value::Int(12));
}
