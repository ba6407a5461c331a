//! Integration tests for corvid-core: whole programs run through
//! [`Vm::interpret`] from outside the crate, the way a host embedding
//! it would.

use std::io::Write as _;
use std::sync::{Arc, Mutex};

use corvid_core::{Error, Vm};

#[derive(Clone, Default)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> String {
    let mut vm = Vm::new();
    let writer = SharedWriter::default();
    vm.set_stdout(Box::new(writer.clone()));
    vm.interpret(source).expect("program should compile and run");
    let bytes = writer.0.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn fibonacci_via_recursion() {
    let source = r#"
        fun fib(n) {
            if (n < 2) { return n; }
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    "#;
    assert_eq!(run(source), "55\n");
}

#[test]
fn a_class_hierarchy_with_fields_methods_and_super() {
    // `+` only accepts two numbers or two strings, so every `describe`
    // here stays string-to-string; `area` is checked separately as a
    // number.
    let source = r#"
        class Shape {
            def label() { return "shape"; }
            def describe() { return "a " + self.label(); }
        }
        class Square < Shape {
            def init(side) { self.side = side; }
            def label() { return "square"; }
            def area() { return self.side * self.side; }
        }
        class LabeledSquare < Square {
            def init(side, tag) {
                super.init(side);
                self.tag = tag;
            }
            def describe() { return self.tag + ": " + super.describe(); }
        }
        var s = LabeledSquare(4, "tile");
        print s.describe();
        print s.area();
    "#;
    assert_eq!(run(source), "tile: a square\n16\n");
}

#[test]
fn higher_order_functions_and_shared_mutable_upvalues() {
    let source = r#"
        fun counter_pair() {
            var count = 0;
            fun increment() { count = count + 1; return count; }
            fun reset() { count = 0; return count; }
            var pair = array();
            pair.push(increment);
            pair.push(reset);
            return pair;
        }
        var pair = counter_pair();
        var increment = pair.pop();
        var reset_fn = pair.pop();
        print increment();
        print increment();
        print reset_fn();
        print increment();
    "#;
    // `increment`/`reset` close over the same `count`, even though
    // the array holding them has already been discarded.
    assert_eq!(run(source), "1\n2\n0\n1\n");
}

#[test]
fn for_loop_break_and_switch_default_compose() {
    let source = r#"
        fun classify(n) {
            switch (n) {
                case 0: return "zero";
                case 1: return "one";
                default: return "many";
            }
        }
        var results = array();
        for (var i = 0; i < 10; i = i + 1) {
            if (i == 5) { break; }
            results.push(classify(i));
        }
        var out = "";
        while (results.len() > 0) {
            out = out + results.pop() + ",";
        }
        print out;
    "#;
    assert_eq!(run(source), "many,many,many,one,zero,\n");
}

#[test]
fn dividing_by_a_string_is_a_runtime_type_error_with_a_line_number() {
    let mut vm = Vm::new();
    let source = "var x = 1;\nvar y = \"oops\";\nprint x / y;\n";
    match vm.interpret(source) {
        Err(Error::Runtime(err)) => assert_eq!(err.line, 3),
        other => panic!("expected a runtime type error, got {other:?}"),
    }
}

#[test]
fn calling_an_undeclared_global_is_a_runtime_error_not_a_compile_error() {
    // Globals are resolved dynamically by name, so an unknown one
    // compiles fine and only fails once the `GetGlobal` actually runs.
    let mut vm = Vm::new();
    match vm.interpret("print not_a_thing();") {
        Err(Error::Runtime(err)) => {
            assert_eq!(err.kind.to_string(), "Undefined variable 'not_a_thing'.")
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn a_native_assertion_failure_is_reported_as_a_runtime_error() {
    let mut vm = Vm::new();
    match vm.interpret("assert(1 == 2);") {
        Err(Error::Runtime(err)) => assert_eq!(err.kind.to_string(), "Assertion failed."),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}
