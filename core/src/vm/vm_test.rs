//! VM-level integration tests: properties that cut across the
//! compiler/GC/runtime boundary rather than a single module.

use crate::diagnostics::{Error, RuntimeErrorKind};
use crate::vm::{Vm, VmOptions};

fn run(vm: &mut Vm, source: &str) -> String {
    let buf = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    vm.set_stdout(Box::new(SharedWriter(buf.clone())));
    vm.interpret(source).expect("program should compile and run");
    let bytes = buf.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

struct SharedWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn garbage_collection_is_observationally_transparent() {
    // `array.get` isn't one of the seed natives, so index through
    // repeated `pop`/`push` instead — the point is allocation churn,
    // not array indexing.
    let source = r#"
        class Counter {
            def init() { self.total = 0; }
            def bump(n) { self.total = self.total + n; return self.total; }
        }

        fun make_adder(n) {
            fun adder(x) { return x + n; }
            return adder;
        }

        var counter = Counter();
        var total = 0;
        var i = 0;
        while (i < 200) {
            var adder = make_adder(i);
            total = counter.bump(adder(1));
            i = i + 1;
        }
        print total;
    "#;

    let mut stress_off = Vm::new();
    let baseline = run(&mut stress_off, source);

    let mut stress_on = Vm::with_options(VmOptions {
        stress_gc: true,
        ..VmOptions::default()
    });
    let under_stress = run(&mut stress_on, source);

    assert_eq!(baseline, under_stress);
}

#[test]
fn closures_created_in_a_loop_each_keep_their_own_upvalue() {
    let source = r#"
        fun make_adders() {
            var fns = array();
            var i = 0;
            while (i < 3) {
                var captured = i;
                fun adder(x) { return x + captured; }
                fns.push(adder);
                i = i + 1;
            }
            return fns;
        }
        var fns = make_adders();
        print fns.pop()(10);
        print fns.pop()(10);
        print fns.pop()(10);
    "#;
    let mut vm = Vm::new();
    // Each `adder` closed over its own `captured` local, closed when
    // the loop body's scope ended, so popping in reverse order must
    // still show 2, 1, 0 rather than all sharing the final value.
    assert_eq!(run(&mut vm, source), "12\n11\n10\n");
}

#[test]
fn returning_from_a_deeply_nested_call_restores_the_caller_stack() {
    let source = r#"
        fun depth(n) {
            if (n == 0) { return 0; }
            return 1 + depth(n - 1);
        }
        var before = 1;
        var result = depth(50);
        var after = 2;
        print before + result + after;
    "#;
    let mut vm = Vm::new();
    assert_eq!(run(&mut vm, source), "53\n");
}

#[test]
fn unbounded_recursion_is_a_runtime_stack_overflow_not_a_crash() {
    let source = r#"
        fun recurse(n) { return recurse(n + 1); }
        recurse(0);
    "#;
    let mut vm = Vm::new();
    match vm.interpret(source) {
        Err(Error::Runtime(err)) => assert_eq!(err.kind, RuntimeErrorKind::StackOverflow),
        other => panic!("expected a stack overflow runtime error, got {other:?}"),
    }
}

#[test]
fn stack_exhaustion_mid_expression_is_a_runtime_stack_overflow_not_a_crash() {
    // Distinct from the frame-count exhaustion above: a single frame
    // evaluating an ordinary expression can also fill the raw value
    // stack (e.g. 64 deep non-tail calls each holding a full complement
    // of locals, then one more temporary for whatever they compute),
    // without ever touching `call()`'s frame-count check.
    let options = VmOptions {
        max_stack_size: 2,
        ..VmOptions::default()
    };
    let mut vm = Vm::with_options(options);
    match vm.interpret("print 1 + 1;") {
        Err(Error::Runtime(err)) => assert_eq!(err.kind, RuntimeErrorKind::StackOverflow),
        other => panic!("expected a stack overflow runtime error, got {other:?}"),
    }
}

#[test]
fn runtime_error_trace_names_every_frame_innermost_first() {
    let source = r#"
        fun c() { return 1 + nil; }
        fun b() { return c(); }
        fun a() { return b(); }
        a();
    "#;
    let mut vm = Vm::new();
    match vm.interpret(source) {
        Err(Error::Runtime(err)) => {
            assert_eq!(err.trace.len(), 4);
            assert!(err.trace[0].contains("c()"));
            assert!(err.trace[1].contains("b()"));
            assert!(err.trace[2].contains("a()"));
            assert!(err.trace[3].contains("script"));
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn native_functions_are_reachable_as_plain_calls_and_methods() {
    let source = r#"
        var a = array();
        a.push(1);
        a.push(2);
        a.push(3);
        print a.len();
        print a.pop();
        print "hello".len();
        assert(a.len() == 2);
    "#;
    let mut vm = Vm::new();
    assert_eq!(run(&mut vm, source), "3\n3\n5\n");
}

#[test]
fn string_interning_deduplicates_equal_literals_across_allocations() {
    let mut vm = Vm::new();
    let a = vm.new_string("shared");
    let b = vm.new_string("shared");
    // Interned strings compare equal by pointer identity; two calls
    // with the same bytes must hand back the same object.
    assert_eq!(a.as_obj(), b.as_obj());
}

#[test]
fn global_constants_are_tracked_across_the_whole_compile_not_just_their_own_scope() {
    // `const` is declared before `bump` is compiled; a single-pass
    // compiler sees it in the VM-wide constants table regardless of
    // how many functions away the assignment attempt is.
    let source = "const LIMIT = 10; fun bump() { LIMIT = LIMIT + 1; } bump();";
    let mut vm = Vm::new();
    let errs = match vm.interpret(source) {
        Err(Error::Compile(errs)) => errs,
        other => panic!("expected a compile error, got {other:?}"),
    };
    assert!(!errs.is_empty());
}
