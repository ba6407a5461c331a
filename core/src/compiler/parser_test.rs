use crate::Vm;
use crate::diagnostics::{CompileErrorKind, Error};

fn run(source: &str) -> String {
    let mut vm = Vm::new();
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

fn compile_err(source: &str) -> Vec<CompileErrorKind> {
    let mut vm = Vm::new();
    match vm.interpret(source) {
        Err(Error::Compile(errs)) => errs.into_iter().map(|e| e.kind).collect(),
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn arithmetic_precedence_matches_standard_math() {
    assert_eq!(run("print 2 + 3 * 4;"), "14\n");
    assert_eq!(run("print (2 + 3) * 4;"), "20\n");
    assert_eq!(run("print -2 + 3;"), "1\n");
}

#[test]
fn string_concatenation_and_equality() {
    assert_eq!(run("print \"foo\" + \"bar\";"), "foobar\n");
    assert_eq!(run("print \"foo\" == \"foo\";"), "true\n");
}

#[test]
fn var_and_const_declarations() {
    assert_eq!(run("var x = 1; x = x + 1; print x;"), "2\n");
    assert_eq!(run("const PI = 3; print PI;"), "3\n");
}

#[test]
fn assigning_to_a_const_global_is_a_compile_error() {
    let errs = compile_err("const X = 1; X = 2;");
    assert_eq!(errs, vec![CompileErrorKind::AssignToConstant]);
}

#[test]
fn compound_assignment_operators_normalize_to_their_own_opcode() {
    // `/=` must divide and `*=` must multiply, for every assignment
    // target kind: locals, upvalues, globals, and properties.
    assert_eq!(run("var x = 10; x /= 2; print x;"), "5\n");
    assert_eq!(run("var x = 10; x *= 2; print x;"), "20\n");
    assert_eq!(
        run("fun f() { var x = 10; x /= 2; return x; } print f();"),
        "5\n"
    );
    assert_eq!(
        run("fun f() { var x = 10; x *= 2; return x; } print f();"),
        "20\n"
    );
    assert_eq!(
        run(
            r#"
            fun make() {
                var x = 10;
                fun divide() { x /= 2; return x; }
                return divide;
            }
            print make()();
            "#
        ),
        "5\n"
    );
    assert_eq!(
        run(
            r#"
            fun make() {
                var x = 10;
                fun multiply() { x *= 2; return x; }
                return multiply;
            }
            print make()();
            "#
        ),
        "20\n"
    );
    assert_eq!(
        run(
            "class Box { def init(v) { self.v = v; } }\nvar b = Box(10);\nb.v /= 2;\nprint b.v;"
        ),
        "5\n"
    );
    assert_eq!(
        run(
            "class Box { def init(v) { self.v = v; } }\nvar b = Box(10);\nb.v *= 2;\nprint b.v;"
        ),
        "20\n"
    );
}

#[test]
fn closures_capture_and_share_upvalues() {
    let source = r#"
        fun make_counter() {
            var count = 0;
            fun increment() {
                count = count + 1;
                return count;
            }
            return increment;
        }
        var counter = make_counter();
        print counter();
        print counter();
        print counter();
    "#;
    assert_eq!(run(source), "1\n2\n3\n");
}

#[test]
fn single_inheritance_and_super_calls() {
    let source = r#"
        class Animal {
            def speak() { return "..."; }
        }
        class Dog < Animal {
            def speak() { return "Woof, " + super.speak(); }
        }
        print Dog().speak();
    "#;
    assert_eq!(run(source), "Woof, ...\n");
}

#[test]
fn while_loop_with_break_and_next() {
    let source = r#"
        var i = 0;
        var total = 0;
        while (true) {
            i = i + 1;
            if (i > 10) { break; }
            if (i == 5) { next; }
            total = total + i;
        }
        print total;
    "#;
    // 1+2+3+4+6+7+8+9+10, skipping 5
    assert_eq!(run(source), "50\n");
}

#[test]
fn for_loop_next_resumes_at_the_increment_clause() {
    let source = r#"
        var total = 0;
        for (var i = 0; i < 5; i = i + 1) {
            if (i == 2) { next; }
            total = total + i;
        }
        print total;
    "#;
    assert_eq!(run(source), "8\n");
}

#[test]
fn switch_has_no_fallthrough_and_supports_default() {
    let source = r#"
        fun classify(n) {
            switch (n) {
                case 1: return "one";
                case 2: return "two";
                default: return "many";
            }
        }
        print classify(1);
        print classify(2);
        print classify(3);
    "#;
    assert_eq!(run(source), "one\ntwo\nmany\n");
}

#[test]
fn ternary_as_a_statement_evaluates_exactly_one_arm() {
    let source = r#"
        var calls = 0;
        fun side_effect(v) { calls = calls + 1; return v; }
        true ? side_effect(1) : side_effect(2);
        print calls;
    "#;
    assert_eq!(run(source), "1\n");
}

#[test]
fn break_outside_a_loop_is_a_compile_error() {
    assert_eq!(compile_err("break;"), vec![CompileErrorKind::BreakOutsideLoop]);
}

#[test]
fn next_outside_a_loop_is_a_compile_error() {
    assert_eq!(compile_err("next;"), vec![CompileErrorKind::NextOutsideLoop]);
}

#[test]
fn self_outside_a_class_is_a_compile_error() {
    assert_eq!(compile_err("fun f() { print self; }"), vec![CompileErrorKind::SelfOutsideClass]);
}

#[test]
fn arrays_have_no_literal_syntax_only_native_construction() {
    let source = r#"
        var a = array();
        a.push(1);
        a.push(2);
        print a.len();
    "#;
    assert_eq!(run(source), "2\n");
}

#[test]
fn a_bracket_in_expression_position_is_a_compile_error() {
    let errs = compile_err("var a = [1, 2];");
    assert!(matches!(errs[0], CompileErrorKind::Expected(_)));
}
