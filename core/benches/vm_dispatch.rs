use corvid_core::Vm;
use criterion::{Criterion, criterion_group, criterion_main};

fn bench_fibonacci(c: &mut Criterion) {
    let source = r#"
        fun fib(n) {
            if (n < 2) { return n; }
            return fib(n - 1) + fib(n - 2);
        }
        fib(20);
    "#;
    c.bench_function("vm_dispatch/fibonacci_recursive", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.set_stdout(Box::new(std::io::sink()));
            vm.interpret(source).expect("benchmark program should run");
        })
    });
}

fn bench_method_calls(c: &mut Criterion) {
    let source = r#"
        class Accumulator {
            def init() { self.total = 0; }
            def add(n) { self.total = self.total + n; }
        }
        var acc = Accumulator();
        var i = 0;
        while (i < 10000) {
            acc.add(i);
            i = i + 1;
        }
    "#;
    c.bench_function("vm_dispatch/method_call_loop", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.set_stdout(Box::new(std::io::sink()));
            vm.interpret(source).expect("benchmark program should run");
        })
    });
}

criterion_group!(benches, bench_fibonacci, bench_method_calls);
criterion_main!(benches);
