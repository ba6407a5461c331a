use corvid_core::{Vm, VmOptions};
use criterion::{Criterion, criterion_group, criterion_main};

const ALLOCATION_CHURN: &str = r#"
    fun make_adder(n) {
        fun adder(x) { return x + n; }
        return adder;
    }
    var i = 0;
    var total = 0;
    while (i < 2000) {
        var adder = make_adder(i);
        total = total + adder(1);
        i = i + 1;
    }
"#;

fn bench_default_heap_growth(c: &mut Criterion) {
    c.bench_function("gc_cycle/default_growth_factor", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.set_stdout(Box::new(std::io::sink()));
            vm.interpret(ALLOCATION_CHURN).expect("benchmark program should run");
        })
    });
}

fn bench_stress_gc(c: &mut Criterion) {
    c.bench_function("gc_cycle/collect_on_every_allocation", |b| {
        b.iter(|| {
            let mut vm = Vm::with_options(VmOptions {
                stress_gc: true,
                ..VmOptions::default()
            });
            vm.set_stdout(Box::new(std::io::sink()));
            vm.interpret(ALLOCATION_CHURN).expect("benchmark program should run");
        })
    });
}

criterion_group!(benches, bench_default_heap_growth, bench_stress_gc);
criterion_main!(benches);
