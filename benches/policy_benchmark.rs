//! Benchmarks for pattern validation and rule reordering.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use procroute::pattern::{self, FieldKind};
use procroute::{MemoryGateway, Policy, Protocol, RuleAction, RuleDraft, RuleId};

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");

    let cases = [
        ("process", "chrome.exe; firefox; \"C:\\Program Files\\app.exe\"", FieldKind::Process),
        ("host_list", "*.google.com;10.0.0.0/8;192.168.1.1;example.org", FieldKind::Host),
        ("port_list", "80;443;8000-9000;27015", FieldKind::Port),
    ];

    for (name, value, kind) in cases {
        group.bench_function(name, |b| {
            b.iter(|| pattern::validate(black_box(value), kind))
        });
    }

    group.finish();
}

fn populated(n: usize) -> (Policy<MemoryGateway>, Vec<RuleId>) {
    let mut policy = Policy::new(MemoryGateway::new());
    let ids = (0..n)
        .map(|i| {
            policy
                .add_rule(&RuleDraft::new(
                    format!("proc{}", i),
                    "*",
                    "443",
                    Protocol::Tcp,
                    RuleAction::Direct,
                ))
                .expect("add rule")
        })
        .collect();
    (policy, ids)
}

fn bench_move(c: &mut Criterion) {
    let mut group = c.benchmark_group("move_rule");

    for size in [10usize, 100, 1000] {
        let (mut policy, ids) = populated(size);
        let last = *ids.last().expect("non-empty");
        let mut to_front = true;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let target = if to_front { 1 } else { size as u32 };
                to_front = !to_front;
                policy.move_rule(black_box(last), target).expect("move")
            })
        });
    }

    group.finish();
}

fn bench_add_and_bulk_delete(c: &mut Criterion) {
    c.bench_function("add_100_then_bulk_delete", |b| {
        b.iter(|| {
            let (mut policy, ids) = populated(100);
            black_box(policy.delete_rules(&ids))
        })
    });
}

criterion_group!(benches, bench_validation, bench_move, bench_add_and_bulk_delete);
criterion_main!(benches);
