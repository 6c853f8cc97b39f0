//! Benchmarks for event push, lazy pull, and the tick loop.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use weft::{FieldDef, FieldId, Graph, PullPolicy, Scene, TypeTag, Value};

fn chain(g: &mut Graph, n: usize) -> (FieldId, FieldId) {
    let head = g.add(FieldDef::new("head", TypeTag::Float));
    let mut prev = head;
    for i in 1..n {
        let next = g.add(FieldDef::new(format!("link{i}"), TypeTag::Float));
        g.route_no_event(prev, next, None).unwrap();
        prev = next;
    }
    (head, prev)
}

/// Benchmark one event sweeping a chain of routed fields
fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_event");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("chain", n), &n, |b, &n| {
            let mut g = Graph::new();
            let (head, _) = chain(&mut g, n);

            let mut v = 0.0;
            b.iter(|| {
                v += 1.0;
                g.set(head, Value::Float(v), None).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark a full push-then-pull cycle through the same chain
fn bench_pull(c: &mut Criterion) {
    let mut group = c.benchmark_group("pull_chain");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("chain", n), &n, |b, &n| {
            let mut g = Graph::new();
            let (head, tail) = chain(&mut g, n);

            let mut v = 0.0;
            b.iter(|| {
                v += 1.0;
                g.set(head, Value::Float(v), None).unwrap();
                g.get(tail, None).unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark one field feeding many listeners
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("listeners", n), &n, |b, &n| {
            let mut g = Graph::new();
            let source = g.add(FieldDef::new("source", TypeTag::Float));
            for i in 0..n {
                let listener = g.add(FieldDef::new(format!("listener{i}"), TypeTag::Float));
                g.route_no_event(source, listener, None).unwrap();
            }

            let mut v = 0.0;
            b.iter(|| {
                v += 1.0;
                g.set(source, Value::Float(v), None).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark the steady-state tick with a watched chain off the clock
fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("scene_tick");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("watched_chain", n), &n, |b, &n| {
            let mut scene = Scene::new();
            let (head, tail) = chain(&mut scene.graph, n);
            let time = scene.time();
            scene.graph.route_no_event(time, head, None).unwrap();
            scene.watch(tail, PullPolicy::EveryTick);

            b.iter(|| {
                scene.tick(0.016);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_push, bench_pull, bench_fanout, bench_tick);
criterion_main!(benches);
