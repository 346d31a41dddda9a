//! Lineage benchmarks
//!
//! - Ancestry traversal over deep chains (streaming vs buffered order)
//! - Descendant traversal over wide fan-outs
//! - Registry create/commit throughput per backend

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trueno_lineage::run::{MemoryRegistry, NewRun, RunCommit, RunRegistry, RunStatus, SqliteRegistry};
use trueno_lineage::{LineageEdge, LineageGraph, Order, RunId};

/// run 1 <- run 2 <- ... <- run `len`
fn chain(len: u64) -> LineageGraph {
    LineageGraph::from_edges((1..len).map(|i| {
        LineageEdge::new(RunId::new(i), RunId::new(i + 1), format!("runs/{i}/artifacts/out"))
    }))
    .unwrap()
}

/// run 1 feeds `width` runs, each feeding one more.
fn fan_out(width: u64) -> LineageGraph {
    let graph = LineageGraph::new();
    for i in 0..width {
        let mid = RunId::new(2 + i);
        let leaf = RunId::new(2 + width + i);
        graph.record_edge(&LineageEdge::new(RunId::new(1), mid, "runs/1/artifacts/root")).unwrap();
        graph
            .record_edge(&LineageEdge::new(mid, leaf, format!("runs/{}/artifacts/out", mid)))
            .unwrap();
    }
    graph
}

fn bench_chain_ancestors(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_ancestors");

    for len in [100u64, 1_000, 10_000] {
        let graph = chain(len);
        let tip = RunId::new(len);

        group.bench_with_input(BenchmarkId::new("reverse_topological", len), &len, |b, _| {
            b.iter(|| black_box(graph.ancestors(tip, Order::ReverseTopological).iter().count()));
        });
        group.bench_with_input(BenchmarkId::new("topological", len), &len, |b, _| {
            b.iter(|| black_box(graph.ancestors(tip, Order::Topological).iter().count()));
        });
    }

    group.finish();
}

fn bench_fan_out_descendants(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out_descendants");

    for width in [10u64, 100, 1_000] {
        let graph = fan_out(width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| black_box(graph.descendants(RunId::new(1), Order::Topological).iter().count()));
        });
    }

    group.finish();
}

fn create_commit(registry: &dyn RunRegistry) {
    let run_id = registry.create(NewRun::new("bench")).unwrap();
    registry
        .commit(run_id, RunCommit::new(RunStatus::Success).log("ok"))
        .unwrap();
}

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_create_commit");

    let memory = MemoryRegistry::new();
    group.bench_function("memory", |b| b.iter(|| create_commit(&memory)));

    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteRegistry::open(dir.path().join("registry.sqlite")).unwrap();
    group.bench_function("sqlite", |b| b.iter(|| create_commit(&sqlite)));

    group.finish();
}

criterion_group!(
    benches,
    bench_chain_ancestors,
    bench_fan_out_descendants,
    bench_registry
);
criterion_main!(benches);
