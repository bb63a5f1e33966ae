use amdahl_analyzer::dep_graph::DepGraph;
use amdahl_core::{opcode, DepKind, Op, RuntimeTable, SNode};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `width` independent chains of `depth` arithmetic ops joining one sink,
/// the shape a moderately parallel frame produces.
fn diamond_graph(width: usize, depth: usize) -> DepGraph {
    let table = Arc::new(RuntimeTable::for_block(12_300_000));
    let mut graph = DepGraph::new(table);
    let mut seq = 0i64;
    let sink = SNode::new(Op::Byte(opcode::KECCAK256), i64::MAX);

    for _ in 0..width {
        let mut prev = SNode::new(Op::Byte(opcode::PUSH1), seq);
        seq += 1;
        graph.record_order(prev);
        for level in 0..depth {
            let ops = [opcode::ADD, opcode::MUL, opcode::XOR, opcode::SHL];
            let node = SNode::new(Op::Byte(ops[level % ops.len()]), seq);
            seq += 1;
            graph.record_order(node);
            graph.add_edge(prev, node, DepKind::Raw);
            prev = node;
        }
        graph.add_edge(prev, sink, DepKind::Raw);
    }
    graph.record_order(sink);
    graph.init().expect("non-empty graph");
    graph
}

// ---------------------------------------------------------------------------
// Benchmark: CP list scheduling
// ---------------------------------------------------------------------------

fn bench_list_scheduling(c: &mut Criterion) {
    let mut group = c.benchmark_group("cp_list_scheduling");
    for (width, depth) in [(8, 32), (32, 64), (128, 64)] {
        let graph = diamond_graph(width, depth);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{depth}")),
            &graph,
            |b, graph| {
                b.iter(|| {
                    for processors in [2usize, 4, 8] {
                        black_box(graph.cp_list_scheduling(processors).unwrap());
                    }
                })
            },
        );
    }
    group.finish();
}

fn bench_naive_analyses(c: &mut Criterion) {
    let graph = diamond_graph(64, 64);
    c.bench_function("naive_level", |b| {
        b.iter(|| black_box(graph.naive_parallelisation_level().unwrap()))
    });
    c.bench_function("naive_empirical", |b| {
        b.iter(|| black_box(graph.naive_parallelisation_empirical().unwrap()))
    });
}

criterion_group!(benches, bench_list_scheduling, bench_naive_analyses);
criterion_main!(benches);
