//! Benchmarks for spark-recompose
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::executor::block_on;
use futures::{FutureExt, StreamExt};
use spark_recompose::stream::flow_of;
use spark_recompose::{BackpressurePolicy, MutableStateFlow, Runtime, SharedFlow, SharedFlowConfig};

// =============================================================================
// CELL BENCHMARKS
// =============================================================================

fn bench_cell_create(c: &mut Criterion) {
    let rt = Runtime::new();
    c.bench_function("cell_create", |b| {
        b.iter(|| {
            let cell = rt.cell(black_box(0i32));
            rt.release(cell)
        })
    });
}

fn bench_cell_read(c: &mut Criterion) {
    let rt = Runtime::new();
    let cell = rt.cell(42i32);
    c.bench_function("cell_read", |b| b.iter(|| black_box(rt.read(&cell))));
}

fn bench_cell_write_same_value(c: &mut Criterion) {
    let rt = Runtime::new();
    let cell = rt.cell(42i32);
    c.bench_function("cell_write_same_value", |b| {
        b.iter(|| rt.write(&cell, black_box(42)))
    });
}

// =============================================================================
// RECOMPOSITION BENCHMARKS
// =============================================================================

fn bench_single_write_flush(c: &mut Criterion) {
    let rt = Runtime::new();
    let count = rt.cell(0i32);
    let _composition = rt
        .compose(move |cx| {
            black_box(cx.read(&count));
            Ok(())
        })
        .unwrap();

    let mut i = 0i32;
    c.bench_function("single_write+flush", |b| {
        b.iter(|| {
            i += 1;
            rt.write(&count, i);
            rt.flush().unwrap()
        })
    });
}

fn bench_batched_writes(c: &mut Criterion) {
    let rt = Runtime::new();
    let cells: Vec<_> = (0..10).map(|_| rt.cell(0i32)).collect();
    let read = cells.clone();
    let _composition = rt
        .compose(move |cx| {
            let sum: i32 = read.iter().map(|cell| cx.read(cell)).sum();
            black_box(sum);
            Ok(())
        })
        .unwrap();

    let mut base = 0i32;
    c.bench_function("batched_10_writes+flush", |b| {
        b.iter(|| {
            base += 1;
            rt.batch(|| {
                for cell in &cells {
                    rt.write(cell, base);
                }
            });
            rt.flush().unwrap()
        })
    });
}

fn bench_wide_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_tree");

    for width in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("one_leaf_dirty", width), &width, |b, &width| {
            let rt = Runtime::new();
            let cells: Vec<_> = (0..width).map(|_| rt.cell(0i32)).collect();
            let leaves = cells.clone();
            let _composition = rt
                .compose(move |cx| {
                    for cell in &leaves {
                        let cell = *cell;
                        cx.scope(move |cx| {
                            let value = cx.read(&cell);
                            cx.emit(value);
                            Ok(())
                        })?;
                    }
                    Ok(())
                })
                .unwrap();

            let mut i = 0i32;
            b.iter(|| {
                i += 1;
                rt.write(&cells[width / 2], i);
                rt.flush().unwrap()
            });
        });
    }

    group.finish();
}

fn bench_keyed_reorder(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed_reorder");

    for count in [10, 100] {
        group.bench_with_input(BenchmarkId::new("reverse", count), &count, |b, &count| {
            let rt = Runtime::new();
            let items = rt.cell((0..count).collect::<Vec<u32>>());
            let _composition = rt
                .compose(move |cx| {
                    for item in cx.read(&items) {
                        cx.keyed_scope(&item, move |cx| {
                            cx.emit(item);
                            Ok(())
                        })?;
                    }
                    Ok(())
                })
                .unwrap();

            b.iter(|| {
                rt.update(&items, |items| items.reverse());
                rt.flush().unwrap()
            });
        });
    }

    group.finish();
}

// =============================================================================
// STREAM BENCHMARKS
// =============================================================================

fn bench_cold_operator_chain(c: &mut Criterion) {
    let numbers = flow_of((0..1000).collect::<Vec<u32>>())
        .map(|n| n * 3)
        .filter(|n| n % 2 == 0)
        .distinct_until_changed();

    c.bench_function("cold_chain_1000", |b| {
        b.iter(|| black_box(block_on(numbers.to_vec()).unwrap()))
    });
}

fn bench_state_flow_set(c: &mut Criterion) {
    let state = MutableStateFlow::new(0u64);
    let mut sub = state.subscribe();

    let mut i = 0u64;
    c.bench_function("state_flow_set+poll", |b| {
        b.iter(|| {
            i += 1;
            state.set(i);
            black_box(sub.next().now_or_never())
        })
    });
}

fn bench_shared_flow_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_flow_fanout");

    for subscribers in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("conflate", subscribers),
            &subscribers,
            |b, &subscribers| {
                let shared = SharedFlow::new(SharedFlowConfig::replay(1).policy(BackpressurePolicy::Conflate));
                let mut subs: Vec<_> = (0..subscribers).map(|_| shared.subscribe()).collect();

                let mut i = 0u64;
                b.iter(|| {
                    i += 1;
                    shared.try_emit(i).unwrap();
                    for sub in subs.iter_mut() {
                        black_box(sub.next().now_or_never());
                    }
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// CRITERION SETUP
// =============================================================================

criterion_group!(
    cell_benches,
    bench_cell_create,
    bench_cell_read,
    bench_cell_write_same_value,
);

criterion_group!(
    recompose_benches,
    bench_single_write_flush,
    bench_batched_writes,
    bench_wide_tree,
    bench_keyed_reorder,
);

criterion_group!(
    stream_benches,
    bench_cold_operator_chain,
    bench_state_flow_set,
    bench_shared_flow_fanout,
);

criterion_main!(cell_benches, recompose_benches, stream_benches);
