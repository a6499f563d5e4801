//! Result ring and operator benchmarks.
//!
//! Run with: cargo bench --bench ring_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use squall_core::ops::ResultApi;
use squall_core::tuple::{ComparisonOp, Constant};
use squall_core::window::NO_MARK;
use squall_core::{
    Aggregation, AggregationType, BufferPool, ColumnRef, ColumnType, Downstream, IngressBuffer,
    Operator, Predicate, QueryConfig, ResultCollector, RingInputs, Selection, Side, TupleSchema,
    WindowBatch, WindowDefinition,
};

const TUPLE: usize = 16;

/// Always-accepting sink.
struct Sink;

impl Downstream for Sink {
    fn try_dispatch_first(&self, data: &[u8]) -> bool {
        black_box(data);
        true
    }

    fn try_dispatch_second(&self, data: &[u8]) -> bool {
        black_box(data);
        true
    }
}

/// Discards operator output (the batch drop recycles its buffer).
struct Discard;

impl ResultApi for Discard {
    fn output_window_batch_result(&mut self, batch: WindowBatch) {
        black_box(&batch);
    }
}

fn input_schema() -> Arc<TupleSchema> {
    Arc::new(TupleSchema::new(vec![ColumnType::Long, ColumnType::Int, ColumnType::Float]).unwrap())
}

fn make_batch(pool: &BufferPool, window: WindowDefinition, tuples: usize) -> WindowBatch {
    let schema = input_schema();
    let mut buffer = pool.acquire();
    for i in 0..tuples {
        buffer.put_long(i as i64);
        buffer.put_int((i % 8) as i32);
        buffer.put_float((i % 10) as f32);
    }
    WindowBatch::new(buffer, schema, window, 1)
}

/// Single-threaded producer-drains-own-slot throughput.
fn bench_forward_and_free(c: &mut Criterion) {
    let config = QueryConfig::builder().task_concurrency(64).build();
    let ingress = Arc::new(IngressBuffer::new(1 << 20));
    let ring = ResultCollector::new(
        &config,
        RingInputs::Single {
            ingress: Arc::clone(&ingress),
        },
        Side::First,
        vec![Arc::new(Sink) as Arc<dyn Downstream>],
        None,
    );
    let pool = BufferPool::from_config(&config);

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    let mut task_id = 0u64;
    group.bench_function("forward_and_free", |b| {
        b.iter(|| {
            task_id += 1;
            let offset = ingress.put_bytes(&[0u8; TUPLE]).expect("ingress full");
            let mut result = pool.acquire();
            result.put_long(task_id as i64);
            ring.forward_and_free(task_id, result, (offset + TUPLE as u64) as i64, NO_MARK);
        });
    });
    group.finish();
}

fn bench_selection(c: &mut Criterion) {
    let pool = BufferPool::new(64, 64 * 1024);
    let window = WindowDefinition::row(64, 64);
    let selection = Selection::new(
        Predicate::compare(ColumnRef(2), ComparisonOp::Lt, Constant::Float(5.0)),
        pool.clone(),
    );

    let mut group = c.benchmark_group("selection");
    group.throughput(Throughput::Elements(1024));
    group.bench_function("filter_1024_tuples", |b| {
        b.iter_batched(
            || make_batch(&pool, window, 1024),
            |batch| selection.process(batch, &mut Discard).unwrap(),
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_aggregation(c: &mut Criterion) {
    let pool = BufferPool::new(64, 64 * 1024);
    let mut group = c.benchmark_group("aggregation");
    group.throughput(Throughput::Elements(1024));

    // Tumbling: full recompute. Heavily overlapped: incremental.
    for (name, window) in [
        ("sum_full_recompute", WindowDefinition::row(64, 64)),
        ("sum_incremental", WindowDefinition::row(64, 8)),
    ] {
        let aggregation = Aggregation::new(
            &window,
            AggregationType::Sum,
            ColumnRef(2),
            &input_schema(),
            pool.clone(),
        )
        .unwrap();
        group.bench_function(name, |b| {
            b.iter_batched(
                || make_batch(&pool, window, 1024),
                |batch| aggregation.process(batch, &mut Discard).unwrap(),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_forward_and_free,
    bench_selection,
    bench_aggregation
);
criterion_main!(benches);
