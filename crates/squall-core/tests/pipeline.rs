//! End-to-end pipeline tests: ingress bytes through operators and the
//! result ring to an in-order downstream.

use std::sync::{Arc, Mutex};
use std::thread;

use rand::seq::SliceRandom;

use squall_core::ring::{CollectorApi, SystemLatencyMonitor};
use squall_core::tuple::{ComparisonOp, Constant};
use squall_core::window::NO_MARK;
use squall_core::{
    Aggregation, AggregationType, BufferPool, ColumnRef, ColumnType, Downstream, IngressBuffer,
    LatencyMonitor, Operator, Predicate, QueryConfig, ResultCollector, RingInputs, Selection,
    Side, TupleSchema, WindowBatch, WindowDefinition,
};

const TUPLE: usize = 16;
const TUPLES_PER_TASK: usize = 4;

/// Always-accepting downstream recording the leading i64 of each result.
#[derive(Default)]
struct Recording {
    received: Mutex<Vec<i64>>,
}

impl Downstream for Recording {
    fn try_dispatch_first(&self, data: &[u8]) -> bool {
        let mut lead = [0u8; 8];
        lead.copy_from_slice(&data[..8]);
        self.received.lock().unwrap().push(i64::from_le_bytes(lead));
        true
    }

    fn try_dispatch_second(&self, data: &[u8]) -> bool {
        self.try_dispatch_first(data)
    }
}

fn input_schema() -> Arc<TupleSchema> {
    Arc::new(TupleSchema::new(vec![ColumnType::Long, ColumnType::Int, ColumnType::Float]).unwrap())
}

struct Pipeline {
    pool: BufferPool,
    ingress: Arc<IngressBuffer>,
    ring: Arc<ResultCollector>,
    downstream: Arc<Recording>,
}

fn pipeline(tasks: usize, monitor: Option<Arc<dyn LatencyMonitor>>) -> Pipeline {
    // One slot per task so no producer ever waits, whatever the shuffle.
    let config = QueryConfig::builder()
        .task_concurrency(tasks)
        .slot_multiplier(1)
        .build();
    let pool = BufferPool::from_config(&config);
    let ingress = Arc::new(IngressBuffer::new(64 * 1024));
    let downstream = Arc::new(Recording::default());
    let ring = Arc::new(ResultCollector::new(
        &config,
        RingInputs::Single {
            ingress: Arc::clone(&ingress),
        },
        Side::First,
        vec![downstream.clone() as Arc<dyn Downstream>],
        monitor,
    ));
    Pipeline {
        pool,
        ingress,
        ring,
        downstream,
    }
}

/// Serializes each task's tuples into the ingress buffer and slices the
/// region into a window batch carrying the task's free offset. The tuple
/// timestamp is the task id, so in-order delivery is visible in the
/// leading bytes of every result.
fn dispatch_batches(pipeline: &Pipeline, tasks: u64, window: WindowDefinition) -> Vec<WindowBatch> {
    let schema = input_schema();
    let mut batches = Vec::new();
    for task in 1..=tasks {
        let mut bytes = Vec::with_capacity(TUPLES_PER_TASK * TUPLE);
        for i in 0..TUPLES_PER_TASK {
            bytes.extend_from_slice(&(task as i64).to_le_bytes());
            bytes.extend_from_slice(&(i as i32).to_le_bytes());
            bytes.extend_from_slice(&(i as f32).to_le_bytes());
        }
        let offset = pipeline.ingress.put_bytes(&bytes).expect("ingress full");

        let mut buffer = pipeline.pool.acquire();
        pipeline
            .ingress
            .copy_to_buffer(offset, bytes.len(), &mut buffer);
        let mut batch = WindowBatch::new(buffer, schema.clone(), window, task);
        batch.set_free_offset((offset + bytes.len() as u64) as i64);
        batches.push(batch);
    }
    batches.shuffle(&mut rand::thread_rng());
    batches
}

fn run_workers(
    operator: Arc<dyn Operator>,
    ring: &Arc<ResultCollector>,
    batches: Vec<WindowBatch>,
    workers: usize,
) {
    let mut groups: Vec<Vec<WindowBatch>> = (0..workers).map(|_| Vec::new()).collect();
    for (index, batch) in batches.into_iter().enumerate() {
        groups[index % workers].push(batch);
    }

    let mut handles = Vec::new();
    for group in groups {
        let operator = Arc::clone(&operator);
        let mut api = CollectorApi::new(Arc::clone(ring));
        handles.push(thread::spawn(move || {
            for batch in group {
                operator.process(batch, &mut api).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn selection_pipeline_delivers_in_task_order() {
    let tasks: u64 = 64;
    let pipeline = pipeline(tasks as usize, None);
    let window = WindowDefinition::row(TUPLES_PER_TASK as u64, TUPLES_PER_TASK as u64);
    let batches = dispatch_batches(&pipeline, tasks, window);

    // Three of the four tuples per task satisfy the predicate.
    let selection = Arc::new(Selection::new(
        Predicate::compare(ColumnRef(1), ComparisonOp::Lt, Constant::Int(3)),
        pipeline.pool.clone(),
    ));
    run_workers(selection, &pipeline.ring, batches, 4);

    let received = pipeline.downstream.received.lock().unwrap();
    let expected: Vec<i64> = (1..=tasks as i64).collect();
    assert_eq!(*received, expected);

    // Every task's ingress region was reclaimed, in order.
    assert_eq!(
        pipeline.ingress.processed_bytes(),
        tasks * (TUPLES_PER_TASK * TUPLE) as u64
    );
    assert_eq!(pipeline.ring.total_output_bytes(), tasks * 3 * TUPLE as u64);
    // Result buffers were recycled after delivery.
    assert!(pipeline.pool.available() > 0);
}

#[test]
fn aggregation_pipeline_sums_each_window() {
    let tasks: u64 = 32;
    let monitor = Arc::new(SystemLatencyMonitor::new());
    let pipeline = pipeline(tasks as usize, Some(monitor.clone() as Arc<dyn LatencyMonitor>));
    let window = WindowDefinition::row(TUPLES_PER_TASK as u64, TUPLES_PER_TASK as u64);
    let mut batches = dispatch_batches(&pipeline, tasks, window);
    for batch in &mut batches {
        batch.set_latency_mark(squall_core::ring::now_millis());
    }

    let aggregation = Arc::new(
        Aggregation::new(
            &window,
            AggregationType::Sum,
            ColumnRef(2),
            &input_schema(),
            pipeline.pool.clone(),
        )
        .unwrap(),
    );
    run_workers(aggregation, &pipeline.ring, batches, 4);

    let received = pipeline.downstream.received.lock().unwrap();
    let expected: Vec<i64> = (1..=tasks as i64).collect();
    assert_eq!(*received, expected);

    // One output tuple [timestamp, sum] per task; values 0+1+2+3.
    assert_eq!(pipeline.ring.total_output_bytes(), tasks * TUPLE as u64);
    assert_eq!(monitor.samples(), tasks);
    assert_eq!(
        pipeline.ingress.processed_bytes(),
        tasks * (TUPLES_PER_TASK * TUPLE) as u64
    );
}
