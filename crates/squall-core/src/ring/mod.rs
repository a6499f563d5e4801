//! # Result Ring Module
//!
//! The concurrency core: serializes many workers' out-of-order outputs
//! into in-order, backpressure-respecting downstream delivery and reclaims
//! buffers.
//!
//! [`ResultCollector`] is the slot ring itself; [`CollectorApi`] adapts it
//! to the operator-facing [`ResultApi`] seam so operators stay unaware of
//! slot mechanics; [`Downstream`] and [`LatencyMonitor`] are the external
//! collaborators results are handed to.

mod collector;
mod dispatch;

pub use collector::{ResultCollector, RingInputs, SlotState};
pub use dispatch::{now_millis, Downstream, LatencyMonitor, Side, SystemLatencyMonitor};

use std::sync::Arc;

use crate::ops::ResultApi;
use crate::window::WindowBatch;

/// Forwards finished operator batches into a [`ResultCollector`].
///
/// Decomposes each batch into its result buffer and threaded task
/// metadata, choosing the single or join entry point to match the ring's
/// input mode.
#[derive(Debug, Clone)]
pub struct CollectorApi {
    collector: Arc<ResultCollector>,
}

impl CollectorApi {
    /// Creates an adapter over `collector`.
    #[must_use]
    pub fn new(collector: Arc<ResultCollector>) -> Self {
        Self { collector }
    }

    /// The underlying collector.
    #[must_use]
    pub fn collector(&self) -> &Arc<ResultCollector> {
        &self.collector
    }
}

impl ResultApi for CollectorApi {
    fn output_window_batch_result(&mut self, batch: WindowBatch) {
        let (task_id, buffer, first_offset, second_offset, mark) = batch.into_result_parts();
        self.collector
            .fill(task_id, buffer, [first_offset, second_offset], mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, IngressBuffer};
    use crate::config::QueryConfig;
    use crate::tuple::{ColumnType, TupleSchema};
    use crate::window::{WindowBatch, WindowDefinition};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        accepted: AtomicUsize,
    }

    impl Downstream for Counting {
        fn try_dispatch_first(&self, _data: &[u8]) -> bool {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn try_dispatch_second(&self, data: &[u8]) -> bool {
            self.try_dispatch_first(data)
        }
    }

    #[test]
    fn test_collector_api_threads_join_offsets_through() {
        let config = QueryConfig::builder().task_concurrency(2).build();
        let first = Arc::new(IngressBuffer::new(256));
        let second = Arc::new(IngressBuffer::new(256));
        first.put_bytes(&[0u8; 16]).unwrap();
        second.put_bytes(&[0u8; 16]).unwrap();

        let downstream = Arc::new(Counting {
            accepted: AtomicUsize::new(0),
        });
        let collector = Arc::new(ResultCollector::new(
            &config,
            RingInputs::Join {
                first: Arc::clone(&first),
                second: Arc::clone(&second),
            },
            Side::First,
            vec![downstream.clone() as Arc<dyn Downstream>],
            None,
        ));
        let mut api = CollectorApi::new(collector);

        let pool = BufferPool::new(2, 64);
        let mut buffer = pool.acquire();
        buffer.put_long(7);
        let schema = Arc::new(TupleSchema::new(vec![ColumnType::Long]).unwrap());
        let mut batch = WindowBatch::new(buffer, schema, WindowDefinition::row(1, 1), 1);
        batch.set_free_offset(16);
        batch.set_second_free_offset(16);
        api.output_window_batch_result(batch);

        assert_eq!(downstream.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(first.processed_bytes(), 16);
        assert_eq!(second.processed_bytes(), 16);
    }
}
