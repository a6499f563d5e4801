//! Stateless selection operator.

use crate::buffer::BufferPool;
use crate::tuple::Predicate;
use crate::window::{WindowBatch, EMPTY_WINDOW};

use super::{Operator, OperatorError, OperatorKind, ResultApi};

/// Filters tuples per window with a predicate.
///
/// Satisfying tuples are copied verbatim, in input order, into a freshly
/// pooled output buffer; the window pointers are rewritten to track the
/// output cursor. Windows where nothing matched get the empty sentinel,
/// and empty input windows are skipped entirely. The filter is stable.
#[derive(Debug)]
pub struct Selection {
    predicate: Predicate,
    pool: BufferPool,
}

impl Selection {
    /// Creates a selection over `predicate`, drawing output buffers from
    /// `pool`.
    #[must_use]
    pub fn new(predicate: Predicate, pool: BufferPool) -> Self {
        Self { predicate, pool }
    }

    /// The configured predicate.
    #[must_use]
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }
}

impl Operator for Selection {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Selection
    }

    fn process(
        &self,
        mut batch: WindowBatch,
        api: &mut dyn ResultApi,
    ) -> Result<(), OperatorError> {
        batch.init_window_pointers();

        let tuple_size = batch.schema().tuple_size();
        let schema = batch.schema().clone();
        let mut out = self.pool.acquire();

        for index in 0..batch.window_count() {
            let (start, end) = batch.window(index);
            if start == EMPTY_WINDOW {
                continue;
            }

            let out_start = out.position();
            let mut offset = usize::try_from(start).expect("non-empty window pointer");
            let end = usize::try_from(end).expect("non-empty window pointer");
            while offset < end {
                if self.predicate.satisfied(batch.buffer(), &schema, offset) {
                    batch.buffer().append_bytes_to(offset, tuple_size, &mut out);
                }
                offset += tuple_size;
            }

            if out.position() == out_start {
                batch.set_window(index, EMPTY_WINDOW, EMPTY_WINDOW);
            } else {
                batch.set_window(index, out_start as i64, out.position() as i64);
            }
        }

        // Schema is unchanged: output tuples are verbatim input tuples.
        let input = batch.replace_buffer(out);
        input.release();
        api.output_window_batch_result(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_support::CollectedResults;
    use crate::tuple::{ColumnRef, ColumnType, ComparisonOp, Constant, TupleSchema};
    use crate::window::WindowDefinition;
    use std::sync::Arc;

    fn schema() -> Arc<TupleSchema> {
        Arc::new(TupleSchema::new(vec![ColumnType::Long, ColumnType::Int]).unwrap())
    }

    fn batch_of(pool: &BufferPool, values: &[i32]) -> WindowBatch {
        let schema = schema();
        let mut buffer = pool.acquire();
        for (i, &value) in values.iter().enumerate() {
            buffer.put_long(i as i64);
            buffer.put_int(value);
            buffer.put_bytes(schema.pad());
        }
        WindowBatch::new(
            buffer,
            schema,
            WindowDefinition::row(values.len() as u64, values.len() as u64),
            1,
        )
    }

    #[test]
    fn test_filter_preserves_order() {
        let pool = BufferPool::new(8, 256);
        let batch = batch_of(&pool, &[10, 60, 5]);
        let predicate = Predicate::compare(ColumnRef(1), ComparisonOp::Lt, Constant::Int(50));
        let selection = Selection::new(predicate, pool);

        let mut results = CollectedResults::default();
        selection.process(batch, &mut results).unwrap();

        let out = &results.batches[0];
        assert_eq!(out.window_count(), 1);
        let (start, end) = out.window(0);
        let tuple_size = out.schema().tuple_size();
        assert_eq!((end - start) as usize, 2 * tuple_size);
        // Survivors keep their input order: 10 then 5.
        assert_eq!(out.buffer().get_int(start as usize + 8), 10);
        assert_eq!(out.buffer().get_int(start as usize + tuple_size + 8), 5);
    }

    #[test]
    fn test_all_failing_window_marked_empty() {
        let pool = BufferPool::new(8, 256);
        let batch = batch_of(&pool, &[60, 70, 80]);
        let predicate = Predicate::compare(ColumnRef(1), ComparisonOp::Lt, Constant::Int(50));
        let selection = Selection::new(predicate, pool);

        let mut results = CollectedResults::default();
        selection.process(batch, &mut results).unwrap();

        let out = &results.batches[0];
        assert_eq!(out.window(0), (EMPTY_WINDOW, EMPTY_WINDOW));
        assert_eq!(out.buffer().position(), 0);
    }

    #[test]
    fn test_input_buffer_returns_to_pool() {
        let pool = BufferPool::new(8, 256);
        let batch = batch_of(&pool, &[1, 2, 3]);
        let predicate = Predicate::compare(ColumnRef(1), ComparisonOp::Gt, Constant::Int(0));
        let selection = Selection::new(predicate, pool.clone());

        let mut results = CollectedResults::default();
        selection.process(batch, &mut results).unwrap();
        // The input buffer was released; the output buffer is still held
        // by the forwarded batch.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_two_stream_dispatch_rejected() {
        let pool = BufferPool::new(8, 256);
        let first = batch_of(&pool, &[1]);
        let second = batch_of(&pool, &[2]);
        let predicate = Predicate::compare(ColumnRef(1), ComparisonOp::Gt, Constant::Int(0));
        let selection = Selection::new(predicate, pool);

        let mut results = CollectedResults::default();
        let err = selection
            .process_pair(first, second, &mut results)
            .unwrap_err();
        assert!(matches!(err, OperatorError::UnsupportedArity { .. }));
    }
}
