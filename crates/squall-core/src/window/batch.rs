//! Window batches: a tuple buffer plus per-window byte-offset pointers.

use std::sync::Arc;

use crate::buffer::{Buffer, PooledBuffer};
use crate::ops::OperatorError;
use crate::tuple::TupleSchema;

use super::{WindowDefinition, WindowKind};

/// Sentinel for an empty window in the pointer arrays.
pub const EMPTY_WINDOW: i64 = -1;

/// Sentinel for an input free offset that carries nothing to free.
pub const UNSET_OFFSET: i64 = i64::MIN;

/// Sentinel for "no latency marker set on this batch".
pub const NO_MARK: i64 = -1;

/// Operator callbacks driven by the incremental-computation protocol.
///
/// The window batch sequences the calls and computes the tuple ranges; it
/// performs no aggregation itself. `exited` is never invoked for the very
/// first window, which has no predecessor.
pub trait IncrementalComputation {
    /// A tuple came into scope for the current window.
    fn entered(&mut self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize);

    /// A tuple left scope.
    ///
    /// # Errors
    ///
    /// Implementations return a fatal [`OperatorError`] when the tuple was
    /// never tracked, which means windowing bookkeeping is broken upstream.
    fn exited(
        &mut self,
        buffer: &Buffer,
        schema: &TupleSchema,
        tuple_offset: usize,
    ) -> Result<(), OperatorError>;

    /// The current window is complete; emit its result and return the
    /// output pointer pair (or `(EMPTY_WINDOW, EMPTY_WINDOW)`).
    fn evaluate(
        &mut self,
        buffer: &Buffer,
        schema: &TupleSchema,
        window_start: i64,
        window_end: i64,
    ) -> (i64, i64);
}

/// A batch of windows over one serialized tuple buffer.
///
/// Holds the buffer, its schema, and two same-length pointer arrays with
/// the byte offsets of each window (`window_end` is exclusive;
/// `EMPTY_WINDOW` in both marks an empty window). Task metadata
/// (`task_id`, free offsets, latency mark) is threaded through untouched
/// so the result collector can reclaim input regions after delivery.
#[derive(Debug)]
pub struct WindowBatch {
    buffer: PooledBuffer,
    schema: Arc<TupleSchema>,
    window: WindowDefinition,
    window_start: Vec<i64>,
    window_end: Vec<i64>,
    pointers_ready: bool,
    batch_start: usize,
    batch_end: usize,
    start_timestamp: i64,
    end_timestamp: i64,
    task_id: u64,
    free_offset: i64,
    second_free_offset: i64,
    latency_mark: i64,
}

impl WindowBatch {
    /// Creates a batch over every tuple currently written to `buffer`.
    #[must_use]
    pub fn new(
        buffer: PooledBuffer,
        schema: Arc<TupleSchema>,
        window: WindowDefinition,
        task_id: u64,
    ) -> Self {
        let batch_end = buffer.position();
        Self {
            buffer,
            schema,
            window,
            window_start: Vec::new(),
            window_end: Vec::new(),
            pointers_ready: false,
            batch_start: 0,
            batch_end,
            start_timestamp: -1,
            end_timestamp: -1,
            task_id,
            free_offset: UNSET_OFFSET,
            second_free_offset: UNSET_OFFSET,
            latency_mark: NO_MARK,
        }
    }

    /// Records the ingress free offset reclaimed once this task's result
    /// is delivered.
    pub fn set_free_offset(&mut self, offset: i64) {
        self.free_offset = offset;
    }

    /// Records the second-stream free offset (join branches only).
    pub fn set_second_free_offset(&mut self, offset: i64) {
        self.second_free_offset = offset;
    }

    /// Attaches a latency marker forwarded to the latency monitor.
    pub fn set_latency_mark(&mut self, mark: i64) {
        self.latency_mark = mark;
    }

    /// The task id this batch belongs to.
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// The batch buffer.
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The batch buffer, writable.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// The tuple schema of the buffer contents.
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &Arc<TupleSchema> {
        &self.schema
    }

    /// Replaces the schema, used when an operator rewrites the batch into
    /// its output layout.
    pub fn set_schema(&mut self, schema: Arc<TupleSchema>) {
        self.schema = schema;
    }

    /// The window definition this batch was sliced with.
    #[inline]
    #[must_use]
    pub fn window_definition(&self) -> WindowDefinition {
        self.window
    }

    /// Timestamp of the first tuple, `-1` until pointers are initialized.
    #[inline]
    #[must_use]
    pub fn start_timestamp(&self) -> i64 {
        self.start_timestamp
    }

    /// Timestamp of the last tuple, `-1` until pointers are initialized.
    #[inline]
    #[must_use]
    pub fn end_timestamp(&self) -> i64 {
        self.end_timestamp
    }

    /// Overwrites the batch start timestamp.
    pub fn set_start_timestamp(&mut self, timestamp: i64) {
        self.start_timestamp = timestamp;
    }

    /// Byte offset of the first tuple.
    #[inline]
    #[must_use]
    pub fn batch_start(&self) -> usize {
        self.batch_start
    }

    /// Exclusive byte offset past the last tuple.
    #[inline]
    #[must_use]
    pub fn batch_end(&self) -> usize {
        self.batch_end
    }

    /// Number of windows in the batch (0 before pointer initialization).
    #[inline]
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.window_start.len()
    }

    /// The pointer pair of window `index`.
    #[inline]
    #[must_use]
    pub fn window(&self, index: usize) -> (i64, i64) {
        (self.window_start[index], self.window_end[index])
    }

    /// Overwrites the pointer pair of window `index`.
    #[inline]
    pub fn set_window(&mut self, index: usize, start: i64, end: i64) {
        self.window_start[index] = start;
        self.window_end[index] = end;
    }

    /// Replaces both pointer arrays wholesale.
    ///
    /// # Panics
    ///
    /// Panics when the arrays differ in length.
    pub fn set_window_pointers(&mut self, start: Vec<i64>, end: Vec<i64>) {
        assert_eq!(start.len(), end.len(), "pointer arrays must match");
        self.window_start = start;
        self.window_end = end;
        self.pointers_ready = true;
    }

    /// Swaps in an operator's output buffer, returning the old buffer for
    /// release. Batch byte bounds follow the new buffer.
    pub fn replace_buffer(&mut self, buffer: PooledBuffer) -> PooledBuffer {
        let old = std::mem::replace(&mut self.buffer, buffer);
        self.batch_start = 0;
        self.batch_end = self.buffer.position();
        old
    }

    /// Decomposes the batch for result forwarding.
    ///
    /// Returns `(task_id, buffer, free_offset, second_free_offset, mark)`.
    #[must_use]
    pub fn into_result_parts(self) -> (u64, PooledBuffer, i64, i64, i64) {
        (
            self.task_id,
            self.buffer,
            self.free_offset,
            self.second_free_offset,
            self.latency_mark,
        )
    }

    /// Lazily computes the window pointer arrays from the batch tuples and
    /// the window definition. Idempotent: repeated calls are no-ops.
    pub fn init_window_pointers(&mut self) {
        if self.pointers_ready {
            return;
        }
        self.pointers_ready = true;

        let tuple_size = self.schema.tuple_size();
        let tuples = (self.batch_end - self.batch_start) / tuple_size;
        self.window_start.clear();
        self.window_end.clear();
        if tuples == 0 {
            return;
        }

        self.start_timestamp = self.buffer.get_long(self.batch_start);
        self.end_timestamp = self
            .buffer
            .get_long(self.batch_start + (tuples - 1) * tuple_size);

        match self.window.kind() {
            WindowKind::Row => self.init_row_pointers(tuples, tuple_size),
            WindowKind::Range => self.init_range_pointers(tuples, tuple_size),
        }
    }

    /// Row windows: window `w` covers tuple indices
    /// `[w * slide, w * slide + size)`, clamped to the batch. Every window
    /// whose first tuple index falls inside the batch is materialized, so
    /// row windows are never empty.
    fn init_row_pointers(&mut self, tuples: usize, tuple_size: usize) {
        let size = usize::try_from(self.window.size()).unwrap_or(usize::MAX);
        let slide = usize::try_from(self.window.slide()).unwrap_or(usize::MAX);

        let mut first = 0usize;
        while first < tuples {
            let last = (first + size).min(tuples);
            self.window_start
                .push((self.batch_start + first * tuple_size) as i64);
            self.window_end
                .push((self.batch_start + last * tuple_size) as i64);
            first += slide;
        }
    }

    /// Range windows: window `w` covers timestamps
    /// `[t0 + w * slide, t0 + w * slide + size)` where `t0` is the first
    /// tuple's timestamp. Both scan cursors advance monotonically, so the
    /// whole batch is sliced in one forward pass. Windows with no tuples
    /// get the empty sentinel.
    #[allow(clippy::cast_possible_wrap)]
    fn init_range_pointers(&mut self, tuples: usize, tuple_size: usize) {
        let size = self.window.size() as i64;
        let slide = self.window.slide() as i64;
        let ts_at = |batch: &Self, index: usize| {
            batch
                .buffer
                .get_long(batch.batch_start + index * tuple_size)
        };

        let mut lo = 0usize;
        let mut hi = 0usize;
        let mut window_start_ts = self.start_timestamp;
        while window_start_ts <= self.end_timestamp {
            let window_end_ts = window_start_ts + size;
            while lo < tuples && ts_at(self, lo) < window_start_ts {
                lo += 1;
            }
            if hi < lo {
                hi = lo;
            }
            while hi < tuples && ts_at(self, hi) < window_end_ts {
                hi += 1;
            }
            if lo == hi || lo >= tuples {
                self.window_start.push(EMPTY_WINDOW);
                self.window_end.push(EMPTY_WINDOW);
            } else {
                self.window_start
                    .push((self.batch_start + lo * tuple_size) as i64);
                self.window_end
                    .push((self.batch_start + hi * tuple_size) as i64);
            }
            window_start_ts += slide;
        }
    }

    /// Drives the incremental-computation protocol across the batch.
    ///
    /// For each window in increasing index order, given the previous
    /// window's bounds: tuples in `[max(prev_end, start), end)` enter,
    /// tuples in `[prev_start, start)` exit (everything exits when the
    /// current window is empty), then the window is evaluated. Returns the
    /// output pointer arrays produced by the evaluations.
    ///
    /// # Errors
    ///
    /// Propagates the fatal error of an `exited` call on untracked state.
    pub fn perform_incremental_computation(
        &mut self,
        computation: &mut dyn IncrementalComputation,
    ) -> Result<(Vec<i64>, Vec<i64>), OperatorError> {
        self.init_window_pointers();

        let tuple_size = self.schema.tuple_size() as i64;
        let buffer: &Buffer = &self.buffer;
        let schema: &TupleSchema = &self.schema;
        let count = self.window_start.len();
        let mut out_start = Vec::with_capacity(count);
        let mut out_end = Vec::with_capacity(count);
        let mut prev: Option<(i64, i64)> = None;

        for index in 0..count {
            let start = self.window_start[index];
            let end = self.window_end[index];

            if start == EMPTY_WINDOW {
                // Nothing is retained: every previous-window tuple exits.
                if let Some((prev_start, prev_end)) = prev {
                    let mut offset = prev_start;
                    while offset < prev_end {
                        computation.exited(buffer, schema, to_offset(offset))?;
                        offset += tuple_size;
                    }
                }
                let (out_s, out_e) = computation.evaluate(buffer, schema, start, end);
                out_start.push(out_s);
                out_end.push(out_e);
                prev = None;
            } else {
                match prev {
                    Some((prev_start, prev_end)) => {
                        let mut offset = prev_end.max(start);
                        while offset < end {
                            computation.entered(buffer, schema, to_offset(offset));
                            offset += tuple_size;
                        }
                        let mut offset = prev_start;
                        while offset < start {
                            computation.exited(buffer, schema, to_offset(offset))?;
                            offset += tuple_size;
                        }
                    }
                    None => {
                        let mut offset = start;
                        while offset < end {
                            computation.entered(buffer, schema, to_offset(offset));
                            offset += tuple_size;
                        }
                    }
                }
                let (out_s, out_e) = computation.evaluate(buffer, schema, start, end);
                out_start.push(out_s);
                out_end.push(out_e);
                prev = Some((start, end));
            }
        }

        Ok((out_start, out_end))
    }
}

#[inline]
fn to_offset(offset: i64) -> usize {
    usize::try_from(offset).expect("window pointer must be non-negative here")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::tuple::ColumnType;

    fn schema() -> Arc<TupleSchema> {
        Arc::new(TupleSchema::new(vec![ColumnType::Long, ColumnType::Float]).unwrap())
    }

    /// One tuple per (timestamp, value) pair, padded to 16 bytes.
    fn batch_of(
        pool: &BufferPool,
        window: WindowDefinition,
        tuples: &[(i64, f32)],
    ) -> WindowBatch {
        let mut buffer = pool.acquire();
        for &(ts, value) in tuples {
            buffer.put_long(ts);
            buffer.put_float(value);
            buffer.put_bytes(&[0u8; 4]);
        }
        WindowBatch::new(buffer, schema(), window, 1)
    }

    #[test]
    fn test_row_pointers() {
        let pool = BufferPool::new(4, 256);
        let tuples: Vec<(i64, f32)> = (0..6).map(|i| (i, i as f32)).collect();
        let mut batch = batch_of(&pool, WindowDefinition::row(4, 2), &tuples);
        batch.init_window_pointers();

        assert_eq!(batch.window_count(), 3);
        assert_eq!(batch.window(0), (0, 64));
        assert_eq!(batch.window(1), (32, 96));
        // Final window clamped to the batch end.
        assert_eq!(batch.window(2), (64, 96));
        assert_eq!(batch.start_timestamp(), 0);
        assert_eq!(batch.end_timestamp(), 5);
    }

    #[test]
    fn test_range_pointers_with_gap() {
        let pool = BufferPool::new(4, 256);
        // A hole between t=1 and t=10 produces empty windows.
        let tuples = [(0i64, 0.0f32), (1, 1.0), (10, 2.0)];
        let mut batch = batch_of(&pool, WindowDefinition::range(2, 2), &tuples);
        batch.init_window_pointers();

        assert_eq!(batch.window_count(), 6);
        assert_eq!(batch.window(0), (0, 32));
        assert_eq!(batch.window(1), (EMPTY_WINDOW, EMPTY_WINDOW));
        assert_eq!(batch.window(4), (EMPTY_WINDOW, EMPTY_WINDOW));
        assert_eq!(batch.window(5), (32, 48));
    }

    #[test]
    fn test_init_is_idempotent() {
        let pool = BufferPool::new(4, 256);
        let tuples: Vec<(i64, f32)> = (0..4).map(|i| (i, 0.0)).collect();
        let mut batch = batch_of(&pool, WindowDefinition::row(2, 2), &tuples);
        batch.init_window_pointers();
        let before = (batch.window_count(), batch.window(0));
        batch.set_window(0, EMPTY_WINDOW, EMPTY_WINDOW);
        batch.init_window_pointers();
        // The second call must not recompute over the mutation.
        assert_eq!(batch.window_count(), before.0);
        assert_eq!(batch.window(0), (EMPTY_WINDOW, EMPTY_WINDOW));
    }

    /// Records protocol calls for sequencing assertions.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl IncrementalComputation for Recorder {
        fn entered(&mut self, buffer: &Buffer, _schema: &TupleSchema, offset: usize) {
            self.events.push(format!("enter:{}", buffer.get_long(offset)));
        }

        fn exited(
            &mut self,
            buffer: &Buffer,
            _schema: &TupleSchema,
            offset: usize,
        ) -> Result<(), OperatorError> {
            self.events.push(format!("exit:{}", buffer.get_long(offset)));
            Ok(())
        }

        fn evaluate(
            &mut self,
            _buffer: &Buffer,
            _schema: &TupleSchema,
            _start: i64,
            _end: i64,
        ) -> (i64, i64) {
            self.events.push("eval".to_string());
            (EMPTY_WINDOW, EMPTY_WINDOW)
        }
    }

    #[test]
    fn test_incremental_sequencing() {
        let pool = BufferPool::new(4, 256);
        let tuples: Vec<(i64, f32)> = (0..6).map(|i| (i, 0.0)).collect();
        let mut batch = batch_of(&pool, WindowDefinition::row(4, 2), &tuples);

        let mut recorder = Recorder::default();
        let (out_start, out_end) = batch
            .perform_incremental_computation(&mut recorder)
            .unwrap();

        // Window 0: tuples 0-3 enter. Window 1: 4, 5 enter, 0, 1 exit.
        // Window 2: nothing new enters, 2, 3 exit.
        assert_eq!(
            recorder.events,
            vec![
                "enter:0", "enter:1", "enter:2", "enter:3", "eval", //
                "enter:4", "enter:5", "exit:0", "exit:1", "eval", //
                "exit:2", "exit:3", "eval",
            ]
        );
        assert_eq!(out_start.len(), 3);
        assert_eq!(out_end.len(), 3);
    }

    #[test]
    fn test_incremental_exits_everything_before_empty_window() {
        let pool = BufferPool::new(4, 256);
        let tuples = [(0i64, 0.0f32), (1, 0.0), (10, 0.0)];
        let mut batch = batch_of(&pool, WindowDefinition::range(2, 2), &tuples);

        let mut recorder = Recorder::default();
        batch.perform_incremental_computation(&mut recorder).unwrap();

        // Window 0 holds t=0 and t=1; window 1 is empty, so both exit
        // before its evaluation; the final window sees t=10 enter fresh.
        assert_eq!(
            recorder.events,
            vec![
                "enter:0", "enter:1", "eval", //
                "exit:0", "exit:1", "eval", //
                "eval", "eval", "eval", //
                "enter:10", "eval",
            ]
        );
    }
}
