//! Stateful aggregation operator.
//!
//! Reduces tuples per window (or per group within a window) with one of
//! `COUNT`, `SUM`, `AVG`, `MIN`, `MAX`. Execution picks between four
//! strategies, fixed at construction:
//!
//! - full recompute, ungrouped or grouped, rescans every window
//! - incremental maintenance, ungrouped or grouped, drives the window
//!   batch's enter/exit/evaluate protocol instead of rescanning
//!
//! Incremental maintenance applies only to `COUNT`/`SUM`/`AVG` and only
//! when consecutive windows overlap by more than half the window size.
//! `MIN`/`MAX` always recompute: retracting an extremum incrementally
//! would need an order-statistics structure this operator does not keep.
//!
//! The output schema is `[timestamp, group-by attributes.., aggregate]`
//! plus schema padding. Group keys are a folded hash of the group-by
//! attribute bytes with no collision fallback, preserved as observed
//! engine behavior.

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::buffer::{Buffer, BufferPool};
use crate::tuple::{ColumnRef, ColumnType, Predicate, SchemaError, TupleSchema};
use crate::window::{IncrementalComputation, WindowBatch, WindowDefinition, EMPTY_WINDOW};

use super::{Operator, OperatorError, OperatorKind, ResultApi};

/// Contribution threshold below which a group's count is treated as zero,
/// tolerating floating-point round-off in incremental maintenance.
const GROUP_EPSILON: f32 = 1e-4;

/// The aggregation function applied per window or per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationType {
    /// Tuple count.
    Count,
    /// Sum of the aggregation attribute.
    Sum,
    /// Arithmetic mean of the aggregation attribute.
    Avg,
    /// Minimum of the aggregation attribute.
    Min,
    /// Maximum of the aggregation attribute.
    Max,
}

impl AggregationType {
    /// Whether this function can be maintained incrementally.
    #[inline]
    #[must_use]
    pub fn supports_incremental(self) -> bool {
        matches!(
            self,
            AggregationType::Count | AggregationType::Sum | AggregationType::Avg
        )
    }
}

impl fmt::Display for AggregationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationType::Count => "COUNT",
            AggregationType::Sum => "SUM",
            AggregationType::Avg => "AVG",
            AggregationType::Min => "MIN",
            AggregationType::Max => "MAX",
        };
        write!(f, "{name}")
    }
}

/// Windowed aggregation with optional grouping and HAVING filter.
pub struct Aggregation {
    agg_type: AggregationType,
    attribute: ColumnRef,
    group_by: SmallVec<[ColumnRef; 4]>,
    having: Option<Predicate>,
    out_schema: Arc<TupleSchema>,
    out_tuple_size: usize,
    /// Byte offset of the aggregate value within an output tuple.
    value_offset: usize,
    incremental: bool,
    pool: BufferPool,
}

impl Aggregation {
    /// Creates an ungrouped aggregation.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] when the aggregation attribute is not a
    /// float column of the input schema.
    pub fn new(
        window: &WindowDefinition,
        agg_type: AggregationType,
        attribute: ColumnRef,
        input_schema: &TupleSchema,
        pool: BufferPool,
    ) -> Result<Self, SchemaError> {
        Self::build(window, agg_type, attribute, SmallVec::new(), None, input_schema, pool)
    }

    /// Creates a grouped aggregation with an optional HAVING filter.
    ///
    /// The HAVING predicate is evaluated against the aggregated output
    /// schema, not the input schema.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] when the aggregation attribute is not a
    /// float column of the input schema.
    pub fn with_group_by(
        window: &WindowDefinition,
        agg_type: AggregationType,
        attribute: ColumnRef,
        group_by: Vec<ColumnRef>,
        having: Option<Predicate>,
        input_schema: &TupleSchema,
        pool: BufferPool,
    ) -> Result<Self, SchemaError> {
        Self::build(
            window,
            agg_type,
            attribute,
            SmallVec::from_vec(group_by),
            having,
            input_schema,
            pool,
        )
    }

    fn build(
        window: &WindowDefinition,
        agg_type: AggregationType,
        attribute: ColumnRef,
        group_by: SmallVec<[ColumnRef; 4]>,
        having: Option<Predicate>,
        input_schema: &TupleSchema,
        pool: BufferPool,
    ) -> Result<Self, SchemaError> {
        input_schema.expect_type(attribute.0, ColumnType::Float)?;

        let mut out_types = Vec::with_capacity(group_by.len() + 2);
        out_types.push(ColumnType::Long);
        for column in &group_by {
            out_types.push(input_schema.column_type(column.0));
        }
        out_types.push(ColumnType::Float);
        let out_schema = Arc::new(TupleSchema::new(out_types)?);

        let out_tuple_size = out_schema.tuple_size();
        let value_offset = out_schema.offset_of(out_schema.columns() - 1);

        // The strategy is fixed here and never re-evaluated per batch.
        let incremental = agg_type.supports_incremental() && window.overlaps_majority();

        Ok(Self {
            agg_type,
            attribute,
            group_by,
            having,
            out_schema,
            out_tuple_size,
            value_offset,
            incremental,
            pool,
        })
    }

    /// The configured aggregation function.
    #[must_use]
    pub fn aggregation_type(&self) -> AggregationType {
        self.agg_type
    }

    /// The synthesized output schema.
    #[must_use]
    pub fn output_schema(&self) -> &Arc<TupleSchema> {
        &self.out_schema
    }

    /// Whether the incremental strategies were selected at construction.
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    #[inline]
    fn has_group_by(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Folds the group-by attribute bytes into the grouping key.
    ///
    /// Seeded at 1 and combined as `hash = 31 * hash + element_hash`,
    /// where the element hash folds the attribute bytes the same way.
    /// Distinct tuples that collide are silently merged; there is no raw
    /// key comparison.
    fn group_key(&self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize) -> i32 {
        let mut hash: i32 = 1;
        for column in &self.group_by {
            let element = bytes_hash(column.raw_bytes(buffer, schema, tuple_offset));
            hash = hash.wrapping_mul(31).wrapping_add(element);
        }
        hash
    }

    /// Strategy: ungrouped, full recompute. Folds every tuple of each
    /// non-empty window into one running scalar; empty windows keep the
    /// empty sentinel untouched.
    fn full_recompute(&self, batch: &mut WindowBatch, out: &mut Buffer) {
        let schema = batch.schema().clone();
        let tuple_size = schema.tuple_size();

        for index in 0..batch.window_count() {
            let (start, end) = batch.window(index);
            if start == EMPTY_WINDOW {
                continue;
            }
            let end = window_offset(end);
            let mut offset = window_offset(start);

            let buffer = batch.buffer();
            let window_ts = buffer.get_long(offset);
            let mut count = 1i32;
            let mut value = match self.agg_type {
                AggregationType::Count => 1.0,
                _ => self.attribute.eval_float(buffer, &schema, offset),
            };
            offset += tuple_size;

            while offset < end {
                match self.agg_type {
                    AggregationType::Count => value += 1.0,
                    AggregationType::Sum | AggregationType::Avg => {
                        value += self.attribute.eval_float(buffer, &schema, offset);
                        count += 1;
                    }
                    AggregationType::Min => {
                        let candidate = self.attribute.eval_float(buffer, &schema, offset);
                        if candidate < value {
                            value = candidate;
                        }
                    }
                    AggregationType::Max => {
                        let candidate = self.attribute.eval_float(buffer, &schema, offset);
                        if candidate > value {
                            value = candidate;
                        }
                    }
                }
                offset += tuple_size;
            }

            if self.agg_type == AggregationType::Avg {
                value /= count as f32;
            }

            let out_start = out.position();
            out.put_long(window_ts);
            out.put_float(value);
            out.put_bytes(self.out_schema.pad());
            batch.set_window(index, out_start as i64, out.position() as i64);
        }
    }

    /// Strategy: grouped, full recompute. Builds per-window working
    /// records keyed by group hash, then finalizes survivors into the
    /// output buffer.
    fn full_recompute_grouped(&self, batch: &mut WindowBatch, out: &mut Buffer) {
        let schema = batch.schema().clone();
        let tuple_size = schema.tuple_size();
        let mut work = self.pool.acquire();
        let mut key_offsets: FxHashMap<i32, usize> = FxHashMap::default();
        let mut counts: FxHashMap<i32, i32> = FxHashMap::default();

        for index in 0..batch.window_count() {
            let (start, end) = batch.window(index);
            if start == EMPTY_WINDOW {
                continue;
            }
            let end = window_offset(end);
            let mut offset = window_offset(start);

            work.clear();
            key_offsets.clear();
            counts.clear();

            while offset < end {
                let buffer = batch.buffer();
                let key = self.group_key(buffer, &schema, offset);

                if let Some(&record) = key_offsets.get(&key) {
                    let value_at = record + self.value_offset;
                    let current = work.get_float(value_at);
                    match self.agg_type {
                        AggregationType::Count => work.put_float_at(value_at, current + 1.0),
                        AggregationType::Sum => {
                            let delta = self.attribute.eval_float(buffer, &schema, offset);
                            work.put_float_at(value_at, current + delta);
                        }
                        AggregationType::Avg => {
                            let delta = self.attribute.eval_float(buffer, &schema, offset);
                            work.put_float_at(value_at, current + delta);
                            *counts
                                .get_mut(&key)
                                .expect("AVG count tracked for every live key") += 1;
                        }
                        AggregationType::Min => {
                            let candidate = self.attribute.eval_float(buffer, &schema, offset);
                            if candidate < current {
                                work.put_float_at(value_at, candidate);
                            }
                        }
                        AggregationType::Max => {
                            let candidate = self.attribute.eval_float(buffer, &schema, offset);
                            if candidate > current {
                                work.put_float_at(value_at, candidate);
                            }
                        }
                    }
                } else {
                    let record = work.position();
                    ColumnRef(0).append_to(buffer, &schema, offset, &mut work);
                    for column in &self.group_by {
                        column.append_to(buffer, &schema, offset, &mut work);
                    }
                    if self.agg_type == AggregationType::Count {
                        work.put_float(1.0);
                    } else {
                        work.put_float(self.attribute.eval_float(buffer, &schema, offset));
                    }
                    work.put_bytes(self.out_schema.pad());
                    key_offsets.insert(key, record);
                    if self.agg_type == AggregationType::Avg {
                        counts.insert(key, 1);
                    }
                }
                offset += tuple_size;
            }

            let (out_start, out_end) = self.emit_groups(&mut work, &key_offsets, &counts, out);
            batch.set_window(index, out_start, out_end);
        }

        work.release();
    }

    /// Strategy: ungrouped, incremental. Drives the enter/exit/evaluate
    /// protocol over one running scalar.
    fn incremental_scalar(
        &self,
        batch: &mut WindowBatch,
        out: &mut Buffer,
    ) -> Result<(), OperatorError> {
        let mut state = ScalarState {
            op: self,
            out,
            value: 0.0,
            count: 0,
        };
        let (start, end) = batch.perform_incremental_computation(&mut state)?;
        batch.set_window_pointers(start, end);
        Ok(())
    }

    /// Strategy: grouped, incremental. The working buffer and key map
    /// persist across windows; exits evict keys whose contribution is
    /// gone.
    fn incremental_grouped(
        &self,
        batch: &mut WindowBatch,
        out: &mut Buffer,
    ) -> Result<(), OperatorError> {
        let mut work = self.pool.acquire();
        let result = {
            let mut state = GroupedState {
                op: self,
                work: &mut work,
                out,
                key_offsets: FxHashMap::default(),
                counts: FxHashMap::default(),
            };
            batch.perform_incremental_computation(&mut state)
        };
        work.release();
        let (start, end) = result?;
        batch.set_window_pointers(start, end);
        Ok(())
    }

    /// Finalizes the live groups of one window into the output buffer,
    /// applying the HAVING filter. Returns the output pointer pair, or
    /// the empty sentinel when nothing survives.
    ///
    /// For AVG the working record keeps the raw sum: the no-filter path
    /// copies first and divides in the copy; the filter path temporarily
    /// writes the average into the working record for the predicate,
    /// copies while it holds the average, and restores the sum right
    /// after the check.
    fn emit_groups(
        &self,
        work: &mut Buffer,
        key_offsets: &FxHashMap<i32, usize>,
        counts: &FxHashMap<i32, i32>,
        out: &mut Buffer,
    ) -> (i64, i64) {
        if key_offsets.is_empty() {
            return (EMPTY_WINDOW, EMPTY_WINDOW);
        }

        let out_start = out.position();
        for (&key, &record) in key_offsets {
            let value_at = record + self.value_offset;
            match &self.having {
                None => {
                    work.append_bytes_to(record, self.out_tuple_size, out);
                    if self.agg_type == AggregationType::Avg {
                        let sum = work.get_float(value_at);
                        let count = avg_count(counts, key);
                        let copied_at = out.position() - self.out_tuple_size + self.value_offset;
                        out.put_float_at(copied_at, sum / count);
                    }
                }
                Some(having) => {
                    if self.agg_type == AggregationType::Avg {
                        let sum = work.get_float(value_at);
                        work.put_float_at(value_at, sum / avg_count(counts, key));
                        if having.satisfied(work, &self.out_schema, record) {
                            work.append_bytes_to(record, self.out_tuple_size, out);
                        }
                        work.put_float_at(value_at, sum);
                    } else if having.satisfied(work, &self.out_schema, record) {
                        work.append_bytes_to(record, self.out_tuple_size, out);
                    }
                }
            }
        }

        if out.position() == out_start {
            (EMPTY_WINDOW, EMPTY_WINDOW)
        } else {
            (out_start as i64, out.position() as i64)
        }
    }
}

impl Operator for Aggregation {
    fn kind(&self) -> OperatorKind {
        OperatorKind::Aggregation
    }

    fn process(
        &self,
        mut batch: WindowBatch,
        api: &mut dyn ResultApi,
    ) -> Result<(), OperatorError> {
        batch.init_window_pointers();

        // The batch-level timestamp comes from the first tuple of the
        // original input, captured before the buffer swap.
        let batch_ts = if batch.batch_end() > batch.batch_start() {
            batch.buffer().get_long(batch.batch_start())
        } else {
            -1
        };

        let mut out = self.pool.acquire();
        match (self.has_group_by(), self.incremental) {
            (false, false) => self.full_recompute(&mut batch, &mut out),
            (true, false) => self.full_recompute_grouped(&mut batch, &mut out),
            (false, true) => self.incremental_scalar(&mut batch, &mut out)?,
            (true, true) => self.incremental_grouped(&mut batch, &mut out)?,
        }

        if out.position() >= 8 {
            out.put_long_at(0, batch_ts);
        }

        let input = batch.replace_buffer(out);
        input.release();
        batch.set_schema(self.out_schema.clone());
        batch.set_start_timestamp(batch_ts);
        api.output_window_batch_result(batch);
        Ok(())
    }
}

impl fmt::Debug for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregation")
            .field("type", &self.agg_type)
            .field("group_by", &self.group_by.len())
            .field("having", &self.having.is_some())
            .field("incremental", &self.incremental)
            .finish()
    }
}

/// Running scalar state for the ungrouped incremental strategy.
struct ScalarState<'a> {
    op: &'a Aggregation,
    out: &'a mut Buffer,
    value: f32,
    count: i32,
}

impl IncrementalComputation for ScalarState<'_> {
    fn entered(&mut self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize) {
        self.count += 1;
        if self.op.agg_type != AggregationType::Count {
            self.value += self.op.attribute.eval_float(buffer, schema, tuple_offset);
        }
    }

    fn exited(
        &mut self,
        buffer: &Buffer,
        schema: &TupleSchema,
        tuple_offset: usize,
    ) -> Result<(), OperatorError> {
        self.count -= 1;
        if self.op.agg_type != AggregationType::Count {
            self.value -= self.op.attribute.eval_float(buffer, schema, tuple_offset);
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        buffer: &Buffer,
        _schema: &TupleSchema,
        window_start: i64,
        _window_end: i64,
    ) -> (i64, i64) {
        if self.count <= 0 {
            return (EMPTY_WINDOW, EMPTY_WINDOW);
        }

        let window_ts = buffer.get_long(window_offset(window_start));
        let out_start = self.out.position();
        self.out.put_long(window_ts);
        // AVG divides at emission time; the running sum stays intact so
        // later windows' incremental adjustments remain correct.
        let result = match self.op.agg_type {
            AggregationType::Count => self.count as f32,
            AggregationType::Avg => self.value / self.count as f32,
            _ => self.value,
        };
        self.out.put_float(result);
        self.out.put_bytes(self.op.out_schema.pad());
        (out_start as i64, self.out.position() as i64)
    }
}

/// Keyed working state for the grouped incremental strategy.
struct GroupedState<'a> {
    op: &'a Aggregation,
    work: &'a mut Buffer,
    out: &'a mut Buffer,
    key_offsets: FxHashMap<i32, usize>,
    counts: FxHashMap<i32, i32>,
}

impl IncrementalComputation for GroupedState<'_> {
    fn entered(&mut self, buffer: &Buffer, schema: &TupleSchema, tuple_offset: usize) {
        let key = self.op.group_key(buffer, schema, tuple_offset);

        if let Some(&record) = self.key_offsets.get(&key) {
            let value_at = record + self.op.value_offset;
            let current = self.work.get_float(value_at);
            if self.op.agg_type == AggregationType::Count {
                self.work.put_float_at(value_at, current + 1.0);
            } else {
                let delta = self.op.attribute.eval_float(buffer, schema, tuple_offset);
                self.work.put_float_at(value_at, current + delta);
                *self
                    .counts
                    .get_mut(&key)
                    .expect("count tracked for every live key") += 1;
            }
        } else {
            let record = self.work.position();
            ColumnRef(0).append_to(buffer, schema, tuple_offset, self.work);
            for column in &self.op.group_by {
                column.append_to(buffer, schema, tuple_offset, self.work);
            }
            if self.op.agg_type == AggregationType::Count {
                self.work.put_float(1.0);
            } else {
                self.work
                    .put_float(self.op.attribute.eval_float(buffer, schema, tuple_offset));
                self.counts.insert(key, 1);
            }
            self.work.put_bytes(self.op.out_schema.pad());
            self.key_offsets.insert(key, record);
        }
    }

    fn exited(
        &mut self,
        buffer: &Buffer,
        schema: &TupleSchema,
        tuple_offset: usize,
    ) -> Result<(), OperatorError> {
        let key = self.op.group_key(buffer, schema, tuple_offset);
        let Some(&record) = self.key_offsets.get(&key) else {
            return Err(OperatorError::UntrackedGroupKey {
                key,
                offset: tuple_offset,
            });
        };

        let value_at = record + self.op.value_offset;
        if self.op.agg_type == AggregationType::Count {
            let current = self.work.get_float(value_at) - 1.0;
            if current < GROUP_EPSILON {
                // The key leaves the window; its record bytes stay behind
                // in the working buffer, only the mapping dies.
                self.key_offsets.remove(&key);
            } else {
                self.work.put_float_at(value_at, current);
            }
        } else {
            let count = *self
                .counts
                .get(&key)
                .expect("count tracked for every live key");
            if count > 1 {
                let delta = self.op.attribute.eval_float(buffer, schema, tuple_offset);
                let current = self.work.get_float(value_at);
                self.work.put_float_at(value_at, current - delta);
                self.counts.insert(key, count - 1);
            } else {
                self.key_offsets.remove(&key);
                self.counts.remove(&key);
            }
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        _buffer: &Buffer,
        _schema: &TupleSchema,
        _window_start: i64,
        _window_end: i64,
    ) -> (i64, i64) {
        self.op
            .emit_groups(self.work, &self.key_offsets, &self.counts, self.out)
    }
}

/// Java-compatible fold over a byte slice: seed 1, `31 * h + byte`, with
/// sign-extended bytes.
fn bytes_hash(bytes: &[u8]) -> i32 {
    let mut hash: i32 = 1;
    for &byte in bytes {
        #[allow(clippy::cast_possible_wrap)]
        let signed = i32::from(byte as i8);
        hash = hash.wrapping_mul(31).wrapping_add(signed);
    }
    hash
}

#[inline]
fn avg_count(counts: &FxHashMap<i32, i32>, key: i32) -> f32 {
    *counts.get(&key).expect("AVG count tracked for every live key") as f32
}

#[inline]
fn window_offset(pointer: i64) -> usize {
    usize::try_from(pointer).expect("window pointer must be non-negative here")
}
