//! # Operator Module
//!
//! Windowed operators for transforming window batches.
//!
//! ## Operator Types
//!
//! - **Stateless**: selection (per-window predicate filter)
//! - **Stateful**: aggregation (per-window or per-group reduction with
//!   four execution strategies)
//!
//! Operators consume a [`WindowBatch`], write their output into a freshly
//! pooled buffer, swap it into the batch and hand the batch to a
//! [`ResultApi`]. They share no mutable state apart from the buffer pool,
//! so many worker threads can run the same operator concurrently.

mod aggregation;
mod selection;

pub use aggregation::{Aggregation, AggregationType};
pub use selection::Selection;

use crate::window::WindowBatch;

/// Tag identifying an operator's behavior where dispatch differs by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    /// Stateless per-tuple filter.
    Selection,
    /// Stateful per-window reduction.
    Aggregation,
}

/// Errors that can occur in operators.
///
/// Every variant is a broken bookkeeping invariant. None of them is
/// retried: continuing would silently produce incorrect results, so the
/// batch is aborted.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// A two-stream call was dispatched into an operator with a different
    /// input arity.
    #[error("operator expects {expected} input stream(s), got {actual}")]
    UnsupportedArity {
        /// Arity the operator was built for.
        expected: usize,
        /// Arity of the dispatched call.
        actual: usize,
    },

    /// A tuple exited a window whose group key was never tracked.
    #[error("group key {key} exited window without ever entering (tuple offset {offset})")]
    UntrackedGroupKey {
        /// The folded group-by hash.
        key: i32,
        /// Byte offset of the offending tuple.
        offset: usize,
    },
}

/// Downstream hand-off for operator results.
///
/// The engine-facing implementation forwards into the result collector;
/// tests substitute an accumulator.
pub trait ResultApi {
    /// Accepts a finished output batch.
    fn output_window_batch_result(&mut self, batch: WindowBatch);
}

/// Trait implemented by all windowed operators.
pub trait Operator: Send + Sync {
    /// The operator's kind tag.
    fn kind(&self) -> OperatorKind;

    /// Processes a single-stream batch and forwards the result.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`OperatorError`] when a bookkeeping invariant is
    /// broken; the batch is dropped, not retried.
    fn process(&self, batch: WindowBatch, api: &mut dyn ResultApi) -> Result<(), OperatorError>;

    /// Processes a two-stream batch pair.
    ///
    /// Single-stream operators reject this dispatch outright.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::UnsupportedArity`] unless overridden by a
    /// join-capable operator.
    fn process_pair(
        &self,
        first: WindowBatch,
        second: WindowBatch,
        api: &mut dyn ResultApi,
    ) -> Result<(), OperatorError> {
        let _ = (first, second, api);
        Err(OperatorError::UnsupportedArity {
            expected: 1,
            actual: 2,
        })
    }
}
