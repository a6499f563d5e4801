//! # Squall Core
//!
//! The execution core of Squall, a parallel windowed stream-query engine.
//!
//! This crate provides:
//! - **Buffers**: pooled byte buffers and the circular ingress buffer all
//!   operators read from and write into
//! - **Tuples**: fixed-width tuple schemas, column references and predicates
//! - **Windows**: window batches with lazy pointer computation and the
//!   incremental enter/exit/evaluate protocol
//! - **Operators**: stateless selection and stateful aggregation with four
//!   execution strategies
//! - **Result collector**: a slot ring that reorders unordered parallel task
//!   completions into strictly ordered, backpressure-aware delivery
//!
//! ## Design Principles
//!
//! 1. **No locks on the data path** - buffer recycling uses a lock-free
//!    free-list, result ordering uses atomic state tags
//! 2. **Single-writer buffers** - exactly one thread populates a buffer
//!    before it is forwarded or released
//! 3. **Bounded backpressure** - a stalled downstream parks results in the
//!    ring, it never blocks a worker indefinitely
//! 4. **Deterministic delivery** - downstream order equals task-id order,
//!    not wall-clock completion order
//!
//! ## Example
//!
//! ```rust,ignore
//! use squall_core::{BufferPool, QueryConfig, Selection};
//!
//! let config = QueryConfig::default();
//! let pool = BufferPool::from_config(&config);
//!
//! // Build operators and a result collector, then hand window batches
//! // to worker threads.
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Selectively allowed where needed with justification
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod config;
pub mod ops;
pub mod ring;
pub mod tuple;
pub mod window;

// Re-export key types
pub use buffer::{BufferPool, IngressBuffer, PooledBuffer};
pub use config::QueryConfig;
pub use ops::{Aggregation, AggregationType, Operator, ResultApi, Selection};
pub use ring::{Downstream, LatencyMonitor, ResultCollector, RingInputs, Side};
pub use tuple::{ColumnRef, ColumnType, Predicate, TupleSchema};
pub use window::{WindowBatch, WindowDefinition, WindowKind};

/// Result type for squall-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for squall-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tuple schema construction errors
    #[error("Schema error: {0}")]
    Schema(#[from] tuple::SchemaError),

    /// Operator errors
    #[error("Operator error: {0}")]
    Operator(#[from] ops::OperatorError),
}
