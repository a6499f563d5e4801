//! Query execution configuration.
//!
//! This module defines the per-query sizing knobs shared by the buffer pool,
//! the ingress buffer and the result collector.

/// Default number of in-flight tasks per query.
pub const DEFAULT_TASK_CONCURRENCY: usize = 16;

/// Default ring-slot multiplier: the collector holds
/// `slot_multiplier * task_concurrency` slots.
pub const DEFAULT_SLOT_MULTIPLIER: usize = 4;

/// Default initial capacity of a pooled buffer in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Default number of buffers pre-populated into the pool.
pub const DEFAULT_POOL_PREALLOC: usize = 64;

/// Default ingress buffer capacity in bytes (rounded up to a power of 2).
pub const DEFAULT_INGRESS_CAPACITY: usize = 1 << 20;

/// Configuration for one query's execution core.
///
/// The slot ring is sized from this configuration: a query with
/// `task_concurrency` in-flight tasks gets
/// `slot_multiplier * task_concurrency` result slots, so a producer only
/// spins when it laps the drainer by a full ring.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Maximum number of tasks in flight at once.
    pub task_concurrency: usize,

    /// Ring slots per unit of task concurrency.
    pub slot_multiplier: usize,

    /// Initial byte capacity of each pooled buffer.
    pub buffer_capacity: usize,

    /// Number of buffers allocated into the pool up front.
    pub pool_prealloc: usize,

    /// Byte capacity of the circular ingress buffer.
    pub ingress_capacity: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            task_concurrency: DEFAULT_TASK_CONCURRENCY,
            slot_multiplier: DEFAULT_SLOT_MULTIPLIER,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            pool_prealloc: DEFAULT_POOL_PREALLOC,
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
        }
    }
}

impl QueryConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> QueryConfigBuilder {
        QueryConfigBuilder::default()
    }

    /// Total number of result slots in the collector ring.
    #[must_use]
    pub fn ring_slots(&self) -> usize {
        self.slot_multiplier * self.task_concurrency
    }
}

/// Builder for `QueryConfig`.
#[derive(Debug, Default)]
pub struct QueryConfigBuilder {
    task_concurrency: Option<usize>,
    slot_multiplier: Option<usize>,
    buffer_capacity: Option<usize>,
    pool_prealloc: Option<usize>,
    ingress_capacity: Option<usize>,
}

impl QueryConfigBuilder {
    /// Sets the number of in-flight tasks.
    #[must_use]
    pub fn task_concurrency(mut self, tasks: usize) -> Self {
        self.task_concurrency = Some(tasks.max(1));
        self
    }

    /// Sets the ring-slot multiplier.
    #[must_use]
    pub fn slot_multiplier(mut self, multiplier: usize) -> Self {
        self.slot_multiplier = Some(multiplier.max(1));
        self
    }

    /// Sets the initial capacity of pooled buffers.
    #[must_use]
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = Some(bytes);
        self
    }

    /// Sets the number of buffers allocated up front.
    #[must_use]
    pub fn pool_prealloc(mut self, buffers: usize) -> Self {
        self.pool_prealloc = Some(buffers);
        self
    }

    /// Sets the ingress buffer capacity.
    #[must_use]
    pub fn ingress_capacity(mut self, bytes: usize) -> Self {
        self.ingress_capacity = Some(bytes);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> QueryConfig {
        QueryConfig {
            task_concurrency: self.task_concurrency.unwrap_or(DEFAULT_TASK_CONCURRENCY),
            slot_multiplier: self.slot_multiplier.unwrap_or(DEFAULT_SLOT_MULTIPLIER),
            buffer_capacity: self.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY),
            pool_prealloc: self.pool_prealloc.unwrap_or(DEFAULT_POOL_PREALLOC),
            ingress_capacity: self.ingress_capacity.unwrap_or(DEFAULT_INGRESS_CAPACITY),
        }
    }
}
