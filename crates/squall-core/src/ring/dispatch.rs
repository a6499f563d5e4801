//! Downstream dispatch and latency collaborators.
//!
//! Both collaborators are external to the core: downstream consumers must
//! answer immediately (accept or reject, never block), and the latency
//! monitor is fire-and-forget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which logical input side of a join-capable consumer this query branch
/// feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The first (or only) upstream of the consumer.
    First,
    /// The second upstream of a join-capable consumer.
    Second,
}

/// A non-blocking downstream consumer of result bytes.
///
/// One entry point per logical input side. Implementations answer
/// immediately: `true` accepts the bytes, `false` signals backpressure and
/// the result collector will retry from this consumer later.
pub trait Downstream: Send + Sync {
    /// Offers result bytes to the consumer's first input side.
    fn try_dispatch_first(&self, data: &[u8]) -> bool;

    /// Offers result bytes to the consumer's second input side.
    fn try_dispatch_second(&self, data: &[u8]) -> bool;
}

/// Fire-and-forget latency recording.
pub trait LatencyMonitor: Send + Sync {
    /// Records the delta between now and the given marker.
    fn monitor(&self, mark: i64);
}

/// Milliseconds since the Unix epoch, the clock latency markers use.
#[must_use]
pub fn now_millis() -> i64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

/// Default latency monitor keeping a running count and sum of deltas.
#[derive(Debug, Default)]
pub struct SystemLatencyMonitor {
    samples: AtomicU64,
    total_millis: AtomicU64,
}

impl SystemLatencyMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded samples.
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Mean recorded latency in milliseconds, 0 with no samples.
    #[must_use]
    pub fn mean_millis(&self) -> f64 {
        let samples = self.samples();
        if samples == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.total_millis.load(Ordering::Relaxed) as f64 / samples as f64
        }
    }
}

impl LatencyMonitor for SystemLatencyMonitor {
    fn monitor(&self, mark: i64) {
        let delta = now_millis().saturating_sub(mark).max(0);
        self.samples.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_sign_loss)]
        self.total_millis.fetch_add(delta as u64, Ordering::Relaxed);
    }
}
