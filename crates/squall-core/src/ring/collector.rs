//! The result slot ring.
//!
//! Many worker threads finish tasks out of order; downstream must see
//! results in task-id order. Each completion lands in the slot indexed by
//! `(task_id - 1) mod N`, and a single elected drainer walks the ring from
//! `next`, forwarding and freeing strictly in order.
//!
//! ## Per-slot state machine
//!
//! ```text
//!          CAS (producer)              store (producer)
//!   FREE ------------------> FILLING ------------------> READY
//!    ^                                                     |
//!    | store (drainer,                  CAS (drainer,      |
//!    |  fully forwarded)                 only at `next`)   v
//!    +----------------------- DRAINING <------------------+
//!                                |            store (drainer, a consumer
//!                                +----------> READY  rejected; latch keeps
//!                                                    the resume position)
//! ```
//!
//! A producer finding its slot not yet FREE spins with bounded backoff:
//! the ring is deeper than downstream can currently drain, which is
//! backpressure, not a bug. Drain responsibility is elected through a
//! single-permit token acquired non-blockingly, so at most one thread ever
//! runs the drain loop and no producer blocks indefinitely.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};

use crate::buffer::{IngressBuffer, PooledBuffer};
use crate::config::QueryConfig;
use crate::window::{NO_MARK, UNSET_OFFSET};

use super::dispatch::{Downstream, LatencyMonitor, Side};

/// State tag of one result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Slot unused, available for a new task's result.
    Free = 0,
    /// A producer thread is writing result and offsets into the slot.
    Filling = 1,
    /// Result fully written, not yet forwarded.
    Ready = 2,
    /// The elected drainer is forwarding and freeing this slot.
    Draining = 3,
}

const FREE: u8 = SlotState::Free as u8;
const FILLING: u8 = SlotState::Filling as u8;
const READY: u8 = SlotState::Ready as u8;
const DRAINING: u8 = SlotState::Draining as u8;

/// The input buffers a ring frees against.
///
/// Join branches carry two independent offsets freed against two
/// independent ingress buffers; the difference is matched explicitly at
/// free time.
pub enum RingInputs {
    /// Single-stream query: one ingress buffer, one offset per slot.
    Single {
        /// The ingress buffer tasks consumed from.
        ingress: Arc<IngressBuffer>,
    },
    /// Join query: two upstreams with independent offsets.
    Join {
        /// Ingress of the first upstream.
        first: Arc<IngressBuffer>,
        /// Ingress of the second upstream.
        second: Arc<IngressBuffer>,
    },
}

/// Slot payload, guarded by the slot's atomic state tag.
struct SlotData {
    result: Option<PooledBuffer>,
    free_offsets: [i64; 2],
    /// Resume position into the downstream consumer list.
    latch: usize,
    mark: i64,
}

struct Slot {
    state: CachePadded<AtomicU8>,
    data: UnsafeCell<SlotData>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(FREE)),
            data: UnsafeCell::new(SlotData {
                result: None,
                free_offsets: [UNSET_OFFSET; 2],
                latch: 0,
                mark: NO_MARK,
            }),
        }
    }
}

/// Reorders out-of-order parallel task completions into in-order,
/// backpressure-aware downstream delivery, reclaiming result and input
/// buffers along the way.
pub struct ResultCollector {
    slots: Box<[Slot]>,
    /// Ring position of the next slot to drain, owned by the drainer.
    next: CachePadded<AtomicUsize>,
    /// Single-permit exclusivity token electing the drainer.
    draining: CachePadded<AtomicBool>,
    downstream: Vec<Arc<dyn Downstream>>,
    side: Side,
    inputs: RingInputs,
    monitor: Option<Arc<dyn LatencyMonitor>>,
    total_output_bytes: AtomicU64,
}

// SAFETY: slot payloads live in UnsafeCells, but access is serialized by
// the per-slot state machine: a producer touches the payload only between
// winning the FREE -> FILLING CAS and publishing READY, and the drainer
// only between winning the READY -> DRAINING CAS and publishing FREE or
// READY. Both hand-offs use Release stores paired with Acquire CAS loads.
#[allow(unsafe_code)]
unsafe impl Send for ResultCollector {}
#[allow(unsafe_code)]
unsafe impl Sync for ResultCollector {}

impl ResultCollector {
    /// Creates a ring with `config.ring_slots()` slots (4x the per-query
    /// task concurrency by default).
    #[must_use]
    pub fn new(
        config: &QueryConfig,
        inputs: RingInputs,
        side: Side,
        downstream: Vec<Arc<dyn Downstream>>,
        monitor: Option<Arc<dyn LatencyMonitor>>,
    ) -> Self {
        let slots: Vec<Slot> = (0..config.ring_slots()).map(|_| Slot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            next: CachePadded::new(AtomicUsize::new(0)),
            draining: CachePadded::new(AtomicBool::new(false)),
            downstream,
            side,
            inputs,
            monitor,
            total_output_bytes: AtomicU64::new(0),
        }
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when this ring frees two input sides per slot.
    #[must_use]
    pub fn is_join(&self) -> bool {
        matches!(self.inputs, RingInputs::Join { .. })
    }

    /// Total result bytes forwarded downstream so far.
    #[must_use]
    pub fn total_output_bytes(&self) -> u64 {
        self.total_output_bytes.load(Ordering::Relaxed)
    }

    /// Hands a completed single-stream task result to the ring.
    ///
    /// `free_offset` is the ingress offset reclaimed once the result is
    /// delivered; `mark` is an optional latency marker ([`NO_MARK`] for
    /// none). May spin briefly when the target slot is still occupied and
    /// may run the drain loop before returning; it never blocks on
    /// downstream.
    pub fn forward_and_free(
        &self,
        task_id: u64,
        result: PooledBuffer,
        free_offset: i64,
        mark: i64,
    ) {
        self.fill(task_id, result, [free_offset, UNSET_OFFSET], mark);
    }

    /// Hands a completed join task result to the ring, with one free
    /// offset per upstream. [`UNSET_OFFSET`] marks a side with nothing to
    /// free.
    pub fn forward_and_free_join(
        &self,
        task_id: u64,
        result: PooledBuffer,
        first_offset: i64,
        second_offset: i64,
        mark: i64,
    ) {
        self.fill(task_id, result, [first_offset, second_offset], mark);
    }

    pub(crate) fn fill(
        &self,
        task_id: u64,
        result: PooledBuffer,
        free_offsets: [i64; 2],
        mark: i64,
    ) {
        assert!(task_id >= 1, "task ids start at 1");
        #[allow(clippy::cast_possible_truncation)]
        let index = ((task_id - 1) % self.slots.len() as u64) as usize;
        let slot = &self.slots[index];

        // FREE -> FILLING. A producer lapping an undrained slot spins with
        // short bounded backoff until the drainer catches up.
        let backoff = Backoff::new();
        let mut warned = false;
        while slot
            .state
            .compare_exchange(FREE, FILLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if !warned {
                tracing::warn!(task_id, slot = index, "result collector blocked on undrained slot");
                warned = true;
            }
            backoff.snooze();
        }

        // SAFETY: winning the CAS above grants exclusive payload access
        // until the READY store below publishes the slot.
        #[allow(unsafe_code)]
        unsafe {
            let data = &mut *slot.data.get();
            data.result = Some(result);
            data.free_offsets = free_offsets;
            data.latch = 0;
            data.mark = mark;
        }
        slot.state.store(READY, Ordering::Release);

        // Drain election: non-blocking try-acquire of the single permit.
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another thread holds drain responsibility; it (or the
                // next acquirer) will forward this result.
                return;
            }
            let stalled = self.drain();
            self.draining.store(false, Ordering::Release);
            if stalled {
                // Downstream rejected; the slot waits READY with its
                // resume position and is retried on the next visit.
                return;
            }
            // A slot can turn READY between the drain loop's last check
            // and the token release above; re-check while unheld so that
            // result is not stranded until the next completion.
            let next = self.next.load(Ordering::Acquire);
            if self.slots[next].state.load(Ordering::Acquire) != READY {
                return;
            }
        }
    }

    /// Walks the ring from `next` while slots are READY. Returns true when
    /// it stopped because a downstream consumer rejected.
    fn drain(&self) -> bool {
        loop {
            let next = self.next.load(Ordering::Relaxed);
            let slot = &self.slots[next];
            if slot
                .state
                .compare_exchange(READY, DRAINING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }

            // SAFETY: winning the READY -> DRAINING CAS grants exclusive
            // payload access until the FREE or READY store below.
            #[allow(unsafe_code)]
            let data = unsafe { &mut *slot.data.get() };

            let mut rejected_at = None;
            {
                let result = data
                    .result
                    .as_ref()
                    .expect("drained slot holds a result buffer");
                let bytes = result.bytes();
                for (index, consumer) in self.downstream.iter().enumerate().skip(data.latch) {
                    let accepted = match self.side {
                        Side::First => consumer.try_dispatch_first(bytes),
                        Side::Second => consumer.try_dispatch_second(bytes),
                    };
                    if !accepted {
                        rejected_at = Some(index);
                        break;
                    }
                }
            }

            if let Some(index) = rejected_at {
                // Backpressure: bookmark the rejecting consumer and park
                // the slot READY again. Consumers before `index` have
                // already accepted and will not see the bytes twice.
                data.latch = index;
                slot.state.store(READY, Ordering::Release);
                return true;
            }

            if data.mark != NO_MARK {
                if let Some(monitor) = &self.monitor {
                    monitor.monitor(data.mark);
                }
                data.mark = NO_MARK;
            }

            let result = data
                .result
                .take()
                .expect("drained slot holds a result buffer");
            self.total_output_bytes
                .fetch_add(result.position() as u64, Ordering::Relaxed);
            result.release();

            let offsets = std::mem::replace(&mut data.free_offsets, [UNSET_OFFSET; 2]);
            data.latch = 0;
            match &self.inputs {
                RingInputs::Single { ingress } => {
                    // A slot that reached DRAINING without its offset ever
                    // populated means producer bookkeeping is broken.
                    assert!(
                        offsets[0] != UNSET_OFFSET,
                        "slot {next} drained with no input offset"
                    );
                    free_offset(ingress, offsets[0]);
                }
                RingInputs::Join { first, second } => {
                    // Here the unset sentinel is legitimate: a join branch
                    // may have nothing to free on one side.
                    if offsets[0] != UNSET_OFFSET {
                        free_offset(first, offsets[0]);
                    }
                    if offsets[1] != UNSET_OFFSET {
                        free_offset(second, offsets[1]);
                    }
                }
            }

            slot.state.store(FREE, Ordering::Release);
            self.next
                .store((next + 1) % self.slots.len(), Ordering::Release);
        }
    }
}

impl std::fmt::Debug for ResultCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCollector")
            .field("slots", &self.slots.len())
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("join", &self.is_join())
            .field("total_output_bytes", &self.total_output_bytes())
            .finish()
    }
}

fn free_offset(ingress: &IngressBuffer, offset: i64) {
    ingress.free_up_to(u64::try_from(offset).expect("free offset must be non-negative"));
}
