//! Circular ingress buffer.
//!
//! Upstream dispatchers append serialized tuples here; tasks reference the
//! region they consumed through a free offset, and the result collector
//! frees regions strictly in task order once results are delivered.
//!
//! ## Design
//!
//! - Power-of-2 capacity with bitmask indexing for fast modulo
//! - Monotonic u64 fill/free offsets, never wrapped, masked on access
//! - One writer appends, one drainer frees; Acquire/Release ordering on
//!   the two indices makes the pair safe from different threads

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use super::pool::Buffer;

/// A circular byte buffer with explicit offset-based freeing.
///
/// Offsets handed out by [`put_bytes`](Self::put_bytes) are monotonic byte
/// positions; a task's free offset is the end of the region it consumed,
/// and [`free_up_to`](Self::free_up_to) makes everything before that
/// offset reusable.
///
/// # Thread Safety
///
/// Exactly one thread may append and one thread may free at any moment.
/// The appender and the freer may be different threads; reads of published
/// regions are safe from any thread because published bytes are never
/// rewritten until freed.
pub struct IngressBuffer {
    /// Ring storage.
    data: Box<[UnsafeCell<u8>]>,

    /// Free offset: bytes before this monotonic position are reusable.
    start: CachePadded<AtomicU64>,

    /// Fill offset: bytes before this monotonic position are published.
    end: CachePadded<AtomicU64>,

    /// Capacity mask for fast modulo (capacity - 1).
    mask: usize,
}

// SAFETY: the single-writer/single-freer contract above is what makes the
// UnsafeCell storage sound. The writer only touches bytes in the free
// region (at or past `end`, before `start + capacity`), readers only touch
// published bytes in `[start, end)`, and `free_up_to` never touches data.
#[allow(unsafe_code)]
unsafe impl Send for IngressBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for IngressBuffer {}

impl IngressBuffer {
    /// Creates an ingress buffer with the given capacity, rounded up to
    /// the next power of 2.
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.next_power_of_two();
        let data: Vec<UnsafeCell<u8>> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Self {
            data: data.into_boxed_slice(),
            start: CachePadded::new(AtomicU64::new(0)),
            end: CachePadded::new(AtomicU64::new(0)),
            mask: capacity - 1,
        }
    }

    /// Returns the capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of published, not yet freed bytes.
    ///
    /// Note: this is a snapshot and may change immediately after returning.
    #[must_use]
    pub fn len(&self) -> usize {
        let start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Relaxed);
        usize::try_from(end.saturating_sub(start)).unwrap_or(usize::MAX)
    }

    /// Returns true if no published bytes are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes freed so far.
    #[must_use]
    pub fn processed_bytes(&self) -> u64 {
        self.start.load(Ordering::Relaxed)
    }

    /// Appends bytes, returning the monotonic offset where they begin.
    ///
    /// Returns `None` when the free region cannot hold `bytes` - the
    /// dispatcher's backpressure signal. Must only be called by the single
    /// writer thread.
    pub fn put_bytes(&self, bytes: &[u8]) -> Option<u64> {
        let end = self.end.load(Ordering::Relaxed);
        let start = self.start.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_truncation)]
        let used = (end - start) as usize;
        if bytes.len() > self.capacity() - used {
            return None;
        }

        #[allow(clippy::cast_possible_truncation)]
        self.write_at(end as usize & self.mask, bytes);

        // Publish the bytes by advancing the fill offset.
        self.end.store(end + bytes.len() as u64, Ordering::Release);
        Some(end)
    }

    /// Frees every byte before the monotonic `offset`.
    ///
    /// Must only be called by the single freeing thread, with offsets that
    /// never move backwards.
    ///
    /// # Panics
    ///
    /// Panics when `offset` regresses or runs past the fill offset; either
    /// means task bookkeeping upstream is broken.
    pub fn free_up_to(&self, offset: u64) {
        let start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Acquire);
        assert!(
            offset >= start && offset <= end,
            "free offset {offset} outside live region [{start}, {end}]"
        );
        self.start.store(offset, Ordering::Release);
    }

    /// Copies `length` published bytes starting at monotonic `offset` to
    /// the cursor of `dest`.
    ///
    /// # Panics
    ///
    /// Panics when the range is not fully inside the published region.
    pub fn copy_to_buffer(&self, offset: u64, length: usize, dest: &mut Buffer) {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        assert!(
            offset >= start && offset + length as u64 <= end,
            "read [{offset}, {}) outside live region [{start}, {end}]",
            offset + length as u64
        );
        let mut scratch = vec![0u8; length];
        #[allow(clippy::cast_possible_truncation)]
        self.read_at(offset as usize & self.mask, &mut scratch);
        dest.put_bytes(&scratch);
    }

    fn write_at(&self, index: usize, bytes: &[u8]) {
        for (i, &byte) in bytes.iter().enumerate() {
            let cell = &self.data[(index + i) & self.mask];
            // SAFETY: this range is in the free region and we are the
            // single writer; no reader sees it until `end` is published.
            #[allow(unsafe_code)]
            unsafe {
                *cell.get() = byte;
            }
        }
    }

    fn read_at(&self, index: usize, dest: &mut [u8]) {
        for (i, slot) in dest.iter_mut().enumerate() {
            let cell = &self.data[(index + i) & self.mask];
            // SAFETY: the caller checked the range is published, and
            // published bytes are immutable until freed.
            #[allow(unsafe_code)]
            unsafe {
                *slot = *cell.get();
            }
        }
    }
}

impl std::fmt::Debug for IngressBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("processed_bytes", &self.processed_bytes())
            .finish()
    }
}
