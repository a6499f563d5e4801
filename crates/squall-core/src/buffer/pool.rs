//! Pooled byte buffers with explicit acquire/release lifecycle.
//!
//! The pool keeps released buffer storage on a lock-free free-list so the
//! hot data-copy path never takes a lock. Acquire pops from the free-list
//! or allocates; release clears the cursor and pushes the storage back.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// A growable byte region with a write cursor and random access.
///
/// Appends (`put_*`) write at the cursor and advance it. Random-access
/// reads and writes (`get_*` / `put_*_at`) address bytes below the cursor
/// and never move it. All values use little-endian encoding.
///
/// # Panics
///
/// Random-access methods panic when the addressed range lies beyond the
/// cursor. An out-of-range offset means operator bookkeeping is broken,
/// which is a fatal condition, not a recoverable error.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    /// Creates a buffer with the given initial capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Current write cursor, equal to the number of bytes written.
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing has been written yet.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends an i64 at the cursor.
    #[inline]
    pub fn put_long(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an i32 at the cursor.
    #[inline]
    pub fn put_int(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an f32 at the cursor.
    #[inline]
    pub fn put_float(&mut self, value: f32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends raw bytes at the cursor.
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Reads an i64 at the given offset.
    #[inline]
    #[must_use]
    pub fn get_long(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.fixed_at::<8>(offset))
    }

    /// Reads an i32 at the given offset.
    #[inline]
    #[must_use]
    pub fn get_int(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.fixed_at::<4>(offset))
    }

    /// Reads an f32 at the given offset.
    #[inline]
    #[must_use]
    pub fn get_float(&self, offset: usize) -> f32 {
        f32::from_le_bytes(self.fixed_at::<4>(offset))
    }

    /// Overwrites an i64 at the given offset without moving the cursor.
    #[inline]
    pub fn put_long_at(&mut self, offset: usize, value: i64) {
        self.range_at(offset, 8).copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrites an i32 at the given offset without moving the cursor.
    #[inline]
    pub fn put_int_at(&mut self, offset: usize, value: i32) {
        self.range_at(offset, 4).copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrites an f32 at the given offset without moving the cursor.
    #[inline]
    pub fn put_float_at(&mut self, offset: usize, value: f32) {
        self.range_at(offset, 4).copy_from_slice(&value.to_le_bytes());
    }

    /// Returns the written bytes in `[offset, offset + length)`.
    #[inline]
    #[must_use]
    pub fn slice(&self, offset: usize, length: usize) -> &[u8] {
        assert!(
            offset + length <= self.data.len(),
            "buffer read [{offset}, {}) beyond cursor {}",
            offset + length,
            self.data.len()
        );
        &self.data[offset..offset + length]
    }

    /// All bytes written so far.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bulk-copies `length` bytes starting at `src_offset` to the cursor of
    /// `dest`.
    #[inline]
    pub fn append_bytes_to(&self, src_offset: usize, length: usize, dest: &mut Buffer) {
        dest.put_bytes(self.slice(src_offset, length));
    }

    /// Resets the cursor to zero, keeping the allocation.
    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Allocated capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    fn fixed_at<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(offset, N));
        out
    }

    #[inline]
    fn range_at(&mut self, offset: usize, length: usize) -> &mut [u8] {
        assert!(
            offset + length <= self.data.len(),
            "buffer write [{offset}, {}) beyond cursor {}",
            offset + length,
            self.data.len()
        );
        &mut self.data[offset..offset + length]
    }
}

#[derive(Debug)]
struct PoolInner {
    free: ArrayQueue<Buffer>,
    buffer_capacity: usize,
    allocated: AtomicUsize,
}

impl PoolInner {
    fn recycle(&self, mut buffer: Buffer) {
        buffer.clear();
        // If the free-list is full the storage is simply dropped, matching
        // the release contract of a fixed-size pool.
        let _ = self.free.push(buffer);
    }
}

/// A pool of growable byte buffers with a lock-free free-list.
///
/// `acquire` reuses a released buffer when one is available and allocates
/// otherwise; there is no global lock anywhere on the acquire/release path.
/// Acquired buffers always start with their cursor at zero. Content is not
/// zeroed.
///
/// Cloning the pool produces another handle to the same free-list.
///
/// # Example
///
/// ```
/// use squall_core::BufferPool;
///
/// let pool = BufferPool::new(8, 1024);
/// let mut buf = pool.acquire();
/// buf.put_long(42);
/// buf.release();
/// assert_eq!(pool.acquire().position(), 0);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Creates a pool holding at most `slots` free buffers, each created
    /// with `buffer_capacity` bytes of initial capacity.
    #[must_use]
    pub fn new(slots: usize, buffer_capacity: usize) -> Self {
        assert!(slots > 0, "pool must have at least one slot");
        Self {
            inner: Arc::new(PoolInner {
                free: ArrayQueue::new(slots),
                buffer_capacity,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Creates a pool sized from a query configuration, pre-populating
    /// `pool_prealloc` buffers so steady-state acquires never allocate.
    #[must_use]
    pub fn from_config(config: &crate::config::QueryConfig) -> Self {
        let slots = config.pool_prealloc.max(config.ring_slots()).max(1);
        let pool = Self::new(slots, config.buffer_capacity);
        for _ in 0..config.pool_prealloc {
            let _ = pool
                .inner
                .free
                .push(Buffer::with_capacity(config.buffer_capacity));
        }
        pool
    }

    /// Acquires a buffer with its cursor at zero.
    ///
    /// Pops from the free-list when possible, otherwise allocates. The
    /// pool grows rather than failing; capacity planning is the caller's
    /// concern.
    #[must_use]
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self.inner.free.pop().unwrap_or_else(|| {
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
            Buffer::with_capacity(self.inner.buffer_capacity)
        });
        debug_assert_eq!(buffer.position(), 0);
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers currently on the free-list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Number of buffers allocated beyond the pre-populated set.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// A buffer borrowed from a [`BufferPool`].
///
/// Dereferences to [`Buffer`] for reads and writes. Call
/// [`release`](Self::release) to return the storage explicitly; dropping
/// the handle returns it as well. After release the owner forfeits the
/// reference, which the move-by-value signature enforces.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Buffer>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Returns the storage to the pool with the cursor reset.
    pub fn release(mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.recycle(buffer);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    #[inline]
    fn deref(&self) -> &Buffer {
        self.buffer.as_ref().expect("buffer already released")
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer.as_mut().expect("buffer already released")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.recycle(buffer);
        }
    }
}
