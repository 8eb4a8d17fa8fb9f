//! Zero-copy buffer pool with `bytes::Bytes` integration.
//!
//! # Design
//!
//! `Bytes::from_owner()` lets a pooled buffer carry its own return path. When
//! the frame payload is frozen into `Bytes` and handed to the transport, the
//! buffer goes back to the pool as soon as the last `Bytes` clone is dropped,
//! whichever thread that happens on.
//!
//! ## Memory Flow
//!
//! ```text
//! 1. BufferPool pre-allocates `pool_size` buffers of `buffer_capacity` bytes
//! 2. acquire() waits for a permit and pops the oldest idle buffer (FIFO)
//! 3. The decoder reads file contents directly into the buffer
//! 4. freeze() wraps it in Bytes (no copy, just an Arc)
//! 5. Publisher keeps one clone for the monitor, the transport another
//! 6. When every clone is gone, BufferOwner::drop() pushes the buffer back
//! ```
//!
//! ## Shutdown
//!
//! `shutdown()` closes the semaphore. Every task parked in `acquire()` wakes
//! up; idle buffers can still be drained, after which acquire reports
//! [`PoolError::Closed`]. Calling `shutdown()` again is a no-op.

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::PoolError;

/// One arena slot: the buffer plus its stable index.
struct Slot {
    index: usize,
    data: Vec<u8>,
}

/// Internal state for the buffer pool.
///
/// Shared between the pool handle and every outstanding buffer.
struct BufferPoolInner {
    /// Idle buffers in release order
    free_slots: SegQueue<Slot>,
    /// One permit per idle buffer
    semaphore: Semaphore,
    /// Capacity of each buffer in bytes
    buffer_capacity: usize,
    /// Total number of buffers in the pool
    pool_size: usize,
    /// Number of buffers currently idle
    available: AtomicUsize,
    /// Metrics: total checkouts
    total_acquires: AtomicU64,
    /// Metrics: total checkins
    total_returns: AtomicU64,
}

impl BufferPoolInner {
    fn checkin(&self, slot: Slot) {
        // Length is never changed, so the next holder can write anywhere.
        debug_assert_eq!(slot.data.len(), self.buffer_capacity);

        self.free_slots.push(slot);
        self.available.fetch_add(1, Ordering::AcqRel);
        self.total_returns.fetch_add(1, Ordering::AcqRel);

        // Slot is visible before the permit that advertises it.
        self.semaphore.add_permits(1);
    }
}

/// Pool of pre-allocated byte buffers for zero-allocation frame handling.
///
/// Cloning the pool is cheap and yields another handle to the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    /// Create a new buffer pool with the specified size and buffer capacity.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size` is 0 or `buffer_capacity` is 0.
    #[must_use]
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");
        assert!(buffer_capacity > 0, "buffer_capacity must be > 0");

        let free_slots = SegQueue::new();
        for index in 0..pool_size {
            free_slots.push(Slot {
                index,
                data: vec![0u8; buffer_capacity],
            });
        }

        info!(
            pool_size,
            buffer_capacity_mb = buffer_capacity as f64 / (1024.0 * 1024.0),
            total_mb = (pool_size * buffer_capacity) as f64 / (1024.0 * 1024.0),
            "BufferPool created"
        );

        Self {
            inner: Arc::new(BufferPoolInner {
                free_slots,
                semaphore: Semaphore::new(pool_size),
                buffer_capacity,
                pool_size,
                available: AtomicUsize::new(pool_size),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a buffer, waiting until one is released if the pool is empty.
    ///
    /// Returns [`PoolError::Closed`] once the pool has been shut down and no
    /// idle buffer is left. Never waits after shutdown.
    pub async fn acquire(&self) -> Result<PooledBuffer, PoolError> {
        match self.inner.semaphore.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.checkout()
            }
            Err(_) => self.checkout_after_shutdown(),
        }
    }

    /// Try to acquire a buffer without waiting.
    ///
    /// [`PoolError::Exhausted`] is the backpressure signal.
    pub fn try_acquire(&self) -> Result<PooledBuffer, PoolError> {
        match self.inner.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.checkout()
            }
            Err(TryAcquireError::NoPermits) => Err(PoolError::Exhausted),
            Err(TryAcquireError::Closed) => self.checkout_after_shutdown(),
        }
    }

    /// Return a buffer to the pool.
    ///
    /// Equivalent to dropping it; provided for call sites that want the
    /// hand-back to read explicitly. Never blocks.
    pub fn release(&self, buffer: PooledBuffer) {
        debug!(slot = buffer.index(), "Releasing pooled buffer");
        drop(buffer);
    }

    /// Close the pool and wake every task blocked in [`acquire`](Self::acquire).
    ///
    /// Idempotent. Buffers still checked out are accepted back normally.
    pub fn shutdown(&self) {
        if self.inner.semaphore.is_closed() {
            return;
        }
        self.inner.semaphore.close();
        info!(
            outstanding = self.outstanding(),
            total_acquires = self.total_acquires(),
            total_returns = self.total_returns(),
            "BufferPool shut down"
        );
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    fn checkout(&self) -> Result<PooledBuffer, PoolError> {
        // A permit guarantees a slot unless a post-shutdown drain raced us.
        match self.inner.free_slots.pop() {
            Some(slot) => Ok(self.wrap(slot)),
            None if self.is_closed() => Err(PoolError::Closed),
            None => Err(PoolError::Exhausted),
        }
    }

    fn checkout_after_shutdown(&self) -> Result<PooledBuffer, PoolError> {
        let slot = self.inner.free_slots.pop().ok_or(PoolError::Closed)?;
        Ok(self.wrap(slot))
    }

    fn wrap(&self, slot: Slot) -> PooledBuffer {
        self.inner.available.fetch_sub(1, Ordering::AcqRel);
        self.inner.total_acquires.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            slot: Some(slot),
            actual_len: 0,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of currently idle buffers.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Number of buffers checked out and not yet returned.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.pool_size - self.available()
    }

    /// Total number of buffers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.pool_size
    }

    /// Capacity of each buffer in bytes.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// Total number of buffer acquisitions since pool creation.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Acquire)
    }

    /// Total number of buffer returns since pool creation.
    #[must_use]
    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::Acquire)
    }
}

/// A buffer checked out of the pool, returned automatically on drop.
///
/// The whole capacity is writable through [`as_mut_slice`](Self::as_mut_slice);
/// [`len`](Self::len) marks how much of it holds valid data.
pub struct PooledBuffer {
    /// Taken on freeze
    slot: Option<Slot>,
    /// Valid bytes at the front of the buffer
    actual_len: usize,
    /// Return path
    pool: Arc<BufferPoolInner>,
}

impl PooledBuffer {
    /// Arena index of this buffer. Stable across reuse.
    #[must_use]
    pub fn index(&self) -> usize {
        self.slot.as_ref().map_or(usize::MAX, |s| s.index)
    }

    /// The valid data.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.slot {
            Some(slot) => &slot.data[..self.actual_len],
            None => &[],
        }
    }

    /// The full writable region (always `capacity()` bytes).
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.slot {
            Some(slot) => &mut slot.data[..],
            None => &mut [],
        }
    }

    /// Buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slot.as_ref().map_or(0, |s| s.data.len())
    }

    /// Length of valid data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actual_len
    }

    /// Whether no valid data has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actual_len == 0
    }

    /// Mark the first `len` bytes as valid.
    pub fn set_len(&mut self, len: usize) -> Result<(), PoolError> {
        let capacity = self.capacity();
        if len > capacity {
            return Err(PoolError::CapacityExceeded {
                requested: len,
                capacity,
            });
        }
        self.actual_len = len;
        Ok(())
    }

    /// Copy `src` to the front of the buffer and mark it valid.
    pub fn copy_from_slice(&mut self, src: &[u8]) -> Result<(), PoolError> {
        let capacity = self.capacity();
        if src.len() > capacity {
            return Err(PoolError::CapacityExceeded {
                requested: src.len(),
                capacity,
            });
        }
        self.as_mut_slice()[..src.len()].copy_from_slice(src);
        self.actual_len = src.len();
        Ok(())
    }

    /// Convert into `Bytes` without copying.
    ///
    /// The buffer returns to the pool when the returned `Bytes` and all of
    /// its clones are dropped.
    #[must_use]
    pub fn freeze(mut self) -> Bytes {
        match self.slot.take() {
            Some(slot) => Bytes::from_owner(BufferOwner {
                slot: Some(slot),
                actual_len: self.actual_len,
                pool: Arc::clone(&self.pool),
            }),
            None => Bytes::new(),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.checkin(slot);
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("index", &self.index())
            .field("len", &self.actual_len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Owner handed to `Bytes::from_owner()` by [`PooledBuffer::freeze`].
struct BufferOwner {
    slot: Option<Slot>,
    actual_len: usize,
    pool: Arc<BufferPoolInner>,
}

impl AsRef<[u8]> for BufferOwner {
    fn as_ref(&self) -> &[u8] {
        match &self.slot {
            Some(slot) => &slot.data[..self.actual_len],
            None => &[],
        }
    }
}

impl Drop for BufferOwner {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.checkin(slot);
        }
    }
}
