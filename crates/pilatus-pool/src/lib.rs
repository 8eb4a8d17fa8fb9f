//! Fixed-capacity buffer pool for detector frame handling.
//!
//! Every frame that leaves the watch folder is read straight into one of a
//! fixed number of equally sized, pre-allocated byte buffers. The buffer then
//! travels decoder → publisher → transport and comes back to the pool exactly
//! once, when the last holder lets go of it.
//!
//! - [`BufferPool`]: the pool itself (acquire / release / shutdown)
//! - [`PooledBuffer`]: a checked-out buffer; returns itself on drop or can be
//!   frozen into a reference-counted [`bytes::Bytes`] that returns the buffer
//!   when the final clone is dropped
//!
//! # Ownership Model
//!
//! ```text
//! BufferPool::acquire() ──► PooledBuffer (unique, mutable)
//!                               │ freeze()
//!                               ▼
//!                         Bytes (shared, read-only) ──► publisher / monitor / transport
//!                               │ last clone dropped
//!                               ▼
//!                         buffer pushed back onto the free list
//! ```
//!
//! A buffer is never held by two mutable owners, and release cannot be
//! called twice because the handle is consumed by it.
//!
//! # Example
//!
//! ```
//! use pilatus_pool::BufferPool;
//!
//! # tokio_test::block_on(async {
//! let pool = BufferPool::new(4, 1024);
//!
//! let mut buffer = pool.acquire().await.unwrap();
//! buffer.copy_from_slice(b"pixels").unwrap();
//!
//! let payload = buffer.freeze();
//! assert_eq!(pool.available(), 3);
//!
//! drop(payload);
//! assert_eq!(pool.available(), 4);
//! # });
//! ```

pub mod buffer_pool;

pub use buffer_pool::{BufferPool, PooledBuffer};

use thiserror::Error;

/// Errors reported by [`BufferPool`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was shut down and has no idle buffer left to hand out.
    #[error("buffer pool is closed")]
    Closed,

    /// No idle buffer is available right now (non-blocking acquire only).
    #[error("buffer pool exhausted")]
    Exhausted,

    /// A write would exceed the fixed buffer capacity.
    #[error("{requested} bytes exceed buffer capacity of {capacity} bytes")]
    CapacityExceeded {
        /// Bytes the caller tried to store
        requested: usize,
        /// Capacity of every buffer in the pool
        capacity: usize,
    },
}
