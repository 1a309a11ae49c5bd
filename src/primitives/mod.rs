//! Low-level primitives the cache engine is built on.
//!
//! Includes the backing-source I/O abstraction and the blocking
//! synchronization helpers used by the pre-read machinery.

/// Synchronization primitives.
///
/// Counting semaphore and one-shot completion signal built on `parking_lot`.
pub mod concurrency;

/// Backing-source abstraction and implementations.
///
/// Positioned read/write/sync/truncate against the data a handle fronts.
pub mod io;
