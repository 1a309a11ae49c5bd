//! Shared, memory-resident page cache for slow backing sources.
//!
//! The crate is organized the way the cache is layered:
//!
//! * [`types`]: page addresses, handle tags, and the crate error type.
//! * [`primitives`]: the backing-source I/O trait with file and in-memory
//!   implementations, plus the semaphore and one-shot signal used by the
//!   pre-read workers.
//! * [`cache`]: the slot arena, the shared page cache, the per-source
//!   handle front end, and the pre-read scheduler.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pagecache::cache::{AttachOptions, CacheOptions, PageCache};
//! use pagecache::primitives::io::StdFileSource;
//!
//! # fn main() -> pagecache::types::Result<()> {
//! let cache = PageCache::new(CacheOptions::default())?;
//! let file = Arc::new(StdFileSource::open("data.bin")?);
//! let handle = cache
//!     .attach(file, AttachOptions::read_only())
//!     .map_err(|rejected| rejected.error)?;
//! let mut buf = vec![0u8; 4096];
//! let n = handle.read(&mut buf, 0)?;
//! println!("read {n} bytes");
//! handle.detach();
//! cache.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod primitives;
pub mod types;

pub use cache::{CacheOptions, CachedHandle, PageCache};
pub use primitives::io::BackingSource;
pub use types::{CacheError, Result};
