#![forbid(unsafe_code)]

//! Shared page cache.
//!
//! A [`PageCache`] owns a fixed arena of page slots that every attached
//! [`BackingSource`](crate::primitives::io::BackingSource) shares. Attaching a
//! source yields a [`CachedHandle`] whose byte-range reads and writes are
//! decomposed into page operations against the arena. Misses are fetched
//! from the source with the global lock released; concurrent requests for
//! the same page wait for that single fetch. Sequential readers can have the
//! following pages brought in by background pre-read workers, which switch
//! themselves off per handle when the pages they fetch go unused.

mod arena;
mod handle;
mod options;
mod preread;
mod shared;
mod stats;

pub use handle::{CachedHandle, ReadSegment};
pub use options::{
    AprParams, AttachOptions, CacheGeometry, CacheOptions, ConfigError, Role, DEFAULT_CACHE_SIZE,
    DEFAULT_PAGE_SIZE, DEFAULT_RECALC_BYTES, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use preread::PrereadHint;
pub use shared::{AttachRejected, PageCache, PageGuard, ReleaseHint, Residency};
pub use stats::{ArenaStats, CacheStats};
