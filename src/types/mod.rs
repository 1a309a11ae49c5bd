#![forbid(unsafe_code)]

//! Identifiers and the crate-wide error type.

use std::fmt;
use std::io;

/// Number of low address bits holding the page number.
pub const PAGE_BITS: u32 = 40;
/// Number of tag bits holding the rotating instance counter.
pub const INSTANCE_BITS: u32 = 8;
/// Largest byte offset (exclusive bound included) any handle may address.
pub const MAX_FILE_OFFSET: u64 = 0x7fff_ffff_ffff;
/// Largest number of handle-table entries a cache can be configured with.
pub const MAX_HANDLES: usize = (1 << 16) - 1;

const PAGE_MASK: u64 = (1 << PAGE_BITS) - 1;
const INSTANCE_MASK: u32 = (1 << INSTANCE_BITS) - 1;

/// Identifies one attachment of a backing source: the handle-table entry
/// combined with that entry's instance counter at attach time.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct HandleTag(pub u32);

impl HandleTag {
    /// Builds a tag from a handle-table index and its instance counter.
    pub fn new(index: usize, instance: u8) -> Self {
        HandleTag(((index as u32) << INSTANCE_BITS) | u32::from(instance))
    }

    /// Handle-table index this tag was issued for.
    pub fn index(self) -> usize {
        (self.0 >> INSTANCE_BITS) as usize
    }

    /// Instance counter of the attachment.
    pub fn instance(self) -> u8 {
        (self.0 & INSTANCE_MASK) as u8
    }

    /// Logical address of `page` for this handle.
    pub fn page(self, page: u64) -> PageAddr {
        PageAddr((u64::from(self.0) << PAGE_BITS) | (page & PAGE_MASK))
    }
}

impl fmt::Display for HandleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.instance())
    }
}

/// Cache lookup key: handle tag in the high bits, page number in the low bits.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageAddr(pub u64);

impl PageAddr {
    /// Tag of the handle owning this page.
    pub fn tag(self) -> HandleTag {
        HandleTag((self.0 >> PAGE_BITS) as u32)
    }

    /// Page number within the owning handle.
    pub fn page(self) -> u64 {
        self.0 & PAGE_MASK
    }

    /// Address of the following page of the same handle.
    pub fn next(self) -> PageAddr {
        self.tag().page(self.page() + 1)
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag(), self.page())
    }
}

/// Errors surfaced by the cache engine and its handles.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Backing-source failure, propagated verbatim.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Every slot is referenced or in transit; nothing can be evicted.
    #[error("no cache slot available: {in_use} of {slots} slots referenced")]
    OutOfCapacity {
        /// Total data slots in the arena.
        slots: usize,
        /// Slots pinned by readers or fetches.
        in_use: usize,
    },
    /// Offset or length falls outside the addressable range.
    #[error("offset out of range")]
    Overflow,
    /// Mutation attempted through a read-only attachment.
    #[error("handle is read-only")]
    ReadOnly,
    /// The backing source accepted fewer bytes than requested.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes the backing source reported written.
        written: usize,
        /// Bytes requested.
        expected: usize,
    },
    /// The cache is shutting down and accepts no new attachments.
    #[error("cache is shutting down")]
    ShuttingDown,
    /// The handle table has no free entry.
    #[error("handle table full ({0} handles)")]
    HandleTableFull(usize),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Cache options failed validation.
    #[error(transparent)]
    Config(#[from] crate::cache::ConfigError),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Validates that `[offset, offset + len)` lies inside the addressable range.
pub fn check_range(offset: u64, len: usize) -> Result<()> {
    let end = offset.checked_add(len as u64).ok_or(CacheError::Overflow)?;
    if offset > MAX_FILE_OFFSET || end > MAX_FILE_OFFSET {
        return Err(CacheError::Overflow);
    }
    Ok(())
}
