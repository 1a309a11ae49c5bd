use std::fmt;

/// Byte and page counters for one handle, or rolled up for the whole cache.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheStats {
    /// Bytes brought into the cache by pre-read.
    pub bytes_preread: u64,
    /// Bytes brought into the cache by foreground reads.
    pub bytes_read: u64,
    /// Bytes delivered to callers from cached pages.
    pub bytes_get: u64,
    /// Bytes read directly from the backing source without caching.
    pub bytes_pass: u64,
    /// Bytes written through to the backing source.
    pub bytes_write: u64,
    /// Bytes copied into resident pages by writes.
    pub bytes_put: u64,
    /// Page lookups that found the page resident.
    pub hits: u64,
    /// Page lookups that had to fetch (or found nothing, for writes).
    pub misses: u64,
    /// Hits on pages a pre-read brought in.
    pub hits_preread: u64,
    /// Pages fetched by pre-read.
    pub misses_preread: u64,
}

impl CacheStats {
    /// Adds every counter of `other` into `self`.
    pub fn merge(&mut self, other: &CacheStats) {
        self.bytes_preread += other.bytes_preread;
        self.bytes_read += other.bytes_read;
        self.bytes_get += other.bytes_get;
        self.bytes_pass += other.bytes_pass;
        self.bytes_write += other.bytes_write;
        self.bytes_put += other.bytes_put;
        self.hits += other.hits;
        self.misses += other.misses;
        self.hits_preread += other.hits_preread;
        self.misses_preread += other.misses_preread;
    }

    /// Percentage of pre-read pages that were later hit.
    pub fn preread_hit_percent(&self) -> u64 {
        if self.misses_preread == 0 {
            0
        } else {
            self.hits_preread * 100 / self.misses_preread
        }
    }

    /// Fraction of page lookups that hit.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read={} get={} pass={} write={} put={} hits={} misses={} preread={} hits_pr={} misses_pr={}",
            self.bytes_read,
            self.bytes_get,
            self.bytes_pass,
            self.bytes_write,
            self.bytes_put,
            self.hits,
            self.misses,
            self.bytes_preread,
            self.hits_preread,
            self.misses_preread
        )
    }
}

/// Point-in-time view of the slot arena.
#[derive(Default, Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArenaStats {
    /// Data slots in the arena.
    pub slots: usize,
    /// Slots holding a page (resident or in transit).
    pub resident: usize,
    /// Slots on the free ring.
    pub free: usize,
    /// Slots with a non-zero in-use count.
    pub in_use: usize,
    /// Handles currently attached.
    pub attached: usize,
    /// Pages recycled from the LRU ring.
    pub evictions: u64,
    /// Backing-source fetches started.
    pub fetches: u64,
    /// Backing-source fetches that failed.
    pub fetch_failures: u64,
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slots={} resident={} free={} in_use={} attached={} evictions={} fetches={} fetch_failures={}",
            self.slots,
            self.resident,
            self.free,
            self.in_use,
            self.attached,
            self.evictions,
            self.fetches,
            self.fetch_failures
        )
    }
}
