use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, trace, warn};

use super::options::AprParams;
use super::preread::{
    AdaptivePolicy, PrereadHint, PrereadOp, PrereadRange, PrereadState, PrereadStatus,
};
use super::shared::{CacheCore, ReleaseHint, Residency};
use super::stats::CacheStats;
use crate::primitives::concurrency::Signal;
use crate::primitives::io::BackingSource;
use crate::types::{check_range, CacheError, HandleTag, Result, MAX_FILE_OFFSET};

/// One segment of a vectored read.
#[derive(Debug)]
pub struct ReadSegment<'a> {
    /// Byte offset in the source.
    pub offset: u64,
    /// Destination; its length is the request size.
    pub buf: &'a mut [u8],
}

struct HandleState {
    stats: CacheStats,
    preread: PrereadState,
}

/// Byte-range front end for one attached backing source.
///
/// Reads are served page by page from the shared cache, fetching misses
/// from the source. Writes go to the source first and are then copied into
/// whichever touched pages are resident. Obtained from
/// [`PageCache::attach`](super::PageCache::attach).
pub struct CachedHandle {
    core: Arc<CacheCore>,
    me: Weak<CachedHandle>,
    source: Arc<dyn BackingSource>,
    tag: HandleTag,
    read_write: bool,
    structured: bool,
    detached: AtomicBool,
    /// Shared for reads and pre-reads, exclusive for writes, truncation, and
    /// teardown.
    io_lock: RwLock<()>,
    state: Mutex<HandleState>,
}

impl fmt::Debug for CachedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedHandle")
            .field("path", &self.source.path())
            .field("tag", &self.tag)
            .field("read_write", &self.read_write)
            .field("structured", &self.structured)
            .finish()
    }
}

impl CachedHandle {
    pub(crate) fn new(
        core: Arc<CacheCore>,
        source: Arc<dyn BackingSource>,
        tag: HandleTag,
        read_write: bool,
        structured: bool,
    ) -> Arc<Self> {
        let policy = AdaptivePolicy::new(core.apr(), core.geometry().page_size);
        Arc::new_cyclic(|me| Self {
            core,
            me: me.clone(),
            source,
            tag,
            read_write,
            structured,
            detached: AtomicBool::new(false),
            io_lock: RwLock::new(()),
            state: Mutex::new(HandleState {
                stats: CacheStats::default(),
                preread: PrereadState::new(policy),
            }),
        })
    }

    /// Tag identifying this attachment's pages.
    pub fn tag(&self) -> HandleTag {
        self.tag
    }

    /// Diagnostic name of the backing source.
    pub fn path(&self) -> &str {
        self.source.path()
    }

    /// True when writes and truncation are allowed.
    pub fn is_read_write(&self) -> bool {
        self.read_write
    }

    /// True when pages are demoted once fully consumed.
    pub fn is_structured(&self) -> bool {
        self.structured
    }

    /// Snapshot of this handle's counters.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Pre-read parameters in effect, with derived defaults filled in.
    pub fn preread_params(&self) -> AprParams {
        self.state.lock().preread.policy.params()
    }

    /// True while sequential reads still trigger automatic pre-read.
    pub fn auto_preread_active(&self) -> bool {
        self.core.can_preread() && self.state.lock().preread.policy.active()
    }

    pub(crate) fn source(&self) -> &Arc<dyn BackingSource> {
        &self.source
    }

    pub(crate) fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.io_lock.write()
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.detached.load(Ordering::Acquire) {
            return Err(CacheError::Invalid("handle is detached"));
        }
        Ok(())
    }

    fn tally(&self, local: &CacheStats) {
        self.state.lock().stats.merge(local);
    }

    /// Reads into `buf` from `offset`, returning the bytes placed. Fewer
    /// bytes than requested means the data ended.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let len = buf.len();
        self.read_opt(Some(buf), offset, len)
    }

    /// Like [`read`](Self::read), but a `None` buffer queues a pre-read of
    /// `len` bytes at `offset` instead and returns zero.
    pub fn read_opt(&self, buf: Option<&mut [u8]>, offset: u64, len: usize) -> Result<usize> {
        check_range(offset, len)?;
        let Some(buf) = buf else {
            let hint = if len > self.core.geometry().max_cached_read {
                PrereadHint::SingleUse
            } else {
                PrereadHint::Normal
            };
            self.preread(offset, len, hint)?;
            return Ok(0);
        };
        let len = len.min(buf.len());
        if len == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..len];
        let _io = self.io_lock.read();
        self.ensure_attached()?;

        let mut local = CacheStats::default();
        let result = if len > self.core.geometry().max_cached_read {
            self.read_oversize(buf, offset, &mut local)
        } else {
            self.read_cached(buf, offset, &mut local)
        };
        self.tally(&local);
        let done = result?;
        if done == len && len <= self.core.geometry().max_cached_read {
            self.maybe_read_ahead(offset, len);
        }
        trace!(path = self.path(), offset, len, done, "cache.read");
        Ok(done)
    }

    /// Serves each segment in order and returns the total bytes read.
    /// Stops at the first error.
    pub fn read_vectored(&self, segments: &mut [ReadSegment<'_>]) -> Result<usize> {
        let mut total = 0;
        for segment in segments.iter_mut() {
            total += self.read(&mut *segment.buf, segment.offset)?;
        }
        Ok(total)
    }

    fn read_cached(&self, buf: &mut [u8], offset: u64, local: &mut CacheStats) -> Result<usize> {
        let geometry = *self.core.geometry();
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_page = geometry.offset_in_page(pos);
            let addr = self.tag.page(geometry.page_of(pos));
            let Some(guard) = self.core.get(Some(&*self.source), addr)? else {
                break;
            };
            match guard.residency() {
                Residency::Fetched => {
                    local.misses += 1;
                    local.bytes_read += guard.len() as u64;
                }
                Residency::Hit => local.hits += 1,
                Residency::PrereadHit => {
                    local.hits += 1;
                    local.hits_preread += 1;
                }
            }
            let copied = guard.copy_out(in_page, &mut buf[done..]);
            let short = guard.is_short();
            let consumed = if self.structured { copied } else { 0 };
            let valid = guard.release(consumed, ReleaseHint::default());
            local.bytes_get += copied as u64;
            done += copied;
            if !valid || short {
                break;
            }
        }
        Ok(done)
    }

    /// Reads larger than the cache ceiling. Resident pages are still used;
    /// every run of missing pages is filled by one source read.
    fn read_oversize(&self, buf: &mut [u8], offset: u64, local: &mut CacheStats) -> Result<usize> {
        let geometry = *self.core.geometry();
        let len = buf.len();
        let first = geometry.page_of(offset);
        let last = geometry.page_of(offset + len as u64 - 1);
        {
            let mut state = self.state.lock();
            if !self.read_write && !self.core.can_preread() {
                drop(state);
                let n = self.source.read_at(offset, buf)?;
                local.bytes_pass += n as u64;
                return Ok(n);
            }
            let cancelled = state.preread.cancel(first, last);
            if cancelled > 0 {
                trace!(path = self.path(), first, last, cancelled, "cache.preread.cancelled");
            }
        }

        let end = offset + len as u64;
        let mut pos = offset;
        let mut gap: Option<u64> = None;
        while pos < end {
            let page = geometry.page_of(pos);
            let chunk_end = geometry.page_start(page + 1).min(end);
            let Some(guard) = self.core.get(None, self.tag.page(page))? else {
                gap.get_or_insert(pos);
                pos = chunk_end;
                continue;
            };
            if let Some(start) = gap.take() {
                let got = self.read_gap(buf, offset, start, pos, local)?;
                if got < (pos - start) as usize {
                    return Ok((start - offset) as usize + got);
                }
            }
            local.hits += 1;
            if guard.residency() == Residency::PrereadHit {
                local.hits_preread += 1;
            }
            let at = (pos - offset) as usize;
            let copied = guard.copy_out(
                geometry.offset_in_page(pos),
                &mut buf[at..(chunk_end - offset) as usize],
            );
            let short = guard.is_short();
            let consumed = if self.structured { copied } else { 0 };
            let valid = guard.release(consumed, ReleaseHint::default());
            local.bytes_get += copied as u64;
            if !valid || short {
                return Ok(at + copied);
            }
            pos = chunk_end;
        }
        if let Some(start) = gap {
            let got = self.read_gap(buf, offset, start, end, local)?;
            return Ok((start - offset) as usize + got);
        }
        Ok(len)
    }

    fn read_gap(
        &self,
        buf: &mut [u8],
        base: u64,
        start: u64,
        stop: u64,
        local: &mut CacheStats,
    ) -> Result<usize> {
        let range = (start - base) as usize..(stop - base) as usize;
        let n = self.source.read_at(start, &mut buf[range])?;
        local.bytes_pass += n as u64;
        Ok(n)
    }

    fn maybe_read_ahead(&self, offset: u64, len: usize) {
        if !self.core.can_preread() {
            return;
        }
        let geometry = self.core.geometry();
        let page = geometry.page_of(offset);
        let mut state = self.state.lock();
        if !state.preread.policy.wants(len) || state.preread.seen_recently(page) {
            return;
        }
        state.preread.remember(page);
        let (first, last) = state
            .preread
            .policy
            .next_run(geometry.page_of(offset + len as u64 - 1));
        let range = PrereadRange {
            first,
            last,
            op: PrereadOp::Lru,
        };
        self.queue_locked(&mut state, range);
    }

    /// Asks for `[offset, offset + len)` to be brought in ahead of use.
    /// Honored even when automatic pre-read has switched itself off; a no-op
    /// when the cache runs no pre-read workers.
    pub fn preread(&self, offset: u64, len: usize, hint: PrereadHint) -> Result<()> {
        check_range(offset, len)?;
        self.ensure_attached()?;
        if len == 0 || !self.core.can_preread() {
            return Ok(());
        }
        let geometry = self.core.geometry();
        let range = PrereadRange {
            first: geometry.page_of(offset),
            last: geometry.page_of(offset + len as u64 - 1),
            op: hint.into(),
        };
        let mut state = self.state.lock();
        self.queue_locked(&mut state, range);
        Ok(())
    }

    fn queue_locked(&self, state: &mut HandleState, range: PrereadRange) {
        if state.preread.stop || !self.core.can_preread() {
            return;
        }
        if let Some(dropped) = state.preread.push(range) {
            debug!(
                path = self.path(),
                first = dropped.first,
                last = dropped.last,
                "cache.preread.dropped"
            );
        }
        if state.preread.status != PrereadStatus::Idle {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            return;
        };
        state.preread.status = PrereadStatus::Queued;
        self.core.schedule_preread(me);
    }

    /// Replaces the automatic pre-read parameters and restarts the
    /// efficiency windows.
    pub fn set_preread_params(&self, params: AprParams) {
        let page_size = self.core.geometry().page_size;
        let mut state = self.state.lock();
        let stats = state.stats;
        state.preread.policy.retune(params, page_size, &stats);
        debug!(
            path = self.path(),
            min_pages = params.min_pages,
            trigger = params.trigger,
            "cache.preread.retuned"
        );
    }

    /// Worker entry point: runs one queued range, then requeues the handle
    /// if more work is pending.
    pub(crate) fn run_preread(&self) {
        let range = {
            let mut state = self.state.lock();
            let next = if state.preread.stop {
                None
            } else {
                state.preread.next()
            };
            match next {
                Some(range) => {
                    state.preread.status = PrereadStatus::Running;
                    range
                }
                None => {
                    state.preread.status = PrereadStatus::Idle;
                    if let Some(signal) = state.preread.finished.take() {
                        signal.post();
                    }
                    return;
                }
            }
        };

        let (bytes, pages) = self.fetch_range(range);

        let mut state = self.state.lock();
        state.stats.bytes_preread += bytes;
        state.stats.misses_preread += pages;
        let stats = state.stats;
        if let Some(sample) = state.preread.policy.observe(&stats) {
            if sample.disabled {
                warn!(
                    path = self.path(),
                    percent = sample.percent,
                    previous = ?sample.previous,
                    min_perf = state.preread.policy.params().min_perf,
                    "cache.preread.disabled"
                );
            } else {
                debug!(
                    path = self.path(),
                    percent = sample.percent,
                    "cache.preread.sample"
                );
            }
        }
        if let Some(signal) = state.preread.finished.take() {
            state.preread.status = PrereadStatus::Idle;
            signal.post();
            return;
        }
        if state.preread.stop || !state.preread.has_pending() {
            state.preread.status = PrereadStatus::Idle;
            return;
        }
        match self.me.upgrade() {
            Some(me) => {
                state.preread.status = PrereadStatus::Queued;
                self.core.schedule_preread(me);
            }
            None => state.preread.status = PrereadStatus::Idle,
        }
    }

    fn fetch_range(&self, range: PrereadRange) -> (u64, u64) {
        let _io = self.io_lock.read();
        if self.detached.load(Ordering::Acquire) {
            return (0, 0);
        }
        let geometry = *self.core.geometry();
        let last_page = geometry.page_of(MAX_FILE_OFFSET);
        let single_use = range.op == PrereadOp::SingleUse;
        let mut bytes = 0;
        let mut pages = 0;
        for page in range.first..=range.last.min(last_page) {
            if self.detached.load(Ordering::Acquire) {
                break;
            }
            let guard = match self.core.get(Some(&*self.source), self.tag.page(page)) {
                Ok(Some(guard)) => guard,
                Ok(None) => break,
                Err(err) => {
                    debug!(path = self.path(), page, error = %err, "cache.preread.fetch_failed");
                    break;
                }
            };
            match guard.residency() {
                Residency::Fetched => {
                    bytes += guard.len() as u64;
                    pages += 1;
                    let short = guard.is_short();
                    let hint = ReleaseHint {
                        single_use,
                        fresh: true,
                    };
                    if !guard.release(0, hint) || short {
                        break;
                    }
                }
                Residency::PrereadHit => {
                    let hint = ReleaseHint {
                        single_use: false,
                        fresh: true,
                    };
                    guard.release(0, hint);
                }
                Residency::Hit => {
                    if guard.is_short() {
                        break;
                    }
                }
            }
        }
        debug!(
            path = self.path(),
            first = range.first,
            last = range.last,
            pages,
            bytes,
            "cache.preread.run"
        );
        (bytes, pages)
    }

    /// Stops pre-read for good and waits for a running pass to finish.
    pub(crate) fn quiesce_preread(&self) {
        self.detached.store(true, Ordering::Release);
        let signal = {
            let mut state = self.state.lock();
            state.preread.stop = true;
            state.preread.clear();
            if state.preread.status == PrereadStatus::Running {
                let signal = Arc::new(Signal::new());
                state.preread.finished = Some(Arc::clone(&signal));
                Some(signal)
            } else {
                None
            }
        };
        if let Some(signal) = signal {
            signal.wait();
        }
    }

    /// Called when the worker pool shuts down with this handle still queued.
    pub(crate) fn abandon_preread(&self) {
        let mut state = self.state.lock();
        state.preread.status = PrereadStatus::Idle;
        state.preread.clear();
        if let Some(signal) = state.preread.finished.take() {
            signal.post();
        }
    }

    /// Writes `buf` at `offset` through to the source, then refreshes any
    /// resident pages it touched. Nothing in the cache changes unless the
    /// source accepted every byte.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.read_write {
            return Err(CacheError::ReadOnly);
        }
        check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(0);
        }
        let _io = self.io_lock.write();
        self.ensure_attached()?;
        let written = self.source.write_at(offset, buf)?;
        if written != buf.len() {
            return Err(CacheError::ShortWrite {
                written,
                expected: buf.len(),
            });
        }

        let geometry = *self.core.geometry();
        let first = geometry.page_of(offset);
        let last = geometry.page_of(offset + buf.len() as u64 - 1);
        self.core.drop_short_pages_before(self.tag, first);
        let mut local = CacheStats {
            bytes_write: written as u64,
            ..CacheStats::default()
        };
        for page in first..=last {
            let page_start = geometry.page_start(page);
            let in_page = if page == first {
                geometry.offset_in_page(offset)
            } else {
                0
            };
            let src_start = (page_start + in_page as u64 - offset) as usize;
            let src_end = buf.len().min(src_start + geometry.page_size - in_page);
            match self.core.get(None, self.tag.page(page)) {
                Ok(Some(mut guard)) => {
                    local.hits += 1;
                    local.bytes_put += guard.update(in_page, &buf[src_start..src_end]) as u64;
                    guard.release(0, ReleaseHint::default());
                }
                Ok(None) | Err(_) => local.misses += 1,
            }
        }
        self.tally(&local);
        trace!(path = self.path(), offset, len = written, "cache.write");
        Ok(written)
    }

    /// Drops cached pages at or past `offset`, then truncates the source.
    pub fn truncate(&self, offset: u64) -> Result<()> {
        if !self.read_write {
            return Err(CacheError::ReadOnly);
        }
        check_range(offset, 0)?;
        let _io = self.io_lock.write();
        self.ensure_attached()?;
        let evicted = self.core.truncate(self.tag, offset);
        debug!(path = self.path(), offset, evicted, "cache.truncate");
        self.source.truncate(offset)
    }

    /// Flushes the source.
    pub fn sync(&self) -> Result<()> {
        self.ensure_attached()?;
        self.source.sync()
    }

    /// Releases one attachment. The final detach waits for pre-read on this
    /// handle to quiesce, evicts its pages, folds its statistics into the
    /// cache totals, and returns the source; earlier detaches return `None`.
    pub fn detach(self: &Arc<Self>) -> Option<Arc<dyn BackingSource>> {
        self.core.detach(self)
    }
}
