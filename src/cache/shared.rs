use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, trace, warn};

use super::arena::{FetchFailure, SlotArena};
use super::handle::CachedHandle;
use super::options::{AprParams, AttachOptions, CacheGeometry, CacheOptions};
use super::preread::{PrereadQueue, PrereadScheduler};
use super::stats::{ArenaStats, CacheStats};
use crate::primitives::io::BackingSource;
use crate::types::{CacheError, HandleTag, PageAddr, Result};

/// How a page returned by [`PageCache::get`] came to be resident.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Residency {
    /// Already resident.
    Hit,
    /// Already resident, brought in by pre-read and not touched since.
    PrereadHit,
    /// Fetched from the backing source by this call.
    Fetched,
}

/// Admission hints applied when a page reference is released.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReleaseHint {
    /// Recycle the page before reusable pages.
    pub single_use: bool,
    pub(crate) fresh: bool,
}

impl ReleaseHint {
    /// Hint marking the page single-use.
    pub fn single_use() -> Self {
        Self {
            single_use: true,
            fresh: false,
        }
    }
}

/// Returned by [`PageCache::attach`] when a source cannot be registered.
/// Hands the source back untouched.
#[derive(thiserror::Error)]
#[error("cannot attach {}: {error}", .backing.path())]
pub struct AttachRejected {
    /// The source that was offered.
    pub backing: Arc<dyn BackingSource>,
    /// Why it was refused.
    #[source]
    pub error: CacheError,
}

impl fmt::Debug for AttachRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRejected")
            .field("backing", &self.backing.path())
            .field("error", &self.error)
            .finish()
    }
}

struct HandleEntry {
    refs: u32,
    instance: u8,
    handle: Option<Arc<CachedHandle>>,
}

struct HandleTable {
    entries: Vec<HandleEntry>,
    by_source: HashMap<usize, usize>,
    free: Vec<usize>,
    attached: usize,
}

impl HandleTable {
    fn new(max_handles: usize) -> Self {
        Self {
            entries: (0..max_handles)
                .map(|_| HandleEntry {
                    refs: 0,
                    instance: 0,
                    handle: None,
                })
                .collect(),
            by_source: HashMap::new(),
            free: (0..max_handles).rev().collect(),
            attached: 0,
        }
    }
}

fn source_key(source: &Arc<dyn BackingSource>) -> usize {
    Arc::as_ptr(source) as *const () as usize
}

struct CacheState {
    arena: SlotArena,
    handles: HandleTable,
    totals: CacheStats,
    fetches: u64,
    fetch_failures: u64,
    closing: bool,
}

/// Engine state shared by the public [`PageCache`], every attached handle,
/// and the pre-read workers.
pub(crate) struct CacheCore {
    geometry: CacheGeometry,
    structured: bool,
    log_stats: bool,
    apr: AprParams,
    state: Mutex<CacheState>,
    /// One condition per data slot, paired with `state`, for fetch waiters.
    arrivals: Vec<Condvar>,
    buffers: Vec<RwLock<Box<[u8]>>>,
    preread: PrereadQueue,
    /// Cleared for good once the worker pool stops.
    preread_live: AtomicBool,
    idle: Condvar,
}

impl CacheCore {
    fn new(options: &CacheOptions, geometry: CacheGeometry) -> Self {
        let arena = SlotArena::new(geometry.slots, geometry.max_handles, geometry.buckets);
        Self {
            geometry,
            structured: options.structured,
            log_stats: options.log_stats,
            apr: options.apr,
            state: Mutex::new(CacheState {
                arena,
                handles: HandleTable::new(geometry.max_handles),
                totals: CacheStats::default(),
                fetches: 0,
                fetch_failures: 0,
                closing: false,
            }),
            arrivals: (0..geometry.slots).map(|_| Condvar::new()).collect(),
            buffers: (0..geometry.slots)
                .map(|_| RwLock::new(vec![0u8; geometry.page_size].into_boxed_slice()))
                .collect(),
            preread: PrereadQueue::default(),
            preread_live: AtomicBool::new(geometry.preread_workers > 0),
            idle: Condvar::new(),
        }
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn apr(&self) -> AprParams {
        self.apr
    }

    pub fn can_preread(&self) -> bool {
        self.preread_live.load(Ordering::Acquire)
    }

    pub fn preread_stopped(&self) {
        self.preread_live.store(false, Ordering::Release);
    }

    pub fn preread_queue(&self) -> &PrereadQueue {
        &self.preread
    }

    pub fn schedule_preread(&self, handle: Arc<CachedHandle>) {
        trace!(path = handle.path(), "cache.preread.scheduled");
        self.preread.push(handle);
    }

    fn attach(
        self: &Arc<Self>,
        source: Arc<dyn BackingSource>,
        options: AttachOptions,
    ) -> std::result::Result<Arc<CachedHandle>, AttachRejected> {
        let key = source_key(&source);
        let mut state = self.state.lock();
        if state.closing {
            debug!(path = source.path(), "cache.attach.shutting_down");
            return Err(AttachRejected {
                backing: source,
                error: CacheError::ShuttingDown,
            });
        }
        if let Some(&index) = state.handles.by_source.get(&key) {
            let entry = &mut state.handles.entries[index];
            if let Some(handle) = entry.handle.as_ref() {
                entry.refs += 1;
                debug!(path = source.path(), refs = entry.refs, "cache.attach.shared");
                return Ok(Arc::clone(handle));
            }
        }
        let Some(index) = state.handles.free.pop() else {
            warn!(
                path = source.path(),
                max_handles = self.geometry.max_handles,
                "cache.attach.table_full"
            );
            return Err(AttachRejected {
                backing: source,
                error: CacheError::HandleTableFull(self.geometry.max_handles),
            });
        };
        let entry = &mut state.handles.entries[index];
        entry.instance = entry.instance.wrapping_add(1);
        let tag = HandleTag::new(index, entry.instance);
        let structured = options.structured.unwrap_or(self.structured);
        let handle = CachedHandle::new(
            Arc::clone(self),
            source,
            tag,
            options.read_write,
            structured,
        );
        entry.refs = 1;
        entry.handle = Some(Arc::clone(&handle));
        state.handles.by_source.insert(key, index);
        state.handles.attached += 1;
        debug!(
            path = handle.path(),
            tag = %tag,
            read_write = options.read_write,
            structured,
            "cache.attach"
        );
        Ok(handle)
    }

    /// Drops one reference. The last reference stops pre-read for the
    /// handle, reclaims its pages, and hands the source back.
    pub fn detach(&self, handle: &Arc<CachedHandle>) -> Option<Arc<dyn BackingSource>> {
        let index = handle.tag().index();
        {
            let mut state = self.state.lock();
            let entry = &mut state.handles.entries[index];
            let known = matches!(&entry.handle, Some(h) if Arc::ptr_eq(h, handle));
            if !known || entry.refs == 0 {
                warn!(path = handle.path(), "cache.detach.unknown_handle");
                return None;
            }
            if entry.refs > 1 {
                entry.refs -= 1;
                debug!(path = handle.path(), refs = entry.refs, "cache.detach.shared");
                return None;
            }
            entry.refs = 0;
            state.handles.by_source.remove(&source_key(handle.source()));
        }

        handle.quiesce_preread();
        let _io = handle.lock_exclusive();
        let stats = handle.stats();
        let reclaimed = {
            let mut state = self.state.lock();
            let owned = state.arena.owned(index);
            for &idx in &owned {
                state.arena.retire(idx);
            }
            state.totals.merge(&stats);
            state.handles.entries[index].handle = None;
            state.handles.free.push(index);
            state.handles.attached -= 1;
            if state.handles.attached == 0 {
                self.idle.notify_all();
            }
            owned.len()
        };
        if self.log_stats {
            info!(
                path = handle.path(),
                stats = %stats,
                hit_rate = stats.hit_rate(),
                "cache.detach.stats"
            );
        }
        debug!(path = handle.path(), reclaimed, "cache.detach");
        Some(Arc::clone(handle.source()))
    }

    /// Looks up `addr`, fetching it from `source` on a miss. Without a
    /// source a miss returns `Ok(None)`. Concurrent requests for the same
    /// missing page share one fetch. Addresses whose tag names no attached
    /// handle are `Invalid`.
    pub fn get(
        &self,
        source: Option<&dyn BackingSource>,
        addr: PageAddr,
    ) -> Result<Option<PageGuard<'_>>> {
        let mut state = self.state.lock();
        let tag = addr.tag();
        let live = state
            .handles
            .entries
            .get(tag.index())
            .is_some_and(|entry| entry.handle.is_some() && entry.instance == tag.instance());
        if !live {
            return Err(CacheError::Invalid("page address names no attached handle"));
        }
        loop {
            if let Some(idx) = state.arena.find(addr) {
                let buffer = state.arena.buffer_index(idx);
                state.arena.pin(idx);
                while state.arena.slot(idx).in_transit {
                    self.arrivals[buffer].wait(&mut state);
                }
                let slot = state.arena.slot(idx);
                if let Some(failure) = slot.failure.clone() {
                    state.arena.unpin(idx);
                    return Err(failure.to_error());
                }
                if slot.orphaned || slot.contents != Some(addr) {
                    state.arena.unpin(idx);
                    continue;
                }
                let slot = state.arena.slot_mut(idx);
                let residency = if slot.fresh {
                    slot.fresh = false;
                    Residency::PrereadHit
                } else {
                    Residency::Hit
                };
                let (len, short) = (slot.len, slot.short);
                return Ok(Some(PageGuard::new(
                    self, idx, buffer, addr, len, short, residency,
                )));
            }
            let Some(source) = source else {
                return Ok(None);
            };
            return self.fetch(state, source, addr).map(Some);
        }
    }

    fn fetch<'a>(
        &'a self,
        mut state: MutexGuard<'a, CacheState>,
        source: &dyn BackingSource,
        addr: PageAddr,
    ) -> Result<PageGuard<'a>> {
        let Some(idx) = state.arena.claim(addr) else {
            let (_, _, in_use) = state.arena.counts();
            return Err(CacheError::OutOfCapacity {
                slots: state.arena.data_slots(),
                in_use,
            });
        };
        state.fetches += 1;
        let buffer = state.arena.buffer_index(idx);
        let page_size = self.geometry.page_size;
        let offset = self.geometry.page_start(addr.page());
        let result = MutexGuard::unlocked(&mut state, || {
            let mut page = self.buffers[buffer].write();
            let read = source.read_at(offset, &mut page[..]);
            if let Ok(n) = read {
                page[n.min(page_size)..].fill(0);
            }
            read
        });
        match result {
            Ok(n) => {
                let len = n.min(page_size);
                let slot = state.arena.slot_mut(idx);
                slot.in_transit = false;
                slot.len = len;
                slot.short = len < page_size;
                // parking_lot requeues waiters onto `state` in park order.
                self.arrivals[buffer].notify_all();
                trace!(addr = %addr, len, "cache.fetch");
                Ok(PageGuard::new(
                    self,
                    idx,
                    buffer,
                    addr,
                    len,
                    len < page_size,
                    Residency::Fetched,
                ))
            }
            Err(err) => {
                state.fetch_failures += 1;
                state.arena.fail(idx, FetchFailure::from_error(&err));
                self.arrivals[buffer].notify_all();
                state.arena.unpin(idx);
                debug!(addr = %addr, path = source.path(), error = %err, "cache.fetch.failed");
                Err(err)
            }
        }
    }

    fn release(&self, idx: u32, addr: PageAddr, consumed: usize, hint: ReleaseHint) -> bool {
        let mut state = self.state.lock();
        let slot = state.arena.slot_mut(idx);
        let valid = slot.contents == Some(addr) && !slot.orphaned && slot.failure.is_none();
        if valid {
            if hint.fresh {
                slot.fresh = true;
            }
            if hint.single_use {
                slot.single_use = true;
            }
            if consumed > 0 && !slot.short {
                slot.consumed = slot.consumed.saturating_add(consumed);
                if slot.consumed >= slot.len {
                    slot.consumed = self.geometry.page_size / 2;
                    slot.demote_once = true;
                }
            }
        }
        state.arena.unpin(idx);
        valid
    }

    fn extend_page(&self, idx: u32, addr: PageAddr, end: usize) -> (usize, bool) {
        let mut state = self.state.lock();
        let slot = state.arena.slot_mut(idx);
        if slot.contents == Some(addr) && end > slot.len {
            slot.len = end.min(self.geometry.page_size);
            slot.short = slot.len < self.geometry.page_size;
        }
        (slot.len, slot.short)
    }

    /// Evicts every page of `tag` at or beyond the page holding `offset`,
    /// plus short pages before it, since a growing truncate moves their end.
    pub fn truncate(&self, tag: HandleTag, offset: u64) -> usize {
        let first_page = self.geometry.page_of(offset);
        self.retire_where(tag, |page, short| short || page >= first_page)
    }

    /// Evicts short pages of `tag` that lie before `page`; a write beyond
    /// them means the data no longer ends there.
    pub fn drop_short_pages_before(&self, tag: HandleTag, page: u64) -> usize {
        self.retire_where(tag, |resident, short| short && resident < page)
    }

    fn retire_where(&self, tag: HandleTag, doomed: impl Fn(u64, bool) -> bool) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0;
        for idx in state.arena.owned(tag.index()) {
            let slot = state.arena.slot(idx);
            let Some(addr) = slot.contents else {
                continue;
            };
            if addr.tag() == tag && !slot.in_transit && doomed(addr.page(), slot.short) {
                state.arena.retire(idx);
                evicted += 1;
            }
        }
        evicted
    }

    fn arena_stats(&self) -> ArenaStats {
        let state = self.state.lock();
        let (free, resident, in_use) = state.arena.counts();
        ArenaStats {
            slots: state.arena.data_slots(),
            resident,
            free,
            in_use,
            attached: state.handles.attached,
            evictions: state.arena.evictions,
            fetches: state.fetches,
            fetch_failures: state.fetch_failures,
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        self.state.lock().arena.check_invariants();
    }
}

/// A referenced page. While the guard lives the slot cannot be evicted or
/// reused; dropping it is equivalent to `release(0, ReleaseHint::default())`.
pub struct PageGuard<'a> {
    core: &'a CacheCore,
    slot: u32,
    buffer: usize,
    addr: PageAddr,
    len: usize,
    short: bool,
    residency: Residency,
    released: bool,
}

impl<'a> PageGuard<'a> {
    fn new(
        core: &'a CacheCore,
        slot: u32,
        buffer: usize,
        addr: PageAddr,
        len: usize,
        short: bool,
        residency: Residency,
    ) -> Self {
        Self {
            core,
            slot,
            buffer,
            addr,
            len,
            short,
            residency,
            released: false,
        }
    }

    /// Address of the page.
    pub fn addr(&self) -> PageAddr {
        self.addr
    }

    /// Valid bytes in the page.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the page holds no valid bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the data ended inside this page.
    pub fn is_short(&self) -> bool {
        self.short
    }

    /// How the page became resident.
    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Copies valid bytes starting at `offset` into `dst`, returning the count.
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = dst.len().min(self.len - offset);
        let page = self.core.buffers[self.buffer].read();
        dst[..n].copy_from_slice(&page[offset..offset + n]);
        n
    }

    /// Copies freshly written bytes into the page at `offset`, extending the
    /// valid length of a short page. Returns the bytes copied.
    pub fn update(&mut self, offset: usize, src: &[u8]) -> usize {
        let page_size = self.core.geometry.page_size;
        if offset >= page_size {
            return 0;
        }
        let n = src.len().min(page_size - offset);
        self.core.buffers[self.buffer].write()[offset..offset + n].copy_from_slice(&src[..n]);
        let end = offset + n;
        if end > self.len {
            let (len, short) = self.core.extend_page(self.slot, self.addr, end);
            self.len = len;
            self.short = short;
        }
        n
    }

    /// Releases the reference. `consumed` bytes count toward demoting a
    /// fully consumed page to single-use; pass zero to leave the page's
    /// admission class alone. Returns false when the page was evicted or
    /// replaced while referenced.
    pub fn release(mut self, consumed: usize, hint: ReleaseHint) -> bool {
        self.released = true;
        self.core.release(self.slot, self.addr, consumed, hint)
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.core
                .release(self.slot, self.addr, 0, ReleaseHint::default());
        }
    }
}

/// The shared page cache: a fixed arena of page slots serving every attached
/// backing source, plus the pre-read worker pool.
pub struct PageCache {
    core: Arc<CacheCore>,
    scheduler: Mutex<Option<PrereadScheduler>>,
}

impl PageCache {
    /// Builds the arena and starts pre-read workers when enabled.
    pub fn new(options: CacheOptions) -> Result<Self> {
        let geometry = options.geometry()?;
        let core = Arc::new(CacheCore::new(&options, geometry));
        let scheduler = if geometry.preread_workers > 0 {
            Some(PrereadScheduler::start(&core, geometry.preread_workers)?)
        } else {
            None
        };
        info!(
            role = options.role.as_str(),
            page_size = geometry.page_size,
            slots = geometry.slots,
            buckets = geometry.buckets,
            max_handles = geometry.max_handles,
            preread_workers = geometry.preread_workers,
            "cache.init"
        );
        Ok(Self {
            core,
            scheduler: Mutex::new(scheduler),
        })
    }

    /// Derived arena layout.
    pub fn geometry(&self) -> &CacheGeometry {
        self.core.geometry()
    }

    /// Registers `source`. Attaching a source that is already attached
    /// returns its existing handle with one more reference.
    pub fn attach(
        &self,
        source: Arc<dyn BackingSource>,
        options: AttachOptions,
    ) -> std::result::Result<Arc<CachedHandle>, AttachRejected> {
        self.core.attach(source, options)
    }

    /// Drops one reference to `handle`; see [`CachedHandle::detach`].
    pub fn detach(&self, handle: &Arc<CachedHandle>) -> Option<Arc<dyn BackingSource>> {
        self.core.detach(handle)
    }

    /// Direct page access. `source` must be the source the page's tag was
    /// issued for; pass `None` to look up without fetching.
    pub fn get(
        &self,
        source: Option<&dyn BackingSource>,
        addr: PageAddr,
    ) -> Result<Option<PageGuard<'_>>> {
        self.core.get(source, addr)
    }

    /// Statistics rolled up from every handle detached so far.
    pub fn stats(&self) -> CacheStats {
        self.core.state.lock().totals
    }

    /// Current arena occupancy.
    pub fn arena_stats(&self) -> ArenaStats {
        self.core.arena_stats()
    }

    /// Number of attached handles.
    pub fn attached(&self) -> usize {
        self.core.state.lock().handles.attached
    }

    /// Blocks until every handle is detached, then stops pre-read workers.
    /// New attachments are refused from the moment this is called.
    pub fn shutdown(&self) {
        {
            let mut state = self.core.state.lock();
            state.closing = true;
            while state.handles.attached > 0 {
                self.core.idle.wait(&mut state);
            }
        }
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        info!(totals = %self.stats(), "cache.shutdown");
    }

    /// Pre-read worker threads currently running.
    pub fn preread_workers(&self) -> usize {
        self.scheduler
            .lock()
            .as_ref()
            .map_or(0, PrereadScheduler::workers)
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.core.check_invariants();
    }
}
