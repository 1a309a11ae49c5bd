//! Background read-ahead.
//!
//! Each handle keeps a small circular queue of page ranges it wants brought
//! in and an adaptive policy deciding whether sequential reads should keep
//! adding to it. Handles with pending work are placed on one shared FIFO that
//! a fixed pool of worker threads drains; a worker runs one range for a
//! handle and, if that handle still has work, puts it back at the tail.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::handle::CachedHandle;
use super::options::AprParams;
use super::shared::CacheCore;
use super::stats::CacheStats;
use crate::primitives::concurrency::{Semaphore, Signal};

/// Ranges a handle can have queued at once; the oldest is dropped on overflow.
pub(crate) const QUEUE_SLOTS: usize = 8;
/// Recently serviced request pages remembered to suppress repeat triggers.
pub(crate) const RECENT_SLOTS: usize = 5;

/// Caller hint attached to an explicit pre-read request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PrereadHint {
    /// Pages are expected to be read more than once.
    #[default]
    Normal,
    /// Pages will be read once; recycle them first.
    SingleUse,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PrereadOp {
    Lru,
    SingleUse,
    Skip,
}

impl From<PrereadHint> for PrereadOp {
    fn from(hint: PrereadHint) -> Self {
        match hint {
            PrereadHint::Normal => PrereadOp::Lru,
            PrereadHint::SingleUse => PrereadOp::SingleUse,
        }
    }
}

/// Inclusive page range.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PrereadRange {
    pub first: u64,
    pub last: u64,
    pub op: PrereadOp,
}

impl PrereadRange {
    fn overlaps(&self, first: u64, last: u64) -> bool {
        self.first <= last && first <= self.last
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PrereadStatus {
    Idle,
    Queued,
    Running,
}

/// Outcome of closing one accounting window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PerfSample {
    pub percent: u64,
    pub previous: Option<u64>,
    pub disabled: bool,
}

/// Decides whether automatic read-ahead stays on for a handle.
///
/// Every `recalc_bytes` of pre-read data closes a window and computes the
/// percentage of pre-read pages that were later hit during that window. Once
/// two consecutive windows both fall under `min_perf` and the newer one did
/// not beat the older by more than `improvement_factor`, automatic pre-read
/// is switched off. Explicit requests are unaffected.
#[derive(Clone, Debug)]
pub(crate) struct AdaptivePolicy {
    params: AprParams,
    workable: bool,
    enabled: bool,
    next_calc: u64,
    mark_hits: u64,
    mark_misses: u64,
    prev_perf: Option<u64>,
}

impl AdaptivePolicy {
    pub fn new(params: AprParams, page_size: usize) -> Self {
        let (params, workable) = params.resolve(page_size);
        Self {
            params,
            workable,
            enabled: true,
            next_calc: params.recalc_bytes,
            mark_hits: 0,
            mark_misses: 0,
            prev_perf: None,
        }
    }

    /// Restarts the policy with new parameters, keeping counters in step
    /// with `stats` so the first window starts now.
    pub fn retune(&mut self, params: AprParams, page_size: usize, stats: &CacheStats) {
        *self = Self::new(params, page_size);
        self.next_calc = stats.bytes_preread + self.params.recalc_bytes;
        self.mark_hits = stats.hits_preread;
        self.mark_misses = stats.misses_preread;
    }

    pub fn params(&self) -> AprParams {
        self.params
    }

    pub fn active(&self) -> bool {
        self.workable && self.enabled
    }

    /// True when a read of `len` bytes should trigger look-ahead.
    pub fn wants(&self, len: usize) -> bool {
        self.active() && len < self.params.trigger
    }

    /// Pages to bring in after a read that ended on `last_page`.
    pub fn next_run(&self, last_page: u64) -> (u64, u64) {
        let first = last_page + 1;
        (first, first + u64::from(self.params.min_pages.max(1)) - 1)
    }

    pub fn observe(&mut self, stats: &CacheStats) -> Option<PerfSample> {
        if self.params.recalc_bytes == 0 || stats.bytes_preread < self.next_calc {
            return None;
        }
        while self.next_calc <= stats.bytes_preread {
            self.next_calc += self.params.recalc_bytes;
        }
        let hits = stats.hits_preread.saturating_sub(self.mark_hits);
        let misses = stats.misses_preread.saturating_sub(self.mark_misses);
        self.mark_hits = stats.hits_preread;
        self.mark_misses = stats.misses_preread;
        let percent = if misses == 0 { 0 } else { hits * 100 / misses };
        let previous = self.prev_perf;
        let floor = u64::from(self.params.min_perf);
        let mut disabled = false;
        if let Some(prev) = previous {
            let factor = u64::from(self.params.improvement_factor);
            if self.enabled && percent < floor && prev < floor && percent <= prev * factor {
                self.enabled = false;
                disabled = true;
            }
        }
        self.prev_perf = Some(percent);
        Some(PerfSample {
            percent,
            previous,
            disabled,
        })
    }
}

/// Per-handle pre-read bookkeeping, guarded by the handle's state lock.
pub(crate) struct PrereadState {
    queue: VecDeque<PrereadRange>,
    recent: [Option<u64>; RECENT_SLOTS],
    recent_next: usize,
    pub status: PrereadStatus,
    pub stop: bool,
    pub finished: Option<Arc<Signal>>,
    pub policy: AdaptivePolicy,
}

impl PrereadState {
    pub fn new(policy: AdaptivePolicy) -> Self {
        Self {
            queue: VecDeque::with_capacity(QUEUE_SLOTS),
            recent: [None; RECENT_SLOTS],
            recent_next: 0,
            status: PrereadStatus::Idle,
            stop: false,
            finished: None,
            policy,
        }
    }

    /// Queues a range, discarding the oldest entry when the queue is full.
    /// Returns the discarded range, if any.
    pub fn push(&mut self, range: PrereadRange) -> Option<PrereadRange> {
        let dropped = if self.queue.len() == QUEUE_SLOTS {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(range);
        dropped
    }

    /// Neutralizes every queued range overlapping `[first, last]`.
    pub fn cancel(&mut self, first: u64, last: u64) -> usize {
        let mut cancelled = 0;
        for range in self.queue.iter_mut() {
            if range.op != PrereadOp::Skip && range.overlaps(first, last) {
                range.op = PrereadOp::Skip;
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Pops the next range worth running.
    pub fn next(&mut self) -> Option<PrereadRange> {
        while let Some(range) = self.queue.pop_front() {
            if range.op != PrereadOp::Skip {
                return Some(range);
            }
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        self.queue.iter().any(|range| range.op != PrereadOp::Skip)
    }

    pub fn seen_recently(&self, page: u64) -> bool {
        self.recent.contains(&Some(page))
    }

    pub fn remember(&mut self, page: u64) {
        self.recent[self.recent_next] = Some(page);
        self.recent_next = (self.recent_next + 1) % RECENT_SLOTS;
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Shared FIFO of handles with pending pre-read work.
#[derive(Default)]
pub(crate) struct PrereadQueue {
    tasks: Mutex<VecDeque<Arc<CachedHandle>>>,
    ready: Semaphore,
}

impl PrereadQueue {
    pub fn push(&self, handle: Arc<CachedHandle>) {
        self.tasks.lock().push_back(handle);
        self.ready.post();
    }

    fn pop(&self) -> Option<Arc<CachedHandle>> {
        self.tasks.lock().pop_front()
    }

    fn wake(&self) {
        self.ready.post();
    }

    fn wait(&self) {
        self.ready.wait();
    }

    fn drain(&self) -> Vec<Arc<CachedHandle>> {
        self.tasks.lock().drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.tasks.lock().len()
    }
}

struct WorkerPool {
    stop: AtomicBool,
    running: AtomicUsize,
    drained: Signal,
}

/// Fixed pool of pre-read worker threads.
pub(crate) struct PrereadScheduler {
    core: Arc<CacheCore>,
    pool: Arc<WorkerPool>,
    workers: Vec<JoinHandle<()>>,
}

impl PrereadScheduler {
    pub fn start(core: &Arc<CacheCore>, count: usize) -> io::Result<Self> {
        let mut scheduler = Self {
            core: Arc::clone(core),
            pool: Arc::new(WorkerPool {
                stop: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                drained: Signal::new(),
            }),
            workers: Vec::with_capacity(count),
        };
        for id in 0..count {
            let core = Arc::clone(core);
            let pool = Arc::clone(&scheduler.pool);
            scheduler.pool.running.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(format!("pagecache-preread-{id}"))
                .spawn(move || worker_loop(core, pool));
            match spawned {
                Ok(handle) => scheduler.workers.push(handle),
                Err(err) => {
                    scheduler.pool.running.fetch_sub(1, Ordering::SeqCst);
                    scheduler.stop();
                    return Err(err);
                }
            }
        }
        debug!(workers = count, "cache.preread.started");
        Ok(scheduler)
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stops every worker and waits for the last one to leave. Work still
    /// queued is discarded.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.core.preread_stopped();
        self.pool.stop.store(true, Ordering::SeqCst);
        for _ in 0..self.workers.len() {
            self.core.preread_queue().wake();
        }
        if self.pool.running.load(Ordering::SeqCst) > 0 {
            self.pool.drained.wait();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("cache.preread.worker_panicked");
            }
        }
        for handle in self.core.preread_queue().drain() {
            handle.abandon_preread();
        }
        debug!("cache.preread.stopped");
    }
}

impl Drop for PrereadScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(core: Arc<CacheCore>, pool: Arc<WorkerPool>) {
    let queue = core.preread_queue();
    loop {
        queue.wait();
        if pool.stop.load(Ordering::SeqCst) {
            break;
        }
        if let Some(handle) = queue.pop() {
            handle.run_preread();
        }
    }
    if pool.running.fetch_sub(1, Ordering::SeqCst) == 1 {
        pool.drained.post();
    }
}
