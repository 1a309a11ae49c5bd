use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use pagecache::cache::{AprParams, AttachOptions, CacheOptions, PageCache, PrereadHint};
use pagecache::primitives::io::{BackingSource, MemSource};
use pagecache::Result;
use tracing_subscriber::EnvFilter;

const PAGE: usize = 4096;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pagecache=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn preread_cache(apr: AprParams) -> PageCache {
    PageCache::new(CacheOptions {
        page_size: PAGE,
        cache_size: 64 * PAGE as u64,
        max_handles: 8,
        can_preread: true,
        preread_workers: 2,
        apr,
        ..CacheOptions::default()
    })
    .expect("cache")
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn file(pages: usize) -> Arc<MemSource> {
    let data = (0..pages * PAGE).map(|i| (i / PAGE) as u8).collect();
    Arc::new(MemSource::new("seq", data))
}

#[test]
fn sequential_reads_are_served_by_preread() -> Result<()> {
    init_tracing();
    let cache = preread_cache(AprParams {
        min_pages: 4,
        ..AprParams::default()
    });
    assert_eq!(cache.preread_workers(), 2);
    let mem = file(64);
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    assert!(handle.auto_preread_active());
    assert_eq!(handle.preread_params().trigger, PAGE + 1);

    let mut buf = vec![0u8; 100];
    handle.read(&mut buf, 0)?;
    wait_until("look-ahead pages", || mem.counters().reads() >= 5);

    for page in 1..=4u64 {
        assert_eq!(handle.read(&mut buf, page * PAGE as u64)?, 100);
        assert!(buf.iter().all(|&b| b == page as u8));
    }
    let stats = handle.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 4);
    assert!(stats.hits_preread >= 1);
    wait_until("pre-read accounting", || handle.stats().misses_preread >= 4);
    assert!(handle.stats().bytes_preread >= 4 * PAGE as u64);
    Ok(())
}

#[test]
fn useless_preread_switches_itself_off() -> Result<()> {
    init_tracing();
    let cache = preread_cache(AprParams {
        min_pages: 2,
        recalc_bytes: 2 * PAGE as u64,
        min_perf: 90,
        ..AprParams::default()
    });
    let mem = file(512);
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");

    let mut buf = vec![0u8; 100];
    let mut expected = 0;
    let mut next_page = 0u64;
    while handle.auto_preread_active() {
        assert!(next_page < 512, "pre-read never disabled");
        handle.read(&mut buf, next_page * PAGE as u64)?;
        expected += 3;
        wait_until("random-read pre-read", || mem.counters().reads() >= expected);
        wait_until("pre-read accounting", || {
            handle.stats().misses_preread >= (expected / 3) * 2
        });
        next_page += 16;
    }
    assert_eq!(next_page, 32, "two poor windows disable read-ahead");
    assert_eq!(handle.stats().hits_preread, 0);

    let before = mem.counters().reads();
    handle.read(&mut buf, 300 * PAGE as u64)?;
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mem.counters().reads(), before + 1);

    handle.preread(400 * PAGE as u64, 2 * PAGE, PrereadHint::Normal)?;
    wait_until("explicit pre-read", || mem.counters().reads() >= before + 3);
    let reads = mem.counters().reads();
    handle.read(&mut buf, 401 * PAGE as u64)?;
    assert_eq!(mem.counters().reads(), reads);
    Ok(())
}

#[test]
fn retuning_enables_automatic_preread() -> Result<()> {
    let cache = preread_cache(AprParams::default());
    let mem = file(16);
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    assert!(!handle.auto_preread_active());

    let mut buf = vec![0u8; 10];
    handle.read(&mut buf, 0)?;
    thread::sleep(Duration::from_millis(50));
    assert_eq!(mem.counters().reads(), 1);

    handle.set_preread_params(AprParams {
        min_pages: 3,
        ..AprParams::default()
    });
    assert!(handle.auto_preread_active());
    handle.read(&mut buf, 5 * PAGE as u64)?;
    wait_until("retuned look-ahead", || mem.counters().reads() >= 5);
    Ok(())
}

#[test]
fn null_buffer_read_queues_preread() -> Result<()> {
    let cache = preread_cache(AprParams::default());
    let mem = file(16);
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    assert_eq!(handle.read_opt(None, 2 * PAGE as u64, 3 * PAGE)?, 0);
    wait_until("null-buffer pre-read", || mem.counters().reads() >= 3);
    let mut buf = vec![0u8; PAGE];
    handle.read(&mut buf, 3 * PAGE as u64)?;
    assert_eq!(mem.counters().reads(), 3);
    assert!(buf.iter().all(|&b| b == 3));
    Ok(())
}

#[test]
fn oversize_read_uses_explicitly_preread_pages() -> Result<()> {
    let cache = preread_cache(AprParams::default());
    let mem = file(16);
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    assert!(!handle.auto_preread_active());

    handle.preread(0, 4 * PAGE, PrereadHint::Normal)?;
    wait_until("explicit pre-read", || handle.stats().misses_preread >= 4);
    assert_eq!(mem.counters().reads(), 4);

    let mut big = vec![0u8; 4 * PAGE];
    assert_eq!(handle.read(&mut big, 0)?, 4 * PAGE);
    for (page, chunk) in big.chunks(PAGE).enumerate() {
        assert!(chunk.iter().all(|&b| b == page as u8));
    }
    assert_eq!(mem.counters().reads(), 4);
    let stats = handle.stats();
    assert_eq!(stats.bytes_get, 4 * PAGE as u64);
    assert_eq!(stats.bytes_pass, 0);
    assert_eq!(stats.hits_preread, 4);
    Ok(())
}

struct SlowSource {
    inner: MemSource,
    reads: AtomicU64,
}

impl BackingSource for SlowSource {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.inner.read_at(off, dst)
    }
    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize> {
        self.inner.write_at(off, src)
    }
    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
    fn path(&self) -> &str {
        self.inner.path()
    }
}

#[test]
fn detach_waits_for_running_preread() -> Result<()> {
    init_tracing();
    let cache = preread_cache(AprParams::default());
    let source = Arc::new(SlowSource {
        inner: MemSource::new("slow", vec![1u8; 32 * PAGE]),
        reads: AtomicU64::new(0),
    });
    let handle = cache
        .attach(source.clone(), AttachOptions::read_only())
        .expect("attach");
    handle.preread(0, 32 * PAGE, PrereadHint::SingleUse)?;
    wait_until("pre-read start", || source.reads.load(Ordering::SeqCst) >= 1);

    assert!(handle.detach().is_some());
    let after = source.reads.load(Ordering::SeqCst);
    assert!(after < 32);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(source.reads.load(Ordering::SeqCst), after);
    let arena = cache.arena_stats();
    assert_eq!(arena.resident, 0);
    assert_eq!(arena.in_use, 0);
    assert_eq!(cache.stats().misses_preread, after);
    Ok(())
}

#[test]
fn shutdown_stops_workers() {
    let cache = preread_cache(AprParams::default());
    assert_eq!(cache.preread_workers(), 2);
    let mem = file(4);
    let handle = cache
        .attach(mem, AttachOptions::read_only())
        .expect("attach");
    handle.detach();
    cache.shutdown();
    assert_eq!(cache.preread_workers(), 0);
}
