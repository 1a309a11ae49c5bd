use std::sync::Arc;

use pagecache::cache::{AttachOptions, CacheOptions, PageCache};
use pagecache::primitives::io::{BackingSource, MemSource};
use pagecache::{CacheError, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const PAGE: usize = 4096;

fn cache_with_slots(slots: u64) -> PageCache {
    PageCache::new(CacheOptions {
        page_size: PAGE,
        cache_size: PAGE as u64 * slots,
        max_handles: 8,
        ..CacheOptions::default()
    })
    .expect("cache")
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn three_page_file_is_fetched_once_per_page() -> Result<()> {
    let cache = cache_with_slots(3);
    let mem = Arc::new(MemSource::new("zeros", vec![0u8; 10_000]));
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");

    for _ in 0..4 {
        let mut total = Vec::new();
        let mut offset = 0u64;
        for len in [4096usize, 4096, 1808] {
            let mut buf = vec![0xffu8; len];
            let n = handle.read(&mut buf, offset)?;
            assert_eq!(n, len);
            total.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
        assert_eq!(total.len(), 10_000);
        assert!(total.iter().all(|&b| b == 0));
    }
    assert_eq!(mem.counters().reads(), 3);

    let stats = handle.stats();
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.hits, 9);
    assert_eq!(stats.bytes_get, 40_000);
    Ok(())
}

#[test]
fn double_attach_shares_one_handle() -> Result<()> {
    let cache = cache_with_slots(4);
    let mem = Arc::new(MemSource::new("shared", patterned(3 * PAGE, 1)));
    let first = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    let second = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.attached(), 1);

    let mut buf = vec![0u8; 2 * PAGE];
    first.read(&mut buf[..PAGE], 0)?;
    first.read(&mut buf[PAGE..], PAGE as u64)?;
    assert_eq!(cache.arena_stats().resident, 2);

    assert!(first.detach().is_none());
    assert_eq!(cache.attached(), 1);
    assert_eq!(cache.arena_stats().resident, 2);
    second.read(&mut buf[..PAGE], 0)?;
    assert_eq!(mem.counters().reads(), 2);

    let source = second.detach().expect("last detach returns the source");
    assert_eq!(source.path(), "shared");
    let arena = cache.arena_stats();
    assert_eq!(arena.resident, 0);
    assert_eq!(arena.free, 4);
    assert_eq!(arena.attached, 0);
    assert_eq!(cache.stats().misses, 2);
    Ok(())
}

#[test]
fn writes_are_visible_immediately() -> Result<()> {
    let cache = cache_with_slots(4);
    let mem = Arc::new(MemSource::new("rw", patterned(4 * PAGE, 7)));
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_write())
        .expect("attach");
    let mut buf = vec![0u8; 4 * PAGE];
    for page in 0..4 {
        handle.read(&mut buf[page * PAGE..(page + 1) * PAGE], (page * PAGE) as u64)?;
    }
    let reads = mem.counters().reads();

    let payload = vec![0xabu8; PAGE + 100];
    assert_eq!(handle.write(&payload, (PAGE - 50) as u64)?, payload.len());
    assert_eq!(mem.counters().writes(), 1);
    assert_eq!(
        &mem.snapshot()[PAGE - 50..2 * PAGE + 50],
        payload.as_slice()
    );

    let mut check = vec![0u8; PAGE + 100];
    assert_eq!(handle.read(&mut check[..60], (PAGE - 55) as u64)?, 60);
    assert_eq!(check[..5], patterned(4 * PAGE, 7)[PAGE - 55..PAGE - 50]);
    assert!(check[5..60].iter().all(|&b| b == 0xab));
    assert_eq!(handle.read(&mut check[..100], (2 * PAGE) as u64)?, 100);
    assert!(check[..50].iter().all(|&b| b == 0xab));
    assert_eq!(mem.counters().reads(), reads);

    handle.sync()?;
    assert_eq!(mem.counters().syncs(), 1);
    Ok(())
}

#[test]
fn failed_write_leaves_cache_untouched() -> Result<()> {
    struct Refusing(MemSource);

    impl BackingSource for Refusing {
        fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
            self.0.read_at(off, dst)
        }
        fn write_at(&self, _off: u64, src: &[u8]) -> Result<usize> {
            Ok(src.len() / 2)
        }
        fn sync(&self) -> Result<()> {
            Ok(())
        }
        fn truncate(&self, len: u64) -> Result<()> {
            self.0.truncate(len)
        }
        fn path(&self) -> &str {
            "refusing"
        }
    }

    let cache = cache_with_slots(2);
    let data = patterned(PAGE, 3);
    let source = Arc::new(Refusing(MemSource::new("inner", data.clone())));
    let handle = cache
        .attach(source, AttachOptions::read_write())
        .expect("attach");
    let mut buf = vec![0u8; 16];
    handle.read(&mut buf, 0)?;

    let err = handle.write(&[1u8; 16], 0).unwrap_err();
    assert!(matches!(
        err,
        CacheError::ShortWrite {
            written: 8,
            expected: 16
        }
    ));
    handle.read(&mut buf, 0)?;
    assert_eq!(buf, data[..16]);
    assert_eq!(handle.stats().bytes_put, 0);
    Ok(())
}

#[test]
fn short_last_page_yields_exact_length() -> Result<()> {
    let cache = cache_with_slots(2);
    let len = 2 * PAGE + 321;
    let data = patterned(len, 9);
    let mem = Arc::new(MemSource::new("short", data.clone()));
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");

    for chunk in [100usize, 1000, PAGE] {
        let mut collected = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut buf = vec![0u8; chunk];
            let n = handle.read(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
        assert_eq!(collected.len(), len);
        assert_eq!(collected, data);
    }
    Ok(())
}

#[test]
fn resident_pages_never_exceed_slots() -> Result<()> {
    let slots = 5u64;
    let cache = cache_with_slots(slots);
    let mem = Arc::new(MemSource::new("big", patterned(64 * PAGE, 5)));
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut buf = vec![0u8; 64];
    for _ in 0..500 {
        let page = rng.gen_range(0..64u64);
        handle.read(&mut buf, page * PAGE as u64)?;
        let arena = cache.arena_stats();
        assert!(arena.resident <= slots as usize);
        assert_eq!(arena.in_use, 0);
    }
    assert!(cache.arena_stats().evictions > 0);
    Ok(())
}

#[test]
fn least_recently_used_page_goes_first() -> Result<()> {
    let cache = cache_with_slots(3);
    let mem = Arc::new(MemSource::new("lru", patterned(8 * PAGE, 2)));
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    let mut buf = vec![0u8; 8];
    for page in [0u64, 1, 2, 0] {
        handle.read(&mut buf, page * PAGE as u64)?;
    }
    assert_eq!(mem.counters().reads(), 3);
    handle.read(&mut buf, 3 * PAGE as u64)?;
    assert_eq!(mem.counters().reads(), 4);

    handle.read(&mut buf, 0)?;
    handle.read(&mut buf, 2 * PAGE as u64)?;
    assert_eq!(mem.counters().reads(), 4);
    handle.read(&mut buf, PAGE as u64)?;
    assert_eq!(mem.counters().reads(), 5);
    Ok(())
}

#[test]
fn truncate_and_detach_respect_ownership() -> Result<()> {
    let cache = PageCache::new(CacheOptions {
        page_size: PAGE,
        cache_size: PAGE as u64 * 9,
        max_handles: 4,
        ..CacheOptions::default()
    })?;
    assert_eq!(cache.geometry().buckets, 9);
    let a = Arc::new(MemSource::new("a", patterned(4 * PAGE, 10)));
    let b = Arc::new(MemSource::new("b", patterned(4 * PAGE, 20)));
    let ha = cache.attach(a.clone(), AttachOptions::read_write()).expect("a");
    let hb = cache.attach(b.clone(), AttachOptions::read_write()).expect("b");
    let mut buf = vec![0u8; PAGE];
    for page in 0..4u64 {
        ha.read(&mut buf, page * PAGE as u64)?;
        hb.read(&mut buf, page * PAGE as u64)?;
    }
    assert_eq!(cache.arena_stats().resident, 8);

    ha.truncate(PAGE as u64)?;
    assert_eq!(a.counters().truncates(), 1);
    assert_eq!(b.counters().truncates(), 0);
    assert_eq!(cache.arena_stats().resident, 5);
    assert_eq!(a.len(), PAGE as u64);
    for page in 0..4u64 {
        assert_eq!(hb.read(&mut buf, page * PAGE as u64)?, PAGE);
        assert_eq!(buf, patterned(4 * PAGE, 20)[page as usize * PAGE..][..PAGE]);
    }
    assert_eq!(b.counters().reads(), 4);

    assert!(ha.detach().is_some());
    assert_eq!(cache.arena_stats().resident, 4);
    for page in 0..4u64 {
        hb.read(&mut buf, page * PAGE as u64)?;
    }
    assert_eq!(b.counters().reads(), 4);
    Ok(())
}

#[test]
fn reattached_source_never_sees_stale_pages() -> Result<()> {
    let cache = cache_with_slots(4);
    let mem = Arc::new(MemSource::new("stale", patterned(PAGE, 1)));
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    let mut buf = vec![0u8; 16];
    handle.read(&mut buf, 0)?;
    let old_tag = handle.tag();
    handle.detach();

    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    assert_ne!(handle.tag(), old_tag);
    assert!(matches!(
        cache.get(None, old_tag.page(0)),
        Err(CacheError::Invalid(_))
    ));
    handle.read(&mut buf, 0)?;
    assert_eq!(mem.counters().reads(), 2);
    Ok(())
}

#[test]
fn fetch_errors_reach_the_caller() {
    let cache = cache_with_slots(2);
    let mem = Arc::new(MemSource::new("flaky", patterned(PAGE, 4)));
    let handle = cache
        .attach(mem.clone(), AttachOptions::read_only())
        .expect("attach");
    mem.set_fail_reads(true);
    let mut buf = vec![0u8; 16];
    match handle.read(&mut buf, 0) {
        Err(CacheError::Io(err)) => assert_eq!(err.to_string(), "injected read failure"),
        other => panic!("expected io error, got {other:?}"),
    }
    mem.set_fail_reads(false);
    assert_eq!(handle.read(&mut buf, 0).unwrap(), 16);
    assert_eq!(cache.arena_stats().fetch_failures, 1);
}
