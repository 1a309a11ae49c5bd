use std::fs;
use std::sync::Arc;

use pagecache::cache::{AttachOptions, CacheOptions, PageCache, ReadSegment};
use pagecache::primitives::io::{BackingSource, StdFileSource};
use pagecache::Result;
use tempfile::tempdir;

const PAGE: usize = 4096;

fn cache() -> PageCache {
    PageCache::new(CacheOptions {
        page_size: PAGE,
        cache_size: 8 * PAGE as u64,
        max_cached_read: 2 * PAGE,
        ..CacheOptions::default()
    })
    .expect("cache")
}

#[test]
fn file_round_trip_through_cache() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cache.bin");
    let contents: Vec<u8> = (0..3 * PAGE + 17).map(|i| (i % 199) as u8).collect();
    fs::write(&path, &contents)?;

    let cache = cache();
    let source = Arc::new(StdFileSource::open(&path)?);
    let handle = cache
        .attach(source, AttachOptions::read_write())
        .expect("attach");
    assert_eq!(handle.path(), path.display().to_string());

    let mut buf = vec![0u8; 2 * PAGE];
    assert_eq!(handle.read(&mut buf, 100)?, 2 * PAGE);
    assert_eq!(buf, contents[100..100 + 2 * PAGE]);

    handle.write(b"patched", 3 * PAGE as u64)?;
    handle.sync()?;
    let on_disk = fs::read(&path)?;
    assert_eq!(&on_disk[3 * PAGE..3 * PAGE + 7], b"patched");

    let mut tail = vec![0u8; PAGE];
    assert_eq!(handle.read(&mut tail, 3 * PAGE as u64)?, 17);
    assert_eq!(&tail[..7], b"patched");
    assert_eq!(tail[7..17], contents[3 * PAGE + 7..]);

    handle.truncate(PAGE as u64 + 10)?;
    assert_eq!(fs::metadata(&path)?.len(), PAGE as u64 + 10);
    assert_eq!(handle.read(&mut tail, PAGE as u64)?, 10);
    assert_eq!(handle.read(&mut tail, 2 * PAGE as u64)?, 0);

    assert!(handle.detach().is_some());
    Ok(())
}

#[test]
fn vectored_reads_against_a_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("vec.bin");
    let contents: Vec<u8> = (0..4 * PAGE).map(|i| (i / 7) as u8).collect();
    fs::write(&path, &contents)?;

    let cache = cache();
    let source: Arc<dyn BackingSource> = Arc::new(StdFileSource::open(&path)?);
    let handle = cache
        .attach(Arc::clone(&source), AttachOptions::read_only())
        .expect("attach");

    let mut first = vec![0u8; 300];
    let mut second = vec![0u8; 5000];
    let mut third = vec![0u8; 50];
    let mut segments = [
        ReadSegment {
            offset: 10,
            buf: &mut first,
        },
        ReadSegment {
            offset: PAGE as u64 - 20,
            buf: &mut second,
        },
        ReadSegment {
            offset: 4 * PAGE as u64 - 25,
            buf: &mut third,
        },
    ];
    assert_eq!(handle.read_vectored(&mut segments)?, 300 + 5000 + 25);
    assert_eq!(first, contents[10..310]);
    assert_eq!(second, contents[PAGE - 20..PAGE + 4980]);
    assert_eq!(third[..25], contents[4 * PAGE - 25..]);

    let returned = handle.detach().expect("source back");
    assert!(Arc::ptr_eq(&returned, &source));
    Ok(())
}

#[test]
fn options_load_from_toml_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("cache.toml");
    fs::write(
        &path,
        r#"
page_size = 8192
cache_size = 65536
max_handles = 3
log_stats = true

[apr]
min_pages = 2
"#,
    )?;
    let options = CacheOptions::load(&path)?;
    let cache = PageCache::new(options)?;
    let geometry = cache.geometry();
    assert_eq!(geometry.page_size, 8192);
    assert_eq!(geometry.slots, 8);
    assert_eq!(geometry.buckets, 7);
    assert_eq!(geometry.max_handles, 3);
    assert_eq!(cache.preread_workers(), 0);
    Ok(())
}
