#![forbid(unsafe_code)]

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use crate::types::{CacheError, Result};

/// Positioned, blocking I/O against the data a cache handle fronts.
///
/// Implementations must be safe to call from several threads at once: the
/// cache issues fetches from foreground readers and pre-read workers
/// concurrently, always for distinct pages.
pub trait BackingSource: Send + Sync + 'static {
    /// Reads up to `dst.len()` bytes at `off`, returning the count placed in
    /// `dst`. A short count means end of data.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Writes `src` at `off`, returning the count accepted.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize>;
    /// Flushes outstanding modifications to durable storage.
    fn sync(&self) -> Result<()>;
    /// Truncates or extends the data to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Identifier used in diagnostics.
    fn path(&self) -> &str;
}

#[cfg(unix)]
/// Unix positioned I/O using `pread`/`pwrite` semantics.
pub mod stdio_unix {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
        path::Path,
    };

    /// Opens a file read-write, creating it when missing.
    pub fn open_rw(path: impl AsRef<Path>) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    /// Fills `dst` from `off` until it is full or the file ends.
    pub fn read_full(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while !dst.is_empty() {
            match file.read_at(dst, off) {
                Ok(0) => break,
                Ok(read) => {
                    let (_, tail) = dst.split_at_mut(read);
                    dst = tail;
                    off += read as u64;
                    total += read;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<usize> {
        let total = src.len();
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(total)
    }
}

#[cfg(windows)]
/// Windows positioned I/O using `seek_read`/`seek_write` semantics.
pub mod stdio_win {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
        path::Path,
    };

    /// Opens a file read-write, creating it when missing.
    pub fn open_rw(path: impl AsRef<Path>) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    /// Fills `dst` from `off` until it is full or the file ends.
    pub fn read_full(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                break;
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
            total += read;
        }
        Ok(total)
    }

    /// Writes all of `src` at `off`.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<usize> {
        let total = src.len();
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(total)
    }
}

/// Backing source over a local file.
#[derive(Clone)]
pub struct StdFileSource {
    inner: Arc<File>,
    path: String,
}

impl StdFileSource {
    /// Wraps an already-open file; `path` is only used for diagnostics.
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(file),
            path: path.into().display().to_string(),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        #[cfg(unix)]
        {
            let file = stdio_unix::open_rw(path)?;
            return Ok(Self::new(file, path));
        }
        #[cfg(windows)]
        {
            let file = stdio_win::open_rw(path)?;
            return Ok(Self::new(file, path));
        }
        #[allow(unreachable_code)]
        Err(CacheError::Invalid(
            "StdFileSource unsupported on this platform",
        ))
    }

    fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_full(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_unix::read_full(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_full(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_win::read_full(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<usize> {
        stdio_win::write_all(self.file(), off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_full(&self, _off: u64, _dst: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileSource unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileSource unsupported on this platform",
        ))
    }
}

impl BackingSource for StdFileSource {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.read_full(off, dst).map_err(CacheError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize> {
        self.write_all(off, src).map_err(CacheError::from)
    }

    fn sync(&self) -> Result<()> {
        self.file().sync_all().map_err(CacheError::from)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(CacheError::from)
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// Counters kept by [`MemSource`].
#[derive(Default, Debug)]
pub struct SourceCounters {
    /// Calls to `read_at`.
    pub reads: AtomicU64,
    /// Calls to `write_at`.
    pub writes: AtomicU64,
    /// Calls to `truncate`.
    pub truncates: AtomicU64,
    /// Calls to `sync`.
    pub syncs: AtomicU64,
}

impl SourceCounters {
    /// Number of `read_at` calls so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of `truncate` calls so far.
    pub fn truncates(&self) -> u64 {
        self.truncates.load(Ordering::Relaxed)
    }

    /// Number of `sync` calls so far.
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

/// In-memory backing source that counts every call made against it.
pub struct MemSource {
    name: String,
    data: RwLock<Vec<u8>>,
    counters: SourceCounters,
    fail_reads: AtomicBool,
}

impl MemSource {
    /// Creates a source holding `data`.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(data),
            counters: SourceCounters::default(),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Call counters.
    pub fn counters(&self) -> &SourceCounters {
        &self.counters
    }

    /// Makes every subsequent `read_at` fail with `ErrorKind::Other` when set.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Current length in bytes.
    pub fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    /// True when the source holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl BackingSource for MemSource {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure").into());
        }
        let data = self.data.read();
        let start = usize::try_from(off).map_err(|_| CacheError::Overflow)?;
        if start >= data.len() {
            return Ok(0);
        }
        let n = dst.len().min(data.len() - start);
        dst[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<usize> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.write();
        let start = usize::try_from(off).map_err(|_| CacheError::Overflow)?;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(src.len())
    }

    fn sync(&self) -> Result<()> {
        self.counters.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.counters.truncates.fetch_add(1, Ordering::Relaxed);
        let len = usize::try_from(len).map_err(|_| CacheError::Overflow)?;
        self.data.write().resize(len, 0);
        Ok(())
    }

    fn path(&self) -> &str {
        &self.name
    }
}

/// Endless source of zeros that silently accepts writes.
#[derive(Default, Clone, Copy, Debug)]
pub struct ZeroSource;

impl BackingSource for ZeroSource {
    fn read_at(&self, _off: u64, dst: &mut [u8]) -> Result<usize> {
        dst.fill(0);
        Ok(dst.len())
    }

    fn write_at(&self, _off: u64, src: &[u8]) -> Result<usize> {
        Ok(src.len())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, _len: u64) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> &str {
        "zero"
    }
}
