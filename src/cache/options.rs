use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MAX_HANDLES;

/// Smallest accepted page size.
pub const MIN_PAGE_SIZE: usize = 4096;
/// Largest accepted page size.
pub const MAX_PAGE_SIZE: usize = 16 * 1024 * 1024;
/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 32 * 1024;
/// Cache capacity used when none is configured.
pub const DEFAULT_CACHE_SIZE: u64 = 100 * 1024 * 1024;
/// Pre-read accounting window used when `recalc_bytes` is zero.
pub const DEFAULT_RECALC_BYTES: u64 = 50 * 1024 * 1024;

/// Deployment role; selects handle-table and worker-pool defaults.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User application embedding the cache.
    #[default]
    Client,
    /// Data server fronting many files at once.
    Server,
}

impl Role {
    /// Returns the string representation of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    fn default_max_handles(self) -> usize {
        match self {
            Role::Client => 256,
            Role::Server => 8192,
        }
    }

    fn default_preread_workers(self) -> usize {
        match self {
            Role::Client => 3,
            Role::Server => 9,
        }
    }
}

/// Automatic pre-read tuning.
///
/// Zero values select derived defaults; see [`AprParams::resolve`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AprParams {
    /// Reads shorter than this many bytes may trigger a pre-read.
    pub trigger: usize,
    /// Recompute pre-read efficiency every this many pre-read bytes.
    pub recalc_bytes: u64,
    /// Pages pre-read per trigger; zero turns automatic pre-read off.
    pub min_pages: u16,
    /// Minimum acceptable pre-read hit percentage.
    pub min_perf: u8,
    /// A sample only counts as improving when it beats the previous one by
    /// more than this factor.
    pub improvement_factor: u32,
}

impl Default for AprParams {
    fn default() -> Self {
        Self {
            trigger: 0,
            recalc_bytes: 0,
            min_pages: 0,
            min_perf: 90,
            improvement_factor: 2,
        }
    }
}

impl AprParams {
    /// Fills derived defaults for `page_size` and reports whether automatic
    /// pre-read is workable with the result.
    pub fn resolve(mut self, page_size: usize) -> (Self, bool) {
        if self.trigger == 0 {
            self.trigger = if self.min_pages > 0 { page_size + 1 } else { 0 };
        }
        if self.recalc_bytes == 0 {
            self.recalc_bytes = DEFAULT_RECALC_BYTES;
        }
        if self.min_perf > 100 {
            self.min_perf = 100;
        }
        let workable = self.min_pages > 0 && self.trigger > 1;
        (self, workable)
    }
}

/// Construction-time configuration of a [`PageCache`](super::PageCache).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Size of each page in bytes.
    pub page_size: usize,
    /// Total bytes of page memory.
    pub cache_size: u64,
    /// Largest read that is placed in the cache; zero means one page.
    pub max_cached_read: usize,
    /// Maximum simultaneously attached handles; zero picks a role default.
    pub max_handles: usize,
    /// Deployment role.
    pub role: Role,
    /// Treat attached sources as structured unless overridden per attach.
    pub structured: bool,
    /// Enable pre-read machinery.
    pub can_preread: bool,
    /// Pre-read worker threads; zero picks a role default.
    pub preread_workers: usize,
    /// Log per-handle statistics when a handle is finally detached.
    pub log_stats: bool,
    /// Default automatic pre-read parameters for new handles.
    pub apr: AprParams,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_cached_read: 0,
            max_handles: 0,
            role: Role::Client,
            structured: false,
            can_preread: false,
            preread_workers: 0,
            log_stats: false,
            apr: AprParams::default(),
        }
    }
}

impl CacheOptions {
    /// Parses options from TOML text; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Validates the options and derives the arena layout.
    pub fn geometry(&self) -> Result<CacheGeometry, ConfigError> {
        if self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: format!("{} exceeds the {} byte maximum", self.page_size, MAX_PAGE_SIZE),
            });
        }
        let page_size = self.page_size.max(MIN_PAGE_SIZE).next_power_of_two();
        let page_shift = page_size.trailing_zeros();
        let slots = usize::try_from(self.cache_size / page_size as u64)
            .map_err(|_| ConfigError::Invalid {
                field: "cache_size",
                reason: format!("{} bytes is not addressable", self.cache_size),
            })?
            .max(1);
        if slots >= u32::MAX as usize / 2 {
            return Err(ConfigError::Invalid {
                field: "cache_size",
                reason: format!("{slots} slots exceed the arena limit"),
            });
        }
        let buckets = if slots % 2 == 1 { slots } else { slots - 1 };
        let max_handles = match self.max_handles {
            0 => self.role.default_max_handles(),
            n if n > MAX_HANDLES => {
                return Err(ConfigError::Invalid {
                    field: "max_handles",
                    reason: format!("{n} exceeds the {MAX_HANDLES} handle maximum"),
                })
            }
            n => n,
        };
        let max_cached_read = self.max_cached_read.max(page_size);
        let preread_workers = if !self.can_preread {
            0
        } else if self.preread_workers == 0 {
            self.role.default_preread_workers()
        } else {
            self.preread_workers
        };
        Ok(CacheGeometry {
            page_size,
            page_shift,
            offset_mask: page_size as u64 - 1,
            slots,
            buckets: buckets.max(1),
            max_handles,
            max_cached_read,
            preread_workers,
        })
    }
}

/// Normalized arena layout derived from [`CacheOptions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheGeometry {
    /// Page size in bytes, a power of two.
    pub page_size: usize,
    /// `log2(page_size)`.
    pub page_shift: u32,
    /// Mask selecting the in-page byte offset.
    pub offset_mask: u64,
    /// Number of data slots.
    pub slots: usize,
    /// Number of hash buckets, odd and no larger than `slots`.
    pub buckets: usize,
    /// Handle-table entries.
    pub max_handles: usize,
    /// Largest read placed in the cache.
    pub max_cached_read: usize,
    /// Pre-read worker threads; zero when pre-read is disabled.
    pub preread_workers: usize,
}

impl CacheGeometry {
    /// Page number containing byte `offset`.
    pub fn page_of(&self, offset: u64) -> u64 {
        offset >> self.page_shift
    }

    /// Byte offset of `offset` within its page.
    pub fn offset_in_page(&self, offset: u64) -> usize {
        (offset & self.offset_mask) as usize
    }

    /// First byte offset of `page`.
    pub fn page_start(&self, page: u64) -> u64 {
        page << self.page_shift
    }
}

/// Per-attach behavior.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AttachOptions {
    /// Allow writes and truncation through the handle.
    pub read_write: bool,
    /// Override the cache-wide structured setting for this handle.
    pub structured: Option<bool>,
}

impl AttachOptions {
    /// Read-only attachment using the cache defaults.
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Read-write attachment using the cache defaults.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            structured: None,
        }
    }

    /// Sets the structured override.
    pub fn with_structured(mut self, structured: bool) -> Self {
        self.structured = Some(structured);
        self
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read cache config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The configuration text is not valid TOML for [`CacheOptions`].
    #[error("failed to parse cache config{}: {source}", display_path(.path))]
    Parse {
        /// File being parsed, when one was involved.
        path: Option<PathBuf>,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// The options could not be rendered as TOML.
    #[error("failed to serialize cache config: {source}")]
    Serialize {
        /// Underlying TOML error.
        source: toml::ser::Error,
    },
    /// A value is outside its accepted range.
    #[error("invalid cache option {field}: {reason}")]
    Invalid {
        /// Offending option.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" {}", path.display()),
        None => String::new(),
    }
}
