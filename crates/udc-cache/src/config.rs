use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use udc_core::{UdcError, UdcErrorKind, UdcResult};

/// Bytes covered by one bitmap bit.
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;
/// Largest single backend fetch issued while filling the cache (32 blocks).
pub const DEFAULT_MAX_FETCH_BYTES: u64 = 32 * DEFAULT_BLOCK_SIZE as u64;
/// Used when neither `XDG_CACHE_HOME` nor `HOME` is set.
pub const FALLBACK_CACHE_ROOT: &str = "/tmp/udcCache";

/// Latency injected by the `slow:` test backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlowDelays {
    /// Before every info lookup and every data fetch.
    pub per_call: Duration,
    /// After each KiB of data read.
    pub per_kib: Duration,
}

impl Default for SlowDelays {
    fn default() -> Self {
        Self {
            per_call: Duration::from_millis(500),
            per_kib: Duration::from_millis(250),
        }
    }
}

impl SlowDelays {
    pub fn none() -> Self {
        Self {
            per_call: Duration::ZERO,
            per_kib: Duration::ZERO,
        }
    }
}

/// Settings for opening cache handles.
#[derive(Clone, Debug)]
pub struct UdcConfig {
    /// Root of the cache tree. `None` disables caching: reads go straight to the backend.
    pub cache_root: Option<PathBuf>,
    pub block_size: u32,
    /// Upper bound on bytes filled per cache pass; rounded down to whole blocks.
    pub max_fetch_bytes: u64,
    /// When positive, an entry whose bitmap was touched more recently than this is trusted
    /// without asking the remote for its size and modification time.
    pub cache_timeout: Duration,
    /// `sync_data` the sparse file before marking freshly written blocks as present.
    pub sync_data: bool,
    pub http_connect_timeout: Duration,
    pub http_timeout: Duration,
    pub ftp_timeout: Duration,
    pub slow_delays: SlowDelays,
}

impl Default for UdcConfig {
    fn default() -> Self {
        Self {
            cache_root: Some(default_cache_root()),
            block_size: DEFAULT_BLOCK_SIZE,
            max_fetch_bytes: DEFAULT_MAX_FETCH_BYTES,
            cache_timeout: Duration::ZERO,
            sync_data: true,
            http_connect_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(60),
            ftp_timeout: Duration::from_secs(30),
            slow_delays: SlowDelays::default(),
        }
    }
}

impl UdcConfig {
    /// Defaults, with the cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Defaults, with caching disabled.
    pub fn without_cache() -> Self {
        Self {
            cache_root: None,
            ..Self::default()
        }
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_fetch_bytes(mut self, max_fetch_bytes: u64) -> Self {
        self.max_fetch_bytes = max_fetch_bytes;
        self
    }

    pub fn with_cache_timeout(mut self, timeout: Duration) -> Self {
        self.cache_timeout = timeout;
        self
    }

    pub fn with_sync_data(mut self, sync_data: bool) -> Self {
        self.sync_data = sync_data;
        self
    }

    pub fn with_slow_delays(mut self, delays: SlowDelays) -> Self {
        self.slow_delays = delays;
        self
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_root.is_some()
    }

    pub fn validate(&self) -> UdcResult<()> {
        if self.block_size == 0 {
            return Err(UdcError::with_message(
                UdcErrorKind::InvalidInput,
                "block size must be non-zero",
            ));
        }
        if self.max_fetch_bytes == 0 {
            return Err(UdcError::with_message(
                UdcErrorKind::InvalidInput,
                "max fetch bytes must be non-zero",
            ));
        }
        Ok(())
    }

    /// Bytes handled per cache pass: `max_fetch_bytes` rounded down to whole blocks, but at
    /// least one block.
    pub fn chunk_bytes(&self) -> u64 {
        let block = u64::from(self.block_size);
        (self.max_fetch_bytes / block).max(1) * block
    }
}

/// Cache root used when the caller does not name one.
pub fn default_cache_root() -> PathBuf {
    cache_root_from(env::var_os("XDG_CACHE_HOME"), env::var_os("HOME"))
}

fn cache_root_from(xdg_cache_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(path) = xdg_cache_home.filter(|path| !path.is_empty()) {
        return PathBuf::from(path).join("udc");
    }
    if let Some(path) = home.filter(|path| !path.is_empty()) {
        return PathBuf::from(path).join(".cache").join("udc");
    }
    PathBuf::from(FALLBACK_CACHE_ROOT)
}
