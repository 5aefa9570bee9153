use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Args;
use udc_cache::UdcConfig;
use udc_cache::config::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_FETCH_BYTES};

mod cat;
mod cleanup;
mod info;
mod path;
mod preload;

pub use cat::{CatArgs, run_cat};
pub use cleanup::{CleanupArgs, run_cleanup};
pub use info::{InfoArgs, run_info};
pub use path::{PathArgs, run_path};
pub use preload::{PreloadArgs, run_preload};

/// Cache settings shared by every subcommand.
#[derive(Args)]
pub struct CacheArgs {
    /// Root of the cache tree (default: $XDG_CACHE_HOME/udc).
    #[arg(long, env = "UDC_CACHE_DIR", value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,
    /// Bypass the cache and read straight from the remote.
    #[arg(long, global = true)]
    pub no_cache: bool,
    /// Bytes tracked by each bitmap bit.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE, global = true)]
    pub block_size: u32,
    /// Largest single fetch issued while filling the cache.
    #[arg(long, default_value_t = DEFAULT_MAX_FETCH_BYTES, global = true)]
    pub max_fetch_bytes: u64,
    /// Trust cached size/mtime for this many seconds instead of asking the remote.
    #[arg(long, value_name = "SECS", default_value_t = 0, global = true)]
    pub cache_timeout: u64,
}

impl CacheArgs {
    pub fn config(&self) -> Result<UdcConfig> {
        let base = if self.no_cache {
            UdcConfig::without_cache()
        } else {
            match &self.cache_dir {
                Some(dir) => UdcConfig::new(dir),
                None => UdcConfig::default(),
            }
        };
        let config = base
            .with_block_size(self.block_size)
            .with_max_fetch_bytes(self.max_fetch_bytes)
            .with_cache_timeout(Duration::from_secs(self.cache_timeout));
        config.validate().context("invalid cache settings")?;
        Ok(config)
    }
}

pub(crate) fn require_cache_root(config: &UdcConfig) -> Result<&Path> {
    config
        .cache_root
        .as_deref()
        .ok_or_else(|| anyhow!("this command needs a cache directory; drop --no-cache"))
}

/// Resolve `[offset, offset + length)` against a file of `size` bytes.
pub(crate) fn clip_range(offset: u64, length: Option<u64>, size: u64) -> (u64, u64) {
    let start = offset.min(size);
    let end = match length {
        Some(length) => offset.saturating_add(length).min(size),
        None => size,
    };
    (start, end.max(start))
}
