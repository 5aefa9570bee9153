use anyhow::{Context, Result, bail};
use clap::Args;
use tracing::info;
use udc_cache::{UdcConfig, UdcFile};

use super::clip_range;

#[derive(Args)]
pub struct PreloadArgs {
    /// URL to cache.
    #[arg(value_name = "URL")]
    pub url: String,
    /// Byte offset to start from.
    #[arg(long, default_value_t = 0)]
    pub offset: u64,
    /// Bytes to cache (default: to end of file).
    #[arg(long)]
    pub length: Option<u64>,
}

pub async fn run_preload(args: PreloadArgs, config: &UdcConfig) -> Result<()> {
    let mut file = UdcFile::open(&args.url, config)
        .await
        .with_context(|| format!("opening {}", args.url))?
        .with_context(|| format!("{} not found", args.url))?;
    if file.cache_dir().is_none() {
        bail!("{} is not cached (local path or --no-cache)", args.url);
    }
    let (start, end) = clip_range(args.offset, args.length, file.size());
    let filled = file
        .preload(start, end - start)
        .await
        .with_context(|| format!("preloading {}", args.url))?;
    if !filled {
        bail!("cache entry for {} was rebuilt while preloading; retry", args.url);
    }
    let stats = *file.io_stats();
    info!(
        url = %args.url,
        start,
        end,
        fetched = stats.remote.bytes_read,
        fetches = stats.remote.reads,
        cached_blocks = file.cached_blocks()?,
        "preloaded"
    );
    file.close();
    Ok(())
}
