use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing::debug;
use udc_cache::{UdcConfig, UdcFile};

use super::clip_range;

const COPY_BUF_LEN: usize = 64 * 1024;

#[derive(Args)]
pub struct CatArgs {
    /// URL or local path to read.
    #[arg(value_name = "URL")]
    pub url: String,
    /// Byte offset to start from.
    #[arg(long, default_value_t = 0)]
    pub offset: u64,
    /// Bytes to copy (default: to end of file).
    #[arg(long)]
    pub length: Option<u64>,
}

pub async fn run_cat(args: CatArgs, config: &UdcConfig) -> Result<()> {
    let mut file = UdcFile::open(&args.url, config)
        .await
        .with_context(|| format!("opening {}", args.url))?
        .with_context(|| format!("{} not found", args.url))?;
    let (start, end) = clip_range(args.offset, args.length, file.size());
    file.seek(start);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut remaining = end - start;
    while remaining > 0 {
        let want = chunk_len(remaining, buf.len());
        let read = file
            .read(&mut buf[..want])
            .await
            .with_context(|| format!("reading {} at {}", args.url, file.tell()))?;
        if read == 0 {
            bail!(
                "cache entry for {} was rebuilt while reading at {}; retry",
                args.url,
                file.tell()
            );
        }
        out.write_all(&buf[..read]).context("writing stdout")?;
        remaining -= read as u64;
    }
    out.flush().context("flushing stdout")?;
    debug!(url = %args.url, start, end, hit_rate = file.io_stats().hit_rate(), "cat done");
    file.close();
    Ok(())
}

/// Bytes to request next: what is left, capped at the buffer size.
fn chunk_len(remaining: u64, buf_len: usize) -> usize {
    usize::try_from(remaining).unwrap_or(usize::MAX).min(buf_len)
}
