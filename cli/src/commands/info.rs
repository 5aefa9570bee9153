use anyhow::{Context, Result};
use chrono::DateTime;
use clap::Args;
use udc_cache::{UdcConfig, UdcFile, cache_age};

#[derive(Args)]
pub struct InfoArgs {
    /// URL or local path to describe.
    #[arg(value_name = "URL")]
    pub url: String,
}

pub async fn run_info(args: InfoArgs, config: &UdcConfig) -> Result<()> {
    let file = UdcFile::open(&args.url, config)
        .await
        .with_context(|| format!("opening {}", args.url))?
        .with_context(|| format!("{} not found", args.url))?;

    println!("url:       {}", file.url());
    println!("protocol:  {}", file.protocol());
    println!("size:      {}", file.size());
    let modified = i64::try_from(file.update_time())
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    match modified {
        Some(modified) => println!("modified:  {}", modified.to_rfc3339()),
        None => println!("modified:  {} (unix seconds)", file.update_time()),
    }

    if let Some(dir) = file.cache_dir() {
        let block_size = u64::from(config.block_size);
        let blocks = file.size().div_ceil(block_size);
        let cached = file.cached_blocks().context("counting cached blocks")?;
        println!("cache:     {}", dir.display());
        println!("version:   {}", file.bitmap_version());
        println!("blocks:    {cached}/{blocks} cached ({block_size} bytes each)");
        if let Some(root) = &config.cache_root {
            if let Some(age) = cache_age(&args.url, root)? {
                println!("checked:   {}s ago", age.as_secs());
            }
        }
    }
    file.close();
    Ok(())
}
