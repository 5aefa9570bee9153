use anyhow::Result;
use clap::Args;
use udc_cache::{CachePaths, UdcConfig, is_local};

use super::require_cache_root;

#[derive(Args)]
pub struct PathArgs {
    /// URL whose cache entry to locate.
    #[arg(value_name = "URL")]
    pub url: String,
}

pub fn run_path(args: PathArgs, config: &UdcConfig) -> Result<()> {
    if is_local(&args.url) {
        println!("{}", args.url);
        return Ok(());
    }
    let root = require_cache_root(config)?;
    let paths = CachePaths::for_url(&args.url, root)?;
    println!("{}", paths.dir.display());
    println!("{}", paths.bitmap.display());
    println!("{}", paths.sparse.display());
    Ok(())
}
