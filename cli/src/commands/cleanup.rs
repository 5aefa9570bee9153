use anyhow::{Context, Result};
use clap::Args;
use udc_cache::{UdcConfig, cleanup};

use super::require_cache_root;

#[derive(Args)]
pub struct CleanupArgs {
    /// Remove entries whose bitmap was not accessed within this many days.
    #[arg(long, value_name = "DAYS")]
    pub max_days: f64,
    /// Report what would be removed without deleting anything.
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run_cleanup(args: CleanupArgs, config: &UdcConfig) -> Result<()> {
    let root = require_cache_root(config)?;
    let bytes = cleanup(root, args.max_days, args.dry_run)
        .with_context(|| format!("cleaning {}", root.display()))?;
    if args.dry_run {
        println!("would remove {bytes} bytes from {}", root.display());
    } else {
        println!("removed {bytes} bytes from {}", root.display());
    }
    Ok(())
}
