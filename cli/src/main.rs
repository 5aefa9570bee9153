use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{
    CacheArgs, CatArgs, CleanupArgs, InfoArgs, PathArgs, PreloadArgs, run_cat, run_cleanup,
    run_info, run_path, run_preload,
};

#[derive(Parser)]
#[command(author, version, about = "URL data cache utilities")]
struct Cli {
    #[command(flatten)]
    cache: CacheArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a byte range of a URL to stdout, through the cache.
    Cat(CatArgs),
    /// Show remote size, modification time and cache state for a URL.
    Info(InfoArgs),
    /// Fill the cache for a byte range without printing it.
    Preload(PreloadArgs),
    /// Print where a URL's cache entry lives.
    Path(PathArgs),
    /// Delete cache entries not accessed for a number of days.
    Cleanup(CleanupArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_default_tracing();
    let config = cli.cache.config()?;
    match cli.command {
        Commands::Cat(args) => run_cat(args, &config).await,
        Commands::Info(args) => run_info(args, &config).await,
        Commands::Preload(args) => run_preload(args, &config).await,
        Commands::Path(args) => run_path(args, &config),
        Commands::Cleanup(args) => run_cleanup(args, &config),
    }
}

/// Logs go to stderr so `cat` output stays clean.
pub(crate) fn setup_default_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
