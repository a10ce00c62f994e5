use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wecache")]
#[command(about = "Inspect and maintain a wecache disk tier")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file (overrides WECACHE_* variables)
    #[arg(short, long, global = true, env = "WECACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disk tier directory (overrides the configured path)
    #[arg(short, long, global = true)]
    pub path: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Show row counts, sizes and hit rates
    Stats,
    /// Remove rows older than the disk max age
    Cleanup,
    /// Print a stored row and its decoded value
    Get(KeyArgs),
    /// Delete one row
    Invalidate(KeyArgs),
    /// List keys whose stored value carries an ETag
    FindEtag(EtagArgs),
    /// Delete every row
    Clear,
}

#[derive(clap::Args, Debug, PartialEq, Eq)]
pub struct KeyArgs {
    /// Cache key, e.g. efforts:WE-0042
    pub key: String,
}

#[derive(clap::Args, Debug, PartialEq, Eq)]
pub struct EtagArgs {
    /// Hex ETag as reported by `get`
    pub etag: String,
}
