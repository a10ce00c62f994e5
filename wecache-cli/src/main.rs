mod cli;
mod config;
mod telemetry;

use std::sync::Arc;

use clap::Parser;
use wecache_core::{CacheError, SystemClock};
use wecache_storage::cache::{DiskTier, LmdbDiskCache, StoredRow};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    if let Err(e) = telemetry::init(&telemetry::LogConfig::from_env()) {
        eprintln!("warning: {}", e);
    }

    if let Err(e) = run().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CacheError> {
    let cli = Cli::parse();
    let config = config::resolve(cli.config.as_deref(), cli.path.clone())?;

    tracing::debug!(path = %config.disk.path.display(), "Opening disk tier");
    let disk = LmdbDiskCache::open(&config.disk, Arc::new(SystemClock))?;

    match &cli.command {
        Commands::Stats => {
            let stats = disk.stats().await?;
            println!("path:          {}", disk.path().display());
            println!("max_age_ms:    {}", disk.max_age_ms());
            println!("rows:          {}", stats.row_count);
            println!("size_bytes:    {}", stats.size_bytes);
            if config.disk.cleanup_interval.is_none() {
                println!("cleanup:       disabled");
            }
        }
        Commands::Cleanup => {
            let removed = disk.cleanup().await?;
            println!("removed {} stale row(s)", removed);
        }
        Commands::Get(args) => match disk.get(&args.key).await? {
            Some(row) => print_row(&row),
            None => {
                println!("{}: not found", args.key);
            }
        },
        Commands::Invalidate(args) => {
            if disk.delete(&args.key).await? {
                println!("{}: deleted", args.key);
            } else {
                println!("{}: not found", args.key);
            }
        }
        Commands::FindEtag(args) => {
            for key in disk.find_by_etag(&args.etag).await? {
                println!("{}", key);
            }
        }
        Commands::Clear => {
            let removed = disk.clear().await?;
            println!("removed {} row(s)", removed);
        }
    }

    Ok(())
}

fn print_row(row: &StoredRow) {
    println!("key:          {}", row.key);
    println!("etag:         {}", row.etag);
    println!("timestamp_ms: {}", row.timestamp_ms);
    println!("size_bytes:   {}", row.size_bytes);
    match row.decode_value::<serde_json::Value>() {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", value),
        },
        Err(e) => println!("<undecodable: {}>", e),
    }
}
