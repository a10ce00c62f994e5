//! Configuration resolution for the CLI.

use std::path::{Path, PathBuf};

use wecache_core::{CacheConfig, ConfigError};

/// Resolve the cache configuration.
///
/// A config file wins over `WECACHE_*` variables; `path_override` wins over
/// both for the disk directory.
pub fn resolve(
    config_file: Option<&Path>,
    path_override: Option<PathBuf>,
) -> Result<CacheConfig, ConfigError> {
    let mut config = match config_file {
        Some(file) => CacheConfig::from_toml_path(file)?,
        None => CacheConfig::from_env(),
    };
    if let Some(path) = path_override {
        config = config.with_disk_path(path);
    }
    config.validate()?;
    Ok(config)
}
