//! Shared stream loading

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use nether_reel::{ReelConfig, StorageConfig, StreamStorage};
use tracing::debug;

/// Storage settings from `--config`, or the defaults
pub fn load_config(path: Option<&Path>) -> Result<StorageConfig> {
    let Some(path) = path else {
        return Ok(StorageConfig::default());
    };
    let config = ReelConfig::load(path)
        .with_context(|| format!("Failed to load config: {}", path.display()))?;
    debug!(?config.storage, "loaded storage config");
    Ok(config.storage)
}

/// Open a committed stream and load its index
pub fn open(path: &Path, config: StorageConfig) -> Result<StreamStorage<File>> {
    let mut storage = StreamStorage::open(path, config)
        .with_context(|| format!("Failed to open stream: {}", path.display()))?;
    storage
        .prepare_read()
        .with_context(|| format!("Failed to read stream index: {}", path.display()))?;
    Ok(storage)
}
