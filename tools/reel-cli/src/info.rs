//! Show stream header and totals

use std::path::Path;

use anyhow::Result;
use nether_reel::StorageConfig;

use crate::stream;

pub fn execute(file: &Path, config: StorageConfig) -> Result<()> {
    let storage = stream::open(file, config)?;
    let header = storage.header();
    let file_size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);

    println!("=== {} ===", file.display());
    println!("Format version: {}", header.version);
    println!("Identity width: {} bytes", header.identity_width.bytes());
    println!("Committed: {}", header.is_committed());
    println!("Snapshots: {}", header.snapshot_count);
    println!("Duration: {:.3}s", header.duration);
    println!("Segments: {}", storage.table().len());
    println!("State memory: {} bytes", header.memory_size);
    println!("File size: {} bytes", file_size);

    let persistent = storage.persistent();
    println!();
    println!(
        "Persistent records: {} ({} objects)",
        persistent.record_count(),
        persistent.len()
    );

    let metadata = storage.metadata();
    if let Some(application) = &metadata.application {
        println!("Application: {}", application);
    }
    if let Some(recorded_at) = metadata.recorded_at {
        println!("Recorded at: {} (unix)", recorded_at);
    }
    if !metadata.tags.is_empty() {
        println!();
        println!("Tags:");
        for (key, value) in &metadata.tags {
            println!("  {} = {}", key, value);
        }
    }
    if !metadata.prefabs.is_empty() {
        println!();
        println!("Prefabs:");
        for (prefab, name) in &metadata.prefabs {
            println!("  {:>5}  {}", prefab.0, name);
        }
    }

    storage.finish()?;
    Ok(())
}
