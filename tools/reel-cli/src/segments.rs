//! List the segment table

use std::path::Path;

use anyhow::Result;
use nether_reel::StorageConfig;

use crate::stream;

pub fn execute(file: &Path, config: StorageConfig) -> Result<()> {
    let storage = stream::open(file, config)?;
    let table = storage.table();

    println!(
        "{:>6}  {:>19}  {:>21}  {:>10}",
        "id", "sequences", "time (s)", "offset"
    );
    for entry in table.iter() {
        println!(
            "{:>6}  {:>9}..{:<8}  {:>10.3}..{:<9.3}  {:>10}",
            entry.segment_id,
            entry.start_sequence,
            entry.end_sequence,
            entry.start_time,
            entry.end_time,
            entry.offset
        );
    }
    println!();
    println!("{} segment(s)", table.len());

    storage.finish()?;
    Ok(())
}
