//! Check a stream end to end
//!
//! Loads every segment as stored, compares it with its table entry and
//! resolves every pointer. Stops at the first failure.

use std::path::Path;

use anyhow::{Context, Result, bail};
use nether_reel::{SegmentEntry, StorageConfig};
use tracing::debug;

use crate::stream;

/// Totals gathered while verifying
#[derive(Debug, Default, PartialEq)]
pub struct VerifyReport {
    pub segments: usize,
    pub snapshots: u64,
    pub pointers: usize,
}

pub fn execute(file: &Path, config: StorageConfig) -> Result<VerifyReport> {
    println!("Verifying stream: {}", file.display());

    let mut storage = stream::open(file, config)?;
    let entries: Vec<SegmentEntry> = storage.table().iter().copied().collect();
    let mut report = VerifyReport::default();

    for entry in &entries {
        let mut segment = storage
            .load_raw_segment(entry)
            .with_context(|| format!("Segment {}: failed to load", entry.segment_id))?;

        let bounds = (segment.start_sequence(), segment.end_sequence());
        if bounds != (Some(entry.start_sequence), Some(entry.end_sequence)) {
            bail!(
                "Segment {}: holds sequences {:?}..{:?}, table says {}..{}",
                entry.segment_id,
                bounds.0,
                bounds.1,
                entry.start_sequence,
                entry.end_sequence
            );
        }
        if segment.start_time() != Some(entry.start_time)
            || segment.end_time() != Some(entry.end_time)
        {
            bail!(
                "Segment {}: time range does not match the table",
                entry.segment_id
            );
        }

        let pointers: usize = segment
            .snapshots()
            .map(|s| s.entries().filter(|(_, st)| st.as_state().is_none()).count())
            .sum();
        segment
            .decompress()
            .with_context(|| format!("Segment {}: bad pointer", entry.segment_id))?;

        debug!(segment = entry.segment_id, pointers, "segment ok");
        report.segments += 1;
        report.snapshots += segment.len() as u64;
        report.pointers += pointers;
        storage.recycle_segment(segment)?;
    }

    let header = storage.header();
    if report.snapshots != header.snapshot_count as u64 {
        bail!(
            "Header counts {} snapshots, segments hold {}",
            header.snapshot_count,
            report.snapshots
        );
    }
    if let Some(last) = entries.last()
        && last.end_time != header.duration
    {
        bail!(
            "Header duration {:.3}s does not match the last snapshot at {:.3}s",
            header.duration,
            last.end_time
        );
    }

    println!();
    println!("=== Stream Valid ===");
    println!("Segments: {}", report.segments);
    println!("Snapshots: {}", report.snapshots);
    println!("Pointers resolved: {}", report.pointers);

    storage.finish()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_reel::{ByteBuffer, ObjectId, StateWrite, StreamStorage};

    fn record(path: &Path) {
        let config = StorageConfig {
            segment_capacity: 4,
            ..Default::default()
        };
        let mut storage = StreamStorage::create(path, config).unwrap();
        storage.prepare_write().unwrap();
        for seq in 1..=10u32 {
            let mut snapshot = storage.acquire_snapshot(seq as f32, seq);
            let mut state = ByteBuffer::new();
            state.write(&7u32).unwrap();
            snapshot.record(ObjectId::new(3), state);
            storage.store_snapshot(snapshot).unwrap();
        }
        storage.commit().unwrap();
        storage.finish().unwrap();
    }

    #[test]
    fn test_verify_recorded_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.nreel");
        record(&path);

        let report = execute(&path, StorageConfig::default()).unwrap();
        assert_eq!(report.segments, 3);
        assert_eq!(report.snapshots, 10);
        // Every snapshot but the first of each segment points at its baseline
        assert_eq!(report.pointers, 7);
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.nreel");
        std::fs::write(&path, b"not a stream at all").unwrap();
        assert!(execute(&path, StorageConfig::default()).is_err());
    }
}
