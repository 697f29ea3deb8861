//! Segments
//!
//! A segment is a bounded, ordered run of snapshots. It is the unit of
//! compression, of hand-off to the storage worker and of loading during
//! playback.

mod compression;

pub use compression::CompressionStats;

use indexmap::IndexMap;

use crate::error::{Result, StorageError};
use crate::pool::Poolable;
use crate::snapshot::Snapshot;

/// Highest capacity a pointer (`u8` index) can address
pub const MAX_SEGMENT_CAPACITY: u16 = 256;

/// Bounded run of snapshots, ordered by sequence
#[derive(Debug, Default)]
pub struct Segment {
    id: u32,
    capacity: u16,
    /// Keyed by sequence; insertion order is sequence order
    snapshots: IndexMap<u32, Snapshot>,
    compressed: bool,
    decompressed: bool,
    pooled: bool,
}

impl Segment {
    pub fn new(id: u32, capacity: u16) -> Self {
        Self {
            id,
            capacity: capacity.min(MAX_SEGMENT_CAPACITY),
            ..Default::default()
        }
    }

    pub(crate) fn assign(&mut self, id: u32, capacity: u16) {
        self.id = id;
        self.capacity = capacity.min(MAX_SEGMENT_CAPACITY);
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.snapshots.len() >= self.capacity as usize
    }

    /// Check if entries may still be back-references
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Check if the segment was decompressed (its states may be shared)
    pub fn is_decompressed(&self) -> bool {
        self.decompressed
    }

    pub fn start(&self) -> Option<&Snapshot> {
        self.snapshots.first().map(|(_, s)| s)
    }

    pub fn end(&self) -> Option<&Snapshot> {
        self.snapshots.last().map(|(_, s)| s)
    }

    pub fn start_sequence(&self) -> Option<u32> {
        self.start().map(Snapshot::sequence)
    }

    pub fn end_sequence(&self) -> Option<u32> {
        self.end().map(Snapshot::sequence)
    }

    pub fn start_time(&self) -> Option<f32> {
        self.start().map(Snapshot::timestamp)
    }

    pub fn end_time(&self) -> Option<f32> {
        self.end().map(Snapshot::timestamp)
    }

    /// Append a snapshot
    ///
    /// A full segment is sealed: the snapshot is rejected and the segment is
    /// left untouched.
    pub fn add_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        if self.pooled {
            return Err(StorageError::Disposed("segment"));
        }
        if self.compressed {
            return Err(StorageError::SegmentCompressed { segment: self.id });
        }
        if self.is_full() {
            return Err(StorageError::Capacity {
                capacity: self.capacity as usize,
            });
        }
        if let Some(previous) = self.end_sequence()
            && snapshot.sequence() <= previous
        {
            return Err(StorageError::OutOfOrder {
                previous,
                found: snapshot.sequence(),
            });
        }
        self.snapshots.insert(snapshot.sequence(), snapshot);
        Ok(())
    }

    /// Latest snapshot taken at or before `time`
    ///
    /// Returns `None` when `time` precedes the first snapshot.
    pub fn fetch_by_time(&self, time: f32) -> Result<Option<&Snapshot>> {
        self.ensure_readable()?;
        let index = self
            .snapshots
            .values()
            .rposition(|s| s.timestamp() <= time);
        Ok(index.and_then(|i| self.snapshot_at(i)))
    }

    /// Snapshot with exactly this sequence id
    pub fn fetch_by_sequence(&self, sequence: u32) -> Result<Option<&Snapshot>> {
        self.ensure_readable()?;
        Ok(self.snapshots.get(&sequence))
    }

    /// Snapshot at `index` within the segment, ignoring compression state
    pub fn snapshot_at(&self, index: usize) -> Option<&Snapshot> {
        self.snapshots.get_index(index).map(|(_, s)| s)
    }

    /// Position of the snapshot with this sequence id
    pub fn index_of(&self, sequence: u32) -> Option<usize> {
        self.snapshots.get_index_of(&sequence)
    }

    /// Iterate in sequence order
    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    pub(crate) fn set_compressed(&mut self, compressed: bool) {
        self.compressed = compressed;
    }

    pub(crate) fn drain_snapshots(&mut self) -> Vec<Snapshot> {
        self.snapshots.drain(..).map(|(_, s)| s).collect()
    }

    fn ensure_readable(&self) -> Result<()> {
        if self.pooled {
            return Err(StorageError::Disposed("segment"));
        }
        if self.compressed {
            return Err(StorageError::SegmentCompressed { segment: self.id });
        }
        Ok(())
    }
}

impl Poolable for Segment {
    fn reset(&mut self) {
        self.id = 0;
        self.capacity = 0;
        self.snapshots.clear();
        self.compressed = false;
        self.decompressed = false;
        self.pooled = true;
    }

    fn revive(&mut self) {
        self.pooled = false;
    }

    fn is_pooled(&self) -> bool {
        self.pooled
    }
}
