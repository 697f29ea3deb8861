//! Cross-snapshot deduplication
//!
//! Compression replaces a state with [`Storable::Pointer`] when an earlier
//! snapshot of the same segment holds identical bytes for the same identity.
//! The first snapshot is always a full baseline. Content hashes only
//! pre-filter candidates; a match is confirmed byte for byte, so a hash
//! collision can never corrupt data.

use std::sync::Arc;

use tracing::debug;

use super::Segment;
use crate::buffer::ByteBuffer;
use crate::error::{FormatError, Result, StorageError};
use crate::identity::ObjectId;
use crate::snapshot::Storable;

/// Outcome of one compression pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    /// States replaced by pointers
    pub deduplicated: usize,
    /// States that had no earlier match
    pub unique: usize,
    /// Payload bytes no longer stored
    pub bytes_saved: usize,
}

impl Segment {
    /// Deduplicate states against earlier snapshots
    ///
    /// No-op on an empty or already compressed segment. A segment that was
    /// decompressed shares buffers between snapshots and cannot be
    /// compressed again.
    pub fn compress(&mut self) -> Result<CompressionStats> {
        let mut stats = CompressionStats::default();
        if self.snapshots.is_empty() || self.compressed {
            return Ok(stats);
        }
        if self.decompressed {
            return Err(StorageError::Recompress { segment: self.id });
        }

        // Newest first, so every candidate baseline is still a plain state
        for i in (1..self.snapshots.len()).rev() {
            let mut replacements: Vec<(ObjectId, u8, usize)> = Vec::new();
            {
                let Some(current) = self.snapshot_at(i) else {
                    continue;
                };
                for (id, storable) in current.entries() {
                    let Storable::State(state) = storable else {
                        continue;
                    };
                    let hash = state.content_hash();
                    let baseline = (0..i).find(|&k| {
                        self.snapshot_at(k)
                            .and_then(|s| s.state(id))
                            .is_some_and(|candidate| {
                                candidate.content_hash() == hash
                                    && candidate.as_bytes() == state.as_bytes()
                            })
                    });
                    match baseline {
                        Some(k) => replacements.push((id, k as u8, state.size())),
                        None => stats.unique += 1,
                    }
                }
            }

            if let Some((_, snapshot)) = self.snapshots.get_index_mut(i) {
                for (id, target, size) in replacements {
                    snapshot.set_storable(id, Storable::Pointer(target));
                    stats.deduplicated += 1;
                    stats.bytes_saved += size.saturating_sub(1);
                }
            }
        }

        if let Some(first) = self.snapshot_at(0) {
            stats.unique += first.len();
        }
        self.compressed = true;
        debug!(
            segment = self.id,
            snapshots = self.snapshots.len(),
            deduplicated = stats.deduplicated,
            unique = stats.unique,
            bytes_saved = stats.bytes_saved,
            "compressed segment"
        );
        Ok(stats)
    }

    /// Resolve every pointer back to its baseline state
    ///
    /// Resolved entries share the baseline's buffer rather than copying it.
    /// No-op on a segment that is not compressed.
    pub fn decompress(&mut self) -> Result<()> {
        if !self.compressed {
            return Ok(());
        }

        let mut resolved = 0usize;
        for i in 1..self.snapshots.len() {
            let mut substitutions: Vec<(ObjectId, Arc<ByteBuffer>)> = Vec::new();
            {
                let Some(current) = self.snapshot_at(i) else {
                    continue;
                };
                for (id, storable) in current.entries() {
                    let Storable::Pointer(target) = *storable else {
                        continue;
                    };
                    if target as usize >= i {
                        return Err(FormatError::ForwardPointer {
                            identity: id,
                            index: i,
                            target,
                        }
                        .into());
                    }
                    let baseline = self
                        .snapshot_at(target as usize)
                        .and_then(|s| s.storable(id));
                    match baseline {
                        Some(Storable::State(state)) => substitutions.push((id, Arc::clone(state))),
                        _ => {
                            return Err(FormatError::MissingBaseline {
                                identity: id,
                                index: i,
                                target,
                            }
                            .into());
                        }
                    }
                }
            }

            if let Some((_, snapshot)) = self.snapshots.get_index_mut(i) {
                resolved += substitutions.len();
                for (id, state) in substitutions {
                    snapshot.set_storable(id, Storable::State(state));
                }
            }
        }

        self.compressed = false;
        self.decompressed = true;
        debug!(segment = self.id, resolved, "decompressed segment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StateWrite;
    use crate::snapshot::Snapshot;

    fn state(value: u32) -> ByteBuffer {
        let mut buf = ByteBuffer::new();
        buf.write(&value).unwrap();
        buf
    }

    /// Segment whose snapshots record `values[i]` for identities 1 and 2
    fn segment(values: &[(u32, u32)]) -> Segment {
        let mut segment = Segment::new(0, 16);
        for (i, &(a, b)) in values.iter().enumerate() {
            let seq = i as u32 + 1;
            let mut snapshot = Snapshot::new(i as f32, seq);
            snapshot.record(ObjectId::new(1), state(a));
            snapshot.record(ObjectId::new(2), state(b));
            segment.add_snapshot(snapshot).unwrap();
        }
        segment
    }

    fn storable(segment: &Segment, index: usize, id: u32) -> Storable {
        segment
            .snapshot_at(index)
            .unwrap()
            .storable(ObjectId::new(id))
            .unwrap()
            .clone()
    }

    #[test]
    fn test_identical_states_become_pointers() {
        let mut segment = segment(&[(5, 1), (5, 2), (5, 1)]);
        let stats = segment.compress().unwrap();

        assert_eq!(storable(&segment, 1, 1), Storable::Pointer(0));
        assert_eq!(storable(&segment, 2, 1), Storable::Pointer(0));
        // Identity 2 matches the first snapshot, not the closest one
        assert_eq!(storable(&segment, 2, 2), Storable::Pointer(0));
        assert!(matches!(storable(&segment, 1, 2), Storable::State(_)));
        assert_eq!(stats.deduplicated, 3);
        assert_eq!(stats.bytes_saved, 9);
    }

    #[test]
    fn test_baseline_never_compressed() {
        let mut segment = segment(&[(1, 1)]);
        segment.compress().unwrap();
        assert!(!segment.snapshot_at(0).unwrap().has_pointers());
    }

    #[test]
    fn test_decompress_aliases_baseline() {
        let mut segment = segment(&[(5, 1), (5, 2)]);
        segment.compress().unwrap();
        segment.decompress().unwrap();

        let Storable::State(base) = storable(&segment, 0, 1) else {
            panic!("baseline must hold state");
        };
        let Storable::State(alias) = storable(&segment, 1, 1) else {
            panic!("pointer was not resolved");
        };
        assert!(Arc::ptr_eq(&base, &alias));
        assert_eq!(alias.as_bytes(), &5u32.to_le_bytes());
        assert!(segment.is_decompressed());
    }

    #[test]
    fn test_recompress_rejected() {
        let mut segment = segment(&[(5, 1), (5, 2)]);
        segment.compress().unwrap();
        segment.decompress().unwrap();
        assert!(matches!(
            segment.compress(),
            Err(StorageError::Recompress { segment: 0 })
        ));
    }

    #[test]
    fn test_empty_segment_is_noop() {
        let mut segment = Segment::new(1, 4);
        assert_eq!(segment.compress().unwrap(), CompressionStats::default());
        segment.decompress().unwrap();
        assert!(!segment.is_compressed());
    }

    #[test]
    fn test_forward_pointer_rejected() {
        let mut segment = segment(&[(1, 1), (2, 2)]);
        segment.set_compressed(true);
        if let Some((_, snapshot)) = segment.snapshots.get_index_mut(1) {
            snapshot.set_storable(ObjectId::new(1), Storable::Pointer(1));
        }
        assert!(matches!(
            segment.decompress(),
            Err(StorageError::Format(FormatError::ForwardPointer { index: 1, target: 1, .. }))
        ));
    }

    #[test]
    fn test_missing_baseline_rejected() {
        let mut segment = Segment::new(0, 4);
        segment.add_snapshot(Snapshot::new(0.0, 1)).unwrap();
        let mut second = Snapshot::new(1.0, 2);
        second.set_storable(ObjectId::new(9), Storable::Pointer(0));
        segment.add_snapshot(second).unwrap();
        segment.set_compressed(true);

        assert!(matches!(
            segment.decompress(),
            Err(StorageError::Format(FormatError::MissingBaseline { target: 0, .. }))
        ));
    }
}
