//! Compression invariants over generated segments

use std::collections::BTreeMap;

use nether_reel::format::codec::{read_segment, write_segment};
use nether_reel::{ByteBuffer, IdentityWidth, ObjectId, PoolRegistry, Segment, Snapshot, Storable};
use proptest::prelude::*;

/// Per snapshot: identity -> state bytes
type Frames = Vec<BTreeMap<u32, Vec<u8>>>;

fn build(frames: &Frames) -> Segment {
    let mut segment = Segment::new(0, frames.len() as u16);
    for (i, frame) in frames.iter().enumerate() {
        let mut snapshot = Snapshot::new(i as f32 * 0.1, i as u32 + 1);
        for (&id, bytes) in frame {
            snapshot.record(ObjectId::new(id), ByteBuffer::from_bytes(bytes.clone()));
        }
        segment.add_snapshot(snapshot).unwrap();
    }
    segment
}

fn assert_matches(segment: &Segment, frames: &Frames) {
    assert_eq!(segment.len(), frames.len());
    for (snapshot, frame) in segment.snapshots().zip(frames) {
        assert_eq!(snapshot.len(), frame.len());
        for (&id, bytes) in frame {
            let state = snapshot.state(ObjectId::new(id)).unwrap();
            assert_eq!(state.as_bytes(), bytes.as_slice());
        }
    }
}

fn arb_frames() -> impl Strategy<Value = Frames> {
    // Few identities and few distinct values so duplicates are common
    let state = prop::collection::vec(0u8..3, 1..4);
    let frame = prop::collection::btree_map(0u32..6, state, 0..6);
    prop::collection::vec(frame, 1..40)
}

proptest! {
    #[test]
    fn test_compress_never_points_forward(frames in arb_frames()) {
        let mut segment = build(&frames);
        segment.compress().unwrap();

        for i in 0..segment.len() {
            let snapshot = segment.snapshot_at(i).unwrap();
            for (id, storable) in snapshot.entries() {
                if let Storable::Pointer(target) = storable {
                    let target = *target as usize;
                    prop_assert!(target < i);
                    // The target holds the identical state, never another pointer
                    let baseline = segment.snapshot_at(target).unwrap().storable(id);
                    prop_assert!(matches!(baseline, Some(Storable::State(_))));
                }
            }
        }
        // The baseline is always stored in full
        prop_assert!(!segment.snapshot_at(0).unwrap().has_pointers());
    }

    #[test]
    fn test_decompress_restores_every_state(frames in arb_frames()) {
        let mut segment = build(&frames);
        segment.compress().unwrap();
        segment.decompress().unwrap();
        assert_matches(&segment, &frames);
    }

    #[test]
    fn test_compressed_block_decodes_to_original(frames in arb_frames()) {
        let mut segment = build(&frames);
        segment.compress().unwrap();

        let mut bytes = Vec::new();
        write_segment(&mut bytes, &segment, IdentityWidth::U16).unwrap();

        let mut pools = PoolRegistry::default();
        let mut decoded = read_segment(&mut bytes.as_slice(), IdentityWidth::U16, &mut pools).unwrap();
        prop_assert!(decoded.is_compressed());
        decoded.decompress().unwrap();
        assert_matches(&decoded, &frames);
    }
}

#[test]
fn test_unchanged_object_is_stored_once() {
    let frame: BTreeMap<u32, Vec<u8>> = [(7, vec![1, 2, 3, 4])].into_iter().collect();
    let frames: Frames = vec![frame; 10];
    let mut segment = build(&frames);

    let stats = segment.compress().unwrap();
    assert_eq!(stats.deduplicated, 9);
    assert_eq!(stats.unique, 1);

    // Every later snapshot points straight at the baseline
    for i in 1..10 {
        let snapshot = segment.snapshot_at(i).unwrap();
        assert!(matches!(
            snapshot.storable(ObjectId::new(7)),
            Some(Storable::Pointer(0))
        ));
    }
}

#[test]
fn test_pointer_targets_first_occurrence() {
    let frames: Frames = [1u8, 2, 1, 2]
        .iter()
        .map(|&v| [(1, vec![v])].into_iter().collect())
        .collect();
    let mut segment = build(&frames);
    segment.compress().unwrap();

    let target = |i: usize| match segment.snapshot_at(i).unwrap().storable(ObjectId::new(1)) {
        Some(Storable::Pointer(t)) => Some(*t),
        _ => None,
    };
    assert_eq!(target(1), None);
    assert_eq!(target(2), Some(0));
    assert_eq!(target(3), Some(1));
}
