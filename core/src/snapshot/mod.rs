//! Snapshots
//!
//! A [`Snapshot`] is every recorded object state at one instant, keyed by
//! [`ObjectId`]. Inside a compressed segment an entry may be a
//! [`Storable::Pointer`] back to an identical state in an earlier snapshot
//! of the same segment.

mod descriptor;
mod restore;

use std::cell::Cell;
use std::sync::Arc;

use hashbrown::HashMap;

pub use descriptor::{ObjectDescriptor, ObservedIds, PrefabId, SpawnState};
pub use restore::{ReplayScene, RestoreReport, RestoreWarning};

use crate::buffer::ByteBuffer;
use crate::identity::ObjectId;
use crate::pool::Poolable;

/// Value stored for one identity in one snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum Storable {
    /// Serialized object state
    ///
    /// Shared read-only once decompression has resolved pointers to it.
    State(Arc<ByteBuffer>),
    /// Index of an earlier snapshot in the same segment holding identical state
    Pointer(u8),
}

impl Storable {
    /// Bytes this entry contributes to a snapshot's storage size
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::State(state) => state.size(),
            Self::Pointer(_) => 1,
        }
    }

    pub fn as_state(&self) -> Option<&ByteBuffer> {
        match self {
            Self::State(state) => Some(state),
            Self::Pointer(_) => None,
        }
    }
}

/// All recorded object states at one point in time
#[derive(Debug, Default)]
pub struct Snapshot {
    timestamp: f32,
    /// Strictly increasing, starting at 1
    sequence: u32,
    entries: HashMap<ObjectId, Storable>,
    /// Cached storage size; `None` means dirty
    size: Cell<Option<u32>>,
    /// Objects spawned this frame (transient, never persisted with the snapshot)
    spawned: Vec<(ObjectId, SpawnState)>,
    /// Objects destroyed this frame (transient)
    destroyed: Vec<ObjectId>,
    pooled: bool,
}

impl Snapshot {
    pub fn new(timestamp: f32, sequence: u32) -> Self {
        Self {
            timestamp,
            sequence,
            ..Default::default()
        }
    }

    pub(crate) fn stamp(&mut self, timestamp: f32, sequence: u32) {
        self.timestamp = timestamp;
        self.sequence = sequence;
    }

    pub fn timestamp(&self) -> f32 {
        self.timestamp
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Number of recorded identities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Recorded identities, in no particular order
    pub fn identities(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.entries.keys().copied()
    }

    /// Iterate over every entry
    pub fn entries(&self) -> impl Iterator<Item = (ObjectId, &Storable)> {
        self.entries.iter().map(|(&id, storable)| (id, storable))
    }

    /// Record the state of `id`
    ///
    /// Only the first record for an identity is kept; later attempts in the
    /// same snapshot are ignored and the rejected buffer is handed back so it
    /// can be returned to its pool.
    pub fn record(&mut self, id: ObjectId, state: ByteBuffer) -> Option<ByteBuffer> {
        if self.entries.contains_key(&id) {
            return Some(state);
        }
        self.entries.insert(id, Storable::State(Arc::new(state)));
        self.size.set(None);
        None
    }

    pub fn storable(&self, id: ObjectId) -> Option<&Storable> {
        self.entries.get(&id)
    }

    /// State for `id`, if it is stored directly (not as a pointer)
    pub fn state(&self, id: ObjectId) -> Option<&ByteBuffer> {
        self.entries.get(&id).and_then(Storable::as_state)
    }

    /// Check if any entry is still a back-reference
    pub fn has_pointers(&self) -> bool {
        self.entries
            .values()
            .any(|storable| matches!(storable, Storable::Pointer(_)))
    }

    /// Total bytes of all entries, cached until the entries change
    pub fn size_bytes(&self) -> u32 {
        if let Some(size) = self.size.get() {
            return size;
        }
        let size: usize = self.entries.values().map(Storable::size_bytes).sum();
        let size = u32::try_from(size).unwrap_or(u32::MAX);
        self.size.set(Some(size));
        size
    }

    /// Note that `id` was spawned this frame with the given initial pose
    pub fn mark_spawned(&mut self, id: ObjectId, spawn: SpawnState) {
        self.spawned.push((id, spawn));
    }

    /// Note that `id` was destroyed this frame
    pub fn mark_destroyed(&mut self, id: ObjectId) {
        self.destroyed.push(id);
    }

    pub fn spawned(&self) -> &[(ObjectId, SpawnState)] {
        &self.spawned
    }

    pub fn destroyed(&self) -> &[ObjectId] {
        &self.destroyed
    }

    /// Take this frame's spawn records, leaving the set empty
    pub fn take_spawned(&mut self) -> Vec<(ObjectId, SpawnState)> {
        std::mem::take(&mut self.spawned)
    }

    /// Take this frame's destroy records, leaving the set empty
    pub fn take_destroyed(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.destroyed)
    }

    pub(crate) fn set_storable(&mut self, id: ObjectId, storable: Storable) {
        self.entries.insert(id, storable);
        self.size.set(None);
    }

    /// Seed the size cache with a value read from a stream
    pub(crate) fn set_cached_size(&mut self, size: u32) {
        self.size.set(Some(size));
    }

    pub(crate) fn drain_entries(&mut self) -> impl Iterator<Item = Storable> + '_ {
        self.size.set(None);
        self.entries.drain().map(|(_, storable)| storable)
    }
}

impl Poolable for Snapshot {
    fn reset(&mut self) {
        self.timestamp = 0.0;
        self.sequence = 0;
        self.entries.clear();
        self.size.set(None);
        self.spawned.clear();
        self.destroyed.clear();
        self.pooled = true;
    }

    fn revive(&mut self) {
        self.pooled = false;
    }

    fn is_pooled(&self) -> bool {
        self.pooled
    }
}
