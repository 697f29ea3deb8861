//! Object restoration during playback
//!
//! Brings the set of live scene objects in line with one snapshot: objects
//! absent from the snapshot are destroyed, objects present but not alive are
//! instantiated, and then parents are re-linked in a second pass so parent
//! and child may be created in the same frame in any order.

use std::fmt;

use hashbrown::HashSet;
use tracing::warn;

use crate::buffer::StateReader;
use crate::error::{BufferError, FormatError, Result};
use crate::identity::{IdentityWidth, ObjectId};
use crate::persistent::PersistentStore;

use super::{ObjectDescriptor, PrefabId, Snapshot, SpawnState, Storable};

/// The embedding application's object model, as seen by playback
pub trait ReplayScene {
    /// Identities of every object currently alive
    fn live_objects(&self) -> Vec<ObjectId>;

    /// Prefab a live object was spawned from
    ///
    /// `None` for objects the scene did not spawn (for example objects placed
    /// in the level); those are never destroyed by playback.
    fn prefab_of(&self, id: ObjectId) -> Option<PrefabId>;

    /// Check whether the scene knows how to spawn `prefab`
    fn has_prefab(&self, prefab: PrefabId) -> bool;

    /// Spawn a new object; returns false if the scene refused
    fn instantiate(&mut self, id: ObjectId, descriptor: &ObjectDescriptor, spawn: &SpawnState)
    -> bool;

    fn destroy(&mut self, id: ObjectId);

    fn set_parent(&mut self, child: ObjectId, parent: Option<ObjectId>);

    /// Apply the component payload recorded for `id`
    ///
    /// `state` is positioned just past the object descriptor.
    fn apply_state(&mut self, id: ObjectId, state: &mut StateReader<'_>)
    -> Result<(), BufferError>;
}

/// Recoverable problem found while restoring objects
///
/// Playback continues, but the scene may not match the recording exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreWarning {
    /// A live object has to go but the scene has no spawn mapping for it
    NoSpawnMapping(ObjectId),
    /// The recorded prefab is not known to the scene
    UnknownPrefab { id: ObjectId, prefab: PrefabId },
    /// No spawn record was found; the object was placed at the origin
    MissingSpawnState(ObjectId),
    /// The scene refused to instantiate the object
    InstantiateFailed(ObjectId),
    /// The recorded parent is neither alive nor created this frame
    MissingParent { child: ObjectId, parent: ObjectId },
}

impl fmt::Display for RestoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpawnMapping(id) => write!(f, "no spawn mapping for {id}, left alive"),
            Self::UnknownPrefab { id, prefab } => {
                write!(f, "unknown prefab {} for {id}, not instantiated", prefab.0)
            }
            Self::MissingSpawnState(id) => write!(f, "no spawn state for {id}, using origin"),
            Self::InstantiateFailed(id) => write!(f, "scene failed to instantiate {id}"),
            Self::MissingParent { child, parent } => {
                write!(f, "parent {parent} of {child} does not exist")
            }
        }
    }
}

/// What a restore step changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreReport {
    pub destroyed: Vec<ObjectId>,
    pub instantiated: Vec<ObjectId>,
    pub reparented: Vec<(ObjectId, ObjectId)>,
    pub warnings: Vec<RestoreWarning>,
}

impl RestoreReport {
    /// Check if the scene now mirrors the snapshot exactly
    pub fn is_accurate(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warn(&mut self, warning: RestoreWarning) {
        warn!("Replay accuracy warning: {}", warning);
        self.warnings.push(warning);
    }
}

impl Snapshot {
    /// Create and destroy scene objects so the live set matches this snapshot
    ///
    /// Call once per playback frame, before applying states. The snapshot
    /// must be decompressed.
    pub fn restore_objects<S: ReplayScene + ?Sized>(
        &self,
        scene: &mut S,
        persistent: &PersistentStore,
        width: IdentityWidth,
    ) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        let mut live: Vec<ObjectId> = scene.live_objects();
        live.sort_unstable();
        let live_set: HashSet<ObjectId> = live.iter().copied().collect();

        // Destroy objects that did not exist at this point in the recording
        for &id in &live {
            if self.contains(id) {
                continue;
            }
            if scene.prefab_of(id).is_none() {
                report.warn(RestoreWarning::NoSpawnMapping(id));
                continue;
            }
            scene.destroy(id);
            report.destroyed.push(id);
        }

        // Instantiate objects that exist in the recording but not in the scene
        let mut missing: Vec<ObjectId> = self
            .identities()
            .filter(|id| !live_set.contains(id))
            .collect();
        missing.sort_unstable();

        let mut pending_parents = Vec::new();
        for id in missing {
            let state = match self.storable(id) {
                Some(Storable::State(state)) => state,
                Some(Storable::Pointer(_)) | None => {
                    return Err(FormatError::UnresolvedPointer { identity: id }.into());
                }
            };
            let mut reader = state.reader()?;
            let descriptor = ObjectDescriptor::read_from(&mut reader, width)?;

            if !scene.has_prefab(descriptor.prefab) {
                report.warn(RestoreWarning::UnknownPrefab {
                    id,
                    prefab: descriptor.prefab,
                });
                continue;
            }

            let spawn = match persistent.spawn_state(id, self.timestamp(), width)? {
                Some(spawn) => spawn,
                None => {
                    report.warn(RestoreWarning::MissingSpawnState(id));
                    SpawnState {
                        parent: descriptor.parent,
                        observed: descriptor.observed.clone(),
                        ..Default::default()
                    }
                }
            };

            if !scene.instantiate(id, &descriptor, &spawn) {
                report.warn(RestoreWarning::InstantiateFailed(id));
                continue;
            }
            report.instantiated.push(id);

            if let Some(parent) = descriptor.parent.or(spawn.parent) {
                pending_parents.push((id, parent));
            }
        }

        // Second pass: every object of this frame exists now
        for (child, parent) in pending_parents {
            if live_set.contains(&parent) || report.instantiated.contains(&parent) {
                scene.set_parent(child, Some(parent));
                report.reparented.push((child, parent));
            } else {
                report.warn(RestoreWarning::MissingParent { child, parent });
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;
    use crate::buffer::{ByteBuffer, StateRead, StateWrite};

    #[derive(Default)]
    struct TestScene {
        live: HashMap<ObjectId, Option<PrefabId>>,
        parents: HashMap<ObjectId, ObjectId>,
        known_prefabs: Vec<PrefabId>,
        applied: Vec<(ObjectId, u32)>,
    }

    impl ReplayScene for TestScene {
        fn live_objects(&self) -> Vec<ObjectId> {
            self.live.keys().copied().collect()
        }

        fn prefab_of(&self, id: ObjectId) -> Option<PrefabId> {
            self.live.get(&id).copied().flatten()
        }

        fn has_prefab(&self, prefab: PrefabId) -> bool {
            self.known_prefabs.contains(&prefab)
        }

        fn instantiate(
            &mut self,
            id: ObjectId,
            descriptor: &ObjectDescriptor,
            _spawn: &SpawnState,
        ) -> bool {
            self.live.insert(id, Some(descriptor.prefab));
            true
        }

        fn destroy(&mut self, id: ObjectId) {
            self.live.remove(&id);
        }

        fn set_parent(&mut self, child: ObjectId, parent: Option<ObjectId>) {
            if let Some(parent) = parent {
                // Parent must already exist when linked
                assert!(self.live.contains_key(&parent));
                self.parents.insert(child, parent);
            }
        }

        fn apply_state(
            &mut self,
            id: ObjectId,
            state: &mut StateReader<'_>,
        ) -> Result<(), BufferError> {
            self.applied.push((id, state.read()?));
            Ok(())
        }
    }

    fn object_state(prefab: u32, parent: Option<u32>) -> ByteBuffer {
        let mut descriptor = ObjectDescriptor::new(PrefabId(prefab));
        descriptor.parent = parent.map(ObjectId::new);
        let mut buf = ByteBuffer::new();
        descriptor.write_to(&mut buf, IdentityWidth::U32).unwrap();
        buf.write(&0u32).unwrap();
        buf
    }

    #[test]
    fn test_restore_destroys_and_instantiates() {
        let mut scene = TestScene {
            known_prefabs: vec![PrefabId(1)],
            ..Default::default()
        };
        scene.live.insert(ObjectId::new(10), Some(PrefabId(1)));

        let mut snapshot = Snapshot::new(1.0, 1);
        snapshot.record(ObjectId::new(20), object_state(1, None));

        let report = snapshot
            .restore_objects(&mut scene, &PersistentStore::new(), IdentityWidth::U32)
            .unwrap();

        assert_eq!(report.destroyed, vec![ObjectId::new(10)]);
        assert_eq!(report.instantiated, vec![ObjectId::new(20)]);
        assert_eq!(
            report.warnings,
            vec![RestoreWarning::MissingSpawnState(ObjectId::new(20))]
        );
        assert!(scene.live.contains_key(&ObjectId::new(20)));
        assert!(!scene.live.contains_key(&ObjectId::new(10)));
    }

    #[test]
    fn test_restore_skips_objects_without_spawn_mapping() {
        let mut scene = TestScene::default();
        scene.live.insert(ObjectId::new(3), None);

        let snapshot = Snapshot::new(0.0, 1);
        let report = snapshot
            .restore_objects(&mut scene, &PersistentStore::new(), IdentityWidth::U32)
            .unwrap();

        assert!(report.destroyed.is_empty());
        assert_eq!(
            report.warnings,
            vec![RestoreWarning::NoSpawnMapping(ObjectId::new(3))]
        );
        assert!(scene.live.contains_key(&ObjectId::new(3)));
    }

    #[test]
    fn test_restore_links_parent_created_after_child() {
        let mut scene = TestScene {
            known_prefabs: vec![PrefabId(1)],
            ..Default::default()
        };
        let mut persistent = PersistentStore::new();
        persistent
            .insert_spawn(ObjectId::new(1), 0.0, &SpawnState::default(), IdentityWidth::U32)
            .unwrap();
        persistent
            .insert_spawn(ObjectId::new(9), 0.0, &SpawnState::default(), IdentityWidth::U32)
            .unwrap();

        // Child has the lower identity, so it is instantiated first
        let mut snapshot = Snapshot::new(0.0, 1);
        snapshot.record(ObjectId::new(1), object_state(1, Some(9)));
        snapshot.record(ObjectId::new(9), object_state(1, None));

        let report = snapshot
            .restore_objects(&mut scene, &persistent, IdentityWidth::U32)
            .unwrap();

        assert!(report.is_accurate());
        assert_eq!(report.reparented, vec![(ObjectId::new(1), ObjectId::new(9))]);
        assert_eq!(scene.parents.get(&ObjectId::new(1)), Some(&ObjectId::new(9)));
    }

    #[test]
    fn test_restore_warns_on_unknown_prefab() {
        let mut scene = TestScene::default();
        let mut snapshot = Snapshot::new(0.0, 1);
        snapshot.record(ObjectId::new(4), object_state(77, None));

        let report = snapshot
            .restore_objects(&mut scene, &PersistentStore::new(), IdentityWidth::U32)
            .unwrap();

        assert!(report.instantiated.is_empty());
        assert_eq!(
            report.warnings,
            vec![RestoreWarning::UnknownPrefab {
                id: ObjectId::new(4),
                prefab: PrefabId(77)
            }]
        );
    }

    #[test]
    fn test_restore_rejects_unresolved_pointer() {
        let mut scene = TestScene::default();
        let mut snapshot = Snapshot::new(0.0, 2);
        snapshot.set_storable(ObjectId::new(4), Storable::Pointer(0));

        let err = snapshot
            .restore_objects(&mut scene, &PersistentStore::new(), IdentityWidth::U32)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::StorageError::Format(FormatError::UnresolvedPointer { .. })
        ));
    }
}
