//! Record a scene through a recorder, then replay it into a fresh scene

use glam::{Quat, Vec3};
use hashbrown::HashMap;
use nether_reel::{
    BufferError, ByteBuffer, ObjectDescriptor, ObjectId, PlaybackConfig, Playback, PrefabId,
    Recordable, RecorderConfig, Recorder, ReplayScene, RestoreWarning, SpawnState, StateRead,
    StateReader, StateWrite, StorageConfig, StreamStorage,
};

const CRATE: PrefabId = PrefabId(1);
const LID: PrefabId = PrefabId(2);

struct Body {
    id: ObjectId,
    prefab: PrefabId,
    parent: Option<ObjectId>,
    position: Vec3,
}

impl Recordable for Body {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn descriptor(&self) -> ObjectDescriptor {
        let descriptor = ObjectDescriptor::new(self.prefab);
        match self.parent {
            Some(parent) => descriptor.with_parent(parent),
            None => descriptor,
        }
    }

    fn spawn_state(&self) -> SpawnState {
        SpawnState {
            parent: self.parent,
            ..SpawnState::at(self.position, Quat::IDENTITY)
        }
    }

    fn record_state(&self, state: &mut ByteBuffer) -> Result<(), BufferError> {
        state.write(&self.position)
    }
}

#[derive(Default)]
struct World {
    positions: HashMap<ObjectId, Vec3>,
    parents: HashMap<ObjectId, ObjectId>,
    known: Vec<PrefabId>,
}

impl World {
    fn knowing(known: &[PrefabId]) -> Self {
        Self {
            known: known.to_vec(),
            ..Default::default()
        }
    }
}

impl ReplayScene for World {
    fn live_objects(&self) -> Vec<ObjectId> {
        self.positions.keys().copied().collect()
    }

    fn prefab_of(&self, _id: ObjectId) -> Option<PrefabId> {
        Some(CRATE)
    }

    fn has_prefab(&self, prefab: PrefabId) -> bool {
        self.known.contains(&prefab)
    }

    fn instantiate(&mut self, id: ObjectId, _descriptor: &ObjectDescriptor, spawn: &SpawnState) -> bool {
        self.positions.insert(id, spawn.position);
        true
    }

    fn destroy(&mut self, id: ObjectId) {
        self.positions.remove(&id);
        self.parents.remove(&id);
    }

    fn set_parent(&mut self, child: ObjectId, parent: Option<ObjectId>) {
        match parent {
            Some(parent) => self.parents.insert(child, parent),
            None => self.parents.remove(&child),
        };
    }

    fn apply_state(&mut self, id: ObjectId, state: &mut StateReader<'_>) -> Result<(), BufferError> {
        let position: Vec3 = state.read()?;
        self.positions.insert(id, position);
        Ok(())
    }
}

/// Crate falls for 2s at 10Hz; a lid attached to it appears at t=1.0
fn record(storage: &mut StreamStorage<std::io::Cursor<Vec<u8>>>) {
    let mut recorder = Recorder::start(storage, RecorderConfig { record_rate: 10.0 }).unwrap();
    let mut body = Body {
        id: ObjectId::new(1),
        prefab: CRATE,
        parent: None,
        position: Vec3::new(0.0, 10.0, 0.0),
    };
    let mut lid = Body {
        id: ObjectId::new(2),
        prefab: LID,
        parent: Some(ObjectId::new(1)),
        position: Vec3::ZERO,
    };

    for frame in 0..=20 {
        let time = frame as f32 * 0.1;
        body.position.y = 10.0 - time;
        lid.position = body.position + Vec3::Y;
        let objects: Vec<&dyn Recordable> = if time >= 0.95 {
            vec![&body, &lid]
        } else {
            vec![&body]
        };
        recorder.update(if frame == 0 { 0.0 } else { 0.1 }, &objects).unwrap();
    }
    let summary = recorder.finish().unwrap();
    assert_eq!(summary.header.snapshot_count, 21);
}

fn storage() -> StreamStorage<std::io::Cursor<Vec<u8>>> {
    StreamStorage::in_memory(StorageConfig {
        segment_capacity: 8,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn test_replay_recreates_scene() {
    let mut storage = storage();
    record(&mut storage);

    let mut world = World::knowing(&[CRATE, LID]);
    let mut playback = Playback::start(&mut storage, PlaybackConfig::default()).unwrap();

    let frame = playback.seek(0.0, &mut world).unwrap().unwrap();
    assert_eq!(frame.current_sequence, 1);
    assert_eq!(frame.report.instantiated, vec![ObjectId::new(1)]);
    assert_eq!(world.positions.len(), 1);

    let frame = playback.seek(1.55, &mut world).unwrap().unwrap();
    assert_eq!(frame.report.instantiated, vec![ObjectId::new(2)]);
    assert!(frame.report.is_accurate());
    assert_eq!(world.parents.get(&ObjectId::new(2)), Some(&ObjectId::new(1)));
    let body = world.positions[&ObjectId::new(1)];
    assert!((body.y - (10.0 - frame.current_time)).abs() < 1e-3);
    assert!(frame.t > 0.0 && frame.t < 1.0);

    // Going back before the lid existed removes it again
    let frame = playback.seek(0.5, &mut world).unwrap().unwrap();
    assert_eq!(frame.report.destroyed, vec![ObjectId::new(2)]);
    assert_eq!(world.positions.len(), 1);
}

#[test]
fn test_unknown_prefab_is_a_warning() {
    let mut storage = storage();
    record(&mut storage);

    let mut world = World::knowing(&[CRATE]);
    let mut playback = Playback::start(&mut storage, PlaybackConfig::default()).unwrap();
    let frame = playback.seek(2.0, &mut world).unwrap().unwrap();

    assert!(!frame.report.is_accurate());
    assert!(frame.report.warnings.contains(&RestoreWarning::UnknownPrefab {
        id: ObjectId::new(2),
        prefab: LID,
    }));
    assert_eq!(world.positions.len(), 1);
}

#[test]
fn test_playback_runs_to_end() {
    let mut storage = storage();
    record(&mut storage);

    let mut world = World::knowing(&[CRATE, LID]);
    let mut playback = Playback::start(&mut storage, PlaybackConfig::default()).unwrap();
    let mut frames = 0;
    while let Some(frame) = playback.advance(0.25, &mut world).unwrap() {
        frames += 1;
        assert!(frame.time <= 2.0 + 1e-4);
    }
    assert!(playback.is_complete());
    assert!(frames >= 8);
    assert_eq!(world.positions.len(), 2);
}

#[test]
fn test_sessions_are_exclusive() {
    let mut storage = storage();
    record(&mut storage);
    storage.lock("editor").unwrap();
    assert!(Playback::start(&mut storage, PlaybackConfig::default()).is_err());
    storage.unlock();
    assert!(Playback::start(&mut storage, PlaybackConfig::default()).is_ok());
}
