//! Replay playback
//!
//! Moves a playhead over a committed stream and brings the scene in line
//! with the snapshot under it.

use hashbrown::HashSet;
use tracing::{debug, info};

use crate::config::{PlaybackConfig, PlaybackDirection};
use crate::error::{FormatError, Result, StorageError};
use crate::identity::ObjectId;
use crate::snapshot::{ObjectDescriptor, ReplayScene, RestoreReport, Storable};
use crate::storage::{StorageMode, StreamStorage, StreamTarget};

use super::PLAYBACK_LOCK;

/// Result of one playback step
///
/// `current` is the snapshot at or before the playhead and `next` the one
/// after it; `t` interpolates between their timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFrame {
    /// Playhead position in seconds
    pub time: f32,
    pub current_sequence: u32,
    pub current_time: f32,
    pub next_sequence: Option<u32>,
    pub next_time: Option<f32>,
    /// Blend factor between current and next (0.0 to 1.0)
    pub t: f32,
    /// Objects created or destroyed to match the current snapshot
    pub report: RestoreReport,
}

/// Playback session over a stream storage
pub struct Playback<'a, S: StreamTarget> {
    storage: &'a mut StreamStorage<S>,
    config: PlaybackConfig,
    time: f32,
    playing: bool,
    paused: bool,
    /// The playhead hit the end it was moving towards
    complete: bool,
}

impl<'a, S: StreamTarget> Playback<'a, S> {
    /// Claim `storage` and load its index if it is not in read mode yet
    pub fn start(storage: &'a mut StreamStorage<S>, config: PlaybackConfig) -> Result<Self> {
        config.validate()?;
        storage.lock(PLAYBACK_LOCK)?;
        if storage.mode() != StorageMode::Read
            && let Err(e) = storage.prepare_read()
        {
            storage.unlock();
            return Err(e);
        }
        info!(
            duration = storage.duration(),
            snapshots = storage.snapshot_count(),
            "playback started"
        );
        let mut playback = Self {
            storage,
            config,
            time: 0.0,
            playing: true,
            paused: false,
            complete: false,
        };
        playback.time = playback.origin();
        Ok(playback)
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Stop playback and rewind to the starting end
    pub fn stop(&mut self) {
        self.playing = false;
        self.paused = false;
        self.complete = false;
        self.time = self.origin();
    }

    /// Restart after [`stop`](Self::stop) or completion
    pub fn play(&mut self) {
        if self.complete {
            self.time = self.origin();
            self.complete = false;
        }
        self.playing = true;
        self.paused = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing && !self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.config.speed = speed.max(0.0);
    }

    pub fn set_direction(&mut self, direction: PlaybackDirection) {
        self.config.direction = direction;
        self.complete = false;
    }

    /// Playhead position in seconds
    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn start_time(&self) -> f32 {
        self.storage.table().first().map_or(0.0, |e| e.start_time)
    }

    pub fn end_time(&self) -> f32 {
        self.storage.duration()
    }

    /// Playhead position (0.0 to 1.0)
    pub fn progress(&self) -> f32 {
        let span = self.end_time() - self.start_time();
        if span <= 0.0 {
            return 0.0;
        }
        ((self.time - self.start_time()) / span).clamp(0.0, 1.0)
    }

    pub fn storage(&self) -> &StreamStorage<S> {
        self.storage
    }

    /// Move the playhead by `delta` seconds of wall time and apply the frame
    ///
    /// Returns `None` while stopped, or once the playhead has reached the end
    /// of a non-looping playback. The frame at the very end is returned once.
    pub fn advance<R: ReplayScene + ?Sized>(
        &mut self,
        delta: f32,
        scene: &mut R,
    ) -> Result<Option<PlaybackFrame>> {
        if !self.playing || self.complete {
            return Ok(None);
        }
        if !self.paused {
            let step = delta * self.config.speed;
            let target = match self.config.direction {
                PlaybackDirection::Forward => self.time + step,
                PlaybackDirection::Backward => self.time - step,
            };
            self.time = self.wrap(target);
        }
        self.render(scene)
    }

    /// Jump to `time` (clamped to the recording) and apply that frame
    pub fn seek<R: ReplayScene + ?Sized>(
        &mut self,
        time: f32,
        scene: &mut R,
    ) -> Result<Option<PlaybackFrame>> {
        self.time = time.clamp(self.start_time(), self.end_time());
        self.complete = false;
        self.render(scene)
    }

    /// Jump to the snapshot with this sequence id and apply it
    pub fn seek_sequence<R: ReplayScene + ?Sized>(
        &mut self,
        sequence: u32,
        scene: &mut R,
    ) -> Result<Option<PlaybackFrame>> {
        let time = match self.storage.fetch_pair_by_sequence(sequence)? {
            Some(pair) => pair.current.timestamp(),
            None => return Ok(None),
        };
        self.time = time;
        self.complete = false;
        self.apply(sequence, scene).map(Some)
    }

    /// Position the playhead according to direction and loop settings
    fn wrap(&mut self, target: f32) -> f32 {
        let (start, end) = (self.start_time(), self.end_time());
        let span = end - start;
        if (start..=end).contains(&target) {
            return target;
        }
        if self.config.loop_playback && span > 0.0 {
            return start + (target - start).rem_euclid(span);
        }
        self.complete = true;
        target.clamp(start, end)
    }

    fn origin(&self) -> f32 {
        match self.config.direction {
            PlaybackDirection::Forward => self.start_time(),
            PlaybackDirection::Backward => self.end_time(),
        }
    }

    fn render<R: ReplayScene + ?Sized>(&mut self, scene: &mut R) -> Result<Option<PlaybackFrame>> {
        let sequence = match self.storage.fetch_pair_by_time(self.time)? {
            Some(pair) => pair.current.sequence(),
            None => return Ok(None),
        };
        self.apply(sequence, scene).map(Some)
    }

    /// Restore objects and states for a snapshot whose segments are loaded
    fn apply<R: ReplayScene + ?Sized>(
        &mut self,
        sequence: u32,
        scene: &mut R,
    ) -> Result<PlaybackFrame> {
        let storage: &StreamStorage<S> = self.storage;
        let width = storage.identity_width();
        let pair = storage
            .cached_pair(sequence)
            .ok_or(StorageError::Disposed("segment"))?;
        let current = pair.current;

        let report = current.restore_objects(scene, storage.persistent(), width)?;

        let live: HashSet<ObjectId> = scene.live_objects().into_iter().collect();
        let mut applied = 0usize;
        for (id, storable) in current.entries() {
            if !live.contains(&id) {
                continue;
            }
            let state = match storable {
                Storable::State(state) => state,
                Storable::Pointer(_) => {
                    return Err(FormatError::UnresolvedPointer { identity: id }.into());
                }
            };
            let mut reader = state.reader()?;
            ObjectDescriptor::read_from(&mut reader, width)?;
            scene.apply_state(id, &mut reader)?;
            applied += 1;
        }

        let next = pair.next;
        let t = match next {
            Some(next) if next.timestamp() > current.timestamp() => ((self.time
                - current.timestamp())
                / (next.timestamp() - current.timestamp()))
            .clamp(0.0, 1.0),
            _ => 0.0,
        };
        debug!(sequence, applied, t, "playback frame");

        Ok(PlaybackFrame {
            time: self.time,
            current_sequence: current.sequence(),
            current_time: current.timestamp(),
            next_sequence: next.map(|s| s.sequence()),
            next_time: next.map(|s| s.timestamp()),
            t,
            report,
        })
    }
}

impl<S: StreamTarget> Drop for Playback<'_, S> {
    fn drop(&mut self) {
        self.storage.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use hashbrown::HashMap;

    use super::*;
    use crate::buffer::{ByteBuffer, StateRead, StateReader, StateWrite};
    use crate::config::StorageConfig;
    use crate::error::BufferError;
    use crate::snapshot::{PrefabId, SpawnState};

    #[derive(Default)]
    struct Scene {
        heights: HashMap<ObjectId, f32>,
    }

    impl ReplayScene for Scene {
        fn live_objects(&self) -> Vec<ObjectId> {
            self.heights.keys().copied().collect()
        }

        fn prefab_of(&self, _id: ObjectId) -> Option<PrefabId> {
            Some(PrefabId(1))
        }

        fn has_prefab(&self, prefab: PrefabId) -> bool {
            prefab == PrefabId(1)
        }

        fn instantiate(
            &mut self,
            id: ObjectId,
            _descriptor: &ObjectDescriptor,
            spawn: &SpawnState,
        ) -> bool {
            self.heights.insert(id, spawn.position.y);
            true
        }

        fn destroy(&mut self, id: ObjectId) {
            self.heights.remove(&id);
        }

        fn set_parent(&mut self, _child: ObjectId, _parent: Option<ObjectId>) {}

        fn apply_state(
            &mut self,
            id: ObjectId,
            state: &mut StateReader<'_>,
        ) -> Result<(), BufferError> {
            let height = state.read::<f32>()?;
            self.heights.insert(id, height);
            Ok(())
        }
    }

    /// Ten snapshots at 1s intervals; object 2 lives from t=3 to t=6
    fn recorded() -> StreamStorage<Cursor<Vec<u8>>> {
        let mut storage = StreamStorage::in_memory(StorageConfig {
            segment_capacity: 4,
            ..Default::default()
        })
        .unwrap();
        storage.prepare_write().unwrap();
        let width = storage.identity_width();
        for seq in 1..=10u32 {
            let time = (seq - 1) as f32;
            let mut snapshot = storage.acquire_snapshot(time, seq);
            let mut ids = vec![1];
            if (3.0..=6.0).contains(&time) {
                ids.push(2);
            }
            for id in ids {
                let mut state = ByteBuffer::new();
                ObjectDescriptor::new(PrefabId(1))
                    .write_to(&mut state, width)
                    .unwrap();
                state.write(&(time * id as f32)).unwrap();
                snapshot.record(ObjectId::new(id), state);
                if seq == 1 || (id == 2 && time == 3.0) {
                    snapshot.mark_spawned(ObjectId::new(id), SpawnState::default());
                }
            }
            storage.store_snapshot(snapshot).unwrap();
        }
        storage.commit().unwrap();
        storage
    }

    fn config() -> PlaybackConfig {
        PlaybackConfig::default()
    }

    #[test]
    fn test_playback_basic() {
        let mut storage = recorded();
        let mut scene = Scene::default();
        let mut playback = Playback::start(&mut storage, config()).unwrap();
        assert!(playback.is_playing());
        assert_eq!(playback.end_time(), 9.0);

        let frame = playback.advance(1.5, &mut scene).unwrap().unwrap();
        assert_eq!(frame.current_sequence, 2);
        assert_eq!(frame.next_sequence, Some(3));
        assert!((frame.t - 0.5).abs() < 1e-6);
        assert_eq!(scene.heights[&ObjectId::new(1)], 1.0);
    }

    #[test]
    fn test_objects_follow_recording() {
        let mut storage = recorded();
        let mut scene = Scene::default();
        let mut playback = Playback::start(&mut storage, config()).unwrap();

        let frame = playback.seek(4.0, &mut scene).unwrap().unwrap();
        assert_eq!(frame.report.instantiated.len(), 2);
        assert_eq!(scene.heights[&ObjectId::new(2)], 8.0);

        let frame = playback.seek(8.0, &mut scene).unwrap().unwrap();
        assert_eq!(frame.report.destroyed, vec![ObjectId::new(2)]);
        assert!(!scene.heights.contains_key(&ObjectId::new(2)));
    }

    #[test]
    fn test_playback_completes() {
        let mut storage = recorded();
        let mut scene = Scene::default();
        let mut playback = Playback::start(&mut storage, config()).unwrap();

        let frame = playback.advance(20.0, &mut scene).unwrap().unwrap();
        assert_eq!(frame.current_sequence, 10);
        assert!(frame.next_sequence.is_none());
        assert!(playback.is_complete());
        assert!(playback.advance(1.0, &mut scene).unwrap().is_none());

        playback.play();
        assert_eq!(playback.time(), 0.0);
    }

    #[test]
    fn test_loop_wraps() {
        let mut storage = recorded();
        let mut scene = Scene::default();
        let config = PlaybackConfig {
            loop_playback: true,
            ..config()
        };
        let mut playback = Playback::start(&mut storage, config).unwrap();
        let frame = playback.advance(11.0, &mut scene).unwrap().unwrap();
        assert_eq!(frame.time, 2.0);
        assert_eq!(frame.current_sequence, 3);
        assert!(!playback.is_complete());
    }

    #[test]
    fn test_backward_playback() {
        let mut storage = recorded();
        let mut scene = Scene::default();
        let config = PlaybackConfig {
            direction: PlaybackDirection::Backward,
            speed: 2.0,
            ..config()
        };
        let mut playback = Playback::start(&mut storage, config).unwrap();
        assert_eq!(playback.time(), 9.0);
        let frame = playback.advance(1.0, &mut scene).unwrap().unwrap();
        assert_eq!(frame.time, 7.0);
        assert_eq!(frame.current_sequence, 8);
    }

    #[test]
    fn test_change_speed_and_direction() {
        let mut storage = recorded();
        let mut scene = Scene::default();
        let mut playback = Playback::start(&mut storage, config()).unwrap();
        playback.advance(4.0, &mut scene).unwrap().unwrap();

        playback.set_direction(PlaybackDirection::Backward);
        playback.set_speed(0.5);
        let frame = playback.advance(2.0, &mut scene).unwrap().unwrap();
        assert_eq!(frame.time, 3.0);
        assert_eq!(frame.current_sequence, 4);

        playback.pause();
        assert!(playback.is_paused());
        let frame = playback.advance(2.0, &mut scene).unwrap().unwrap();
        assert_eq!(frame.time, 3.0);
    }

    #[test]
    fn test_seek_sequence() {
        let mut storage = recorded();
        let mut scene = Scene::default();
        let mut playback = Playback::start(&mut storage, config()).unwrap();
        let frame = playback.seek_sequence(5, &mut scene).unwrap().unwrap();
        assert_eq!(frame.time, 4.0);
        assert_eq!(frame.next_sequence, Some(6));
        assert!(playback.seek_sequence(42, &mut scene).unwrap().is_none());
    }

    #[test]
    fn test_playback_releases_lock() {
        let mut storage = recorded();
        {
            let _playback = Playback::start(&mut storage, config()).unwrap();
        }
        assert!(!storage.is_locked());
        // Still in read mode, so a second session skips reloading the index
        assert_eq!(storage.mode(), StorageMode::Read);
        let playback = Playback::start(&mut storage, config()).unwrap();
        assert_eq!(playback.storage().snapshot_count(), 10);
    }
}
