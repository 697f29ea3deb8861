//! Recorder
//!
//! Captures the observed objects at a fixed rate into stream storage.

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use crate::buffer::ByteBuffer;
use crate::config::RecorderConfig;
use crate::error::{BufferError, Result};
use crate::identity::ObjectId;
use crate::snapshot::{ObjectDescriptor, SpawnState};
use crate::storage::{CommitSummary, StreamStorage, StreamTarget};

use super::RECORDER_LOCK;

/// An object whose state is captured every frame
pub trait Recordable {
    fn identity(&self) -> ObjectId;

    /// Descriptor written at the start of every recorded state
    fn descriptor(&self) -> ObjectDescriptor;

    /// Pose used to recreate the object, kept once per spawn
    fn spawn_state(&self) -> SpawnState;

    /// Append the component payload after the descriptor
    fn record_state(&self, state: &mut ByteBuffer) -> Result<(), BufferError>;
}

/// Recording session over a stream storage
///
/// Dropping an unfinished recorder discards the recording.
pub struct Recorder<'a, S: StreamTarget> {
    storage: &'a mut StreamStorage<S>,
    config: RecorderConfig,
    /// Seconds since the recording started (excluding paused time)
    elapsed: f32,
    since_capture: f32,
    sequence: u32,
    /// Identities captured in the previous snapshot
    previous: HashSet<ObjectId>,
    paused: bool,
    finished: bool,
}

impl<'a, S: StreamTarget> Recorder<'a, S> {
    /// Claim `storage` and start a new recording
    pub fn start(storage: &'a mut StreamStorage<S>, config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        storage.lock(RECORDER_LOCK)?;
        if let Err(e) = storage.prepare_write() {
            storage.unlock();
            return Err(e);
        }
        if storage.metadata().recorded_at.is_none() {
            storage.metadata_mut().stamp_now();
        }
        info!(rate = config.record_rate, "recording started");
        Ok(Self {
            storage,
            config,
            elapsed: 0.0,
            since_capture: 0.0,
            sequence: 0,
            previous: HashSet::new(),
            paused: false,
            finished: false,
        })
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_recording(&self) -> bool {
        !self.paused && !self.finished
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Recording time of the next capture
    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    /// Number of snapshots captured so far
    pub fn frame_count(&self) -> u32 {
        self.sequence
    }

    /// Access the underlying storage (e.g. to fill in metadata)
    pub fn storage(&mut self) -> &mut StreamStorage<S> {
        self.storage
    }

    /// Advance the recording clock and capture if a snapshot is due
    ///
    /// The first update always captures. Returns true if a snapshot was
    /// stored.
    pub fn update(&mut self, delta: f32, objects: &[&dyn Recordable]) -> Result<bool> {
        if !self.is_recording() {
            return Ok(false);
        }
        let interval = self.config.interval();
        if self.sequence > 0 {
            self.elapsed += delta;
            self.since_capture += delta;
            if self.since_capture < interval {
                return Ok(false);
            }
            // Keep the cadence but never queue more than one capture
            self.since_capture %= interval;
        }
        self.capture(objects)?;
        Ok(true)
    }

    /// Capture one snapshot right now
    ///
    /// Objects that were not part of the previous capture are recorded as
    /// spawned; objects that disappeared are recorded as destroyed. Returns
    /// the sequence id of the stored snapshot.
    pub fn capture(&mut self, objects: &[&dyn Recordable]) -> Result<u32> {
        let sequence = self.sequence + 1;
        let width = self.storage.identity_width();
        let mut snapshot = self.storage.acquire_snapshot(self.elapsed, sequence);
        let mut current = HashSet::with_capacity(objects.len());

        for object in objects {
            let id = object.identity();
            if !current.insert(id) {
                warn!(%id, "object captured twice in one frame, keeping the first");
                continue;
            }
            let mut state = self.storage.pools_mut().acquire_buffer();
            object.descriptor().write_to(&mut state, width)?;
            object.record_state(&mut state)?;
            if let Some(rejected) = snapshot.record(id, state) {
                self.storage.pools_mut().release_buffer(rejected);
            }
            if !self.previous.contains(&id) {
                snapshot.mark_spawned(id, object.spawn_state());
            }
        }
        for &id in self.previous.difference(&current) {
            snapshot.mark_destroyed(id);
        }

        self.storage.store_snapshot(snapshot)?;
        self.sequence = sequence;
        self.previous = current;
        Ok(sequence)
    }

    /// Commit the recording and release the storage
    pub fn finish(mut self) -> Result<CommitSummary> {
        self.finished = true;
        let result = self.storage.commit();
        self.storage.unlock();
        let summary = result?;
        info!(
            snapshots = summary.header.snapshot_count,
            segments = summary.table.len(),
            duration = summary.header.duration,
            "recording finished"
        );
        Ok(summary)
    }

    /// Throw the recording away and release the storage
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        self.finished = true;
        let cancelled = self.storage.discard();
        self.storage.unlock();
        debug!(cancelled, frames = self.sequence, "recording discarded");
    }
}

impl<S: StreamTarget> Drop for Recorder<'_, S> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("recorder dropped without finish, discarding recording");
            self.discard();
        }
    }
}
