//! Stream storage
//!
//! [`StreamStorage`] owns the backing stream through its worker thread and
//! moves between modes:
//!
//! - **Write**: snapshots accumulate into the open segment; sealed segments
//!   are handed to the worker, which compresses and appends them.
//! - **Read**: header, segment table, persistent and metadata blocks are
//!   loaded up front; segments are loaded on demand and cached.
//! - **Idle**: after commit or discard, ready to be prepared again.
//!
//! The producer thread never touches the stream directly. Writes are
//! fire-and-forget; reads and commit wait for their own job only.

mod cache;
mod operation;
mod worker;

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use tracing::{debug, info, warn};

pub use cache::SegmentCache;
pub use operation::{Completer, Operation, operation};
pub use worker::{CommitSummary, StreamIndex};

use self::worker::{Job, WorkerHandle};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::format::{SegmentEntry, SegmentTable, StreamHeader};
use crate::identity::IdentityWidth;
use crate::metadata::StreamMetadata;
use crate::persistent::PersistentStore;
use crate::pool::PoolRegistry;
use crate::segment::Segment;
use crate::snapshot::Snapshot;

/// A seekable byte stream the worker can own
pub trait StreamTarget: Read + Write + Seek + Send + 'static {}

impl<T: Read + Write + Seek + Send + 'static> StreamTarget for T {}

/// Current storage mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    #[default]
    Idle,
    Write,
    Read,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Write => "write",
            Self::Read => "read",
        })
    }
}

/// Transition requested through [`StreamStorage::prepare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAction {
    Write,
    Read,
    Discard,
    Commit,
}

/// Current and following snapshot around a playhead
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPair<'a> {
    pub current: &'a Snapshot,
    /// `None` at the end of the stream
    pub next: Option<&'a Snapshot>,
}

/// Segmented snapshot storage over a seekable stream
pub struct StreamStorage<S: StreamTarget> {
    config: StorageConfig,
    mode: StorageMode,
    worker: WorkerHandle<S>,
    /// Producer-side pools; the worker keeps its own
    pools: PoolRegistry,
    header: StreamHeader,
    table: SegmentTable,
    persistent: PersistentStore,
    metadata: StreamMetadata,
    /// Segment currently receiving snapshots (write mode)
    active: Option<Segment>,
    next_segment_id: u32,
    last_sequence: Option<u32>,
    /// Decompressed segments (read mode)
    cache: SegmentCache,
    lock_owner: Option<String>,
}

impl<S: StreamTarget> fmt::Debug for StreamStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamStorage")
            .field("mode", &self.mode)
            .field("header", &self.header)
            .field("segments", &self.table.len())
            .field("cached", &self.cache.len())
            .field("lock_owner", &self.lock_owner)
            .finish()
    }
}

impl StreamStorage<File> {
    /// Create (or truncate) a file for recording
    pub fn create(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Self::new(file, config)
    }

    /// Open an existing file for playback
    ///
    /// The storage starts idle; call [`prepare_read`](Self::prepare_read).
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let file = File::options().read(true).open(path.as_ref())?;
        Self::new(file, config)
    }
}

impl StreamStorage<Cursor<Vec<u8>>> {
    /// Storage over an in-memory buffer
    pub fn in_memory(config: StorageConfig) -> Result<Self> {
        Self::new(Cursor::new(Vec::new()), config)
    }
}

impl<S: StreamTarget> StreamStorage<S> {
    /// Wrap `stream`, moving it onto a new worker thread
    pub fn new(stream: S, config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let worker = WorkerHandle::spawn(stream, &config)?;
        // A snapshot pair can straddle a segment boundary, so keep at least two
        let cache_limit = match config.max_cached_segments {
            0 => 0,
            n => n.max(2),
        };
        Ok(Self {
            pools: PoolRegistry::new(config.pool_retain),
            header: StreamHeader::new(config.identity_width),
            table: SegmentTable::new(),
            persistent: PersistentStore::new(),
            metadata: StreamMetadata::default(),
            active: None,
            next_segment_id: 0,
            last_sequence: None,
            cache: SegmentCache::new(cache_limit),
            lock_owner: None,
            mode: StorageMode::Idle,
            worker,
            config,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    // --- Session lock ---

    /// Claim the storage for a record or playback session
    pub fn lock(&mut self, owner: &str) -> Result<()> {
        if let Some(current) = &self.lock_owner {
            return Err(StorageError::Locked {
                owner: current.clone(),
            });
        }
        self.lock_owner = Some(owner.to_string());
        Ok(())
    }

    pub fn unlock(&mut self) {
        self.lock_owner = None;
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    pub fn lock_owner(&self) -> Option<&str> {
        self.lock_owner.as_deref()
    }

    // --- Mode transitions ---

    /// Apply a mode transition
    pub fn prepare(&mut self, action: StorageAction) -> Result<()> {
        match action {
            StorageAction::Write => self.prepare_write(),
            StorageAction::Read => self.prepare_read(),
            StorageAction::Discard => {
                self.discard();
                Ok(())
            }
            StorageAction::Commit => self.commit().map(|_| ()),
        }
    }

    /// Start a new recording, overwriting the stream from offset 0
    pub fn prepare_write(&mut self) -> Result<()> {
        self.expect_mode(StorageMode::Idle)?;
        self.reset_index();
        self.header = StreamHeader::new(self.config.identity_width);
        self.worker.submit(Job::BeginWrite(self.header.clone()))?;
        self.reclaim();
        self.active = Some(
            self.pools
                .acquire_segment(0, self.config.segment_capacity),
        );
        self.next_segment_id = 1;
        self.mode = StorageMode::Write;
        info!(
            capacity = self.config.segment_capacity,
            width = self.config.identity_width.bytes(),
            "storage prepared for writing"
        );
        Ok(())
    }

    /// Load the stream index, blocking until it is available
    pub fn prepare_read(&mut self) -> Result<()> {
        self.expect_mode(StorageMode::Idle)?;
        self.reset_index();
        let (op, done) = operation();
        self.worker.submit(Job::ReadIndex(done))?;
        let index = op.wait()?;

        self.header = index.header;
        self.table = index.table;
        self.persistent = index.persistent;
        self.metadata = index.metadata;
        self.mode = StorageMode::Read;
        info!(
            segments = self.table.len(),
            snapshots = self.header.snapshot_count,
            duration = self.header.duration,
            "storage prepared for reading"
        );
        Ok(())
    }

    /// Flush the open segment and finalize the stream
    ///
    /// Blocks until every queued write has reached the stream.
    pub fn commit(&mut self) -> Result<CommitSummary> {
        self.expect_mode(StorageMode::Write)?;
        if let Some(segment) = self.active.take() {
            if segment.is_empty() {
                self.pools.release_segment(segment);
            } else {
                self.worker.submit(Job::WriteSegment(segment))?;
            }
        }

        let (op, done) = operation();
        self.worker.submit(Job::Commit {
            header: self.header.clone(),
            persistent: self.persistent.clone(),
            metadata: self.metadata.clone(),
            done,
        })?;
        self.mode = StorageMode::Idle;
        let summary = op.wait()?;

        self.header = summary.header.clone();
        self.table = summary.table.clone();
        Ok(summary)
    }

    /// Drop all queued work and in-memory state
    ///
    /// Returns the number of queued jobs that were cancelled.
    pub fn discard(&mut self) -> usize {
        let cancelled = self.worker.cancel_pending();
        self.reset_index();
        self.header = StreamHeader::new(self.config.identity_width);
        self.metadata = StreamMetadata::default();
        self.mode = StorageMode::Idle;
        info!(cancelled, "storage discarded");
        cancelled
    }

    // --- Recording ---

    /// Append a snapshot to the open segment
    ///
    /// Spawn events on the snapshot move into the persistent store. When the
    /// segment fills up it is handed to the worker and a new one is opened.
    pub fn store_snapshot(&mut self, mut snapshot: Snapshot) -> Result<()> {
        self.expect_mode(StorageMode::Write)?;
        if let Some(previous) = self.last_sequence
            && snapshot.sequence() <= previous
        {
            return Err(StorageError::OutOfOrder {
                previous,
                found: snapshot.sequence(),
            });
        }

        let timestamp = snapshot.timestamp();
        for (id, spawn) in snapshot.take_spawned() {
            self.persistent
                .insert_spawn(id, timestamp, &spawn, self.header.identity_width)?;
        }
        snapshot.take_destroyed();

        let size = snapshot.size_bytes();
        let sequence = snapshot.sequence();
        let segment = self.active.as_mut().ok_or(StorageError::NotReady {
            expected: StorageMode::Write,
            actual: self.mode,
        })?;
        segment.add_snapshot(snapshot)?;

        self.header.duration = timestamp;
        self.header.memory_size += size as u64;
        self.header.snapshot_count += 1;
        self.last_sequence = Some(sequence);

        if segment.is_full() {
            self.flush_active()?;
        }
        Ok(())
    }

    /// Get an empty snapshot from the producer's pool
    ///
    /// Picks up instances the worker has freed since the last call.
    pub fn acquire_snapshot(&mut self, timestamp: f32, sequence: u32) -> Snapshot {
        self.reclaim();
        self.pools.acquire_snapshot(timestamp, sequence)
    }

    /// Restock the producer's pools from what the worker has handed back
    fn reclaim(&mut self) {
        let recycled = self.worker.reclaim();
        if !recycled.is_empty() {
            self.pools.restock(recycled);
        }
    }

    /// Hand the open segment to the worker and open the next one
    fn flush_active(&mut self) -> Result<()> {
        let Some(segment) = self.active.take() else {
            return Ok(());
        };
        debug!(segment = segment.id(), snapshots = segment.len(), "handing off segment");
        self.worker.submit(Job::WriteSegment(segment))?;
        self.reclaim();
        self.active = Some(
            self.pools
                .acquire_segment(self.next_segment_id, self.config.segment_capacity),
        );
        self.next_segment_id += 1;
        Ok(())
    }

    // --- Playback ---

    /// Snapshot with exactly this sequence id
    pub fn fetch_by_sequence(&mut self, sequence: u32) -> Result<Option<&Snapshot>> {
        self.expect_mode(StorageMode::Read)?;
        let Some(entry) = self.table.find_by_sequence(sequence).copied() else {
            return Ok(None);
        };
        let segment = self.load_cached(entry)?;
        segment.fetch_by_sequence(sequence)
    }

    /// Latest snapshot not after `time`
    ///
    /// Times outside the recording clamp to the first or last snapshot.
    pub fn fetch_by_time(&mut self, time: f32) -> Result<Option<&Snapshot>> {
        self.expect_mode(StorageMode::Read)?;
        let Some(entry) = self.table.find_by_time(time).copied() else {
            return Ok(None);
        };
        let segment = self.load_cached(entry)?;
        Ok(segment.fetch_by_time(time)?.or(segment.start()))
    }

    /// Snapshot at or before `time` together with the one after it
    pub fn fetch_pair_by_time(&mut self, time: f32) -> Result<Option<SnapshotPair<'_>>> {
        self.expect_mode(StorageMode::Read)?;
        let Some(entry) = self.table.find_by_time(time).copied() else {
            return Ok(None);
        };
        let current = {
            let segment = self.load_cached(entry)?;
            segment
                .fetch_by_time(time)?
                .or(segment.start())
                .and_then(|s| segment.index_of(s.sequence()))
                .map(|index| (index, index + 1 < segment.len()))
        };
        let Some((index, has_next_in_segment)) = current else {
            return Ok(None);
        };
        self.pair_at(entry, index, has_next_in_segment)
    }

    /// Snapshot with this sequence id together with the one after it
    pub fn fetch_pair_by_sequence(&mut self, sequence: u32) -> Result<Option<SnapshotPair<'_>>> {
        self.expect_mode(StorageMode::Read)?;
        let Some(entry) = self.table.find_by_sequence(sequence).copied() else {
            return Ok(None);
        };
        let current = {
            let segment = self.load_cached(entry)?;
            segment
                .index_of(sequence)
                .map(|index| (index, index + 1 < segment.len()))
        };
        let Some((index, has_next_in_segment)) = current else {
            return Ok(None);
        };
        self.pair_at(entry, index, has_next_in_segment)
    }

    fn pair_at(
        &mut self,
        entry: SegmentEntry,
        index: usize,
        has_next_in_segment: bool,
    ) -> Result<Option<SnapshotPair<'_>>> {
        let next_location = if has_next_in_segment {
            Some((entry.segment_id, index + 1))
        } else {
            match self.table.following(entry.segment_id).copied() {
                Some(next) => {
                    self.load_cached(next)?;
                    Some((next.segment_id, 0))
                }
                None => None,
            }
        };
        // Loading the next segment may have evicted the current one
        if !self.cache.contains(entry.segment_id) {
            self.load_cached(entry)?;
        }

        let Some(current) = self
            .cache
            .peek(entry.segment_id)
            .and_then(|s| s.snapshot_at(index))
        else {
            return Ok(None);
        };
        let next = next_location
            .and_then(|(id, i)| self.cache.peek(id).and_then(|s| s.snapshot_at(i)));
        Ok(Some(SnapshotPair { current, next }))
    }

    /// Pair around `sequence` from already-loaded segments only
    ///
    /// `next` is `None` when the following segment is not cached. Call one of
    /// the `fetch_pair_*` methods first to load both.
    pub fn cached_pair(&self, sequence: u32) -> Option<SnapshotPair<'_>> {
        let entry = self.table.find_by_sequence(sequence)?;
        let segment = self.cache.peek(entry.segment_id)?;
        let index = segment.index_of(sequence)?;
        let current = segment.snapshot_at(index)?;
        let next = segment.snapshot_at(index + 1).or_else(|| {
            self.table
                .following(entry.segment_id)
                .and_then(|e| self.cache.peek(e.segment_id))
                .and_then(Segment::start)
        });
        Some(SnapshotPair { current, next })
    }

    /// Load a segment into the cache if needed and mark it recently used
    fn load_cached(&mut self, entry: SegmentEntry) -> Result<&Segment> {
        if !self.cache.contains(entry.segment_id) {
            let (op, done) = operation();
            self.worker.submit(Job::LoadSegment {
                entry,
                decompress: true,
                done,
            })?;
            let segment = op.wait()?;
            let evicted = self.cache.insert(segment);
            self.recycle(evicted)?;
        }
        self.cache
            .get(entry.segment_id)
            .ok_or(StorageError::Disposed("segment"))
    }

    /// Start loading every segment overlapping `start..=end` in the background
    ///
    /// Finish with [`complete_preload`](Self::complete_preload).
    pub fn begin_preload(&mut self, start: f32, end: f32) -> Result<Operation<Vec<Segment>>> {
        self.expect_mode(StorageMode::Read)?;
        let entries: Vec<SegmentEntry> = self
            .table
            .overlapping(start, end)
            .filter(|e| !self.cache.contains(e.segment_id))
            .copied()
            .collect();
        if entries.is_empty() {
            return Ok(Operation::ready(Ok(Vec::new())));
        }
        let (op, done) = operation();
        self.worker.submit(Job::Preload { entries, done })?;
        Ok(op)
    }

    /// Wait for a preload and move its segments into the cache
    ///
    /// Returns the number of segments loaded.
    pub fn complete_preload(&mut self, op: Operation<Vec<Segment>>) -> Result<usize> {
        let segments = op.wait()?;
        let count = segments.len();
        for segment in segments {
            let evicted = self.cache.insert(segment);
            self.recycle(evicted)?;
        }
        debug!(count, cached = self.cache.len(), "preloaded segments");
        Ok(count)
    }

    /// Load every segment overlapping `start..=end`, blocking until done
    pub fn preload(&mut self, start: f32, end: f32) -> Result<usize> {
        let op = self.begin_preload(start, end)?;
        self.complete_preload(op)
    }

    /// Read one segment block as stored, bypassing the cache
    ///
    /// Pointers are left unresolved. Hand the segment back with
    /// [`recycle_segment`](Self::recycle_segment) when done.
    pub fn load_raw_segment(&mut self, entry: &SegmentEntry) -> Result<Segment> {
        self.expect_mode(StorageMode::Read)?;
        let (op, done) = operation();
        self.worker.submit(Job::LoadSegment {
            entry: *entry,
            decompress: false,
            done,
        })?;
        op.wait()
    }

    pub fn recycle_segment(&mut self, segment: Segment) -> Result<()> {
        self.recycle(vec![segment])
    }

    fn recycle(&mut self, segments: Vec<Segment>) -> Result<()> {
        if segments.is_empty() {
            return Ok(());
        }
        self.worker.submit(Job::Recycle(segments))
    }

    // --- Accessors ---

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    pub fn persistent(&self) -> &PersistentStore {
        &self.persistent
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.metadata
    }

    /// Metadata to be written at commit
    pub fn metadata_mut(&mut self) -> &mut StreamMetadata {
        &mut self.metadata
    }

    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    /// Producer-side pools, for acquiring state buffers
    pub fn pools_mut(&mut self) -> &mut PoolRegistry {
        &mut self.pools
    }

    pub fn identity_width(&self) -> IdentityWidth {
        self.header.identity_width
    }

    /// Timestamp of the last stored snapshot
    pub fn duration(&self) -> f32 {
        self.header.duration
    }

    /// Sum of every stored snapshot's size
    pub fn memory_size(&self) -> u64 {
        self.header.memory_size
    }

    pub fn snapshot_count(&self) -> u32 {
        self.header.snapshot_count
    }

    /// Stop the worker and return the stream
    ///
    /// An uncommitted recording is discarded.
    pub fn finish(mut self) -> Result<S> {
        if self.mode == StorageMode::Write {
            warn!("finishing storage with an uncommitted recording");
            self.discard();
        }
        let cached = self.cache.drain();
        self.recycle(cached)?;
        self.worker.shutdown()
    }

    fn expect_mode(&self, expected: StorageMode) -> Result<()> {
        if self.mode != expected {
            return Err(StorageError::NotReady {
                expected,
                actual: self.mode,
            });
        }
        Ok(())
    }

    fn reset_index(&mut self) {
        if let Some(segment) = self.active.take() {
            self.pools.release_segment(segment);
        }
        let cached = self.cache.drain();
        if let Err(e) = self.recycle(cached) {
            warn!("could not recycle cached segments: {e}");
        }
        self.table.clear();
        self.persistent.clear();
        self.next_segment_id = 0;
        self.last_sequence = None;
    }
}
