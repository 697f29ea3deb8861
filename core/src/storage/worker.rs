//! Storage worker thread
//!
//! Exactly one worker per storage instance performs every physical read and
//! write on the backing stream. Jobs run strictly in submission order; each
//! segment block lands at the offset the previous block left behind.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use super::StreamTarget;
use super::operation::{Completer, lock_or_recover};
use crate::config::StorageConfig;
use crate::error::{FormatError, Result, StorageError};
use crate::format::codec::{read_segment, write_segment};
use crate::format::{SegmentEntry, SegmentTable, StreamFlags, StreamHeader};
use crate::identity::IdentityWidth;
use crate::metadata::StreamMetadata;
use crate::persistent::PersistentStore;
use crate::pool::{PoolRegistry, Recycled};
use crate::segment::Segment;

/// Everything loaded when a stream is opened for reading
#[derive(Debug, Clone)]
pub struct StreamIndex {
    pub header: StreamHeader,
    pub table: SegmentTable,
    pub persistent: PersistentStore,
    pub metadata: StreamMetadata,
}

/// Final header and table written at commit
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub header: StreamHeader,
    pub table: SegmentTable,
}

/// A unit of work for the worker
pub(crate) enum Job {
    /// Write a placeholder header and start a fresh segment table
    BeginWrite(StreamHeader),
    /// Compress and append a sealed segment, then recycle it
    WriteSegment(Segment),
    /// Write table, persistent and metadata blocks, then rewrite the header
    Commit {
        header: StreamHeader,
        persistent: PersistentStore,
        metadata: StreamMetadata,
        done: Completer<CommitSummary>,
    },
    /// Read header, table, persistent and metadata blocks
    ReadIndex(Completer<StreamIndex>),
    /// Read one segment block
    LoadSegment {
        entry: SegmentEntry,
        decompress: bool,
        done: Completer<Segment>,
    },
    /// Read and decompress several segment blocks
    Preload {
        entries: Vec<SegmentEntry>,
        done: Completer<Vec<Segment>>,
    },
    /// Return segments to the worker's pools
    Recycle(Vec<Segment>),
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Self::BeginWrite(_) => "begin-write",
            Self::WriteSegment(_) => "write-segment",
            Self::Commit { .. } => "commit",
            Self::ReadIndex(_) => "read-index",
            Self::LoadSegment { .. } => "load-segment",
            Self::Preload { .. } => "preload",
            Self::Recycle(_) => "recycle",
        }
    }

    /// Fail the job's operation, if it has one
    fn cancel(self) {
        match self {
            Self::Commit { done, .. } => done.complete(Err(StorageError::Cancelled)),
            Self::ReadIndex(done) => done.complete(Err(StorageError::Cancelled)),
            Self::LoadSegment { done, .. } => done.complete(Err(StorageError::Cancelled)),
            Self::Preload { done, .. } => done.complete(Err(StorageError::Cancelled)),
            Self::BeginWrite(_) | Self::WriteSegment(_) | Self::Recycle(_) => {}
        }
    }
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    /// Instances freed after a segment write, waiting for the producer
    returned: Mutex<Recycled>,
}

/// Producer-side handle to the worker thread
///
/// Dropping the handle lets the worker finish every queued job, then joins
/// it.
pub(crate) struct WorkerHandle<S> {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<S>>,
}

impl<S: StreamTarget> WorkerHandle<S> {
    /// Start the worker thread, moving `stream` onto it
    pub fn spawn(stream: S, config: &StorageConfig) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let mut worker = Worker {
            stream,
            width: config.identity_width,
            pools: PoolRegistry::new(config.pool_retain),
            retain: config.pool_retain,
            table: SegmentTable::new(),
            write_pos: 0,
            deferred: None,
        };

        let handle = thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || {
                worker.run(&worker_shared);
                worker.stream
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Queue a job behind everything already submitted
    pub fn submit(&self, job: Job) -> Result<()> {
        let mut queue = lock_or_recover(&self.shared.queue, "worker queue");
        if queue.shutdown || self.handle.as_ref().is_none_or(|h| h.is_finished()) {
            drop(queue);
            job.cancel();
            return Err(StorageError::WorkerStopped);
        }
        trace!(job = job.name(), pending = queue.jobs.len(), "queued job");
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Take the instances the worker freed after writing segments
    pub fn reclaim(&self) -> Recycled {
        std::mem::take(&mut *lock_or_recover(&self.shared.returned, "worker returns"))
    }

    /// Drop every job that has not started yet
    ///
    /// Jobs with an operation complete with [`StorageError::Cancelled`].
    /// Returns how many jobs were dropped.
    pub fn cancel_pending(&self) -> usize {
        let jobs: Vec<Job> = {
            let mut queue = lock_or_recover(&self.shared.queue, "worker queue");
            queue.jobs.drain(..).collect()
        };
        let count = jobs.len();
        for job in jobs {
            job.cancel();
        }
        count
    }

    /// Finish queued jobs, stop the thread and take the stream back
    pub fn shutdown(mut self) -> Result<S> {
        self.signal_shutdown();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| StorageError::WorkerStopped),
            None => Err(StorageError::WorkerStopped),
        }
    }

    fn signal_shutdown(&self) {
        lock_or_recover(&self.shared.queue, "worker queue").shutdown = true;
        self.shared.available.notify_all();
    }
}

impl<S> Drop for WorkerHandle<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            lock_or_recover(&self.shared.queue, "worker queue").shutdown = true;
            self.shared.available.notify_all();
            if handle.join().is_err() {
                warn!("storage worker panicked");
            }
        }
    }
}

struct Worker<S> {
    stream: S,
    width: IdentityWidth,
    /// Worker-side pools; only segments handed off to the worker land here
    pools: PoolRegistry,
    retain: usize,
    /// Table of the stream being written
    table: SegmentTable,
    /// Offset where the next segment block goes
    write_pos: u64,
    /// First failure of a fire-and-forget job, reported at commit
    deferred: Option<StorageError>,
}

impl<S: StreamTarget> Worker<S> {
    fn run(&mut self, shared: &Shared) {
        debug!("storage worker started");
        loop {
            let job = {
                let mut queue = lock_or_recover(&shared.queue, "worker queue");
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break Some(job);
                    }
                    if queue.shutdown {
                        break None;
                    }
                    queue = shared.available.wait(queue).unwrap_or_else(|e| {
                        warn!("worker queue wait mutex poisoned; continuing");
                        e.into_inner()
                    });
                }
            };
            let Some(job) = job else {
                break;
            };
            trace!(job = job.name(), "running job");
            self.execute(job, shared);
        }
        debug!("storage worker finished");
    }

    fn execute(&mut self, job: Job, shared: &Shared) {
        match job {
            Job::BeginWrite(header) => {
                self.table.clear();
                self.deferred = None;
                self.width = header.identity_width;
                if let Err(e) = self.begin_write(&header) {
                    self.defer(e);
                }
            }
            Job::WriteSegment(mut segment) => {
                if let Err(e) = self.write_segment(&mut segment) {
                    self.defer(e);
                }
                self.pools.release_segment(segment);
                self.hand_back(shared);
            }
            Job::Commit {
                header,
                persistent,
                metadata,
                done,
            } => {
                let result = match self.deferred.take() {
                    Some(e) => Err(e),
                    None => self.commit(header, &persistent, &metadata),
                };
                done.complete(result);
            }
            Job::ReadIndex(done) => {
                if done.is_cancelled() {
                    return done.complete(Err(StorageError::Cancelled));
                }
                let result = self.read_index(&done);
                done.complete(result);
            }
            Job::LoadSegment {
                entry,
                decompress,
                done,
            } => {
                if done.is_cancelled() {
                    return done.complete(Err(StorageError::Cancelled));
                }
                let result = self.load_segment(&entry, decompress);
                done.complete(result);
            }
            Job::Preload { entries, done } => {
                let mut loaded = Vec::with_capacity(entries.len());
                for (i, entry) in entries.iter().enumerate() {
                    if done.is_cancelled() {
                        self.recycle(loaded);
                        return done.complete(Err(StorageError::Cancelled));
                    }
                    match self.load_segment(entry, true) {
                        Ok(segment) => loaded.push(segment),
                        Err(e) => {
                            self.recycle(loaded);
                            return done.complete(Err(e));
                        }
                    }
                    done.report_progress((i + 1) as f32 / entries.len() as f32);
                }
                done.complete(Ok(loaded));
            }
            Job::Recycle(segments) => self.recycle(segments),
        }
    }

    fn defer(&mut self, e: StorageError) {
        error!("storage write failed: {e}");
        if self.deferred.is_none() {
            self.deferred = Some(e);
        }
    }

    /// Move freed write-path instances back to the producer
    fn hand_back(&mut self, shared: &Shared) {
        let freed = self.pools.take_free();
        if !freed.is_empty() {
            lock_or_recover(&shared.returned, "worker returns").merge(freed, self.retain);
        }
    }

    fn recycle(&mut self, segments: Vec<Segment>) {
        for segment in segments {
            self.pools.release_segment(segment);
        }
    }

    fn begin_write(&mut self, header: &StreamHeader) -> Result<()> {
        self.stream.seek(SeekFrom::Start(0))?;
        header.write_to(&mut self.stream)?;
        self.write_pos = header.encoded_size() as u64;
        Ok(())
    }

    fn write_segment(&mut self, segment: &mut Segment) -> Result<()> {
        let (Some(start), Some(end)) = (segment.start(), segment.end()) else {
            return Ok(());
        };
        let entry = SegmentEntry {
            segment_id: segment.id(),
            start_sequence: start.sequence(),
            end_sequence: end.sequence(),
            start_time: start.timestamp(),
            end_time: end.timestamp(),
            offset: self.write_pos,
        };

        let stats = segment.compress()?;
        self.stream.seek(SeekFrom::Start(self.write_pos))?;
        let written = write_segment(&mut self.stream, segment, self.width)?;
        self.table.push(entry)?;
        self.write_pos += written;

        debug!(
            segment = entry.segment_id,
            snapshots = segment.len(),
            bytes = written,
            deduplicated = stats.deduplicated,
            "flushed segment"
        );
        Ok(())
    }

    fn commit(
        &mut self,
        mut header: StreamHeader,
        persistent: &PersistentStore,
        metadata: &StreamMetadata,
    ) -> Result<CommitSummary> {
        self.stream.seek(SeekFrom::Start(self.write_pos))?;
        header.table_offset = self.write_pos;
        self.table.write_to(&mut self.stream)?;

        header.persistent_offset = self.stream.stream_position()?;
        persistent.write_to(&mut self.stream, header.identity_width)?;

        header.metadata_offset = self.stream.stream_position()?;
        metadata.write_to(&mut self.stream)?;
        let end = self.stream.stream_position()?;

        header.flags.insert(StreamFlags::COMMITTED);
        self.stream.seek(SeekFrom::Start(0))?;
        header.write_to(&mut self.stream)?;
        self.stream.flush()?;

        info!(
            segments = self.table.len(),
            snapshots = header.snapshot_count,
            duration = header.duration,
            bytes = end,
            "committed stream"
        );
        Ok(CommitSummary {
            header,
            table: self.table.clone(),
        })
    }

    fn read_index(&mut self, done: &Completer<StreamIndex>) -> Result<StreamIndex> {
        self.stream.seek(SeekFrom::Start(0))?;
        let header = StreamHeader::read_from(&mut self.stream)?;
        if !header.is_committed() {
            return Err(FormatError::NotCommitted.into());
        }
        self.width = header.identity_width;
        done.report_progress(0.25);

        self.stream.seek(SeekFrom::Start(header.table_offset))?;
        let table = SegmentTable::read_from(&mut self.stream)?;
        done.report_progress(0.5);

        self.stream.seek(SeekFrom::Start(header.persistent_offset))?;
        let persistent = PersistentStore::read_from(&mut self.stream, header.identity_width)?;
        done.report_progress(0.75);

        let metadata = if header.metadata_offset == 0 {
            StreamMetadata::default()
        } else {
            self.stream.seek(SeekFrom::Start(header.metadata_offset))?;
            StreamMetadata::read_from(&mut self.stream)?
        };

        debug!(
            version = header.version,
            segments = table.len(),
            snapshots = header.snapshot_count,
            "read stream index"
        );
        Ok(StreamIndex {
            header,
            table,
            persistent,
            metadata,
        })
    }

    fn load_segment(&mut self, entry: &SegmentEntry, decompress: bool) -> Result<Segment> {
        self.stream.seek(SeekFrom::Start(entry.offset))?;
        let mut segment = read_segment(&mut self.stream, self.width, &mut self.pools)?;
        if segment.id() != entry.segment_id {
            let found = segment.id();
            self.pools.release_segment(segment);
            return Err(FormatError::SegmentMismatch {
                expected: entry.segment_id,
                found,
            }
            .into());
        }
        if decompress && let Err(e) = segment.decompress() {
            self.pools.release_segment(segment);
            return Err(e);
        }
        debug!(
            segment = entry.segment_id,
            snapshots = segment.len(),
            decompress,
            "loaded segment"
        );
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read, Seek, Write};
    use std::sync::mpsc;

    use super::*;
    use crate::buffer::{ByteBuffer, StateWrite};
    use crate::format::HEADER_SIZE;
    use crate::identity::ObjectId;
    use crate::snapshot::Snapshot;
    use crate::storage::{Operation, operation};

    type Memory = Cursor<Vec<u8>>;

    fn spawn() -> WorkerHandle<Memory> {
        WorkerHandle::spawn(Cursor::new(Vec::new()), &StorageConfig::default()).unwrap()
    }

    fn segment(id: u32, first: u32) -> Segment {
        let mut segment = Segment::new(id, 4);
        for seq in first..first + 2 {
            let mut snapshot = Snapshot::new(seq as f32, seq);
            let mut state = ByteBuffer::new();
            state.write(&seq).unwrap();
            snapshot.record(ObjectId::new(1), state);
            segment.add_snapshot(snapshot).unwrap();
        }
        segment
    }

    fn commit<S: StreamTarget>(worker: &WorkerHandle<S>, snapshots: u32) -> Operation<CommitSummary> {
        let (op, done) = operation();
        let header = StreamHeader {
            snapshot_count: snapshots,
            ..StreamHeader::new(IdentityWidth::U32)
        };
        worker
            .submit(Job::Commit {
                header,
                persistent: PersistentStore::new(),
                metadata: StreamMetadata::default(),
                done,
            })
            .unwrap();
        op
    }

    /// Accepts seeks but fails every write
    struct ReadOnly;

    impl Read for ReadOnly {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for ReadOnly {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for ReadOnly {
        fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
            Ok(0)
        }
    }

    /// In-memory stream whose first write parks until released
    struct Gated {
        inner: Memory,
        entered: Option<mpsc::Sender<()>>,
        release: mpsc::Receiver<()>,
    }

    impl Read for Gated {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Write for Gated {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(entered) = self.entered.take() {
                let _ = entered.send(());
                let _ = self.release.recv();
            }
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for Gated {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_cancel_pending_clears_queue() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let stream = Gated {
            inner: Cursor::new(Vec::new()),
            entered: Some(entered_tx),
            release: release_rx,
        };
        let worker = WorkerHandle::spawn(stream, &StorageConfig::default()).unwrap();

        // The header write parks the worker inside this job
        worker
            .submit(Job::BeginWrite(StreamHeader::new(IdentityWidth::U32)))
            .unwrap();
        entered_rx.recv().unwrap();

        worker.submit(Job::WriteSegment(segment(0, 1))).unwrap();
        worker.submit(Job::WriteSegment(segment(1, 3))).unwrap();
        let (op, done) = operation();
        let entry = SegmentEntry {
            segment_id: 0,
            start_sequence: 1,
            end_sequence: 2,
            start_time: 1.0,
            end_time: 2.0,
            offset: HEADER_SIZE as u64,
        };
        worker
            .submit(Job::LoadSegment {
                entry,
                decompress: true,
                done,
            })
            .unwrap();

        assert_eq!(worker.cancel_pending(), 3);
        assert!(matches!(op.wait(), Err(StorageError::Cancelled)));

        release_tx.send(()).unwrap();
        let summary = commit(&worker, 0).wait().unwrap();
        assert!(summary.table.is_empty());
    }

    #[test]
    fn test_segments_written_in_order() {
        let worker = spawn();
        worker
            .submit(Job::BeginWrite(StreamHeader::new(IdentityWidth::U32)))
            .unwrap();
        worker.submit(Job::WriteSegment(segment(0, 1))).unwrap();
        worker.submit(Job::WriteSegment(segment(1, 3))).unwrap();
        let summary = commit(&worker, 4).wait().unwrap();

        assert!(summary.header.is_committed());
        assert_eq!(summary.table.len(), 2);
        let first = summary.table.get(0).unwrap();
        let second = summary.table.get(1).unwrap();
        assert_eq!(first.offset, HEADER_SIZE as u64);
        assert!(second.offset > first.offset);
        assert_eq!(second.start_sequence, 3);

        let stream = worker.shutdown().unwrap();
        let header = StreamHeader::read_from(&mut stream.get_ref().as_slice()).unwrap();
        assert_eq!(header, summary.header);
    }

    #[test]
    fn test_write_error_reported_at_commit() {
        let worker = WorkerHandle::spawn(ReadOnly, &StorageConfig::default()).unwrap();
        worker
            .submit(Job::BeginWrite(StreamHeader::new(IdentityWidth::U32)))
            .unwrap();
        let err = commit(&worker, 0).wait().unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let worker = spawn();
        let (op, done) = operation::<StreamIndex>();
        op.cancel();
        worker.submit(Job::ReadIndex(done)).unwrap();
        assert!(matches!(op.wait(), Err(StorageError::Cancelled)));
    }

    #[test]
    fn test_uncommitted_stream_unreadable() {
        let worker = spawn();
        worker
            .submit(Job::BeginWrite(StreamHeader::new(IdentityWidth::U32)))
            .unwrap();
        let (op, done) = operation();
        worker.submit(Job::ReadIndex(done)).unwrap();
        assert!(matches!(
            op.wait(),
            Err(StorageError::Format(FormatError::NotCommitted))
        ));
    }
}
