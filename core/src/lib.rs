//! Nether Reel - segmented state capture and replay storage
//!
//! Records periodic snapshots of a simulation's object states, groups them
//! into fixed-size segments, removes redundancy across time inside each
//! segment and persists them to a seekable stream from a background worker.
//! Playback answers random-access queries by time or sequence without
//! blocking on anything but the segment it needs.
//!
//! # Architecture
//!
//! - [`ByteBuffer`] - Growable byte container holding one object's state
//! - [`Snapshot`] - Every recorded state at one timestamp
//! - [`Segment`] - Bounded run of snapshots; the unit of compression and I/O
//! - [`StreamStorage`] - Mode state machine over the stream and its worker
//! - [`Recorder`] / [`Playback`] - Sessions driving the storage

pub mod buffer;
pub mod config;
pub mod error;
pub mod format;
pub mod identity;
pub mod metadata;
pub mod persistent;
pub mod pool;
pub mod segment;
pub mod session;
pub mod snapshot;
pub mod storage;

pub use buffer::{ByteBuffer, Packable, Precision, StateRead, StateReader, StateWrite};
pub use config::{PlaybackConfig, PlaybackDirection, RecorderConfig, ReelConfig, StorageConfig};
pub use error::{BufferError, FormatError, Result, StorageError};
pub use format::{SegmentEntry, SegmentTable, StreamFlags, StreamHeader};
pub use identity::{IdentityWidth, ObjectId};
pub use metadata::StreamMetadata;
pub use persistent::PersistentStore;
pub use pool::{Pool, PoolRegistry, Poolable, Recycled};
pub use segment::{CompressionStats, Segment};
pub use session::{Playback, PlaybackFrame, Recordable, Recorder};
pub use snapshot::{
    ObjectDescriptor, PrefabId, ReplayScene, RestoreReport, RestoreWarning, Snapshot, SpawnState,
    Storable,
};
pub use storage::{
    CommitSummary, Operation, SnapshotPair, StorageAction, StorageMode, StreamIndex,
    StreamStorage, StreamTarget,
};
