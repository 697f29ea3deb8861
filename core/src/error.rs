//! Error types for the reel storage engine
//!
//! Three layers: [`BufferError`] for typed reads/writes on a single state
//! buffer, [`FormatError`] for malformed stream bytes, and [`StorageError`]
//! as the crate-wide error returned by segments, storage and sessions.

use std::io;

use thiserror::Error;

use crate::identity::ObjectId;
use crate::storage::StorageMode;

/// Crate-wide result type
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Error reading or writing a [`ByteBuffer`](crate::buffer::ByteBuffer)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The buffer was disposed (or released to its pool)
    #[error("buffer has been disposed")]
    Disposed,

    /// Read attempted on a buffer that holds no data at all
    #[error("buffer contains no data")]
    Empty,

    /// Read attempted past the write cursor
    #[error("read of {requested} bytes exceeds the {available} bytes remaining")]
    OutOfBounds { requested: usize, available: usize },

    /// String payload is not valid UTF-8
    #[error("string data is not valid UTF-8")]
    InvalidString,

    /// String is longer than its u16 length prefix allows
    #[error("string of {len} bytes exceeds the u16 length prefix")]
    StringTooLong { len: usize },

    /// Identity does not fit the configured identity width
    #[error("identity {id} does not fit in {width} bytes")]
    IdentityOverflow { id: u32, width: u8 },
}

/// Malformed stream data
///
/// Format errors abort the current operation. They are never retried since
/// the underlying bytes will not change.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("bad magic bytes {found:?} (expected {expected:?})")]
    BadMagic { found: [u8; 4], expected: [u8; 4] },

    #[error("unsupported format version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    #[error("unsupported identity width of {0} bytes")]
    UnsupportedIdentityWidth(u8),

    #[error("stream was never committed")]
    NotCommitted,

    #[error("stream truncated while reading {context}")]
    Truncated { context: &'static str },

    #[error("unknown storable tag {tag}")]
    UnknownStorableTag { tag: u8 },

    #[error("pointer for {identity} at snapshot index {index} targets index {target}")]
    ForwardPointer {
        identity: ObjectId,
        index: usize,
        target: u8,
    },

    #[error("pointer for {identity} at snapshot index {index} targets index {target}, which holds no state")]
    MissingBaseline {
        identity: ObjectId,
        index: usize,
        target: u8,
    },

    #[error("pointer for {identity} was never resolved")]
    UnresolvedPointer { identity: ObjectId },

    #[error("expected segment {expected} at table offset, found segment {found}")]
    SegmentMismatch { expected: u32, found: u32 },

    #[error("segment {segment} holds {count} snapshots, more than a pointer can address")]
    SegmentOverflow { segment: u32, count: usize },

    #[error("invalid segment table: {0}")]
    InvalidTable(String),

    #[error("invalid metadata block: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Error returned by segments, stream storage and replay sessions
#[derive(Debug, Error)]
pub enum StorageError {
    /// Operation on a disposed segment or snapshot
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Segment is sealed
    #[error("segment is full ({capacity} snapshots)")]
    Capacity { capacity: usize },

    /// Storage is not prepared for the requested operation
    #[error("storage is in {actual} mode, expected {expected}")]
    NotReady {
        expected: StorageMode,
        actual: StorageMode,
    },

    /// Storage is claimed by another record/playback session
    #[error("storage is locked by '{owner}'")]
    Locked { owner: String },

    /// Query on a segment that has not been decompressed
    #[error("segment {segment} is still compressed")]
    SegmentCompressed { segment: u32 },

    /// Compression requested on a segment whose states alias a baseline
    #[error("segment {segment} was decompressed and cannot be compressed again")]
    Recompress { segment: u32 },

    /// Snapshot sequence ids must strictly increase
    #[error("snapshot sequence {found} does not follow {previous}")]
    OutOfOrder { previous: u32, found: u32 },

    /// The task was discarded before the worker ran it
    #[error("operation was cancelled")]
    Cancelled,

    /// The storage worker thread is gone
    #[error("storage worker has stopped")]
    WorkerStopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Map an I/O error raised while decoding `context`
    ///
    /// Unexpected EOF becomes [`FormatError::Truncated`]; anything else stays
    /// an I/O error.
    pub(crate) fn decoding(context: &'static str) -> impl FnOnce(io::Error) -> StorageError {
        move |e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FormatError::Truncated { context }.into()
            } else {
                StorageError::Io(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_truncated() {
        let err = StorageError::decoding("header")(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(
            err,
            StorageError::Format(FormatError::Truncated { context: "header" })
        ));
    }

    #[test]
    fn test_other_io_errors_pass_through() {
        let err = StorageError::decoding("header")(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = BufferError::OutOfBounds {
            requested: 4,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "read of 4 bytes exceeds the 1 bytes remaining"
        );

        let err = StorageError::Locked {
            owner: "recorder".into(),
        };
        assert_eq!(err.to_string(), "storage is locked by 'recorder'");
    }
}
