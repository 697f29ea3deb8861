//! State buffers
//!
//! A [`ByteBuffer`] holds the serialized state of one object for one
//! snapshot. It is filled by a single serialize call, read back by at most
//! one deserialize call, then released to its [`Pool`](crate::pool::Pool).
//!
//! Reads go through the [`StateRead`] trait, either on the buffer's own read
//! cursor or on a borrowed [`StateReader`] (needed once decompression has
//! made several snapshots share one buffer).

mod hash;
mod pack;

use std::fmt;
use std::io::{self, Read};
use std::sync::OnceLock;

pub use hash::content_hash;
pub use pack::{Packable, Precision, StateRead, StateWrite};

use crate::error::BufferError;
use crate::pool::Poolable;

/// Initial allocation for a buffer's first write
const MIN_CAPACITY: usize = 32;

/// Growable, poolable byte buffer with independent read and write cursors
#[derive(Clone, Default)]
pub struct ByteBuffer {
    /// Written bytes; `data.len()` is the write cursor
    data: Vec<u8>,
    read_pos: usize,
    /// Lazily computed content hash, cleared on every write
    hash: OnceLock<u64>,
    disposed: bool,
}

impl ByteBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            ..Default::default()
        }
    }

    /// Wrap already-serialized bytes
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Number of bytes written (the write cursor)
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if nothing has been written
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Current read cursor
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Written bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Check if the buffer has been disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Grow so that at least `capacity` bytes fit without reallocating
    ///
    /// Growth is geometric (at least doubling). Never shrinks.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        let current = self.data.capacity();
        if capacity <= current {
            return;
        }
        let target = capacity.max(current * 2).max(MIN_CAPACITY);
        self.data.reserve_exact(target - self.data.len());
    }

    /// Move the read cursor back to the start
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    /// Drop all data and reset both cursors
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.hash.take();
    }

    /// Content hash of the written bytes
    ///
    /// Computed on first query and cached until the data changes.
    pub fn content_hash(&self) -> u64 {
        *self.hash.get_or_init(|| content_hash(&self.data))
    }

    /// Borrow the written bytes through an independent read cursor
    pub fn reader(&self) -> Result<StateReader<'_>, BufferError> {
        if self.disposed {
            return Err(BufferError::Disposed);
        }
        Ok(StateReader::new(&self.data))
    }

    /// Clear the buffer and mark it unusable
    ///
    /// Any further read or write fails with [`BufferError::Disposed`] until
    /// the buffer is handed out again by a pool.
    pub fn dispose(&mut self) {
        self.clear();
        self.disposed = true;
    }

    /// Replace the contents with exactly `len` bytes from `reader`
    pub(crate) fn load_from<R: Read + ?Sized>(&mut self, reader: &mut R, len: usize) -> io::Result<()> {
        self.clear();
        // Length comes from the stream; grow only as bytes actually arrive
        let read = (&mut *reader).take(len as u64).read_to_end(&mut self.data)?;
        if read < len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }
}

impl StateWrite for ByteBuffer {
    fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if self.disposed {
            return Err(BufferError::Disposed);
        }
        self.ensure_capacity(self.data.len() + bytes.len());
        self.data.extend_from_slice(bytes);
        self.hash.take();
        Ok(())
    }
}

impl StateRead for ByteBuffer {
    fn take_bytes(&mut self, len: usize) -> Result<&[u8], BufferError> {
        if self.disposed {
            return Err(BufferError::Disposed);
        }
        let start = self.read_pos;
        let end = checked_range(&self.data, start, len)?;
        self.read_pos = end;
        Ok(&self.data[start..end])
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }
}

impl PartialEq for ByteBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for ByteBuffer {}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("size", &self.data.len())
            .field("read_pos", &self.read_pos)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Poolable for ByteBuffer {
    fn reset(&mut self) {
        self.dispose();
    }

    fn revive(&mut self) {
        self.disposed = false;
    }

    fn is_pooled(&self) -> bool {
        self.disposed
    }
}

/// Read-only cursor over a borrowed state
#[derive(Debug, Clone)]
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current read cursor
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl StateRead for StateReader<'_> {
    fn take_bytes(&mut self, len: usize) -> Result<&[u8], BufferError> {
        let start = self.pos;
        let end = checked_range(self.data, start, len)?;
        self.pos = end;
        Ok(&self.data[start..end])
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

fn checked_range(data: &[u8], start: usize, len: usize) -> Result<usize, BufferError> {
    if data.is_empty() {
        return Err(BufferError::Empty);
    }
    let available = data.len() - start;
    if len > available {
        return Err(BufferError::OutOfBounds {
            requested: len,
            available,
        });
    }
    Ok(start + len)
}
