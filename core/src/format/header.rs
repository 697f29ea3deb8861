//! Stream header

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{FORMAT_VERSION, HEADER_SIZE, HEADER_SIZE_V1, MAGIC};
use crate::error::{FormatError, Result, StorageError};
use crate::identity::IdentityWidth;

bitflags::bitflags! {
    /// Stream state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamFlags: u8 {
        /// Header was rewritten at commit; offsets and totals are final
        const COMMITTED = 0b0000_0001;
    }
}

/// Fixed-size header at offset 0
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHeader {
    pub version: u16,
    pub identity_width: IdentityWidth,
    pub flags: StreamFlags,
    /// Sum of every stored snapshot's size
    pub memory_size: u64,
    /// Timestamp of the last stored snapshot
    pub duration: f32,
    pub snapshot_count: u32,
    pub table_offset: u64,
    pub persistent_offset: u64,
    /// Zero when the stream predates the metadata block
    pub metadata_offset: u64,
}

impl Default for StreamHeader {
    fn default() -> Self {
        Self::new(IdentityWidth::default())
    }
}

impl StreamHeader {
    /// Placeholder header for a stream that is about to be recorded
    pub fn new(identity_width: IdentityWidth) -> Self {
        Self {
            version: FORMAT_VERSION,
            identity_width,
            flags: StreamFlags::empty(),
            memory_size: 0,
            duration: 0.0,
            snapshot_count: 0,
            table_offset: 0,
            persistent_offset: 0,
            metadata_offset: 0,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.flags.contains(StreamFlags::COMMITTED)
    }

    /// Encoded size of this header
    pub fn encoded_size(&self) -> usize {
        if self.version >= 2 {
            HEADER_SIZE
        } else {
            HEADER_SIZE_V1
        }
    }

    /// Write the header at the current version
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.write_all(&MAGIC)?;
        bytes.write_u16::<LittleEndian>(FORMAT_VERSION)?;
        bytes.write_u8(self.identity_width.bytes())?;
        bytes.write_u8(self.flags.bits())?;
        bytes.write_u64::<LittleEndian>(self.memory_size)?;
        bytes.write_f32::<LittleEndian>(self.duration)?;
        bytes.write_u32::<LittleEndian>(self.snapshot_count)?;
        bytes.write_u64::<LittleEndian>(self.table_offset)?;
        bytes.write_u64::<LittleEndian>(self.persistent_offset)?;
        bytes.write_u64::<LittleEndian>(self.metadata_offset)?;
        w.write_all(&bytes)?;
        Ok(())
    }

    /// Read and validate a header
    ///
    /// Uncommitted streams are readable here; callers that need final
    /// offsets check [`is_committed`](Self::is_committed).
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let eof = StorageError::decoding;

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(eof("header"))?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic {
                found: magic,
                expected: MAGIC,
            }
            .into());
        }

        let version = r.read_u16::<LittleEndian>().map_err(eof("header"))?;
        if version == 0 || version > FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: version,
                supported: FORMAT_VERSION,
            }
            .into());
        }

        let width = r.read_u8().map_err(eof("header"))?;
        let identity_width =
            IdentityWidth::from_bytes(width).ok_or(FormatError::UnsupportedIdentityWidth(width))?;
        let flags = StreamFlags::from_bits_truncate(r.read_u8().map_err(eof("header"))?);

        let memory_size = r.read_u64::<LittleEndian>().map_err(eof("header"))?;
        let duration = r.read_f32::<LittleEndian>().map_err(eof("header"))?;
        let snapshot_count = r.read_u32::<LittleEndian>().map_err(eof("header"))?;
        let table_offset = r.read_u64::<LittleEndian>().map_err(eof("header"))?;
        let persistent_offset = r.read_u64::<LittleEndian>().map_err(eof("header"))?;
        let metadata_offset = if version >= 2 {
            r.read_u64::<LittleEndian>().map_err(eof("header"))?
        } else {
            0
        };

        Ok(Self {
            version,
            identity_width,
            flags,
            memory_size,
            duration,
            snapshot_count,
            table_offset,
            persistent_offset,
            metadata_offset,
        })
    }
}
