//! Segment and snapshot block codec
//!
//! Blocks are encoded into a scratch buffer and written with a single
//! `write_all`, so a failed encode never leaves a partial block behind.

use std::io::{self, Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{STORABLE_POINTER, STORABLE_STATE};
use crate::error::{BufferError, FormatError, Result, StorageError};
use crate::identity::{IdentityWidth, ObjectId};
use crate::pool::PoolRegistry;
use crate::segment::{MAX_SEGMENT_CAPACITY, Segment};
use crate::snapshot::{Snapshot, Storable};

/// Write an identity at the stream's width
pub fn write_identity<W: Write + ?Sized>(w: &mut W, id: ObjectId, width: IdentityWidth) -> Result<()> {
    if !width.fits(id) {
        return Err(BufferError::IdentityOverflow {
            id: id.raw(),
            width: width.bytes(),
        }
        .into());
    }
    match width {
        IdentityWidth::U16 => w.write_u16::<LittleEndian>(id.raw() as u16)?,
        IdentityWidth::U32 => w.write_u32::<LittleEndian>(id.raw())?,
    }
    Ok(())
}

pub fn read_identity<R: Read + ?Sized>(r: &mut R, width: IdentityWidth) -> io::Result<ObjectId> {
    Ok(match width {
        IdentityWidth::U16 => ObjectId::new(r.read_u16::<LittleEndian>()? as u32),
        IdentityWidth::U32 => ObjectId::new(r.read_u32::<LittleEndian>()?),
    })
}

/// Encode one snapshot
///
/// Entries are written in identity order so identical snapshots encode to
/// identical bytes.
pub fn write_snapshot<W: Write + ?Sized>(
    w: &mut W,
    snapshot: &Snapshot,
    width: IdentityWidth,
) -> Result<()> {
    let count = u16::try_from(snapshot.len()).map_err(|_| StorageError::Capacity {
        capacity: u16::MAX as usize,
    })?;

    w.write_f32::<LittleEndian>(snapshot.timestamp())?;
    w.write_u32::<LittleEndian>(snapshot.sequence())?;
    w.write_u32::<LittleEndian>(snapshot.size_bytes())?;
    w.write_u16::<LittleEndian>(count)?;

    let mut entries: Vec<(ObjectId, &Storable)> = snapshot.entries().collect();
    entries.sort_unstable_by_key(|(id, _)| *id);
    for (id, storable) in entries {
        write_identity(w, id, width)?;
        match storable {
            Storable::State(state) => {
                w.write_u8(STORABLE_STATE)?;
                w.write_u32::<LittleEndian>(state.size() as u32)?;
                w.write_all(state.as_bytes())?;
            }
            Storable::Pointer(target) => {
                w.write_u8(STORABLE_POINTER)?;
                w.write_u8(*target)?;
            }
        }
    }
    Ok(())
}

/// Decode one snapshot, drawing instances from `pools`
pub fn read_snapshot<R: Read + ?Sized>(
    r: &mut R,
    width: IdentityWidth,
    pools: &mut PoolRegistry,
) -> Result<Snapshot> {
    let eof = StorageError::decoding;
    let timestamp = r.read_f32::<LittleEndian>().map_err(eof("snapshot header"))?;
    let sequence = r.read_u32::<LittleEndian>().map_err(eof("snapshot header"))?;
    let size = r.read_u32::<LittleEndian>().map_err(eof("snapshot header"))?;
    let count = r.read_u16::<LittleEndian>().map_err(eof("snapshot header"))?;

    let mut snapshot = pools.acquire_snapshot(timestamp, sequence);
    if let Err(e) = read_entries(r, width, pools, &mut snapshot, count) {
        pools.release_snapshot(snapshot);
        return Err(e);
    }
    snapshot.set_cached_size(size);
    Ok(snapshot)
}

fn read_entries<R: Read + ?Sized>(
    r: &mut R,
    width: IdentityWidth,
    pools: &mut PoolRegistry,
    snapshot: &mut Snapshot,
    count: u16,
) -> Result<()> {
    let eof = StorageError::decoding;
    for _ in 0..count {
        let id = read_identity(r, width).map_err(eof("snapshot entry"))?;
        match r.read_u8().map_err(eof("snapshot entry"))? {
            STORABLE_STATE => {
                let len = r.read_u32::<LittleEndian>().map_err(eof("snapshot entry"))?;
                let mut state = pools.acquire_buffer();
                if let Err(e) = state.load_from(r, len as usize) {
                    pools.release_buffer(state);
                    return Err(eof("state payload")(e));
                }
                snapshot.set_storable(id, Storable::State(Arc::new(state)));
            }
            STORABLE_POINTER => {
                let target = r.read_u8().map_err(eof("snapshot entry"))?;
                snapshot.set_storable(id, Storable::Pointer(target));
            }
            tag => return Err(FormatError::UnknownStorableTag { tag }.into()),
        }
    }
    Ok(())
}

/// Encode a segment block; returns the number of bytes written
pub fn write_segment<W: Write + ?Sized>(
    w: &mut W,
    segment: &Segment,
    width: IdentityWidth,
) -> Result<u64> {
    let mut bytes = Vec::new();
    bytes.write_u32::<LittleEndian>(segment.id())?;
    bytes.write_u8(segment.is_compressed() as u8)?;
    bytes.write_u16::<LittleEndian>(segment.len() as u16)?;
    for snapshot in segment.snapshots() {
        write_snapshot(&mut bytes, snapshot, width)?;
    }
    w.write_all(&bytes)?;
    Ok(bytes.len() as u64)
}

/// Decode a segment block
///
/// The segment's capacity is its stored snapshot count. Pointers are left
/// unresolved; call [`Segment::decompress`] before querying.
pub fn read_segment<R: Read + ?Sized>(
    r: &mut R,
    width: IdentityWidth,
    pools: &mut PoolRegistry,
) -> Result<Segment> {
    let eof = StorageError::decoding;
    let id = r.read_u32::<LittleEndian>().map_err(eof("segment header"))?;
    let compressed = r.read_u8().map_err(eof("segment header"))? != 0;
    let count = r.read_u16::<LittleEndian>().map_err(eof("segment header"))?;
    if count > MAX_SEGMENT_CAPACITY {
        return Err(FormatError::SegmentOverflow {
            segment: id,
            count: count as usize,
        }
        .into());
    }

    let mut segment = pools.acquire_segment(id, count);
    for _ in 0..count {
        let snapshot = match read_snapshot(r, width, pools) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                pools.release_segment(segment);
                return Err(e);
            }
        };
        if let Err(e) = segment.add_snapshot(snapshot) {
            pools.release_segment(segment);
            return Err(e);
        }
    }
    segment.set_compressed(compressed);
    Ok(segment)
}
