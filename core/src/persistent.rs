//! Persistent side-channel
//!
//! Per-identity data that is not tied to a single snapshot, such as the pose
//! an object was spawned with. Records are stored once and looked up by the
//! nearest timestamp.
//!
//! # Block layout
//!
//! ```text
//! [block_len: u32]
//! [identity_count: u32]
//!   per identity: [identity][record_count: u32]
//!     per record: [timestamp: f32][len: u32][bytes]
//! ```

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;

use crate::buffer::ByteBuffer;
use crate::error::{BufferError, Result, StorageError};
use crate::format::codec::{read_identity, write_identity};
use crate::identity::{IdentityWidth, ObjectId};
use crate::snapshot::SpawnState;

/// One time-stamped record for an identity
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentRecord {
    pub timestamp: f32,
    pub data: ByteBuffer,
}

/// Time-keyed auxiliary data per identity
#[derive(Debug, Clone, Default)]
pub struct PersistentStore {
    /// Records per identity, sorted by timestamp
    records: HashMap<ObjectId, Vec<PersistentRecord>>,
}

impl PersistentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of identities with at least one record
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of records across all identities
    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn identities(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.records.keys().copied()
    }

    pub fn records(&self, id: ObjectId) -> &[PersistentRecord] {
        self.records.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Store a record, keeping the identity's records ordered by time
    pub fn insert(&mut self, id: ObjectId, timestamp: f32, data: ByteBuffer) {
        let records = self.records.entry(id).or_default();
        let index = records.partition_point(|r| r.timestamp <= timestamp);
        records.insert(index, PersistentRecord { timestamp, data });
    }

    /// Encode and store a spawn record
    pub fn insert_spawn(
        &mut self,
        id: ObjectId,
        timestamp: f32,
        spawn: &SpawnState,
        width: IdentityWidth,
    ) -> Result<(), BufferError> {
        let mut data = ByteBuffer::new();
        spawn.write_to(&mut data, width)?;
        self.insert(id, timestamp, data);
        Ok(())
    }

    /// Record whose timestamp is closest to `timestamp`
    ///
    /// On a tie the earlier record wins.
    pub fn nearest(&self, id: ObjectId, timestamp: f32) -> Option<&PersistentRecord> {
        let records = self.records.get(&id)?;
        let index = records.partition_point(|r| r.timestamp <= timestamp);
        let before = index.checked_sub(1).map(|i| &records[i]);
        let after = records.get(index);
        match (before, after) {
            (Some(b), Some(a)) => {
                if (a.timestamp - timestamp).abs() < (timestamp - b.timestamp).abs() {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (Some(b), None) => Some(b),
            (None, a) => a,
        }
    }

    /// Decode the spawn record nearest to `timestamp`
    pub fn spawn_state(
        &self,
        id: ObjectId,
        timestamp: f32,
        width: IdentityWidth,
    ) -> Result<Option<SpawnState>, BufferError> {
        match self.nearest(id, timestamp) {
            Some(record) => {
                let mut reader = record.data.reader()?;
                SpawnState::read_from(&mut reader, width).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Write the length-prefixed block
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W, width: IdentityWidth) -> Result<()> {
        let mut body = Vec::new();
        let mut ids: Vec<ObjectId> = self.records.keys().copied().collect();
        ids.sort_unstable();

        body.write_u32::<LittleEndian>(ids.len() as u32)?;
        for id in ids {
            let records = &self.records[&id];
            write_identity(&mut body, id, width)?;
            body.write_u32::<LittleEndian>(records.len() as u32)?;
            for record in records {
                body.write_f32::<LittleEndian>(record.timestamp)?;
                body.write_u32::<LittleEndian>(record.data.size() as u32)?;
                body.write_all(record.data.as_bytes())?;
            }
        }

        w.write_u32::<LittleEndian>(body.len() as u32)?;
        w.write_all(&body)?;
        Ok(())
    }

    /// Read a block written by [`write_to`](Self::write_to)
    pub fn read_from<R: Read + ?Sized>(r: &mut R, width: IdentityWidth) -> Result<Self> {
        let eof = StorageError::decoding;
        let block_len = r.read_u32::<LittleEndian>().map_err(eof("persistent block"))?;
        let mut block = r.take(block_len as u64);

        let mut store = Self::new();
        let identity_count = block
            .read_u32::<LittleEndian>()
            .map_err(eof("persistent block"))?;
        for _ in 0..identity_count {
            let id = read_identity(&mut block, width).map_err(eof("persistent identity"))?;
            let record_count = block
                .read_u32::<LittleEndian>()
                .map_err(eof("persistent identity"))?;
            let mut records = Vec::with_capacity(record_count.min(1024) as usize);
            for _ in 0..record_count {
                let timestamp = block
                    .read_f32::<LittleEndian>()
                    .map_err(eof("persistent record"))?;
                let len = block
                    .read_u32::<LittleEndian>()
                    .map_err(eof("persistent record"))?;
                let mut data = ByteBuffer::new();
                data.load_from(&mut block, len as usize)
                    .map_err(eof("persistent record"))?;
                records.push(PersistentRecord { timestamp, data });
            }
            records.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
            store.records.insert(id, records);
        }
        Ok(store)
    }
}
