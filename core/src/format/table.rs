//! Segment table
//!
//! Seek index written at commit: one fixed-width entry per segment, in
//! segment order, mapping sequence and time ranges to stream offsets.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{FormatError, Result, StorageError};

/// Encoded size of one entry
pub const SEGMENT_ENTRY_SIZE: usize = 28;

/// Location and range of one segment block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentEntry {
    pub segment_id: u32,
    pub start_sequence: u32,
    pub end_sequence: u32,
    pub start_time: f32,
    pub end_time: f32,
    /// Byte offset of the segment block from the start of the stream
    pub offset: u64,
}

impl SegmentEntry {
    pub fn contains_sequence(&self, sequence: u32) -> bool {
        (self.start_sequence..=self.end_sequence).contains(&sequence)
    }

    /// Number of sequence ids covered, assuming no gaps
    pub fn span(&self) -> u32 {
        self.end_sequence - self.start_sequence + 1
    }
}

/// Ordered, contiguous list of segment entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentTable {
    entries: Vec<SegmentEntry>,
}

impl SegmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<&SegmentEntry> {
        self.entries.first()
    }

    pub fn last(&self) -> Option<&SegmentEntry> {
        self.entries.last()
    }

    pub fn get(&self, index: usize) -> Option<&SegmentEntry> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SegmentEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Append an entry, which must follow the last one
    pub fn push(&mut self, entry: SegmentEntry) -> Result<()> {
        if let Some(last) = self.entries.last() {
            check_follows(last, &entry)?;
        }
        check_entry(&entry)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Entry whose sequence range contains `sequence`
    pub fn find_by_sequence(&self, sequence: u32) -> Option<&SegmentEntry> {
        let index = self.entries.partition_point(|e| e.end_sequence < sequence);
        self.entries
            .get(index)
            .filter(|e| e.contains_sequence(sequence))
    }

    /// Entry owning the latest snapshot not after `time`
    ///
    /// Times before the first segment clamp to the first entry.
    pub fn find_by_time(&self, time: f32) -> Option<&SegmentEntry> {
        let index = self.entries.partition_point(|e| e.start_time <= time);
        self.entries.get(index.saturating_sub(1))
    }

    /// Entry stored right after the segment `segment_id`
    pub fn following(&self, segment_id: u32) -> Option<&SegmentEntry> {
        let index = self.entries.iter().position(|e| e.segment_id == segment_id)?;
        self.entries.get(index + 1)
    }

    /// Entries whose time range overlaps `start..=end`
    pub fn overlapping(&self, start: f32, end: f32) -> impl Iterator<Item = &SegmentEntry> {
        self.entries
            .iter()
            .filter(move |e| e.end_time >= start && e.start_time <= end)
    }

    /// Check ordering and contiguity of every entry
    pub fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            check_entry(entry)?;
        }
        for pair in self.entries.windows(2) {
            check_follows(&pair[0], &pair[1])?;
        }
        Ok(())
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let mut bytes = Vec::with_capacity(4 + self.entries.len() * SEGMENT_ENTRY_SIZE);
        bytes.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            bytes.write_u32::<LittleEndian>(entry.segment_id)?;
            bytes.write_u32::<LittleEndian>(entry.start_sequence)?;
            bytes.write_u32::<LittleEndian>(entry.end_sequence)?;
            bytes.write_f32::<LittleEndian>(entry.start_time)?;
            bytes.write_f32::<LittleEndian>(entry.end_time)?;
            bytes.write_u64::<LittleEndian>(entry.offset)?;
        }
        w.write_all(&bytes)?;
        Ok(())
    }

    /// Read and validate a table
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let eof = StorageError::decoding;
        let count = r.read_u32::<LittleEndian>().map_err(eof("segment table"))?;
        let mut entries = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            entries.push(SegmentEntry {
                segment_id: r.read_u32::<LittleEndian>().map_err(eof("segment table"))?,
                start_sequence: r.read_u32::<LittleEndian>().map_err(eof("segment table"))?,
                end_sequence: r.read_u32::<LittleEndian>().map_err(eof("segment table"))?,
                start_time: r.read_f32::<LittleEndian>().map_err(eof("segment table"))?,
                end_time: r.read_f32::<LittleEndian>().map_err(eof("segment table"))?,
                offset: r.read_u64::<LittleEndian>().map_err(eof("segment table"))?,
            });
        }
        let table = Self { entries };
        table.validate()?;
        Ok(table)
    }
}

fn check_entry(entry: &SegmentEntry) -> Result<()> {
    if entry.end_sequence < entry.start_sequence || entry.end_time < entry.start_time {
        return Err(FormatError::InvalidTable(format!(
            "segment {} has an inverted range",
            entry.segment_id
        ))
        .into());
    }
    Ok(())
}

fn check_follows(previous: &SegmentEntry, next: &SegmentEntry) -> Result<()> {
    if next.segment_id != previous.segment_id.wrapping_add(1) {
        return Err(FormatError::InvalidTable(format!(
            "segment {} follows segment {}",
            next.segment_id, previous.segment_id
        ))
        .into());
    }
    if next.start_sequence <= previous.end_sequence {
        return Err(FormatError::InvalidTable(format!(
            "segment {} starts at sequence {} but segment {} ends at {}",
            next.segment_id, next.start_sequence, previous.segment_id, previous.end_sequence
        ))
        .into());
    }
    if next.start_time < previous.end_time {
        return Err(FormatError::InvalidTable(format!(
            "segment {} starts at {}s but segment {} ends at {}s",
            next.segment_id, next.start_time, previous.segment_id, previous.end_time
        ))
        .into());
    }
    if next.offset <= previous.offset {
        return Err(FormatError::InvalidTable(format!(
            "segment {} is stored before segment {}",
            next.segment_id, previous.segment_id
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(segment_id: u32, start: u32, end: u32) -> SegmentEntry {
        SegmentEntry {
            segment_id,
            start_sequence: start,
            end_sequence: end,
            start_time: (start - 1) as f32,
            end_time: (end - 1) as f32,
            offset: 48 + segment_id as u64 * 1000,
        }
    }

    fn table() -> SegmentTable {
        let mut table = SegmentTable::new();
        table.push(entry(0, 1, 30)).unwrap();
        table.push(entry(1, 31, 60)).unwrap();
        table.push(entry(2, 61, 65)).unwrap();
        table
    }

    #[test]
    fn test_find_by_sequence() {
        let table = table();
        assert_eq!(table.find_by_sequence(1).unwrap().segment_id, 0);
        assert_eq!(table.find_by_sequence(30).unwrap().segment_id, 0);
        assert_eq!(table.find_by_sequence(31).unwrap().segment_id, 1);
        assert_eq!(table.find_by_sequence(65).unwrap().segment_id, 2);
        assert!(table.find_by_sequence(0).is_none());
        assert!(table.find_by_sequence(66).is_none());
    }

    #[test]
    fn test_find_by_time_clamps() {
        let table = table();
        assert_eq!(table.find_by_time(-5.0).unwrap().segment_id, 0);
        assert_eq!(table.find_by_time(29.5).unwrap().segment_id, 0);
        assert_eq!(table.find_by_time(30.0).unwrap().segment_id, 1);
        assert_eq!(table.find_by_time(1e6).unwrap().segment_id, 2);
        assert!(SegmentTable::new().find_by_time(0.0).is_none());
    }

    #[test]
    fn test_push_rejects_gaps_in_ids() {
        let mut table = table();
        let err = table.push(entry(4, 66, 70)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Format(FormatError::InvalidTable(_))
        ));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_push_rejects_overlap() {
        let mut table = table();
        assert!(table.push(entry(3, 65, 70)).is_err());
    }

    #[test]
    fn test_push_rejects_time_going_backwards() {
        let mut table = SegmentTable::new();
        table.push(SegmentEntry {
            start_time: 5.0,
            end_time: 9.0,
            ..entry(0, 1, 4)
        })
        .unwrap();
        let err = table
            .push(SegmentEntry {
                start_time: 1.0,
                end_time: 2.0,
                ..entry(1, 5, 8)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Format(FormatError::InvalidTable(_))
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find_by_time(6.0).unwrap().segment_id, 0);
    }

    #[test]
    fn test_read_rejects_time_going_backwards() {
        let table = table();
        let mut bytes = Vec::new();
        table.write_to(&mut bytes).unwrap();
        // Second entry's start_time
        let at = 4 + SEGMENT_ENTRY_SIZE + 12;
        bytes[at..at + 4].copy_from_slice(&0.5f32.to_le_bytes());
        assert!(SegmentTable::read_from(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_table_roundtrip() {
        let table = table();
        let mut bytes = Vec::new();
        table.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 4 + 3 * SEGMENT_ENTRY_SIZE);

        let parsed = SegmentTable::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, table);
    }
}
