//! Loaded segment cache

use indexmap::IndexMap;

use crate::segment::Segment;

/// Least-recently-used map of decompressed segments
///
/// Evicted segments are returned to the caller, which hands them back to
/// the worker for recycling.
#[derive(Debug, Default)]
pub struct SegmentCache {
    /// Least recently used first
    segments: IndexMap<u32, Segment>,
    /// Zero means unbounded
    limit: usize,
}

impl SegmentCache {
    pub fn new(limit: usize) -> Self {
        Self {
            segments: IndexMap::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.segments.contains_key(&id)
    }

    /// Look up a segment without touching its recency
    pub fn peek(&self, id: u32) -> Option<&Segment> {
        self.segments.get(&id)
    }

    /// Look up a segment and mark it most recently used
    pub fn get(&mut self, id: u32) -> Option<&Segment> {
        let index = self.segments.get_index_of(&id)?;
        let last = self.segments.len() - 1;
        self.segments.move_index(index, last);
        self.segments.get_index(last).map(|(_, s)| s)
    }

    /// Insert a segment as most recently used
    ///
    /// Returns the segments pushed out, including any previous segment with
    /// the same id.
    #[must_use = "evicted segments should be recycled"]
    pub fn insert(&mut self, segment: Segment) -> Vec<Segment> {
        let mut evicted = Vec::new();
        if let Some(previous) = self.segments.shift_remove(&segment.id()) {
            evicted.push(previous);
        }
        self.segments.insert(segment.id(), segment);
        if self.limit > 0 {
            while self.segments.len() > self.limit {
                match self.segments.shift_remove_index(0) {
                    Some((_, segment)) => evicted.push(segment),
                    None => break,
                }
            }
        }
        evicted
    }

    /// Ids in recency order, least recently used first
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.segments.keys().copied()
    }

    /// Remove every segment
    pub fn drain(&mut self) -> Vec<Segment> {
        self.segments.drain(..).map(|(_, s)| s).collect()
    }
}
