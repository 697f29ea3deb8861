//! Instance pools
//!
//! Recording allocates a buffer per object per frame and a snapshot per
//! frame; pooling them keeps the capture path allocation-free once warm.
//!
//! Pools are not thread-safe. Each side of the storage pipeline owns its own
//! [`PoolRegistry`]: the producer recycles what it still owns, and the worker
//! recycles segments after they have been handed off to it. Instances only
//! ever cross between the two by being moved, as a [`Recycled`] batch.

use std::sync::Arc;

use crate::buffer::ByteBuffer;
use crate::segment::Segment;
use crate::snapshot::{Snapshot, Storable};

/// Default number of free instances a pool retains
pub const DEFAULT_POOL_RETAIN: usize = 64;

/// A type that can be recycled through a [`Pool`]
pub trait Poolable: Default {
    /// Clear the instance before it enters the free list
    ///
    /// After this, [`is_pooled`](Poolable::is_pooled) must return true.
    fn reset(&mut self);

    /// Prepare a recycled instance for reuse
    fn revive(&mut self);

    /// Check if the instance is currently sitting in a free list
    fn is_pooled(&self) -> bool;
}

/// Free list of reusable instances
pub struct Pool<T: Poolable> {
    name: &'static str,
    free: Vec<T>,
    retain: usize,
    created: usize,
    reused: usize,
}

impl<T: Poolable> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("available", &self.free.len())
            .field("created", &self.created)
            .field("reused", &self.reused)
            .finish()
    }
}

impl<T: Poolable> Pool<T> {
    /// Create an empty pool keeping at most `retain` free instances
    pub fn new(name: &'static str, retain: usize) -> Self {
        Self {
            name,
            free: Vec::new(),
            retain,
            created: 0,
            reused: 0,
        }
    }

    /// Take a recycled instance, or construct a new one
    pub fn acquire(&mut self) -> T {
        match self.free.pop() {
            Some(mut item) => {
                item.revive();
                self.reused += 1;
                item
            }
            None => {
                self.created += 1;
                T::default()
            }
        }
    }

    /// Return an instance to the free list
    ///
    /// Instances beyond the retain limit are dropped.
    pub fn release(&mut self, mut item: T) {
        debug_assert!(
            !item.is_pooled(),
            "{} pool: instance released twice without being re-acquired",
            self.name
        );
        item.reset();
        if self.free.len() < self.retain {
            self.free.push(item);
        }
    }

    /// Number of free instances
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of instances constructed because the free list was empty
    pub fn created(&self) -> usize {
        self.created
    }

    /// Number of acquisitions served from the free list
    pub fn reused(&self) -> usize {
        self.reused
    }

    /// Drop every free instance
    pub fn clear(&mut self) {
        self.free.clear();
    }

    /// Move every free instance out of the pool
    pub fn take_free(&mut self) -> Vec<T> {
        std::mem::take(&mut self.free)
    }

    /// Adopt instances freed by another pool, up to the retain limit
    pub fn restock(&mut self, items: Vec<T>) {
        let room = self.retain.saturating_sub(self.free.len());
        self.free
            .extend(items.into_iter().filter(|item| item.is_pooled()).take(room));
    }
}

/// Free instances in transit between two registries
#[derive(Debug, Default)]
pub struct Recycled {
    pub buffers: Vec<ByteBuffer>,
    pub snapshots: Vec<Snapshot>,
    pub segments: Vec<Segment>,
}

impl Recycled {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.snapshots.is_empty() && self.segments.is_empty()
    }

    /// Add `other`, keeping at most `limit` instances of each type
    pub fn merge(&mut self, other: Recycled, limit: usize) {
        fn top_up<T>(into: &mut Vec<T>, from: Vec<T>, limit: usize) {
            let room = limit.saturating_sub(into.len());
            into.extend(from.into_iter().take(room));
        }
        top_up(&mut self.buffers, other.buffers, limit);
        top_up(&mut self.snapshots, other.snapshots, limit);
        top_up(&mut self.segments, other.segments, limit);
    }
}

/// Pools for every recyclable storage type
///
/// Releasing a segment cascades into its snapshots, and releasing a snapshot
/// cascades into the state buffers it solely owns.
#[derive(Debug)]
pub struct PoolRegistry {
    buffers: Pool<ByteBuffer>,
    snapshots: Pool<Snapshot>,
    segments: Pool<Segment>,
}

impl PoolRegistry {
    pub fn new(retain: usize) -> Self {
        Self {
            buffers: Pool::new("buffer", retain),
            snapshots: Pool::new("snapshot", retain),
            segments: Pool::new("segment", retain.min(16)),
        }
    }

    pub fn buffers(&self) -> &Pool<ByteBuffer> {
        &self.buffers
    }

    pub fn snapshots(&self) -> &Pool<Snapshot> {
        &self.snapshots
    }

    pub fn segments(&self) -> &Pool<Segment> {
        &self.segments
    }

    /// Get an empty state buffer
    pub fn acquire_buffer(&mut self) -> ByteBuffer {
        self.buffers.acquire()
    }

    pub fn release_buffer(&mut self, buffer: ByteBuffer) {
        self.buffers.release(buffer);
    }

    /// Get an empty snapshot stamped with `timestamp` and `sequence`
    pub fn acquire_snapshot(&mut self, timestamp: f32, sequence: u32) -> Snapshot {
        let mut snapshot = self.snapshots.acquire();
        snapshot.stamp(timestamp, sequence);
        snapshot
    }

    /// Recycle a snapshot and every state buffer no other snapshot shares
    pub fn release_snapshot(&mut self, mut snapshot: Snapshot) {
        for storable in snapshot.drain_entries() {
            if let Storable::State(state) = storable
                && let Ok(buffer) = Arc::try_unwrap(state)
            {
                self.buffers.release(buffer);
            }
        }
        self.snapshots.release(snapshot);
    }

    /// Get an empty segment
    pub fn acquire_segment(&mut self, id: u32, capacity: u16) -> Segment {
        let mut segment = self.segments.acquire();
        segment.assign(id, capacity);
        segment
    }

    /// Recycle a segment along with its snapshots
    ///
    /// A buffer shared by several decompressed snapshots reaches the pool
    /// when its last alias is released.
    pub fn release_segment(&mut self, mut segment: Segment) {
        for snapshot in segment.drain_snapshots() {
            self.release_snapshot(snapshot);
        }
        self.segments.release(segment);
    }

    /// Move every free instance out, ready for [`restock`](Self::restock)
    pub fn take_free(&mut self) -> Recycled {
        Recycled {
            buffers: self.buffers.take_free(),
            snapshots: self.snapshots.take_free(),
            segments: self.segments.take_free(),
        }
    }

    /// Adopt instances freed by another registry
    pub fn restock(&mut self, recycled: Recycled) {
        self.buffers.restock(recycled.buffers);
        self.snapshots.restock(recycled.snapshots);
        self.segments.restock(recycled.segments);
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_RETAIN)
    }
}
