//! Reel stream format (.nreel)
//!
//! A stream is written front to back while recording; the header is
//! rewritten in place at commit once every offset is known.
//!
//! # File Structure
//!
//! ```text
//! +-------------------------------------------------+
//! | Header (48 bytes, 40 in version 1)              |
//! |  magic "NREL", version: u16, identity_width: u8 |
//! |  flags: u8, memory_size: u64, duration: f32     |
//! |  snapshot_count: u32, table_offset: u64         |
//! |  persistent_offset: u64, metadata_offset: u64   |
//! +-------------------------------------------------+
//! | Segment blocks, back to back                    |
//! |  [id: u32][compressed: u8][count: u16]          |
//! |  count x snapshot                               |
//! +-------------------------------------------------+
//! | Segment table                                   |
//! +-------------------------------------------------+
//! | Persistent block (length-prefixed)              |
//! +-------------------------------------------------+
//! | Metadata block (length-prefixed JSON)           |
//! +-------------------------------------------------+
//! ```
//!
//! All integers and floats are little-endian.

pub mod codec;
mod header;
mod table;

pub use header::{StreamFlags, StreamHeader};
pub use table::{SEGMENT_ENTRY_SIZE, SegmentEntry, SegmentTable};

/// Magic bytes at the start of every stream
pub const MAGIC: [u8; 4] = *b"NREL";

/// Current format version
///
/// Version 2 added the metadata block.
pub const FORMAT_VERSION: u16 = 2;

/// Header size for the current version
pub const HEADER_SIZE: usize = 48;

/// Header size for version 1 streams (no metadata offset)
pub const HEADER_SIZE_V1: usize = 40;

/// Storable tag for an inline state buffer
pub const STORABLE_STATE: u8 = 0;

/// Storable tag for a back-reference
pub const STORABLE_POINTER: u8 = 1;
