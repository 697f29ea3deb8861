//! Content hash for state buffers
//!
//! Only used as an equality pre-filter during compression; collisions are
//! possible and callers must confirm with a byte comparison.

use xxhash_rust::xxh3::xxh3_64;

/// Hash a byte slice
#[inline]
pub fn content_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}
