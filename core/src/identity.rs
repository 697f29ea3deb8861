//! Object identities
//!
//! An [`ObjectId`] names one observed object for the lifetime of a single
//! recording session. Identities are not stable across sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session-scoped identity of a recorded object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Create an identity from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw value
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ObjectId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Number of bytes used to encode an identity on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityWidth {
    /// 2-byte identities (up to 65535 objects per session)
    U16,
    /// 4-byte identities
    #[default]
    U32,
}

impl IdentityWidth {
    /// Encoded size in bytes
    pub const fn bytes(self) -> u8 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Parse the width byte stored in a stream header
    pub const fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            2 => Some(Self::U16),
            4 => Some(Self::U32),
            _ => None,
        }
    }

    /// Check whether `id` can be encoded at this width
    pub const fn fits(self, id: ObjectId) -> bool {
        match self {
            Self::U16 => id.0 <= u16::MAX as u32,
            Self::U32 => true,
        }
    }

}
