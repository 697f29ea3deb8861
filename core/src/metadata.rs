//! Stream metadata block
//!
//! Free-form, human-oriented information about a recording, stored as
//! length-prefixed JSON after the persistent block.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{FormatError, Result, StorageError};
use crate::snapshot::PrefabId;

/// Descriptive information about a recording
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Name of the recording application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    /// Recording start, in UNIX seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<u64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Human-readable names for the prefabs referenced by descriptors
    #[serde(default)]
    pub prefabs: BTreeMap<PrefabId, String>,
}

impl StreamMetadata {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: Some(application.into()),
            ..Default::default()
        }
    }

    /// Stamp the recording start with the current time
    pub fn stamp_now(&mut self) {
        self.recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn name_prefab(&mut self, prefab: PrefabId, name: impl Into<String>) {
        self.prefabs.insert(prefab, name.into());
    }

    pub fn prefab_name(&self, prefab: PrefabId) -> Option<&str> {
        self.prefabs.get(&prefab).map(String::as_str)
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let json = serde_json::to_vec(self).map_err(FormatError::Metadata)?;
        w.write_u32::<LittleEndian>(json.len() as u32)?;
        w.write_all(&json)?;
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let eof = StorageError::decoding;
        let len = r.read_u32::<LittleEndian>().map_err(eof("metadata block"))?;
        let mut json = Vec::new();
        let read = r
            .take(len as u64)
            .read_to_end(&mut json)
            .map_err(eof("metadata block"))?;
        if read < len as usize {
            return Err(FormatError::Truncated {
                context: "metadata block",
            }
            .into());
        }
        Ok(serde_json::from_slice(&json).map_err(FormatError::Metadata)?)
    }
}
