//! Configuration
//!
//! Storage, recorder and playback settings. Every field has a serde default
//! so a partial TOML file (or none at all) yields a usable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::identity::IdentityWidth;
use crate::pool::DEFAULT_POOL_RETAIN;
use crate::segment::MAX_SEGMENT_CAPACITY;

/// Top-level configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReelConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

/// Stream storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Snapshots per segment (default: 30, range: 2-256)
    #[serde(default = "default_segment_capacity")]
    pub segment_capacity: u16,
    /// Encoded identity size (default: u32)
    #[serde(default)]
    pub identity_width: IdentityWidth,
    /// Decompressed segments kept in memory during playback (default: 8, 0 = unbounded)
    #[serde(default = "default_max_cached_segments")]
    pub max_cached_segments: usize,
    /// Free instances each pool retains (default: 64)
    #[serde(default = "default_pool_retain")]
    pub pool_retain: usize,
    /// Name of the background I/O thread (default: "reel-io")
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
}

/// Recording session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Snapshots captured per second (default: 30)
    #[serde(default = "default_record_rate")]
    pub record_rate: f32,
}

/// Direction the playhead moves in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackDirection {
    #[default]
    Forward,
    Backward,
}

/// Playback session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Time scale applied to every advance (default: 1.0)
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Wrap around at either end instead of stopping (default: false)
    #[serde(default)]
    pub loop_playback: bool,
    #[serde(default)]
    pub direction: PlaybackDirection,
}

fn default_segment_capacity() -> u16 {
    30
}
fn default_max_cached_segments() -> usize {
    8
}
fn default_pool_retain() -> usize {
    DEFAULT_POOL_RETAIN
}
fn default_worker_name() -> String {
    "reel-io".to_string()
}
fn default_record_rate() -> f32 {
    30.0
}
fn default_speed() -> f32 {
    1.0
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            segment_capacity: default_segment_capacity(),
            identity_width: IdentityWidth::default(),
            max_cached_segments: default_max_cached_segments(),
            pool_retain: default_pool_retain(),
            worker_name: default_worker_name(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            record_rate: default_record_rate(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            loop_playback: false,
            direction: PlaybackDirection::default(),
        }
    }
}

impl StorageConfig {
    /// Check every field is in range
    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_SEGMENT_CAPACITY).contains(&self.segment_capacity) {
            return Err(StorageError::Config(format!(
                "segment_capacity must be between 2 and {MAX_SEGMENT_CAPACITY}, got {}",
                self.segment_capacity
            )));
        }
        if self.worker_name.is_empty() {
            return Err(StorageError::Config("worker_name must not be empty".into()));
        }
        Ok(())
    }

    /// Parse and validate a TOML document holding storage fields at top level
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.record_rate.is_finite() && self.record_rate > 0.0) {
            return Err(StorageError::Config(format!(
                "record_rate must be positive, got {}",
                self.record_rate
            )));
        }
        Ok(())
    }

    /// Seconds between captures
    pub fn interval(&self) -> f32 {
        1.0 / self.record_rate
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.speed.is_finite() && self.speed >= 0.0) {
            return Err(StorageError::Config(format!(
                "speed must be non-negative, got {}",
                self.speed
            )));
        }
        Ok(())
    }
}

impl ReelConfig {
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.recorder.validate()?;
        self.playback.validate()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.segment_capacity, 30);
        assert_eq!(config.identity_width, IdentityWidth::U32);
        assert_eq!(config.max_cached_segments, 8);
        assert_eq!(config.worker_name, "reel-io");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ReelConfig::from_toml_str(
            r#"
            [storage]
            segment_capacity = 60
            identity_width = "u16"

            [playback]
            loop_playback = true
            direction = "backward"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.segment_capacity, 60);
        assert_eq!(config.storage.identity_width, IdentityWidth::U16);
        assert_eq!(config.storage.pool_retain, DEFAULT_POOL_RETAIN);
        assert_eq!(config.recorder.record_rate, 30.0);
        assert!(config.playback.loop_playback);
        assert_eq!(config.playback.direction, PlaybackDirection::Backward);
    }

    #[test]
    fn test_capacity_range() {
        for capacity in [0, 1, 257] {
            let config = StorageConfig {
                segment_capacity: capacity,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(StorageError::Config(_))));
        }
        let config = StorageConfig {
            segment_capacity: 256,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml() {
        let err = StorageConfig::from_toml_str("segment_capacity = \"many\"").unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ReelConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ReelConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reel.toml");
        std::fs::write(&path, "[recorder]\nrecord_rate = 60.0\n").unwrap();
        let config = ReelConfig::load(&path).unwrap();
        assert_eq!(config.recorder.record_rate, 60.0);
        assert!((config.recorder.interval() - 1.0 / 60.0).abs() < 1e-6);
    }
}
