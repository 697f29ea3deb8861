//! Record and playback sessions
//!
//! Sessions drive a [`StreamStorage`](crate::storage::StreamStorage) on
//! behalf of the embedding application. Each session claims the storage
//! lock for its lifetime, so a recording and a playback can never interleave
//! on the same stream.

mod playback;
mod recorder;

pub use playback::{Playback, PlaybackFrame};
pub use recorder::{Recordable, Recorder};

/// Lock owner name used by [`Recorder`]
pub const RECORDER_LOCK: &str = "recorder";

/// Lock owner name used by [`Playback`]
pub const PLAYBACK_LOCK: &str = "playback";
