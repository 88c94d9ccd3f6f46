//! Event and continuous recording on top of a [`VideoRingBuffer`].
//!
//! A [`VideoRecorder`] waits until the ring buffer holds a decodable
//! keyframe, writes that history to an [`ArchiveSink`], and then follows
//! the live feed until stopped.
//!
//! [`VideoRingBuffer`]: vigil_ringbuffer::VideoRingBuffer

pub mod archive;
mod config;
mod error;
mod recorder;

use std::time::Duration;

pub use archive::{ArchiveNalu, ArchiveSink, MemoryArchive, NaluFlags, TrackPayload, VIDEO_TRACK};
pub use config::{BackoffPolicy, RecorderConfig};
pub use error::RecorderError;
pub use recorder::{RecorderState, RecorderStats, VideoRecorder};

/// Capacity of the recorder's live packet channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Minimum interval between archive write warnings.
pub const DEFAULT_WRITE_WARNING_INTERVAL: Duration = Duration::from_secs(30);

/// Attempt at which "not ready" is logged as a warning instead of debug.
pub const NOT_READY_WARNING_ATTEMPT: u32 = 5;

/// Result type for recorder operations.
pub type RecorderResult<T> = Result<T, RecorderError>;
