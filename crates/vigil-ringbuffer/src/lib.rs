//! Video history ring buffer.
//!
//! [`VideoRingBuffer`] keeps the most recent packets of a camera stream
//! under a byte budget and fans every new packet out to registered
//! listeners. Holding a [`RingBufferGuard`] while extracting history and
//! registering a listener gives a consumer a gap-free handoff from the
//! stored history to the live feed.

mod buffer;
mod config;
mod error;
mod listener;
pub mod lock_order;
mod rate_limit;
mod ring;

use std::time::Duration;

pub use buffer::{RingBufferGuard, VideoRingBuffer};
pub use config::{ExtractMethod, ExtractMode, FullChannelPolicy, RingBufferConfig};
pub use error::RingBufferError;
pub use listener::ListenerStats;
pub use rate_limit::RateLimitedLog;
pub use ring::{PushOutcome, WeightedRing};

/// Default byte budget of a ring buffer.
pub const DEFAULT_MAX_WEIGHT_BYTES: usize = 16 * 1024 * 1024;

/// Minimum interval between "listener full" warnings for one listener.
pub const DEFAULT_DROP_WARNING_INTERVAL: Duration = Duration::from_secs(3);

/// How often a stalled delivery re-checks whether its listener was removed.
pub const STALL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result type for ring buffer operations.
pub type RingBufferResult<T> = Result<T, RingBufferError>;
