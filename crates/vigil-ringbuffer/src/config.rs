//! Ring buffer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_DROP_WARNING_INTERVAL, DEFAULT_MAX_WEIGHT_BYTES};

/// Ring buffer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingBufferConfig {
    /// Byte budget across all stored packets.
    pub max_weight_bytes: usize,

    /// Minimum interval between drop warnings for one listener.
    pub drop_warning_interval: Duration,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            max_weight_bytes: DEFAULT_MAX_WEIGHT_BYTES,
            drop_warning_interval: DEFAULT_DROP_WARNING_INTERVAL,
        }
    }
}

/// What happens when a listener's channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullChannelPolicy {
    /// Skip the packet for this listener and count it as dropped.
    #[default]
    Drop,
    /// Block the producer until the listener makes room.
    Stall,
}

/// How extracted packets relate to the buffer's own storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMethod {
    /// Share the stored packets.
    #[default]
    ShallowClone,
    /// Copy every payload.
    DeepClone,
    /// Empty the buffer, discarding anything older than the window.
    Drain,
}

/// Behavior when the buffer cannot cover the requested duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    /// Return the longest available window and log a warning.
    #[default]
    BestEffort,
    /// Fail with `InsufficientHistory`.
    Strict,
}
