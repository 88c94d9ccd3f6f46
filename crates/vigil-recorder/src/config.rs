//! Recorder configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_ringbuffer::{ExtractMode, FullChannelPolicy};

use crate::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_WRITE_WARNING_INTERVAL, NOT_READY_WARNING_ATTEMPT};

/// Retry schedule while waiting for a keyframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay of the first retry before growth is applied.
    pub base_delay: Duration,

    /// Growth factor per attempt.
    pub multiplier: f64,

    /// Attempt count after which the delay stops growing.
    pub max_exponent: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 1.5,
            max_exponent: 7,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt. The first attempt is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.min(self.max_exponent) as i32);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// History to write before the live feed.
    pub include_history: Duration,

    /// Capacity of the live packet channel.
    pub channel_capacity: usize,

    /// Policy of the live listener when the channel is full.
    pub listener_policy: FullChannelPolicy,

    /// Whether a short history is acceptable.
    pub extract_mode: ExtractMode,

    /// Retry schedule while waiting for a keyframe.
    pub backoff: BackoffPolicy,

    /// Minimum interval between archive write warnings.
    pub write_warning_interval: Duration,

    /// Attempt at which "not ready" is logged as a warning.
    pub not_ready_warning_attempt: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            include_history: Duration::from_secs(5),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            listener_policy: FullChannelPolicy::Drop,
            extract_mode: ExtractMode::BestEffort,
            backoff: BackoffPolicy::default(),
            write_warning_interval: DEFAULT_WRITE_WARNING_INTERVAL,
            not_ready_warning_attempt: NOT_READY_WARNING_ATTEMPT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(450));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_nanos(3_417_187_500));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(8), policy.delay_for_attempt(7));
        assert_eq!(policy.delay_for_attempt(u32::MAX), policy.delay_for_attempt(7));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: RecorderConfig =
            serde_json::from_str(r#"{ "channel_capacity": 64, "listener_policy": "stall" }"#).unwrap();

        assert_eq!(config.channel_capacity, 64);
        assert_eq!(config.listener_policy, FullChannelPolicy::Stall);
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert_eq!(config.include_history, Duration::from_secs(5));
    }
}
