//! Error types for the ring buffer module.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when extracting history from a ring buffer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    /// The buffer holds no packets.
    #[error("No video available")]
    NoVideoAvailable,

    /// The buffer holds packets but none of them is a keyframe.
    #[error("No keyframe available (buffered packets: {0})")]
    NoKeyframeAvailable(usize),

    /// Keyframes are buffered but none is preceded by its parameter sets.
    #[error("Missing essential metadata before keyframe: {0}")]
    MissingEssentialMetadata(String),

    /// Strict extraction could not cover the requested duration.
    #[error("Insufficient history: requested {requested:?}, available {available:?}")]
    InsufficientHistory {
        /// Requested history length.
        requested: Duration,
        /// Longest keyframe-anchored history in the buffer.
        available: Duration,
    },

    /// An internal guarantee was broken.
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),
}

impl RingBufferError {
    /// Whether this error signals a broken internal guarantee.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolated(_))
    }

    /// Whether the buffer may satisfy the same request once more video arrives.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Self::NoVideoAvailable | Self::NoKeyframeAvailable(_) | Self::MissingEssentialMetadata(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RingBufferError::NoVideoAvailable.is_not_ready());
        assert!(RingBufferError::NoKeyframeAvailable(3).is_not_ready());
        assert!(!RingBufferError::NoVideoAvailable.is_fatal());
        assert!(RingBufferError::InvariantViolated("drain".into()).is_fatal());

        let short = RingBufferError::InsufficientHistory {
            requested: Duration::from_secs(5),
            available: Duration::from_secs(2),
        };
        assert!(!short.is_fatal());
        assert!(!short.is_not_ready());
    }
}
