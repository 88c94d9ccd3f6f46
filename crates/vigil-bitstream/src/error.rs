//! Error types for the bitstream module.

use thiserror::Error;

use crate::codec::Codec;

/// Errors that can occur while framing or parsing NAL units.
#[derive(Debug, Error)]
pub enum BitstreamError {
    /// A worst-case sized buffer was still too small, or some other internal
    /// guarantee did not hold. Callers must treat this as fatal.
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    /// The NAL unit has no payload after its start code.
    #[error("Empty NAL unit")]
    EmptyNalu,

    /// The parameter set ended before all required fields were read.
    #[error("Parameter set truncated while reading {0}")]
    Truncated(&'static str),

    /// The parameter set contains a value outside its legal range.
    #[error("Malformed parameter set: {0}")]
    MalformedParameterSet(String),

    /// The codec has no parser for the requested operation.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(Codec),

    /// The codec name could not be recognised.
    #[error("Unknown codec name: {0}")]
    UnknownCodecName(String),
}

impl BitstreamError {
    /// Whether this error signals a broken internal guarantee rather than bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolated(_))
    }
}
