//! Error types for the packet module.

use std::path::PathBuf;

use thiserror::Error;
use vigil_bitstream::{BitstreamError, Codec};

/// Errors that can occur in packet and packet buffer operations.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The buffer holds no packets.
    #[error("Packet buffer is empty")]
    Empty,

    /// No sequence parameter set in the buffer.
    #[error("No SPS found")]
    MissingSps,

    /// A parameter set required before the first keyframe is missing.
    #[error("Missing essential metadata: {0}")]
    MissingEssentialMetadata(String),

    /// No packet in the buffer carries a keyframe.
    #[error("No keyframe found")]
    NoKeyframe,

    /// No packet between the first keyframe and the end decoded to a frame.
    #[error("No thumbnail available")]
    NoThumbnail,

    /// The operation does not support this codec.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(Codec),

    /// A dump directory entry does not follow the naming scheme.
    #[error("Invalid dump file name: {0}")]
    InvalidDumpFile(PathBuf),

    /// Framing or parameter set parsing failed.
    #[error("Bitstream error: {0}")]
    Bitstream(#[from] BitstreamError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The container writer or decoder reported a failure.
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl PacketError {
    /// Whether this error signals a broken internal guarantee.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bitstream(e) if e.is_fatal())
    }
}
