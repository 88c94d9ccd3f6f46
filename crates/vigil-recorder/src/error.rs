//! Error types for the recorder module.

use thiserror::Error;
use vigil_bitstream::BitstreamError;
use vigil_packet::PacketError;
use vigil_ringbuffer::RingBufferError;

/// Errors that can occur while recording.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// History extraction failed.
    #[error("Ring buffer error: {0}")]
    RingBuffer(#[from] RingBufferError),

    /// The extracted history could not be analysed.
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// A NAL unit could not be converted for the archive.
    #[error("Bitstream error: {0}")]
    Bitstream(#[from] BitstreamError),

    /// The archive rejected a write.
    #[error("Archive error: {0}")]
    Archive(#[source] anyhow::Error),

    /// The recording thread could not be started.
    #[error("Thread error: {0}")]
    Thread(#[from] std::io::Error),
}

impl RecorderError {
    /// Whether this error signals a broken internal guarantee.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::RingBuffer(e) => e.is_fatal(),
            Self::Packet(e) => e.is_fatal(),
            Self::Bitstream(e) => e.is_fatal(),
            Self::Archive(_) | Self::Thread(_) => false,
        }
    }
}
