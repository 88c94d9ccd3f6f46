//! Decoder boundary used for thumbnail extraction.

use crate::packet::VideoPacket;

/// A video decoder supplied by the caller.
///
/// Decoders are stateful: packets must be fed in decode order starting at
/// a keyframe, and a decoder may need several packets before it yields its
/// first frame.
pub trait FrameDecoder {
    /// Decoded picture type, e.g. an RGB image.
    type Frame;

    /// Feed one packet. Returns `Ok(None)` when the decoder needs more input.
    fn decode(&mut self, packet: &VideoPacket) -> anyhow::Result<Option<Self::Frame>>;
}
