//! Container writer boundary shared by the MPEG-TS and MP4 exporters.

use std::time::Duration;

use bytes::Bytes;
use vigil_bitstream::{Codec, Nalu};

/// Stream-level parameters known before the first access unit is written.
#[derive(Debug, Clone)]
pub struct StreamParameters {
    /// Video codec.
    pub codec: Codec,

    /// Picture width in pixels.
    pub width: u32,

    /// Picture height in pixels.
    pub height: u32,

    /// Parameter sets (VPS for H.265, SPS, PPS) as escaped NAL units without
    /// start codes, in the order they must be sent to a decoder.
    pub parameter_sets: Vec<Bytes>,
}

/// One access unit handed to a container writer.
#[derive(Debug)]
pub struct AccessUnit<'a> {
    /// Presentation time relative to the start of the export.
    pub pts: Duration,

    /// NAL units in Annex-B form, each with a start code.
    pub nalus: &'a [Nalu],

    /// The access unit contains a keyframe.
    pub is_keyframe: bool,
}

/// Sink for an exported video stream.
///
/// Implementations may be in-crate muxers or bindings to an external
/// library; failures cross this boundary as `anyhow::Error`.
pub trait ContainerWriter {
    /// Called once before the first access unit.
    fn begin(&mut self, params: &StreamParameters) -> anyhow::Result<()>;

    /// Write one access unit. Timestamps are non-decreasing.
    fn write_access_unit(&mut self, unit: &AccessUnit<'_>) -> anyhow::Result<()>;

    /// Flush buffered data and write any trailer.
    fn finish(&mut self) -> anyhow::Result<()>;
}

/// Derives decode timestamps for streams without B-frame reordering.
///
/// DTS equals PTS, nudged forward by one tick whenever the input would not
/// be strictly increasing.
#[derive(Debug, Default)]
pub struct DtsExtractor {
    last: Option<u64>,
}

impl DtsExtractor {
    /// Create an extractor with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode timestamp for an access unit with presentation time `pts`,
    /// both in 90 kHz ticks.
    pub fn extract(&mut self, pts: u64) -> u64 {
        let dts = match self.last {
            Some(last) if pts <= last => last + 1,
            _ => pts,
        };
        self.last = Some(dts);
        dts
    }
}

/// Convert a duration to 90 kHz ticks.
pub fn to_90khz(d: Duration) -> u64 {
    (d.as_nanos() * 90_000 / 1_000_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dts_is_strictly_increasing() {
        let mut dts = DtsExtractor::new();
        assert_eq!(dts.extract(0), 0);
        assert_eq!(dts.extract(3000), 3000);
        assert_eq!(dts.extract(3000), 3001);
        assert_eq!(dts.extract(2000), 3002);
        assert_eq!(dts.extract(9000), 9000);
    }

    #[test]
    fn test_to_90khz() {
        assert_eq!(to_90khz(Duration::from_secs(1)), 90_000);
        assert_eq!(to_90khz(Duration::from_millis(40)), 3_600);
        assert_eq!(to_90khz(Duration::ZERO), 0);
    }
}
