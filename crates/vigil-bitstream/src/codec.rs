//! Codec identification and NAL unit classification.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BitstreamError;

/// Video codec carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// No packets seen yet.
    #[default]
    Unknown,
    /// H.264 / AVC.
    H264,
    /// H.265 / HEVC.
    H265,
}

/// Codec-independent category of a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbstractNaluType {
    /// Anything not covered below (SEI, AUD, filler, ...).
    Other,
    /// Parameter sets required before decoding (VPS, SPS, PPS).
    EssentialMetadata,
    /// Independently decodable picture (IDR).
    Keyframe,
    /// Picture that depends on earlier pictures.
    InterFrame,
}

/// H.264 NAL unit types. The type is the low 5 bits of the header byte.
pub mod h264 {
    /// Coded slice of a non-IDR picture.
    pub const NON_IDR_SLICE: u8 = 1;
    /// Coded slice of an IDR picture.
    pub const IDR_SLICE: u8 = 5;
    /// Supplemental enhancement information.
    pub const SEI: u8 = 6;
    /// Sequence parameter set.
    pub const SPS: u8 = 7;
    /// Picture parameter set.
    pub const PPS: u8 = 8;
    /// Access unit delimiter.
    pub const AUD: u8 = 9;

    /// Access unit delimiter NAL unit with `primary_pic_type` = any slice type.
    pub const AUD_NALU: [u8; 2] = [0x09, 0xF0];

    /// Extract the NAL unit type from a header byte.
    pub const fn nalu_type(header: u8) -> u8 {
        header & 0x1F
    }
}

/// H.265 NAL unit types. The type is bits 1-6 of the first header byte.
pub mod h265 {
    /// Last trailing/leading picture type that is not an IRAP.
    pub const MAX_INTER_FRAME: u8 = 9;
    /// IDR picture that may have RADL pictures.
    pub const IDR_W_RADL: u8 = 19;
    /// IDR picture without leading pictures.
    pub const IDR_N_LP: u8 = 20;
    /// Video parameter set.
    pub const VPS: u8 = 32;
    /// Sequence parameter set.
    pub const SPS: u8 = 33;
    /// Picture parameter set.
    pub const PPS: u8 = 34;
    /// Access unit delimiter.
    pub const AUD: u8 = 35;

    /// Access unit delimiter NAL unit: two header bytes plus `pic_type` = 2.
    pub const AUD_NALU: [u8; 3] = [0x46, 0x01, 0x50];

    /// Extract the NAL unit type from the first header byte.
    pub const fn nalu_type(header: u8) -> u8 {
        (header >> 1) & 0x3F
    }
}

impl Codec {
    /// NAL unit type of a header byte, per this codec's layout.
    pub fn nalu_type(self, header: u8) -> u8 {
        match self {
            Self::H265 => h265::nalu_type(header),
            Self::H264 | Self::Unknown => h264::nalu_type(header),
        }
    }

    /// Classify a NAL unit type of this codec.
    pub fn abstract_type(self, nalu_type: u8) -> AbstractNaluType {
        match self {
            Self::H264 => match nalu_type {
                h264::SPS | h264::PPS => AbstractNaluType::EssentialMetadata,
                h264::IDR_SLICE => AbstractNaluType::Keyframe,
                h264::NON_IDR_SLICE => AbstractNaluType::InterFrame,
                _ => AbstractNaluType::Other,
            },
            Self::H265 => match nalu_type {
                h265::VPS | h265::SPS | h265::PPS => AbstractNaluType::EssentialMetadata,
                h265::IDR_W_RADL | h265::IDR_N_LP => AbstractNaluType::Keyframe,
                0..=h265::MAX_INTER_FRAME => AbstractNaluType::InterFrame,
                _ => AbstractNaluType::Other,
            },
            Self::Unknown => AbstractNaluType::Other,
        }
    }

    /// Type of the sequence parameter set.
    pub fn sps_type(self) -> Option<u8> {
        match self {
            Self::H264 => Some(h264::SPS),
            Self::H265 => Some(h265::SPS),
            Self::Unknown => None,
        }
    }

    /// Types that must be present before the first keyframe can be decoded.
    pub fn parameter_set_types(self) -> &'static [u8] {
        match self {
            Self::H264 => &[h264::SPS, h264::PPS],
            Self::H265 => &[h265::VPS, h265::SPS, h265::PPS],
            Self::Unknown => &[],
        }
    }

    /// Type of the access unit delimiter.
    pub fn aud_type(self) -> Option<u8> {
        match self {
            Self::H264 => Some(h264::AUD),
            Self::H265 => Some(h265::AUD),
            Self::Unknown => None,
        }
    }

    /// Name understood by common muxers and decoders.
    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "hevc",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("H264"),
            Self::H265 => f.write_str("H265"),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

impl FromStr for Codec {
    type Err = BitstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Self::H264),
            "h265" | "hevc" => Ok(Self::H265),
            _ => Err(BitstreamError::UnknownCodecName(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_classification() {
        let codec = Codec::H264;
        assert_eq!(codec.nalu_type(0x67), h264::SPS);
        assert_eq!(codec.nalu_type(0x65), h264::IDR_SLICE);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x67)), AbstractNaluType::EssentialMetadata);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x68)), AbstractNaluType::EssentialMetadata);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x65)), AbstractNaluType::Keyframe);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x41)), AbstractNaluType::InterFrame);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x06)), AbstractNaluType::Other);
    }

    #[test]
    fn test_h265_classification() {
        let codec = Codec::H265;
        assert_eq!(codec.nalu_type(0x40), h265::VPS);
        assert_eq!(codec.nalu_type(0x42), h265::SPS);
        assert_eq!(codec.nalu_type(0x26), h265::IDR_W_RADL);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x44)), AbstractNaluType::EssentialMetadata);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x28)), AbstractNaluType::Keyframe);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x02)), AbstractNaluType::InterFrame);
        assert_eq!(codec.abstract_type(codec.nalu_type(0x4E)), AbstractNaluType::Other);
    }

    #[test]
    fn test_codec_names() {
        assert_eq!("h264".parse::<Codec>().unwrap(), Codec::H264);
        assert_eq!("H265".parse::<Codec>().unwrap(), Codec::H265);
        assert_eq!("hevc".parse::<Codec>().unwrap(), Codec::H265);
        assert!("vp9".parse::<Codec>().is_err());
        assert_eq!(Codec::H264.to_string(), "H264");
        assert_eq!(Codec::H265.name(), "hevc");
    }
}
