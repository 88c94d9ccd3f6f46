//! Bitstream framing for H.264/H.265 NAL units.
//!
//! This crate converts NAL unit payloads between their raw form (RBSP, no
//! start code, no emulation-prevention bytes) and the Annex-B form used on
//! the wire, classifies NAL units per codec, and recovers picture
//! dimensions from sequence parameter sets.

mod annexb;
mod avcc;
mod codec;
mod error;
mod nalu;
mod sps;

pub use annexb::{
    annexb_worst_size, decode_annexb, decode_annexb_into, decode_annexb_size, encode_annexb,
    encode_annexb_into, first_likely_annexb_encoded_index, split_annexb, start_code_len,
    StartCode, EMULATION_PREVENTION_BYTE,
};
pub use avcc::{build_avc_decoder_config, nals_to_avcc};
pub use codec::{h264, h265, AbstractNaluType, Codec};
pub use error::BitstreamError;
pub use nalu::Nalu;
pub use sps::{parse_h264_sps, parse_h265_sps, parse_sps};

/// Result type for bitstream operations.
pub type BitstreamResult<T> = Result<T, BitstreamError>;
