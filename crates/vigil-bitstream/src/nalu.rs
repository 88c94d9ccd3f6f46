//! NAL unit payload with its framing state.

use bytes::{BufMut, Bytes, BytesMut};

use crate::annexb::{decode_annexb, encode_annexb, start_code_len, StartCode};
use crate::codec::{AbstractNaluType, Codec};
use crate::BitstreamResult;

/// Type byte reported for an empty H.265 NAL unit. H.265 types only use 6
/// bits, so this never collides with a real type.
const H265_EMPTY_TYPE: u8 = 255;

/// A single NAL unit.
///
/// When `payload_is_annexb` is false the payload is raw RBSP without a start
/// code. Otherwise it is escaped and may carry a 3 or 4 byte start code.
///
/// `Clone` shares the payload buffer; use [`Nalu::deep_clone`] for a copy
/// that does not alias the original allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nalu {
    /// Payload bytes, possibly prefixed by a start code.
    pub payload: Bytes,

    /// The payload is escaped with emulation-prevention bytes.
    pub payload_is_annexb: bool,

    /// The payload is Annex-B but contains no emulation-prevention bytes,
    /// so unescaping can be skipped.
    pub payload_has_no_escapes: bool,
}

impl Nalu {
    /// Wrap a raw RBSP payload.
    pub fn from_rbsp(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            payload_is_annexb: false,
            payload_has_no_escapes: false,
        }
    }

    /// Wrap an escaped payload, with or without start code.
    pub fn from_annexb(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            payload_is_annexb: true,
            payload_has_no_escapes: false,
        }
    }

    /// Copy of this NAL unit backed by its own allocation.
    pub fn deep_clone(&self) -> Self {
        Self {
            payload: Bytes::copy_from_slice(&self.payload),
            ..*self
        }
    }

    /// Length of the start code at the front of the payload.
    pub fn start_code_len(&self) -> usize {
        start_code_len(&self.payload)
    }

    /// Payload without its start code.
    pub fn payload_only(&self) -> &[u8] {
        &self.payload[self.start_code_len()..]
    }

    /// Annex-B encoded and starting with a start code.
    pub fn is_annexb_with_start_code(&self) -> bool {
        self.payload_is_annexb && self.start_code_len() != 0
    }

    /// Raw RBSP without a start code.
    pub fn is_rbsp_without_start_code(&self) -> bool {
        !self.payload_is_annexb && self.start_code_len() == 0
    }

    /// Annex-B form of this NAL unit, always with a start code.
    ///
    /// An already escaped payload is never escaped again; at most a 3 byte
    /// start code is added.
    pub fn as_annexb(&self) -> BitstreamResult<Nalu> {
        if self.payload_is_annexb {
            if self.start_code_len() != 0 {
                return Ok(self.clone());
            }
            let mut buf = BytesMut::with_capacity(StartCode::Short.len() + self.payload.len());
            buf.put_slice(StartCode::Short.bytes());
            buf.put_slice(&self.payload);
            return Ok(Nalu {
                payload: buf.freeze(),
                payload_is_annexb: true,
                payload_has_no_escapes: self.payload_has_no_escapes,
            });
        }

        let raw = self.payload_only();
        let encoded = encode_annexb(raw, StartCode::Short, true)?;
        let payload_has_no_escapes = encoded.len() == raw.len() + StartCode::Short.len();
        Ok(Nalu {
            payload: Bytes::from(encoded),
            payload_is_annexb: true,
            payload_has_no_escapes,
        })
    }

    /// RBSP form of this NAL unit, without a start code.
    ///
    /// Shares the payload buffer when no unescaping is needed.
    pub fn as_rbsp(&self) -> Nalu {
        let body = self.payload.slice(self.start_code_len()..);
        let payload = if self.payload_is_annexb && !self.payload_has_no_escapes {
            Bytes::from(decode_annexb(&body))
        } else {
            body
        };
        Nalu::from_rbsp(payload)
    }

    /// Codec-specific type of this NAL unit.
    ///
    /// An empty payload reports 0 for H.264 (unspecified) and 255 for H.265.
    pub fn type_byte(&self, codec: Codec) -> u8 {
        match self.payload_only().first() {
            Some(&header) => codec.nalu_type(header),
            None if codec == Codec::H265 => H265_EMPTY_TYPE,
            None => 0,
        }
    }

    /// Codec-independent category of this NAL unit.
    pub fn abstract_type(&self, codec: Codec) -> AbstractNaluType {
        if self.payload_only().is_empty() {
            return AbstractNaluType::Other;
        }
        codec.abstract_type(self.type_byte(codec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264;

    #[test]
    fn test_as_annexb_escapes_rbsp() {
        let nalu = Nalu::from_rbsp(vec![0x65, 0x00, 0x00, 0x01, 0x22]);
        let annexb = nalu.as_annexb().unwrap();
        assert!(annexb.payload_is_annexb);
        assert!(!annexb.payload_has_no_escapes);
        assert_eq!(annexb.payload.as_ref(), &[0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x03, 0x01, 0x22]);
    }

    #[test]
    fn test_as_annexb_marks_escape_free_payloads() {
        let annexb = Nalu::from_rbsp(vec![0x65, 0x88, 0x84]).as_annexb().unwrap();
        assert!(annexb.payload_has_no_escapes);
        assert_eq!(annexb.as_rbsp().payload.as_ref(), &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_as_annexb_is_idempotent() {
        let inputs = [
            Nalu::from_rbsp(vec![0x65, 0x00, 0x00, 0x00, 0x00, 0x03]),
            Nalu::from_annexb(vec![0x65, 0x00, 0x00, 0x03, 0x01]),
            Nalu::from_annexb(vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x03, 0x01]),
            Nalu::from_rbsp(Vec::new()),
        ];
        for nalu in inputs {
            let once = nalu.as_annexb().unwrap();
            let twice = once.as_annexb().unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_as_annexb_keeps_existing_start_code() {
        let nalu = Nalu::from_annexb(vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
        let annexb = nalu.as_annexb().unwrap();
        assert_eq!(annexb.payload.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
        assert_eq!(annexb.start_code_len(), 4);
    }

    #[test]
    fn test_as_rbsp_unescapes_and_strips_start_code() {
        let nalu = Nalu::from_annexb(vec![0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x03, 0x01]);
        let rbsp = nalu.as_rbsp();
        assert!(rbsp.is_rbsp_without_start_code());
        assert_eq!(rbsp.payload.as_ref(), &[0x65, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_as_rbsp_zero_copy_when_escape_free() {
        let annexb = Nalu::from_rbsp(vec![0x41, 0x9A, 0x20]).as_annexb().unwrap();
        let rbsp = annexb.as_rbsp();
        assert_eq!(rbsp.payload.as_ptr(), annexb.payload[3..].as_ptr());
    }

    #[test]
    fn test_deep_clone_does_not_alias() {
        let nalu = Nalu::from_rbsp(vec![0x65, 0x01]);
        let shallow = nalu.clone();
        let deep = nalu.deep_clone();
        assert_eq!(shallow.payload.as_ptr(), nalu.payload.as_ptr());
        assert_ne!(deep.payload.as_ptr(), nalu.payload.as_ptr());
        assert_eq!(deep, nalu);
    }

    #[test]
    fn test_type_byte() {
        let sps = Nalu::from_annexb(vec![0x00, 0x00, 0x01, 0x67, 0x42]);
        assert_eq!(sps.type_byte(Codec::H264), h264::SPS);
        assert_eq!(sps.abstract_type(Codec::H264), AbstractNaluType::EssentialMetadata);

        let empty = Nalu::from_annexb(vec![0x00, 0x00, 0x01]);
        assert_eq!(empty.type_byte(Codec::H264), 0);
        assert_eq!(empty.type_byte(Codec::H265), 255);
        assert_eq!(empty.abstract_type(Codec::H265), AbstractNaluType::Other);
    }
}
