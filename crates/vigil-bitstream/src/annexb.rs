//! Annex-B framing.
//!
//! An Annex-B NAL unit is an optional start code (`00 00 01` or
//! `00 00 00 01`) followed by the escaped RBSP. Escaping inserts an
//! emulation-prevention byte (`0x03`) after every `00 00` pair that is
//! immediately followed by a byte `<= 0x03`, so the payload can never
//! contain something that looks like a start code.
//!
//! The encoder sizes its output in two phases: an optimistic buffer that
//! fits nearly every real NAL unit, then a worst-case buffer if the first
//! attempt ran out of room. Callers that already own a destination slice
//! can use [`encode_annexb_into`] directly and get `None` back when the
//! slice is too small instead of a reallocation.

use crate::error::BitstreamError;
use crate::BitstreamResult;

/// The byte inserted to break up a `00 00 0N` sequence.
pub const EMULATION_PREVENTION_BYTE: u8 = 0x03;

const SHORT_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];
const LONG_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Start code that prefixes an Annex-B NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StartCode {
    /// No start code.
    #[default]
    None,
    /// `00 00 01`
    Short,
    /// `00 00 00 01`
    Long,
}

impl StartCode {
    /// Detect the start code at the front of `payload`.
    pub fn detect(payload: &[u8]) -> Self {
        if payload.starts_with(&SHORT_START_CODE) {
            Self::Short
        } else if payload.starts_with(&LONG_START_CODE) {
            Self::Long
        } else {
            Self::None
        }
    }

    /// Start code for a length of 0, 3 or 4 bytes.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            0 => Some(Self::None),
            3 => Some(Self::Short),
            4 => Some(Self::Long),
            _ => None,
        }
    }

    /// Length of the start code in bytes.
    pub const fn len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Short => 3,
            Self::Long => 4,
        }
    }

    /// True for [`StartCode::None`].
    pub const fn is_empty(self) -> bool {
        matches!(self, Self::None)
    }

    /// The start code bytes.
    pub const fn bytes(self) -> &'static [u8] {
        match self {
            Self::None => &[],
            Self::Short => &SHORT_START_CODE,
            Self::Long => &LONG_START_CODE,
        }
    }
}

/// Length of the start code at the front of `payload`: 0, 3 or 4.
pub fn start_code_len(payload: &[u8]) -> usize {
    StartCode::detect(payload).len()
}

/// Upper bound on the encoded size of `raw_len` bytes.
///
/// An escape needs two zero bytes since the previous one, so at most one
/// extra byte is inserted for every two input bytes.
pub fn annexb_worst_size(start_code_len: usize, raw_len: usize) -> usize {
    start_code_len + raw_len * 3 / 2
}

fn annexb_optimistic_size(start_code_len: usize, raw_len: usize) -> usize {
    start_code_len + 8 + raw_len * 101 / 100
}

/// Encode `raw` into `dst`, returning the number of bytes written, or `None`
/// if `dst` is too small.
pub fn encode_annexb_into(
    raw: &[u8],
    start_code: StartCode,
    add_escapes: bool,
    dst: &mut [u8],
) -> Option<usize> {
    let prefix = start_code.bytes();
    dst.get_mut(..prefix.len())?.copy_from_slice(prefix);
    let out = &mut dst[prefix.len()..];

    let written = if add_escapes {
        escape_into(raw, out)?
    } else {
        out.get_mut(..raw.len())?.copy_from_slice(raw);
        raw.len()
    };

    Some(prefix.len() + written)
}

fn escape_into(raw: &[u8], out: &mut [u8]) -> Option<usize> {
    let mut zeros = 0usize;
    let mut j = 0usize;

    for &b in raw {
        if zeros >= 2 && b <= EMULATION_PREVENTION_BYTE {
            *out.get_mut(j)? = EMULATION_PREVENTION_BYTE;
            j += 1;
            zeros = 0;
        }
        *out.get_mut(j)? = b;
        j += 1;
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }

    Some(j)
}

/// Encode `raw` as an Annex-B NAL unit.
///
/// With `add_escapes` false the payload is copied verbatim after the start
/// code, for sources already known to be escaped.
pub fn encode_annexb(raw: &[u8], start_code: StartCode, add_escapes: bool) -> BitstreamResult<Vec<u8>> {
    let mut dst = vec![0u8; annexb_optimistic_size(start_code.len(), raw.len())];
    if let Some(n) = encode_annexb_into(raw, start_code, add_escapes, &mut dst) {
        dst.truncate(n);
        return Ok(dst);
    }

    dst.resize(annexb_worst_size(start_code.len(), raw.len()), 0);
    match encode_annexb_into(raw, start_code, add_escapes, &mut dst) {
        Some(n) => {
            dst.truncate(n);
            Ok(dst)
        }
        None => Err(BitstreamError::InvariantViolated(format!(
            "worst-case Annex-B buffer of {} bytes too small for {} raw bytes",
            dst.len(),
            raw.len()
        ))),
    }
}

/// Remove emulation-prevention bytes from `encoded`, appending to `out`.
///
/// `encoded` must not carry a start code.
pub fn decode_annexb_into(encoded: &[u8], out: &mut Vec<u8>) {
    out.reserve(encoded.len());
    let mut zeros = 0usize;
    for &b in encoded {
        if zeros >= 2 && b == EMULATION_PREVENTION_BYTE {
            zeros = 0;
            continue;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
}

/// Remove emulation-prevention bytes from `encoded`.
pub fn decode_annexb(encoded: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    decode_annexb_into(encoded, &mut out);
    out
}

/// Size [`decode_annexb`] would produce, without allocating.
pub fn decode_annexb_size(encoded: &[u8]) -> usize {
    let mut zeros = 0usize;
    let mut size = 0usize;
    for &b in encoded {
        if zeros >= 2 && b == EMULATION_PREVENTION_BYTE {
            zeros = 0;
            continue;
        }
        size += 1;
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    size
}

/// Index of the first `00 00 03 0N` (N <= 3) sequence, which is a strong
/// hint that a camera delivers escaped payloads.
pub fn first_likely_annexb_encoded_index(payload: &[u8]) -> Option<usize> {
    payload.windows(4).position(|w| {
        w[0] == 0 && w[1] == 0 && w[2] == EMULATION_PREVENTION_BYTE && w[3] <= EMULATION_PREVENTION_BYTE
    })
}

/// Split an Annex-B byte stream into NAL units, without their start codes.
///
/// Bytes before the first start code are ignored.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let len = data.len();
    let mut i = 0;

    while i + 3 <= len {
        let code_len = start_code_len(&data[i..]);
        if code_len == 0 {
            i += 1;
            continue;
        }

        let nal_start = i + code_len;
        let mut nal_end = len;
        let mut j = nal_start;
        while j + 3 <= len {
            if data[j] == 0 && data[j + 1] == 0 && (data[j + 2] == 1 || (data[j + 2] == 0 && j + 3 < len && data[j + 3] == 1)) {
                nal_end = j;
                break;
            }
            j += 1;
        }

        if nal_start < nal_end {
            nals.push(&data[nal_start..nal_end]);
        }
        i = nal_end;
    }

    nals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_scenario() {
        let out = encode_annexb(&[0x00, 0x00, 0x03], StartCode::Short, true).unwrap();
        assert_eq!(out, vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x03, 0x03]);
    }

    #[test]
    fn test_round_trip_escape_triggers() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0x00, 0x00],
            vec![0x00, 0x00, 0x00],
            vec![0x00, 0x00, 0x01],
            vec![0x00, 0x00, 0x02],
            vec![0x00, 0x00, 0x03],
            vec![0x00, 0x00, 0x04],
            vec![0x00; 64],
            vec![0x65, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00],
            (0u8..=255).cycle().take(1000).collect(),
        ];

        for raw in cases {
            let encoded = encode_annexb(&raw, StartCode::None, true).unwrap();
            assert_eq!(decode_annexb(&encoded), raw, "round trip of {:02x?}", raw);
            assert_eq!(decode_annexb_size(&encoded), raw.len());
            assert!(encoded.len() <= annexb_worst_size(0, raw.len()));
        }
    }

    #[test]
    fn test_all_zero_input_takes_pessimistic_path() {
        let raw = vec![0u8; 4096];
        let encoded = encode_annexb(&raw, StartCode::Long, true).unwrap();
        assert_eq!(&encoded[..4], &[0x00, 0x00, 0x00, 0x01]);
        assert!(encoded.len() > annexb_optimistic_size(4, raw.len()));
        assert_eq!(decode_annexb(&encoded[4..]), raw);
    }

    #[test]
    fn test_escaped_output_has_no_start_code_emulation() {
        let raw: Vec<u8> = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x02].repeat(8);
        let encoded = encode_annexb(&raw, StartCode::None, true).unwrap();
        assert!(encoded
            .windows(3)
            .all(|w| !(w[0] == 0 && w[1] == 0 && w[2] <= 0x02)));
    }

    #[test]
    fn test_encode_without_escapes_is_verbatim() {
        let raw = [0x00, 0x00, 0x01, 0x02];
        let out = encode_annexb(&raw, StartCode::Short, false).unwrap();
        assert_eq!(out, vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_empty_input_only_start_code() {
        assert!(encode_annexb(&[], StartCode::None, true).unwrap().is_empty());
        assert_eq!(encode_annexb(&[], StartCode::Long, true).unwrap(), vec![0, 0, 0, 1]);
    }

    #[test]
    fn test_encode_into_reports_small_destination() {
        let mut dst = [0u8; 5];
        assert_eq!(encode_annexb_into(&[0x00, 0x00, 0x00], StartCode::None, true, &mut dst), Some(4));
        let mut tiny = [0u8; 3];
        assert_eq!(encode_annexb_into(&[0x00, 0x00, 0x00], StartCode::None, true, &mut tiny), None);
        let mut no_room_for_code = [0u8; 2];
        assert_eq!(encode_annexb_into(&[], StartCode::Short, true, &mut no_room_for_code), None);
    }

    #[test]
    fn test_start_code_len() {
        assert_eq!(start_code_len(&[0x00, 0x00, 0x01, 0x65]), 3);
        assert_eq!(start_code_len(&[0x00, 0x00, 0x00, 0x01, 0x65]), 4);
        assert_eq!(start_code_len(&[0x00, 0x00, 0x00, 0x02]), 0);
        assert_eq!(start_code_len(&[0x00, 0x00]), 0);
        assert_eq!(start_code_len(&[]), 0);
        assert_eq!(StartCode::from_len(4), Some(StartCode::Long));
        assert_eq!(StartCode::from_len(2), None);
    }

    #[test]
    fn test_first_likely_annexb_encoded_index() {
        assert_eq!(first_likely_annexb_encoded_index(&[0x65, 0x00, 0x00, 0x03, 0x01]), Some(1));
        assert_eq!(first_likely_annexb_encoded_index(&[0x65, 0x00, 0x00, 0x03, 0x04]), None);
        assert_eq!(first_likely_annexb_encoded_index(&[0x00, 0x00]), None);
    }

    #[test]
    fn test_split_annexb_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
            0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, // IDR, trailing zero kept
        ];
        let nals = split_annexb(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[0x67, 0x42, 0x00, 0x1E]);
        assert_eq!(nals[1], &[0x68, 0xCE, 0x3C, 0x80]);
        assert_eq!(nals[2], &[0x65, 0x88, 0x84, 0x00]);
    }

    #[test]
    fn test_split_annexb_without_start_code() {
        assert!(split_annexb(&[0x65, 0x88, 0x84]).is_empty());
    }
}
