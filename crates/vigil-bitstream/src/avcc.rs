//! Length-prefixed (AVCC) framing used by MP4 sample data.
//!
//! MP4 stores NAL units escaped but without start codes, each preceded by
//! a 4 byte big-endian length. The decoder configuration record (`avcC`)
//! carries the parameter sets out of band.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::BitstreamError;
use crate::BitstreamResult;

/// Concatenate escaped NAL units (no start codes) with 4 byte length prefixes.
pub fn nals_to_avcc<T: AsRef<[u8]>>(nals: &[T]) -> Bytes {
    let total: usize = nals.iter().map(|n| 4 + n.as_ref().len()).sum();
    let mut buf = BytesMut::with_capacity(total);

    for nal in nals {
        let nal = nal.as_ref();
        buf.put_u32(nal.len() as u32);
        buf.put_slice(nal);
    }

    buf.freeze()
}

/// Build an AVC decoder configuration record (ISO 14496-15) from one SPS
/// and one PPS, both escaped and without start codes.
///
/// Layout:
/// - configurationVersion (1), profile, compatibility, level (from SPS bytes 1-3)
/// - lengthSizeMinusOne: 0xFF, 4 byte lengths
/// - numOfSequenceParameterSets: 0xE1, one SPS, then u16 length + SPS
/// - numOfPictureParameterSets: 1, then u16 length + PPS
pub fn build_avc_decoder_config(sps: &[u8], pps: &[u8]) -> BitstreamResult<Bytes> {
    if sps.len() < 4 {
        return Err(BitstreamError::MalformedParameterSet(format!(
            "SPS too short for decoder configuration: {} bytes",
            sps.len()
        )));
    }
    let sps_len = u16::try_from(sps.len())
        .map_err(|_| BitstreamError::MalformedParameterSet("SPS longer than 65535 bytes".into()))?;
    let pps_len = u16::try_from(pps.len())
        .map_err(|_| BitstreamError::MalformedParameterSet("PPS longer than 65535 bytes".into()))?;

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01);
    buf.put_u8(sps[1]); // profile_idc
    buf.put_u8(sps[2]); // constraint flags
    buf.put_u8(sps[3]); // level_idc
    buf.put_u8(0xFF);
    buf.put_u8(0xE1);
    buf.put_u16(sps_len);
    buf.put_slice(sps);
    buf.put_u8(0x01);
    buf.put_u16(pps_len);
    buf.put_slice(pps);

    debug!(
        sps_len = sps.len(),
        pps_len = pps.len(),
        total_len = buf.len(),
        "Built AVC decoder configuration record"
    );

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nals_to_avcc() {
        let nals: [&[u8]; 2] = [&[0x65, 0x88, 0x84], &[0x06]];
        let avcc = nals_to_avcc(&nals);
        assert_eq!(
            avcc.as_ref(),
            &[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x84, 0x00, 0x00, 0x00, 0x01, 0x06]
        );
    }

    #[test]
    fn test_build_avc_decoder_config() {
        let sps = [0x67, 0x42, 0xC0, 0x1E, 0xDA];
        let pps = [0x68, 0xCE, 0x3C, 0x80];
        let config = build_avc_decoder_config(&sps, &pps).unwrap();

        assert_eq!(&config[..6], &[0x01, 0x42, 0xC0, 0x1E, 0xFF, 0xE1]);
        assert_eq!(&config[6..8], &[0x00, 0x05]);
        assert_eq!(&config[8..13], &sps);
        assert_eq!(config[13], 0x01);
        assert_eq!(&config[14..16], &[0x00, 0x04]);
        assert_eq!(&config[16..], &pps);
    }

    #[test]
    fn test_build_avc_decoder_config_rejects_short_sps() {
        assert!(build_avc_decoder_config(&[0x67, 0x42], &[0x68]).is_err());
    }
}
