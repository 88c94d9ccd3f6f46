//! Sequence parameter set parsing.
//!
//! H.264 parameter sets go through `h264-reader`. H.265 is read with a
//! small Exp-Golomb reader that stops after the conformance window.
//! Inputs are RBSP (already unescaped) and include the NAL header.

use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::rbsp::BitReader as RbspReader;
use tracing::trace;

use crate::codec::Codec;
use crate::error::BitstreamError;
use crate::BitstreamResult;

/// MSB-first bit reader over an RBSP buffer.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Create a reader positioned at the first bit of `data`.
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read a single bit.
    pub(crate) fn read_bit(&mut self, field: &'static str) -> BitstreamResult<bool> {
        let byte = self.data.get(self.pos / 8).ok_or(BitstreamError::Truncated(field))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read up to 32 bits as an unsigned integer.
    pub(crate) fn read_bits(&mut self, count: u32, field: &'static str) -> BitstreamResult<u32> {
        debug_assert!(count <= 32);
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | u32::from(self.read_bit(field)?);
        }
        Ok(value)
    }

    /// Skip `count` bits.
    pub(crate) fn skip_bits(&mut self, count: usize, field: &'static str) -> BitstreamResult<()> {
        if self.pos + count > self.data.len() * 8 {
            return Err(BitstreamError::Truncated(field));
        }
        self.pos += count;
        Ok(())
    }

    /// Read an unsigned Exp-Golomb value.
    pub(crate) fn read_ue(&mut self, field: &'static str) -> BitstreamResult<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bit(field)? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(BitstreamError::MalformedParameterSet(format!(
                    "Exp-Golomb code for {field} longer than 32 bits"
                )));
            }
        }
        let suffix = self.read_bits(leading_zeros, field)?;
        Ok(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }
}

fn cropped(size: u32, crop: u32, unit: u32, field: &str) -> BitstreamResult<u32> {
    crop.checked_mul(unit)
        .and_then(|c| size.checked_sub(c))
        .filter(|&s| s > 0)
        .ok_or_else(|| BitstreamError::MalformedParameterSet(format!("{field} crop exceeds picture size")))
}

/// Parse an H.264 SPS and return the cropped `(width, height)` in pixels.
pub fn parse_h264_sps(rbsp: &[u8]) -> BitstreamResult<(u32, u32)> {
    let body = rbsp.get(1..).ok_or(BitstreamError::Truncated("nal_unit_header"))?;
    let sps = SeqParameterSet::from_bits(RbspReader::new(body))
        .map_err(|e| BitstreamError::MalformedParameterSet(format!("bad SPS: {e:?}")))?;
    trace!(?sps, "Parsed H.264 SPS");
    sps.pixel_dimensions()
        .map_err(|e| BitstreamError::MalformedParameterSet(format!("SPS has invalid pixel dimensions: {e:?}")))
}

fn skip_h265_profile_tier_level(r: &mut BitReader<'_>, max_sub_layers_minus1: u32) -> BitstreamResult<()> {
    // general_profile_space .. general_level_idc
    r.skip_bits(96, "general_profile_tier_level")?;

    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = r.read_bit("sub_layer_profile_present_flag")?;
        level_present[i] = r.read_bit("sub_layer_level_present_flag")?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip_bits(2, "reserved_zero_2bits")?;
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            r.skip_bits(88, "sub_layer_profile")?;
        }
        if level_present[i] {
            r.skip_bits(8, "sub_layer_level_idc")?;
        }
    }
    Ok(())
}

/// Parse an H.265 SPS and return the conformance-window `(width, height)`.
pub fn parse_h265_sps(rbsp: &[u8]) -> BitstreamResult<(u32, u32)> {
    let mut r = BitReader::new(rbsp);
    r.skip_bits(16, "nal_unit_header")?;
    r.skip_bits(4, "sps_video_parameter_set_id")?;
    let max_sub_layers_minus1 = r.read_bits(3, "sps_max_sub_layers_minus1")?;
    if max_sub_layers_minus1 > 6 {
        return Err(BitstreamError::MalformedParameterSet(format!(
            "sps_max_sub_layers_minus1 {max_sub_layers_minus1}"
        )));
    }
    r.skip_bits(1, "sps_temporal_id_nesting_flag")?;
    skip_h265_profile_tier_level(&mut r, max_sub_layers_minus1)?;

    r.read_ue("sps_seq_parameter_set_id")?;
    let chroma_format_idc = r.read_ue("chroma_format_idc")?;
    if chroma_format_idc > 3 {
        return Err(BitstreamError::MalformedParameterSet(format!(
            "chroma_format_idc {chroma_format_idc}"
        )));
    }
    let separate_colour_plane = chroma_format_idc == 3 && r.read_bit("separate_colour_plane_flag")?;
    let width = r.read_ue("pic_width_in_luma_samples")?;
    let height = r.read_ue("pic_height_in_luma_samples")?;

    let (mut left, mut right, mut top, mut bottom) = (0, 0, 0, 0);
    if r.read_bit("conformance_window_flag")? {
        left = r.read_ue("conf_win_left_offset")?;
        right = r.read_ue("conf_win_right_offset")?;
        top = r.read_ue("conf_win_top_offset")?;
        bottom = r.read_ue("conf_win_bottom_offset")?;
    }

    let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
    let sub_width = if matches!(chroma_array_type, 1 | 2) { 2 } else { 1 };
    let sub_height = if chroma_array_type == 1 { 2 } else { 1 };

    Ok((
        cropped(width, left.saturating_add(right), sub_width, "horizontal")?,
        cropped(height, top.saturating_add(bottom), sub_height, "vertical")?,
    ))
}

/// Parse the SPS of `codec` and return the picture `(width, height)`.
pub fn parse_sps(codec: Codec, rbsp: &[u8]) -> BitstreamResult<(u32, u32)> {
    match codec {
        Codec::H264 => parse_h264_sps(rbsp),
        Codec::H265 => parse_h265_sps(rbsp),
        Codec::Unknown => Err(BitstreamError::UnsupportedCodec(codec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MSB-first writer used to build parameter sets field by field.
    #[derive(Default)]
    struct BitWriter {
        bits: Vec<bool>,
    }

    impl BitWriter {
        fn u(&mut self, count: u32, value: u32) -> &mut Self {
            for i in (0..count).rev() {
                self.bits.push((value >> i) & 1 == 1);
            }
            self
        }

        fn ue(&mut self, value: u32) -> &mut Self {
            let code = value + 1;
            let len = 32 - code.leading_zeros();
            self.u(len - 1, 0).u(len, code)
        }

        fn finish(&mut self) -> Vec<u8> {
            self.bits.push(true);
            while self.bits.len() % 8 != 0 {
                self.bits.push(false);
            }
            self.bits
                .chunks(8)
                .map(|c| c.iter().fold(0u8, |acc, &b| (acc << 1) | u8::from(b)))
                .collect()
        }
    }

    fn baseline_sps(width_mbs: u32, height_mbs: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.u(8, 0x67).u(8, 66).u(8, 0xC0).u(8, 30);
        w.ue(0).ue(0).ue(2).ue(1).u(1, 0);
        w.ue(width_mbs - 1).ue(height_mbs - 1).u(1, 1).u(1, 1);
        if crop_bottom > 0 {
            w.u(1, 1).ue(0).ue(0).ue(0).ue(crop_bottom);
        } else {
            w.u(1, 0);
        }
        w.u(1, 0);
        w.finish()
    }

    #[test]
    fn test_bit_writer_matches_known_sps() {
        assert_eq!(
            baseline_sps(50, 38, 4),
            vec![0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x03, 0x20, 0x4D, 0xF9, 0x50]
        );
    }

    #[test]
    fn test_h264_baseline_800x600() {
        assert_eq!(parse_h264_sps(&baseline_sps(50, 38, 4)).unwrap(), (800, 600));
    }

    #[test]
    fn test_h264_without_cropping() {
        assert_eq!(parse_h264_sps(&baseline_sps(40, 30, 0)).unwrap(), (640, 480));
    }

    #[test]
    fn test_h264_high_profile_1080p() {
        let mut w = BitWriter::default();
        w.u(8, 0x67).u(8, 100).u(8, 0).u(8, 40);
        w.ue(0).ue(1).ue(0).ue(0).u(1, 0).u(1, 0);
        w.ue(0).ue(0).ue(2).ue(1).u(1, 0);
        w.ue(119).ue(67).u(1, 1).u(1, 1);
        w.u(1, 1).ue(0).ue(0).ue(0).ue(4);
        w.u(1, 0);
        let sps = w.finish();
        assert_eq!(
            sps,
            vec![0x67, 0x64, 0x00, 0x28, 0xAC, 0xDA, 0x01, 0xE0, 0x08, 0x9F, 0x95]
        );
        assert_eq!(parse_h264_sps(&sps).unwrap(), (1920, 1080));
    }

    #[test]
    fn test_h264_interlaced_doubles_height() {
        let mut w = BitWriter::default();
        w.u(8, 0x67).u(8, 77).u(8, 0).u(8, 30);
        w.ue(0).ue(0).ue(0).ue(2).ue(1).u(1, 0);
        w.ue(44).ue(17).u(1, 0).u(1, 1).u(1, 1);
        w.u(1, 0).u(1, 0);
        assert_eq!(parse_h264_sps(&w.finish()).unwrap(), (720, 576));
    }

    #[test]
    fn test_h264_truncated() {
        let sps = baseline_sps(50, 38, 4);
        assert!(matches!(
            parse_h264_sps(&sps[..5]),
            Err(BitstreamError::MalformedParameterSet(_))
        ));
        assert!(matches!(parse_h264_sps(&[]), Err(BitstreamError::Truncated(_))));
    }

    /// High profile 1080p SPS whose scaling matrix is written by `lists`.
    fn high_profile_sps(lists: impl FnOnce(&mut BitWriter)) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.u(8, 0x67).u(8, 100).u(8, 0).u(8, 40);
        w.ue(0).ue(1).ue(0).ue(0).u(1, 0).u(1, 1);
        lists(&mut w);
        w.ue(0).ue(0).ue(2).ue(1).u(1, 0);
        w.ue(119).ue(67).u(1, 1).u(1, 1);
        w.u(1, 1).ue(0).ue(0).ue(0).ue(4);
        w.u(1, 0);
        w.finish()
    }

    /// Signed Exp-Golomb code of `value`.
    fn se(w: &mut BitWriter, value: i32) {
        let code = if value > 0 { 2 * value as u32 - 1 } else { 2 * value.unsigned_abs() };
        w.ue(code);
    }

    #[test]
    fn test_h264_high_profile_with_scaling_lists() {
        let sps = high_profile_sps(|w| {
            // list 0: explicit 4x4 list rising from 16 by one per entry
            w.u(1, 1);
            se(w, 8);
            for _ in 1..16 {
                se(w, 1);
            }
            // list 1: falls back to the default matrix
            w.u(1, 1);
            se(w, -8);
            // lists 2..5 absent
            for _ in 2..6 {
                w.u(1, 0);
            }
            // list 6: explicit 8x8 list that wraps past 255 without reaching 0
            w.u(1, 1);
            for _ in 0..64 {
                se(w, 6);
            }
            w.u(1, 0);
        });
        assert_eq!(parse_h264_sps(&sps).unwrap(), (1920, 1080));
    }

    #[test]
    fn test_h264_scaling_delta_out_of_range() {
        for delta in [128, -129, i32::MAX] {
            let sps = high_profile_sps(|w| {
                w.u(1, 1);
                se(w, delta);
                for _ in 1..8 {
                    w.u(1, 0);
                }
            });
            assert!(matches!(
                parse_h264_sps(&sps),
                Err(BitstreamError::MalformedParameterSet(_))
            ));
        }
    }

    #[test]
    fn test_h265_1080p_with_conformance_window() {
        let mut w = BitWriter::default();
        w.u(8, 0x42).u(8, 0x01).u(4, 0).u(3, 0).u(1, 1);
        w.u(2, 0).u(1, 0).u(5, 1).u(32, 0x6000_0000).u(4, 0b1001);
        w.u(32, 0).u(11, 0).u(1, 0).u(8, 93);
        w.ue(0).ue(1).ue(1920).ue(1088).u(1, 1).ue(0).ue(0).ue(0).ue(4);
        w.ue(0).ue(0).ue(4);
        let sps = w.finish();
        assert_eq!(
            sps,
            vec![
                0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x00, 0x90, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x5D, 0xA0, 0x03, 0xC0, 0x80, 0x11, 0x07, 0xCB, 0x96
            ]
        );
        assert_eq!(parse_h265_sps(&sps).unwrap(), (1920, 1080));
        assert_eq!(parse_sps(Codec::H265, &sps).unwrap(), (1920, 1080));
    }

    #[test]
    fn test_h265_sub_layers() {
        let mut w = BitWriter::default();
        w.u(8, 0x42).u(8, 0x01).u(4, 0).u(3, 1).u(1, 1);
        w.u(32, 0).u(32, 0).u(32, 0);
        // one sub-layer with profile and level present, then 7 reserved pairs
        w.u(1, 1).u(1, 1);
        for _ in 1..8 {
            w.u(2, 0);
        }
        w.u(32, 0).u(32, 0).u(24, 0).u(8, 0);
        w.ue(0).ue(1).ue(1280).ue(720).u(1, 0);
        assert_eq!(parse_h265_sps(&w.finish()).unwrap(), (1280, 720));
    }

    #[test]
    fn test_parse_sps_unknown_codec() {
        assert!(matches!(
            parse_sps(Codec::Unknown, &[0x67]),
            Err(BitstreamError::UnsupportedCodec(Codec::Unknown))
        ));
    }
}
