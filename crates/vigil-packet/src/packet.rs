//! A single received access unit.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};
use vigil_bitstream::{
    annexb_worst_size, encode_annexb_into, h264, h265, AbstractNaluType, BitstreamError, Codec, Nalu,
    StartCode,
};

use crate::config::PacketConfig;
use crate::PacketResult;

/// Packets are shared between the ring buffer, listeners and extracted
/// buffers without copying.
pub type SharedPacket = Arc<VideoPacket>;

/// One or more NAL units received together from a camera, such as
/// SPS + PPS + IDR, or a single inter-frame slice.
///
/// `Clone` shares the NAL unit payloads. Producers that reuse their
/// buffers must hand over a [`VideoPacket::deep_clone`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoPacket {
    /// Monotonic receive sequence id, used to detect drops.
    pub valid_recv_id: i64,

    /// Codec of every NAL unit in the packet.
    pub codec: Codec,

    /// NAL units in decode order.
    pub nalus: Vec<Nalu>,

    /// Stream-relative presentation time.
    pub pts: Duration,

    /// Wall clock time at which the packet was captured.
    pub wall_pts: SystemTime,

    /// Replayed from history to a consumer that joined late.
    pub is_backlog: bool,
}

impl VideoPacket {
    /// Create a packet that takes ownership of `nalus`.
    pub fn new(codec: Codec, nalus: Vec<Nalu>, pts: Duration, wall_pts: SystemTime) -> Self {
        Self {
            valid_recv_id: 0,
            codec,
            nalus,
            pts,
            wall_pts,
            is_backlog: false,
        }
    }

    /// Build a packet from NAL units whose buffers belong to the transport
    /// and may be reused after this call returns.
    ///
    /// Annex-B sources that omit the start code get one added while the
    /// payload is copied; everything else is copied verbatim.
    pub fn from_transport<T: AsRef<[u8]>>(
        codec: Codec,
        nalus: &[T],
        pts: Duration,
        wall_pts: SystemTime,
        payload_is_annexb: bool,
    ) -> Self {
        let nalus = nalus
            .iter()
            .map(|raw| {
                let raw = raw.as_ref();
                if payload_is_annexb && StartCode::detect(raw).is_empty() {
                    let mut buf = BytesMut::with_capacity(StartCode::Short.len() + raw.len());
                    buf.put_slice(StartCode::Short.bytes());
                    buf.put_slice(raw);
                    Nalu::from_annexb(buf.freeze())
                } else if payload_is_annexb {
                    Nalu::from_annexb(Bytes::copy_from_slice(raw))
                } else {
                    Nalu::from_rbsp(Bytes::copy_from_slice(raw))
                }
            })
            .collect();
        Self::new(codec, nalus, pts, wall_pts)
    }

    /// Set the receive sequence id.
    pub fn with_recv_id(mut self, id: i64) -> Self {
        self.valid_recv_id = id;
        self
    }

    /// Copy with every payload in its own allocation.
    pub fn deep_clone(&self) -> Self {
        Self {
            nalus: self.nalus.iter().map(Nalu::deep_clone).collect(),
            ..self.clone()
        }
    }

    /// True if any NAL unit falls into `kind`.
    pub fn has_abstract_type(&self, kind: AbstractNaluType) -> bool {
        self.nalus.iter().any(|n| n.abstract_type(self.codec) == kind)
    }

    /// True if any NAL unit has the codec-specific type `nalu_type`.
    pub fn has_type(&self, nalu_type: u8) -> bool {
        self.nalus.iter().any(|n| n.type_byte(self.codec) == nalu_type)
    }

    /// True if the packet carries a keyframe.
    pub fn has_idr(&self) -> bool {
        self.has_abstract_type(AbstractNaluType::Keyframe)
    }

    /// True if the packet is a single inter-frame NAL unit.
    pub fn is_i_frame(&self) -> bool {
        self.nalus.len() == 1 && self.nalus[0].abstract_type(self.codec) == AbstractNaluType::InterFrame
    }

    /// First NAL unit of the codec-specific type `nalu_type`.
    pub fn first_nalu_of_type(&self, nalu_type: u8) -> Option<&Nalu> {
        self.nalus.iter().find(|n| n.type_byte(self.codec) == nalu_type)
    }

    /// Payload size, including any start codes.
    pub fn payload_bytes(&self) -> usize {
        self.nalus.iter().map(|n| n.payload.len()).sum()
    }

    /// One line description of the NAL units, e.g. `3 NALUs: SPS (10 bytes), ...`.
    pub fn summary(&self) -> String {
        let mut out = format!("{} NALUs: ", self.nalus.len());
        for (i, n) in self.nalus.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let t = n.type_byte(self.codec);
            let _ = write!(out, "{} ({} bytes)", nalu_type_name(self.codec, t), n.payload.len());
        }
        out
    }

    /// Annex-B byte stream of every NAL unit, escaped with default settings.
    pub fn encode_to_annexb_packet(&self) -> PacketResult<Bytes> {
        self.encode_to_annexb_packet_with(&PacketConfig::default())
    }

    /// Annex-B byte stream of every NAL unit.
    ///
    /// A packet holding a single start-coded Annex-B NAL unit is returned
    /// without copying.
    pub fn encode_to_annexb_packet_with(&self, config: &PacketConfig) -> PacketResult<Bytes> {
        if let [only] = self.nalus.as_slice() {
            if only.is_annexb_with_start_code() {
                return Ok(only.payload.clone());
            }
        }

        let capacity: usize = self
            .nalus
            .iter()
            .map(|n| {
                StartCode::Long.len()
                    + if n.payload_is_annexb {
                        n.payload.len()
                    } else {
                        annexb_worst_size(0, n.payload.len())
                    }
            })
            .sum();

        let mut out = vec![0u8; capacity];
        let mut used = 0;
        for n in &self.nalus {
            if n.is_annexb_with_start_code() {
                let end = used + n.payload.len();
                out[used..end].copy_from_slice(&n.payload);
                used = end;
                continue;
            }
            let escape = config.escape_emulation_prevention && !n.payload_is_annexb;
            used += encode_annexb_into(n.payload_only(), StartCode::Short, escape, &mut out[used..])
                .ok_or_else(|| {
                    BitstreamError::InvariantViolated(format!(
                        "ran out of space packing {} NAL units into {} bytes",
                        self.nalus.len(),
                        capacity
                    ))
                })?;
        }
        out.truncate(used);
        Ok(Bytes::from(out))
    }
}

fn nalu_type_name(codec: Codec, nalu_type: u8) -> String {
    let name = match (codec, nalu_type) {
        (Codec::H264, h264::NON_IDR_SLICE) => "NonIDR",
        (Codec::H264, h264::IDR_SLICE) => "IDR",
        (Codec::H264, h264::SEI) => "SEI",
        (Codec::H264, h264::SPS) => "SPS",
        (Codec::H264, h264::PPS) => "PPS",
        (Codec::H264, h264::AUD) => "AUD",
        (Codec::H265, h265::IDR_W_RADL) | (Codec::H265, h265::IDR_N_LP) => "IDR",
        (Codec::H265, h265::VPS) => "VPS",
        (Codec::H265, h265::SPS) => "SPS",
        (Codec::H265, h265::PPS) => "PPS",
        (Codec::H265, h265::AUD) => "AUD",
        _ => return format!("type {nalu_type}"),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(nalus: Vec<Nalu>) -> VideoPacket {
        VideoPacket::new(Codec::H264, nalus, Duration::ZERO, SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn test_from_transport_adds_start_code() {
        let raw: [&[u8]; 2] = [&[0x67, 0x42], &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]];
        let p = VideoPacket::from_transport(Codec::H264, &raw, Duration::ZERO, SystemTime::UNIX_EPOCH, true);
        assert_eq!(p.nalus[0].payload.as_ref(), &[0x00, 0x00, 0x01, 0x67, 0x42]);
        assert_eq!(p.nalus[1].payload.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x65, 0x88]);
        assert!(p.nalus.iter().all(|n| n.payload_is_annexb));
    }

    #[test]
    fn test_from_transport_copies_source_buffer() {
        let mut source = vec![0x65, 0x88, 0x84];
        let p = VideoPacket::from_transport(Codec::H264, &[&source], Duration::ZERO, SystemTime::UNIX_EPOCH, false);
        source[1] = 0xFF;
        assert_eq!(p.nalus[0].payload.as_ref(), &[0x65, 0x88, 0x84]);
        assert!(p.nalus[0].is_rbsp_without_start_code());
    }

    #[test]
    fn test_keyframe_queries() {
        let p = packet(vec![
            Nalu::from_rbsp(vec![0x67, 0x42]),
            Nalu::from_rbsp(vec![0x68, 0xCE]),
            Nalu::from_rbsp(vec![0x65, 0x88]),
        ]);
        assert!(p.has_idr());
        assert!(p.has_abstract_type(AbstractNaluType::EssentialMetadata));
        assert!(p.has_type(h264::PPS));
        assert!(!p.is_i_frame());
        assert_eq!(p.first_nalu_of_type(h264::SPS).unwrap().payload.as_ref(), &[0x67, 0x42]);
        assert!(p.first_nalu_of_type(h264::SEI).is_none());
        assert_eq!(p.payload_bytes(), 6);

        let inter = packet(vec![Nalu::from_rbsp(vec![0x41, 0x9A])]);
        assert!(inter.is_i_frame());
        assert!(!inter.has_idr());
    }

    #[test]
    fn test_summary() {
        let p = packet(vec![Nalu::from_rbsp(vec![0x67, 0x42]), Nalu::from_rbsp(vec![0x65])]);
        assert_eq!(p.summary(), "2 NALUs: SPS (2 bytes), IDR (1 bytes)");
    }

    #[test]
    fn test_encode_single_annexb_is_zero_copy() {
        let nalu = Nalu::from_annexb(vec![0x00, 0x00, 0x01, 0x65, 0x88]);
        let p = packet(vec![nalu.clone()]);
        let out = p.encode_to_annexb_packet().unwrap();
        assert_eq!(out.as_ptr(), nalu.payload.as_ptr());
    }

    #[test]
    fn test_encode_mixed_nalus() {
        let p = packet(vec![
            Nalu::from_rbsp(vec![0x67, 0x00, 0x00, 0x01]),
            Nalu::from_annexb(vec![0x68, 0xCE]),
            Nalu::from_annexb(vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88]),
        ]);
        let out = p.encode_to_annexb_packet().unwrap();
        assert_eq!(
            out.as_ref(),
            &[
                0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x03, 0x01, // escaped SPS
                0x00, 0x00, 0x01, 0x68, 0xCE, // start code added
                0x00, 0x00, 0x00, 0x01, 0x65, 0x88, // verbatim
            ]
        );
    }

    #[test]
    fn test_encode_without_escaping() {
        let p = packet(vec![Nalu::from_rbsp(vec![0x67, 0x00, 0x00, 0x01])]);
        let config = PacketConfig {
            escape_emulation_prevention: false,
        };
        let out = p.encode_to_annexb_packet_with(&config).unwrap();
        assert_eq!(out.as_ref(), &[0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let p = packet(vec![Nalu::from_rbsp(vec![0x65, 0x88])]);
        let shallow = p.clone();
        let deep = p.deep_clone();
        assert_eq!(shallow.nalus[0].payload.as_ptr(), p.nalus[0].payload.as_ptr());
        assert_ne!(deep.nalus[0].payload.as_ptr(), p.nalus[0].payload.as_ptr());
        assert_eq!(deep, p);
    }
}
