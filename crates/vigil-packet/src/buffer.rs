//! Point-in-time collection of packets and the bulk operations on it.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tracing::{debug, info, instrument};
use vigil_bitstream::{parse_sps, split_annexb, AbstractNaluType, Codec, Nalu};

use crate::container::{AccessUnit, ContainerWriter, StreamParameters};
use crate::error::PacketError;
use crate::mp4::Mp4Writer;
use crate::mpegts::MpegTsWriter;
use crate::packet::{SharedPacket, VideoPacket};
use crate::thumbnail::FrameDecoder;
use crate::PacketResult;

/// Ordered snapshot of packets, typically extracted from a ring buffer.
///
/// Packets are shared: cloning a buffer, or extracting one from a ring
/// buffer, does not copy payloads.
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    /// Packets in receive order.
    pub packets: Vec<SharedPacket>,
}

fn abs_diff(a: SystemTime, b: SystemTime) -> Duration {
    match a.duration_since(b) {
        Ok(d) => d,
        Err(e) => e.duration(),
    }
}

impl PacketBuffer {
    /// Create a buffer over shared packets.
    pub fn new(packets: Vec<SharedPacket>) -> Self {
        Self { packets }
    }

    /// Create a buffer that takes ownership of `packets`.
    pub fn from_packets(packets: impl IntoIterator<Item = VideoPacket>) -> Self {
        Self {
            packets: packets.into_iter().map(Arc::new).collect(),
        }
    }

    /// Split an Annex-B elementary stream into packets, one per picture.
    ///
    /// Parameter sets, SEI and delimiters are attached to the picture that
    /// follows them. Packets are stamped `frame_interval` apart starting at
    /// `start`.
    pub fn from_annexb_stream(codec: Codec, data: &[u8], frame_interval: Duration, start: SystemTime) -> Self {
        let mut packets = Vec::new();
        let mut pending: Vec<Nalu> = Vec::new();

        let flush = |nalus: Vec<Nalu>, packets: &mut Vec<VideoPacket>| {
            let index = packets.len() as u32;
            let pts = frame_interval * index;
            packets.push(VideoPacket::new(codec, nalus, pts, start + pts).with_recv_id(i64::from(index)));
        };

        for nal in split_annexb(data) {
            let nalu = Nalu::from_annexb(Bytes::copy_from_slice(nal));
            let is_picture = matches!(
                nalu.abstract_type(codec),
                AbstractNaluType::Keyframe | AbstractNaluType::InterFrame
            );
            pending.push(nalu);
            if is_picture {
                flush(std::mem::take(&mut pending), &mut packets);
            }
        }
        if !pending.is_empty() {
            flush(pending, &mut packets);
        }

        Self::from_packets(packets)
    }

    /// Number of packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True if there are no packets.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Codec of the first packet, or `Unknown` when empty.
    pub fn codec(&self) -> Codec {
        self.packets.first().map_or(Codec::Unknown, |p| p.codec)
    }

    /// Time between the first and last packet.
    pub fn duration(&self) -> Duration {
        match (self.packets.first(), self.packets.last()) {
            (Some(first), Some(last)) => last.pts.saturating_sub(first.pts),
            _ => Duration::ZERO,
        }
    }

    /// Total payload size of all packets.
    pub fn payload_bytes(&self) -> usize {
        self.packets.iter().map(|p| p.payload_bytes()).sum()
    }

    /// True if any packet carries a keyframe.
    pub fn has_idr(&self) -> bool {
        self.packets.iter().any(|p| p.has_idr())
    }

    /// Index of the first packet carrying a keyframe.
    pub fn find_first_idr(&self) -> Option<usize> {
        self.find_first_packet_of_type(AbstractNaluType::Keyframe)
    }

    /// Index of the first packet with a NAL unit of category `kind`.
    pub fn find_first_packet_of_type(&self, kind: AbstractNaluType) -> Option<usize> {
        self.packets.iter().position(|p| p.has_abstract_type(kind))
    }

    /// Index of the packet whose wall clock time is closest to `target`.
    /// Ties go to the earlier packet.
    pub fn find_closest_packet_by_wall_pts(&self, target: SystemTime, keyframe_only: bool) -> Option<usize> {
        let mut best: Option<(usize, Duration)> = None;
        for (i, p) in self.packets.iter().enumerate() {
            if keyframe_only && !p.has_idr() {
                continue;
            }
            let delta = abs_diff(p.wall_pts, target);
            if best.map_or(true, |(_, d)| delta < d) {
                best = Some((i, delta));
            }
        }
        best.map(|(i, _)| i)
    }

    /// First NAL unit of codec-specific type `nalu_type` in any packet.
    pub fn first_nalu_of_type(&self, nalu_type: u8) -> Option<&Nalu> {
        self.packets.iter().find_map(|p| p.first_nalu_of_type(nalu_type))
    }

    /// Picture `(width, height)` from the first SPS.
    pub fn decode_header(&self) -> PacketResult<(u32, u32)> {
        let codec = self.codec();
        let sps_type = codec.sps_type().ok_or(PacketError::Empty)?;
        let sps = self.first_nalu_of_type(sps_type).ok_or(PacketError::MissingSps)?;
        Ok(parse_sps(codec, &sps.as_rbsp().payload)?)
    }

    /// Rebase stream timestamps so the first packet is at zero.
    ///
    /// Packets still shared with other holders are copied first, so their
    /// view is unchanged.
    pub fn reset_pts(&mut self) {
        let Some(base) = self.packets.first().map(|p| p.pts) else {
            return;
        };
        for p in &mut self.packets {
            let packet = Arc::make_mut(p);
            packet.pts = packet.pts.saturating_sub(base);
        }
    }

    /// Write the buffer from its first keyframe onward into `writer`, with
    /// timestamps rebased so the keyframe is at zero.
    ///
    /// Every parameter set the codec needs must appear at or before the
    /// first keyframe, otherwise nothing is written.
    #[instrument(name = "packet_buffer_export", skip(self, writer), fields(packets = self.packets.len()))]
    pub fn export_to_muxed_container(&self, writer: &mut dyn ContainerWriter) -> PacketResult<()> {
        let codec = self.codec();
        let sps_type = codec.sps_type().ok_or(PacketError::Empty)?;
        let first = self.find_first_idr().ok_or(PacketError::NoKeyframe)?;
        let head = &self.packets[..=first];

        let mut parameter_sets = Vec::new();
        let mut dimensions = None;
        for &t in codec.parameter_set_types() {
            let nalu = head.iter().rev().find_map(|p| p.first_nalu_of_type(t)).ok_or_else(|| {
                PacketError::MissingEssentialMetadata(format!(
                    "{codec} NAL unit type {t} not found before the first keyframe"
                ))
            })?;
            if t == sps_type {
                dimensions = Some(parse_sps(codec, &nalu.as_rbsp().payload)?);
            }
            let annexb = nalu.as_annexb()?;
            parameter_sets.push(annexb.payload.slice(annexb.start_code_len()..));
        }
        let (width, height) = dimensions.ok_or(PacketError::MissingSps)?;

        writer.begin(&StreamParameters {
            codec,
            width,
            height,
            parameter_sets,
        })?;

        let base = self.packets[first].pts;
        for packet in &self.packets[first..] {
            let nalus = packet
                .nalus
                .iter()
                .map(Nalu::as_annexb)
                .collect::<Result<Vec<_>, _>>()?;
            writer.write_access_unit(&AccessUnit {
                pts: packet.pts.saturating_sub(base),
                nalus: &nalus,
                is_keyframe: packet.has_idr(),
            })?;
        }
        writer.finish()?;

        info!(
            codec = %codec,
            width,
            height,
            skipped = first,
            written = self.packets.len() - first,
            "Exported packet buffer"
        );
        Ok(())
    }

    /// Export as an MPEG-TS stream into `out`.
    pub fn save_to_mpegts<W: Write>(&self, out: W) -> PacketResult<W> {
        let mut writer = MpegTsWriter::new(out);
        self.export_to_muxed_container(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Export as a progressive MP4 file into `out`. H.264 only.
    pub fn save_to_mp4<W: Write>(&self, out: W) -> PacketResult<W> {
        if self.codec() == Codec::H265 {
            return Err(PacketError::UnsupportedCodec(Codec::H265));
        }
        let mut writer = Mp4Writer::new(out);
        self.export_to_muxed_container(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Decode a representative frame.
    ///
    /// Starts from the keyframe at or before the middle packet and feeds
    /// packets forward until the decoder yields a frame.
    pub fn extract_thumbnail<D: FrameDecoder>(&self, decoder: &mut D) -> PacketResult<D::Frame> {
        if self.packets.is_empty() {
            return Err(PacketError::NoThumbnail);
        }

        let mut start = self.packets.len() / 2;
        while start > 0 && !self.packets[start].has_idr() {
            start -= 1;
        }

        for (i, packet) in self.packets.iter().enumerate().skip(start) {
            match decoder.decode(packet) {
                Ok(Some(frame)) => {
                    debug!(start, index = i, "Decoded thumbnail");
                    return Ok(frame);
                }
                Ok(None) => {}
                Err(e) => debug!(index = i, error = %e, "Decoder rejected packet"),
            }
        }
        Err(PacketError::NoThumbnail)
    }
}
