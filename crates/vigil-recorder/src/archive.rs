//! Boundary to the video archive.
//!
//! The archive stores NAL units per stream and track. Video is always
//! written as Annex-B with start codes, so archived tracks can be fed to
//! common tools directly.

use std::collections::HashMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::Mutex;
use vigil_bitstream::{AbstractNaluType, Codec, Nalu};
use vigil_packet::{PacketBuffer, SharedPacket, VideoPacket};

use crate::RecorderResult;

/// Name of the video track in [`ArchiveSink::write`].
pub const VIDEO_TRACK: &str = "video";

/// Per-NAL-unit archive flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NaluFlags(u8);

impl NaluFlags {
    pub const EMPTY: Self = Self(0);
    /// The payload is Annex-B with a start code.
    pub const ANNEX_B: Self = Self(1);
    /// The NAL unit is a parameter set needed to start decoding.
    pub const ESSENTIAL_METADATA: Self = Self(2);
    /// The NAL unit is a keyframe slice.
    pub const KEY_FRAME: Self = Self(4);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for NaluFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for NaluFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One archived NAL unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNalu {
    /// Wall clock time of the packet the NAL unit belonged to.
    pub pts: SystemTime,
    pub flags: NaluFlags,
    pub payload: Bytes,
}

/// NAL units of one track, with the stream parameters needed to decode them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPayload {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub nalus: Vec<ArchiveNalu>,
}

impl TrackPayload {
    /// Payload of a video track.
    pub fn video(codec: Codec, width: u32, height: u32, nalus: Vec<ArchiveNalu>) -> Self {
        Self {
            codec,
            width,
            height,
            nalus,
        }
    }
}

/// Destination of recorded video.
///
/// Implementations are expected to buffer writes; failures are reported to
/// the caller, which decides whether to retry.
pub trait ArchiveSink: Send + Sync {
    /// Append `tracks` to the named stream.
    fn write(&self, stream_name: &str, tracks: HashMap<String, TrackPayload>) -> anyhow::Result<()>;

    /// Hint that buffered writes should be flushed soon.
    fn trigger_flush(&self) {}
}

/// Convert packets into an archive video track.
pub fn packets_to_track(packets: &[SharedPacket], width: u32, height: u32) -> RecorderResult<TrackPayload> {
    let codec = packets.first().map_or(Codec::Unknown, |p| p.codec);
    let mut nalus = Vec::with_capacity(packets.iter().map(|p| p.nalus.len()).sum());
    for packet in packets {
        for nalu in &packet.nalus {
            let mut flags = NaluFlags::ANNEX_B;
            match nalu.abstract_type(packet.codec) {
                AbstractNaluType::EssentialMetadata => flags |= NaluFlags::ESSENTIAL_METADATA,
                AbstractNaluType::Keyframe => flags |= NaluFlags::KEY_FRAME,
                _ => {}
            }
            nalus.push(ArchiveNalu {
                pts: packet.wall_pts,
                flags,
                payload: nalu.as_annexb()?.payload,
            });
        }
    }
    Ok(TrackPayload::video(codec, width, height, nalus))
}

/// Rebuild packets from archived NAL units.
///
/// Consecutive NAL units with the same timestamp form one packet. Packet
/// PTS is measured from the first NAL unit's timestamp.
pub fn packets_from_archive(codec: Codec, nalus: &[ArchiveNalu]) -> PacketBuffer {
    let Some(origin) = nalus.first().map(|n| n.pts) else {
        return PacketBuffer::default();
    };

    let mut packets: Vec<VideoPacket> = Vec::new();
    for archived in nalus {
        let nalu = if archived.flags.contains(NaluFlags::ANNEX_B) {
            Nalu::from_annexb(archived.payload.clone())
        } else {
            Nalu::from_rbsp(archived.payload.clone())
        };
        match packets.last_mut() {
            Some(packet) if packet.wall_pts == archived.pts => packet.nalus.push(nalu),
            _ => {
                let pts = archived.pts.duration_since(origin).unwrap_or_default();
                let index = packets.len() as i64;
                packets.push(VideoPacket::new(codec, vec![nalu], pts, archived.pts).with_recv_id(index));
            }
        }
    }
    PacketBuffer::from_packets(packets)
}

/// Archive that keeps every write in memory.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    writes: Mutex<Vec<(String, HashMap<String, TrackPayload>)>>,
    flushes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, simulating a full or missing disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Every NAL unit written to `track` of `stream_name`, in write order.
    pub fn nalus(&self, stream_name: &str, track: &str) -> Vec<ArchiveNalu> {
        self.writes
            .lock()
            .iter()
            .filter(|(stream, _)| stream == stream_name)
            .filter_map(|(_, tracks)| tracks.get(track))
            .flat_map(|payload| payload.nalus.iter().cloned())
            .collect()
    }
}

impl ArchiveSink for MemoryArchive {
    fn write(&self, stream_name: &str, tracks: HashMap<String, TrackPayload>) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("archive unavailable");
        }
        self.writes.lock().push((stream_name.to_string(), tracks));
        Ok(())
    }

    fn trigger_flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    const SPS: [u8; 10] = [0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x03, 0x20, 0x4D, 0xF9, 0x50];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn packets() -> Vec<SharedPacket> {
        let wall = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        vec![
            Arc::new(VideoPacket::new(
                Codec::H264,
                vec![
                    Nalu::from_rbsp(SPS.to_vec()),
                    Nalu::from_rbsp(PPS.to_vec()),
                    Nalu::from_rbsp(vec![0x65, 0x00, 0x00, 0x01]),
                ],
                Duration::ZERO,
                wall,
            )),
            Arc::new(VideoPacket::new(
                Codec::H264,
                vec![Nalu::from_rbsp(vec![0x41, 0x9A])],
                Duration::from_millis(40),
                wall + Duration::from_millis(40),
            )),
        ]
    }

    #[test]
    fn test_flags_combine() {
        let flags = NaluFlags::ANNEX_B | NaluFlags::KEY_FRAME;
        assert_eq!(flags.bits(), 5);
        assert!(flags.contains(NaluFlags::KEY_FRAME));
        assert!(!flags.contains(NaluFlags::ESSENTIAL_METADATA));
        assert!(flags.contains(NaluFlags::EMPTY));
    }

    #[test]
    fn test_packets_to_track() {
        let track = packets_to_track(&packets(), 800, 600).unwrap();
        assert_eq!(track.codec, Codec::H264);
        assert_eq!((track.width, track.height), (800, 600));
        assert_eq!(track.nalus.len(), 4);

        let flags: Vec<u8> = track.nalus.iter().map(|n| n.flags.bits()).collect();
        assert_eq!(flags, vec![3, 3, 5, 1]);

        // payloads are escaped and carry a start code
        assert_eq!(
            track.nalus[2].payload.as_ref(),
            &[0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x03, 0x01]
        );
        assert_eq!(track.nalus[0].pts, track.nalus[2].pts);
    }

    #[test]
    fn test_packets_from_archive_groups_by_pts() {
        let track = packets_to_track(&packets(), 800, 600).unwrap();
        let buf = packets_from_archive(Codec::H264, &track.nalus);

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.packets[0].nalus.len(), 3);
        assert_eq!(buf.packets[1].pts, Duration::from_millis(40));
        assert_eq!(buf.decode_header().unwrap(), (800, 600));
        assert_eq!(
            buf.packets[0].nalus[2].as_rbsp().payload.as_ref(),
            &[0x65, 0x00, 0x00, 0x01]
        );
        assert!(packets_from_archive(Codec::H264, &[]).is_empty());
    }

    #[test]
    fn test_memory_archive() {
        let archive = MemoryArchive::new();
        let track = packets_to_track(&packets(), 800, 600).unwrap();
        let tracks = HashMap::from([(VIDEO_TRACK.to_string(), track.clone())]);

        archive.write("cam1", tracks.clone()).unwrap();
        archive.set_fail_writes(true);
        assert!(archive.write("cam1", tracks).is_err());
        archive.trigger_flush();

        assert_eq!(archive.write_count(), 1);
        assert_eq!(archive.flush_count(), 1);
        assert_eq!(archive.nalus("cam1", VIDEO_TRACK), track.nalus);
        assert!(archive.nalus("cam2", VIDEO_TRACK).is_empty());
    }
}
