//! Raw NAL unit dumps for offline analysis.
//!
//! Each NAL unit is written as RBSP to its own file named
//! `PPP-NNN.TTTTTTTTTTTT.raw`: packet index, NAL unit index within the
//! packet, and the packet PTS in nanoseconds.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;
use vigil_bitstream::{Codec, Nalu};

use crate::buffer::PacketBuffer;
use crate::error::PacketError;
use crate::packet::VideoPacket;
use crate::PacketResult;

const DUMP_EXTENSION: &str = "raw";

/// Fields encoded in a dump file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpFileName {
    /// Index of the packet within the buffer.
    pub packet: usize,
    /// Index of the NAL unit within the packet.
    pub nalu: usize,
    /// Packet PTS in nanoseconds.
    pub pts_ns: u64,
}

impl DumpFileName {
    /// File name for these fields.
    pub fn format(&self) -> String {
        format!("{:03}-{:03}.{:012}.{DUMP_EXTENSION}", self.packet, self.nalu, self.pts_ns)
    }

    /// Parse a dump file name, returning `None` if it does not match.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(DUMP_EXTENSION)?.strip_suffix('.')?;
        let (indices, pts) = stem.split_once('.')?;
        let (packet, nalu) = indices.split_once('-')?;
        Some(Self {
            packet: packet.parse().ok()?,
            nalu: nalu.parse().ok()?,
            pts_ns: pts.parse().ok()?,
        })
    }
}

impl PacketBuffer {
    /// Write every NAL unit as RBSP into `dir`, replacing any earlier dump.
    ///
    /// Returns the number of files written.
    pub fn dump_bin(&self, dir: &Path) -> PacketResult<usize> {
        fs::create_dir_all(dir)?;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == DUMP_EXTENSION) {
                fs::remove_file(&path)?;
            }
        }

        let mut written = 0;
        for (i, packet) in self.packets.iter().enumerate() {
            for (j, nalu) in packet.nalus.iter().enumerate() {
                let name = DumpFileName {
                    packet: i,
                    nalu: j,
                    pts_ns: packet.pts.as_nanos() as u64,
                };
                fs::write(dir.join(name.format()), nalu.as_rbsp().payload)?;
                written += 1;
            }
        }
        debug!(dir = %dir.display(), files = written, "Dumped packet buffer");
        Ok(written)
    }

    /// Load a directory written by [`PacketBuffer::dump_bin`].
    ///
    /// Wall clock times are reconstructed as the UNIX epoch plus the PTS.
    pub fn load_bin_dir(dir: &Path, codec: Codec) -> PacketResult<Self> {
        let mut files: Vec<(DumpFileName, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|e| e == DUMP_EXTENSION) {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(DumpFileName::parse)
                .ok_or_else(|| PacketError::InvalidDumpFile(path.clone()))?;
            files.push((name, path));
        }
        files.sort_by_key(|(name, _)| (name.packet, name.nalu));

        let mut packets: Vec<VideoPacket> = Vec::new();
        let mut current: Option<usize> = None;
        for (name, path) in files {
            let nalu = Nalu::from_rbsp(fs::read(&path)?);
            match packets.last_mut() {
                Some(packet) if current == Some(name.packet) => packet.nalus.push(nalu),
                _ => {
                    let pts = Duration::from_nanos(name.pts_ns);
                    packets.push(
                        VideoPacket::new(codec, vec![nalu], pts, SystemTime::UNIX_EPOCH + pts)
                            .with_recv_id(name.packet as i64),
                    );
                    current = Some(name.packet);
                }
            }
        }

        debug!(dir = %dir.display(), packets = packets.len(), "Loaded packet dump");
        Ok(Self::from_packets(packets))
    }
}
