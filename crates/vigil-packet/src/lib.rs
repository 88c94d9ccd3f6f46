//! Video packets and packet buffers.
//!
//! A [`VideoPacket`] is one access unit received from a camera. A
//! [`PacketBuffer`] is an ordered snapshot of packets that can be analysed,
//! dumped, or exported to MPEG-TS and MP4 containers.

mod buffer;
mod config;
mod container;
mod dump;
mod error;
mod mp4;
mod mpegts;
mod packet;
mod thumbnail;

pub use buffer::PacketBuffer;
pub use config::PacketConfig;
pub use container::{to_90khz, AccessUnit, ContainerWriter, DtsExtractor, StreamParameters};
pub use dump::DumpFileName;
pub use error::PacketError;
pub use mp4::Mp4Writer;
pub use mpegts::{crc32_mpeg2, MpegTsWriter, TS_PACKET_SIZE, VIDEO_PID};
pub use packet::{SharedPacket, VideoPacket};
pub use thumbnail::FrameDecoder;

/// Result type for packet operations.
pub type PacketResult<T> = Result<T, PacketError>;
