//! MPEG transport stream writer for short clip exports.
//!
//! The output is a single program with one video PID. Every access unit
//! is prefixed with an access unit delimiter, and the most recent
//! parameter sets are repeated in front of every keyframe so that players
//! can start decoding at any keyframe.

use std::io::Write;

use anyhow::{bail, Context};
use bytes::Bytes;
use tracing::{debug, trace};
use vigil_bitstream::{h264, h265, AbstractNaluType, Codec, StartCode};

use crate::container::{to_90khz, AccessUnit, ContainerWriter, DtsExtractor, StreamParameters};

/// Size of a transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;

const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;

/// PID carrying the video elementary stream.
pub const VIDEO_PID: u16 = 256;

const VIDEO_STREAM_ID: u8 = 0xE0;
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_H265: u8 = 0x24;

/// CRC-32/MPEG-2 as used by PSI sections.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= u32::from(b) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Writes access units as an MPEG-TS byte stream.
pub struct MpegTsWriter<W: Write> {
    out: W,
    codec: Codec,
    parameter_sets: Vec<Bytes>,
    dts: DtsExtractor,
    start_dts: Option<u64>,
    first_idr_received: bool,
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    units_written: u64,
}

impl<W: Write> MpegTsWriter<W> {
    /// Create a writer over `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            codec: Codec::Unknown,
            parameter_sets: Vec::new(),
            dts: DtsExtractor::new(),
            start_dts: None,
            first_idr_received: false,
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
            units_written: 0,
        }
    }

    /// Number of access units written so far.
    pub fn units_written(&self) -> u64 {
        self.units_written
    }

    /// Consume the writer and return the underlying output.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn stream_type(&self) -> u8 {
        match self.codec {
            Codec::H265 => STREAM_TYPE_H265,
            _ => STREAM_TYPE_H264,
        }
    }

    fn aud(&self) -> &'static [u8] {
        match self.codec {
            Codec::H265 => &h265::AUD_NALU,
            _ => &h264::AUD_NALU,
        }
    }

    fn write_psi(&mut self, pid: u16, section: &[u8]) -> std::io::Result<()> {
        let cc = if pid == PAT_PID { &mut self.pat_cc } else { &mut self.pmt_cc };
        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        packet[2] = pid as u8;
        packet[3] = 0x10 | *cc;
        *cc = (*cc + 1) & 0x0F;
        packet[4] = 0x00; // pointer_field
        packet[5..5 + section.len()].copy_from_slice(section);
        self.out.write_all(&packet)
    }

    fn write_tables(&mut self) -> std::io::Result<()> {
        let mut pat = vec![0x00, 0xB0, 0x00, 0x00, 0x01, 0xC1, 0x00, 0x00];
        pat.extend_from_slice(&[0x00, 0x01, 0xE0 | (PMT_PID >> 8) as u8, PMT_PID as u8]);
        finish_section(&mut pat);
        self.write_psi(PAT_PID, &pat)?;

        let mut pmt = vec![0x02, 0xB0, 0x00, 0x00, 0x01, 0xC1, 0x00, 0x00];
        pmt.extend_from_slice(&[0xE0 | (VIDEO_PID >> 8) as u8, VIDEO_PID as u8, 0xF0, 0x00]);
        pmt.extend_from_slice(&[
            self.stream_type(),
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
        ]);
        finish_section(&mut pmt);
        self.write_psi(PMT_PID, &pmt)
    }

    fn remember_parameter_set(&mut self, nalu: &[u8]) {
        let t = self.codec.nalu_type(nalu[0]);
        let existing = self
            .parameter_sets
            .iter()
            .position(|p| p.first().map(|&h| self.codec.nalu_type(h)) == Some(t));
        let nalu = Bytes::copy_from_slice(nalu);
        match existing {
            Some(i) => self.parameter_sets[i] = nalu,
            None => self.parameter_sets.push(nalu),
        }
    }

    fn write_pes(&mut self, es: &[u8], pts: u64, dts: u64, keyframe: bool) -> std::io::Result<()> {
        let mut pes = Vec::with_capacity(19 + es.len());
        pes.extend_from_slice(&[0x00, 0x00, 0x01, VIDEO_STREAM_ID, 0x00, 0x00, 0x80]);
        if pts != dts {
            pes.extend_from_slice(&[0xC0, 10]);
            pes.extend_from_slice(&encode_timestamp(0x3, pts));
            pes.extend_from_slice(&encode_timestamp(0x1, dts));
        } else {
            pes.extend_from_slice(&[0x80, 5]);
            pes.extend_from_slice(&encode_timestamp(0x2, pts));
        }
        pes.extend_from_slice(es);

        let pcr = (keyframe || self.units_written == 0).then_some(dts);
        let mut rest = pes.as_slice();
        let mut first = true;

        while !rest.is_empty() {
            let mut adaptation = Vec::new();
            if first && (keyframe || pcr.is_some()) {
                let mut flags = 0u8;
                if keyframe {
                    flags |= 0x40; // random_access_indicator
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                adaptation.push(flags);
                if let Some(pcr) = pcr {
                    adaptation.extend_from_slice(&encode_pcr(pcr));
                }
            }

            let mut has_adaptation = !adaptation.is_empty();
            let overhead = if has_adaptation { 1 + adaptation.len() } else { 0 };
            let capacity = TS_PAYLOAD_SIZE - overhead;
            let chunk = rest.len().min(capacity);
            let stuffing = capacity - chunk;
            if stuffing > 0 {
                if has_adaptation {
                    adaptation.resize(adaptation.len() + stuffing, 0xFF);
                } else {
                    has_adaptation = true;
                    if stuffing > 1 {
                        adaptation.push(0x00);
                        adaptation.resize(stuffing - 1, 0xFF);
                    }
                }
            }

            let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
            packet.push(SYNC_BYTE);
            packet.push((if first { 0x40 } else { 0x00 }) | ((VIDEO_PID >> 8) as u8 & 0x1F));
            packet.push(VIDEO_PID as u8);
            packet.push((if has_adaptation { 0x30 } else { 0x10 }) | self.video_cc);
            self.video_cc = (self.video_cc + 1) & 0x0F;
            if has_adaptation {
                packet.push(adaptation.len() as u8);
                packet.extend_from_slice(&adaptation);
            }
            packet.extend_from_slice(&rest[..chunk]);
            debug_assert_eq!(packet.len(), TS_PACKET_SIZE);
            self.out.write_all(&packet)?;

            rest = &rest[chunk..];
            first = false;
        }
        Ok(())
    }
}

fn finish_section(section: &mut Vec<u8>) {
    let length = section.len() - 3 + 4;
    section[1] = 0xB0 | ((length >> 8) as u8 & 0x0F);
    section[2] = length as u8;
    let crc = crc32_mpeg2(section);
    section.extend_from_slice(&crc.to_be_bytes());
}

fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1,
        (ts >> 22) as u8,
        ((((ts >> 15) & 0x7F) as u8) << 1) | 1,
        (ts >> 7) as u8,
        (((ts & 0x7F) as u8) << 1) | 1,
    ]
}

fn encode_pcr(base: u64) -> [u8; 6] {
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) as u8) << 7) | 0x7E,
        0x00,
    ]
}

impl<W: Write> ContainerWriter for MpegTsWriter<W> {
    fn begin(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        if !matches!(params.codec, Codec::H264 | Codec::H265) {
            bail!("MPEG-TS export does not support codec {}", params.codec);
        }
        self.codec = params.codec;
        for set in &params.parameter_sets {
            if !set.is_empty() {
                self.remember_parameter_set(set);
            }
        }
        self.write_tables().context("writing PAT/PMT")?;
        debug!(codec = %self.codec, "MPEG-TS export started");
        Ok(())
    }

    fn write_access_unit(&mut self, unit: &AccessUnit<'_>) -> anyhow::Result<()> {
        let codec = self.codec;
        let aud_type = codec.aud_type();

        let mut has_keyframe = false;
        let mut has_frame = false;
        let mut body: Vec<&[u8]> = Vec::with_capacity(unit.nalus.len());
        for nalu in unit.nalus {
            let data = nalu.payload_only();
            let Some(&header) = data.first() else { continue };
            match codec.abstract_type(codec.nalu_type(header)) {
                AbstractNaluType::EssentialMetadata => {
                    self.remember_parameter_set(data);
                    continue;
                }
                AbstractNaluType::Keyframe => {
                    has_keyframe = true;
                    has_frame = true;
                }
                AbstractNaluType::InterFrame => has_frame = true,
                AbstractNaluType::Other if Some(codec.nalu_type(header)) == aud_type => continue,
                AbstractNaluType::Other => {}
            }
            body.push(data);
        }

        if !has_frame {
            trace!("Skipping access unit without picture data");
            return Ok(());
        }
        if !self.first_idr_received {
            if !has_keyframe {
                trace!("Skipping access unit before first keyframe");
                return Ok(());
            }
            self.first_idr_received = true;
        }

        let mut es = Vec::new();
        let mut push = |nalu: &[u8]| {
            es.extend_from_slice(StartCode::Long.bytes());
            es.extend_from_slice(nalu);
        };
        push(self.aud());
        if has_keyframe {
            for set in &self.parameter_sets {
                push(&set[..]);
            }
        }
        for nalu in body {
            push(nalu);
        }

        let pts = to_90khz(unit.pts);
        let dts = self.dts.extract(pts);
        let base = *self.start_dts.get_or_insert(dts);
        let (pts, dts) = (pts.max(dts) - base, dts - base);

        if has_keyframe && self.units_written > 0 {
            self.write_tables().context("writing PAT/PMT")?;
        }
        self.write_pes(&es, pts, dts, has_keyframe)
            .context("writing PES packet")?;
        self.units_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.out.flush().context("flushing MPEG-TS output")?;
        debug!(units = self.units_written, "MPEG-TS export finished");
        Ok(())
    }
}
