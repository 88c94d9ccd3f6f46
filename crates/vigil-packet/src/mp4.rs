//! Progressive MP4 writer for short clip exports.
//!
//! Samples are buffered in memory and the file is written on
//! [`ContainerWriter::finish`] as `ftyp`, `mdat`, `moov`. Clips are short
//! diagnostic exports, so a single chunk holding every sample is enough.

use std::io::Write;

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};
use vigil_bitstream::{build_avc_decoder_config, h264, nals_to_avcc, AbstractNaluType, Codec};

use crate::container::{to_90khz, AccessUnit, ContainerWriter, StreamParameters};

const MEDIA_TIMESCALE: u32 = 90_000;
const MOVIE_TIMESCALE: u32 = 1_000;
/// Sample duration used for the last sample when nothing better is known.
const DEFAULT_SAMPLE_DURATION: u32 = 3_000;
const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

struct Sample {
    pts: u64,
    size: u32,
    keyframe: bool,
}

/// Writes H.264 access units as a progressive MP4 file.
pub struct Mp4Writer<W: Write> {
    out: W,
    width: u32,
    height: u32,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    samples: Vec<Sample>,
    mdat: BytesMut,
}

fn write_box(buf: &mut BytesMut, kind: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(kind);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(buf: &mut BytesMut, kind: &[u8; 4], version: u8, flags: u32, body: impl FnOnce(&mut BytesMut)) {
    write_box(buf, kind, |b| {
        b.put_u32((u32::from(version) << 24) | (flags & 0x00FF_FFFF));
        body(b);
    });
}

fn put_matrix(b: &mut BytesMut) {
    for v in UNITY_MATRIX {
        b.put_u32(v);
    }
}

impl<W: Write> Mp4Writer<W> {
    /// Create a writer over `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            width: 0,
            height: 0,
            sps: None,
            pps: None,
            samples: Vec::new(),
            mdat: BytesMut::new(),
        }
    }

    /// Number of samples buffered so far.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Consume the writer and return the underlying output.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn durations(&self) -> Vec<u32> {
        let mut durations: Vec<u32> = self
            .samples
            .windows(2)
            .map(|w| w[1].pts.saturating_sub(w[0].pts).clamp(1, u64::from(u32::MAX)) as u32)
            .collect();
        let last = durations.last().copied().unwrap_or(DEFAULT_SAMPLE_DURATION);
        if !self.samples.is_empty() {
            durations.push(last);
        }
        durations
    }

    fn build_moov(&self, avcc: &[u8], chunk_offset: u32) -> BytesMut {
        let durations = self.durations();
        let media_duration: u64 = durations.iter().map(|&d| u64::from(d)).sum();
        let movie_duration = media_duration * u64::from(MOVIE_TIMESCALE) / u64::from(MEDIA_TIMESCALE);

        let mut stts: Vec<(u32, u32)> = Vec::new();
        for &d in &durations {
            match stts.last_mut() {
                Some((count, delta)) if *delta == d => *count += 1,
                _ => stts.push((1, d)),
            }
        }
        let sync: Vec<u32> = self
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.keyframe)
            .map(|(i, _)| i as u32 + 1)
            .collect();

        let mut buf = BytesMut::new();
        write_box(&mut buf, b"moov", |b| {
            write_full_box(b, b"mvhd", 0, 0, |b| {
                b.put_u32(0); // creation_time
                b.put_u32(0); // modification_time
                b.put_u32(MOVIE_TIMESCALE);
                b.put_u32(movie_duration as u32);
                b.put_u32(0x0001_0000); // rate
                b.put_u16(0x0100); // volume
                b.put_bytes(0, 10);
                put_matrix(b);
                b.put_bytes(0, 24);
                b.put_u32(2); // next_track_ID
            });
            write_box(b, b"trak", |b| {
                write_full_box(b, b"tkhd", 0, 0x000003, |b| {
                    b.put_u32(0);
                    b.put_u32(0);
                    b.put_u32(1); // track_ID
                    b.put_u32(0);
                    b.put_u32(movie_duration as u32);
                    b.put_bytes(0, 8);
                    b.put_u16(0); // layer
                    b.put_u16(0); // alternate_group
                    b.put_u16(0); // volume
                    b.put_u16(0);
                    put_matrix(b);
                    b.put_u32(self.width << 16);
                    b.put_u32(self.height << 16);
                });
                write_box(b, b"mdia", |b| {
                    write_full_box(b, b"mdhd", 0, 0, |b| {
                        b.put_u32(0);
                        b.put_u32(0);
                        b.put_u32(MEDIA_TIMESCALE);
                        b.put_u32(media_duration as u32);
                        b.put_u16(0x55C4); // "und"
                        b.put_u16(0);
                    });
                    write_full_box(b, b"hdlr", 0, 0, |b| {
                        b.put_u32(0);
                        b.put_slice(b"vide");
                        b.put_bytes(0, 12);
                        b.put_slice(b"VideoHandler\0");
                    });
                    write_box(b, b"minf", |b| {
                        write_full_box(b, b"vmhd", 0, 1, |b| {
                            b.put_u16(0); // graphicsmode
                            b.put_bytes(0, 6); // opcolor
                        });
                        write_box(b, b"dinf", |b| {
                            write_full_box(b, b"dref", 0, 0, |b| {
                                b.put_u32(1);
                                write_full_box(b, b"url ", 0, 1, |_| {});
                            });
                        });
                        write_box(b, b"stbl", |b| {
                            write_full_box(b, b"stsd", 0, 0, |b| {
                                b.put_u32(1);
                                write_box(b, b"avc1", |b| {
                                    b.put_bytes(0, 6);
                                    b.put_u16(1); // data_reference_index
                                    b.put_bytes(0, 16);
                                    b.put_u16(self.width as u16);
                                    b.put_u16(self.height as u16);
                                    b.put_u32(0x0048_0000); // 72 dpi
                                    b.put_u32(0x0048_0000);
                                    b.put_u32(0);
                                    b.put_u16(1); // frame_count
                                    b.put_bytes(0, 32); // compressorname
                                    b.put_u16(0x0018); // depth
                                    b.put_i16(-1);
                                    write_box(b, b"avcC", |b| b.put_slice(avcc));
                                });
                            });
                            write_full_box(b, b"stts", 0, 0, |b| {
                                b.put_u32(stts.len() as u32);
                                for &(count, delta) in &stts {
                                    b.put_u32(count);
                                    b.put_u32(delta);
                                }
                            });
                            write_full_box(b, b"stss", 0, 0, |b| {
                                b.put_u32(sync.len() as u32);
                                for &n in &sync {
                                    b.put_u32(n);
                                }
                            });
                            write_full_box(b, b"stsc", 0, 0, |b| {
                                b.put_u32(1);
                                b.put_u32(1); // first_chunk
                                b.put_u32(self.samples.len() as u32);
                                b.put_u32(1); // sample_description_index
                            });
                            write_full_box(b, b"stsz", 0, 0, |b| {
                                b.put_u32(0);
                                b.put_u32(self.samples.len() as u32);
                                for s in &self.samples {
                                    b.put_u32(s.size);
                                }
                            });
                            write_full_box(b, b"stco", 0, 0, |b| {
                                b.put_u32(1);
                                b.put_u32(chunk_offset);
                            });
                        });
                    });
                });
            });
        });
        buf
    }
}

impl<W: Write> ContainerWriter for Mp4Writer<W> {
    fn begin(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        if params.codec != Codec::H264 {
            bail!("MP4 export does not support codec {}", params.codec);
        }
        self.width = params.width;
        self.height = params.height;
        for set in &params.parameter_sets {
            match set.first().map(|&h| h264::nalu_type(h)) {
                Some(h264::SPS) => self.sps = Some(set.clone()),
                Some(h264::PPS) => self.pps = Some(set.clone()),
                _ => {}
            }
        }
        Ok(())
    }

    fn write_access_unit(&mut self, unit: &AccessUnit<'_>) -> anyhow::Result<()> {
        let mut keyframe = false;
        let mut nals: Vec<&[u8]> = Vec::with_capacity(unit.nalus.len());
        for nalu in unit.nalus {
            let data = nalu.payload_only();
            let Some(&header) = data.first() else { continue };
            let t = h264::nalu_type(header);
            match Codec::H264.abstract_type(t) {
                AbstractNaluType::EssentialMetadata => {
                    if t == h264::SPS && self.sps.is_none() {
                        self.sps = Some(Bytes::copy_from_slice(data));
                    } else if t == h264::PPS && self.pps.is_none() {
                        self.pps = Some(Bytes::copy_from_slice(data));
                    }
                    continue;
                }
                AbstractNaluType::Keyframe => keyframe = true,
                AbstractNaluType::Other if t == h264::AUD => continue,
                _ => {}
            }
            nals.push(data);
        }

        if nals.is_empty() || (self.samples.is_empty() && !keyframe) {
            trace!("Skipping access unit before first keyframe");
            return Ok(());
        }

        let sample = nals_to_avcc(&nals);
        let size = u32::try_from(sample.len()).context("sample larger than 4 GiB")?;
        self.mdat.put_slice(&sample);
        self.samples.push(Sample {
            pts: to_90khz(unit.pts),
            size,
            keyframe,
        });
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.samples.is_empty() {
            bail!("MP4 export has no samples");
        }
        let (Some(sps), Some(pps)) = (&self.sps, &self.pps) else {
            bail!("MP4 export needs an SPS and a PPS");
        };
        let avcc = build_avc_decoder_config(sps, pps)?;

        let mut head = BytesMut::new();
        write_box(&mut head, b"ftyp", |b| {
            b.put_slice(b"isom");
            b.put_u32(0x200);
            for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
                b.put_slice(brand);
            }
        });
        let mdat_size = u32::try_from(8 + self.mdat.len()).context("mdat larger than 4 GiB")?;
        head.put_u32(mdat_size);
        head.put_slice(b"mdat");
        let chunk_offset = head.len() as u32;

        let moov = self.build_moov(&avcc, chunk_offset);
        self.out.write_all(&head).context("writing MP4 header")?;
        self.out.write_all(&self.mdat).context("writing MP4 sample data")?;
        self.out.write_all(&moov).context("writing MP4 movie box")?;
        self.out.flush().context("flushing MP4 output")?;

        debug!(samples = self.samples.len(), bytes = self.mdat.len(), "MP4 export finished");
        Ok(())
    }
}
