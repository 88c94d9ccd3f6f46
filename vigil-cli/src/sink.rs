//! Archive sink that appends recorded video to an Annex-B file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vigil_recorder::{ArchiveSink, TrackPayload, VIDEO_TRACK};

/// Writes the video track of every stream to one elementary stream file.
pub struct AnnexbFileSink {
    out: Mutex<BufWriter<File>>,
    nalus: AtomicU64,
    bytes: AtomicU64,
}

impl AnnexbFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        info!(path = %path.display(), "Writing recording");
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
            nalus: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        })
    }

    /// NAL units and bytes written so far.
    pub fn totals(&self) -> (u64, u64) {
        (self.nalus.load(Ordering::Relaxed), self.bytes.load(Ordering::Relaxed))
    }

    pub fn finish(&self) -> Result<()> {
        self.out.lock().flush().context("flushing recording")
    }
}

impl ArchiveSink for AnnexbFileSink {
    fn write(&self, stream_name: &str, tracks: HashMap<String, TrackPayload>) -> Result<()> {
        let Some(video) = tracks.get(VIDEO_TRACK) else {
            return Ok(());
        };
        let mut out = self.out.lock();
        for nalu in &video.nalus {
            out.write_all(&nalu.payload)?;
            self.bytes.fetch_add(nalu.payload.len() as u64, Ordering::Relaxed);
        }
        self.nalus.fetch_add(video.nalus.len() as u64, Ordering::Relaxed);
        debug!(stream = stream_name, nalus = video.nalus.len(), "Appended to recording");
        Ok(())
    }

    fn trigger_flush(&self) {
        if let Err(e) = self.out.lock().flush() {
            warn!(error = %e, "Failed to flush recording");
        }
    }
}
