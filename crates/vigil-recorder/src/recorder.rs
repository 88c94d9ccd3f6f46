//! Recorder state machine.
//!
//! A recorder moves through `WaitingForKeyframe -> Recording -> Stopped`
//! on its own thread. While waiting, it retries a history extraction with
//! backoff. Once the ring buffer yields a keyframe-anchored window, the
//! recorder registers its live listener under the same ring buffer lock,
//! so the live feed continues exactly where the history ends.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use vigil_packet::{PacketBuffer, SharedPacket, VideoPacket};
use vigil_ringbuffer::{ExtractMethod, RateLimitedLog, VideoRingBuffer};

use crate::archive::{packets_to_track, ArchiveSink, VIDEO_TRACK};
use crate::config::RecorderConfig;
use crate::error::RecorderError;
use crate::RecorderResult;

/// Recorder lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecorderState {
    /// Waiting for the ring buffer to hold a decodable keyframe.
    WaitingForKeyframe,
    /// Writing live packets to the archive.
    Recording,
    /// Finished; the live listener is unregistered.
    Stopped,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitingForKeyframe => f.write_str("waiting for keyframe"),
            Self::Recording => f.write_str("recording"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Snapshot of a recorder's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub state: RecorderState,
    /// Extraction attempts made while waiting for a keyframe.
    pub attempts: u64,
    /// Packets written from the ring buffer history.
    pub history_packets: u64,
    /// Packets written in total, history included.
    pub packets_written: u64,
    /// Archive writes that failed.
    pub write_failures: u64,
    /// Stream dimensions decoded from the history.
    pub dimensions: Option<(u32, u32)>,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    history_packets: AtomicU64,
    packets_written: AtomicU64,
    write_failures: AtomicU64,
}

/// State shared between the handle and the recording thread.
struct Shared {
    stream_name: String,
    state: RwLock<RecorderState>,
    dimensions: RwLock<Option<(u32, u32)>>,
    counters: Counters,
}

impl Shared {
    fn set_state(&self, next: RecorderState) {
        let mut state = self.state.write();
        if *state != next {
            info!(stream = %self.stream_name, from = %*state, to = %next, "Recorder state change");
            *state = next;
        }
    }
}

/// Writes a ring buffer's history and live feed to an archive stream.
///
/// Dropping the recorder stops it and waits for the recording thread.
pub struct VideoRecorder {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl VideoRecorder {
    /// Start recording `ring` into `stream_name` of `archive`.
    ///
    /// Returns immediately; waiting for a keyframe happens on the
    /// recording thread.
    #[instrument(name = "recorder_start", skip_all)]
    pub fn start(
        ring: Arc<VideoRingBuffer>,
        stream_name: impl Into<String>,
        archive: Arc<dyn ArchiveSink>,
        config: RecorderConfig,
    ) -> RecorderResult<Self> {
        let shared = Arc::new(Shared {
            stream_name: stream_name.into(),
            state: RwLock::new(RecorderState::WaitingForKeyframe),
            dimensions: RwLock::new(None),
            counters: Counters::default(),
        });
        info!(
            stream = %shared.stream_name,
            history_secs = config.include_history.as_secs_f64(),
            policy = ?config.listener_policy,
            "Starting recorder"
        );

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (packet_tx, packet_rx) = bounded(config.channel_capacity);
        let worker = Worker {
            ring,
            archive,
            write_warning: RateLimitedLog::new(config.write_warning_interval),
            config,
            shared: Arc::clone(&shared),
            packet_tx,
            packet_rx,
            stop_rx,
        };

        let thread = thread::Builder::new()
            .name(format!("recorder-{}", shared.stream_name))
            .spawn(move || worker.run())?;

        Ok(Self {
            shared,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.shared.stream_name
    }

    pub fn state(&self) -> RecorderState {
        *self.shared.state.read()
    }

    /// Stream dimensions, known once recording has started.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        *self.shared.dimensions.read()
    }

    pub fn stats(&self) -> RecorderStats {
        let counters = &self.shared.counters;
        RecorderStats {
            state: self.state(),
            attempts: counters.attempts.load(Ordering::Relaxed),
            history_packets: counters.history_packets.load(Ordering::Relaxed),
            packets_written: counters.packets_written.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
            dimensions: self.dimensions(),
        }
    }

    /// Signal the recording thread to stop without waiting for it.
    pub fn request_stop(&mut self) {
        // closing the channel wakes the thread
        self.stop_tx.take();
    }

    /// Stop recording and wait until the last write has finished.
    #[instrument(name = "recorder_stop", skip(self), fields(stream = %self.shared.stream_name))]
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Recorder thread panicked");
            }
            self.shared.set_state(RecorderState::Stopped);
        }
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    ring: Arc<VideoRingBuffer>,
    archive: Arc<dyn ArchiveSink>,
    config: RecorderConfig,
    shared: Arc<Shared>,
    packet_tx: Sender<SharedPacket>,
    packet_rx: Receiver<SharedPacket>,
    stop_rx: Receiver<()>,
    write_warning: RateLimitedLog,
}

impl Worker {
    fn run(self) {
        debug!(stream = %self.shared.stream_name, "Recorder thread started");

        let Some(history) = self.wait_for_keyframe() else {
            info!(stream = %self.shared.stream_name, "Recorder stopped before it started");
            self.shared.set_state(RecorderState::Stopped);
            return;
        };

        self.write_history(&history);
        self.shared.set_state(RecorderState::Recording);
        let started = Instant::now();

        loop {
            select! {
                recv(self.stop_rx) -> _ => break,
                recv(self.packet_rx) -> msg => match msg {
                    Ok(packet) => self.write_packets(&[packet]),
                    Err(_) => break,
                },
            }
        }

        self.ring.remove_listener(&self.packet_tx);
        let discarded = self.packet_rx.try_iter().count();
        self.shared.set_state(RecorderState::Stopped);
        info!(
            stream = %self.shared.stream_name,
            elapsed = ?started.elapsed(),
            discarded,
            "Recorder stopped"
        );
    }

    /// Retry until history can be extracted, or return `None` on stop.
    fn wait_for_keyframe(&self) -> Option<PacketBuffer> {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.config.backoff.delay_for_attempt(attempt);
            select! {
                recv(self.stop_rx) -> _ => return None,
                recv(after(delay)) -> _ => {}
            }

            self.shared.counters.attempts.fetch_add(1, Ordering::Relaxed);
            match self.try_handoff() {
                Ok(history) => return Some(history),
                Err(e) if e.is_fatal() => {
                    warn!(stream = %self.shared.stream_name, error = %e, "Recorder history extraction failed");
                }
                Err(e) if attempt == self.config.not_ready_warning_attempt => {
                    warn!(stream = %self.shared.stream_name, attempt, error = %e, "Recorder not ready yet");
                }
                Err(e) => {
                    debug!(stream = %self.shared.stream_name, attempt, error = %e, "Recorder not ready");
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Extract history and register the live listener in one critical section.
    fn try_handoff(&self) -> RecorderResult<PacketBuffer> {
        let mut guard = self.ring.lock();
        let history = guard.extract(
            ExtractMethod::ShallowClone,
            self.config.include_history,
            self.config.extract_mode,
        )?;
        let dimensions = history.decode_header()?;
        *self.shared.dimensions.write() = Some(dimensions);
        guard.add_listener(
            format!("recorder:{}", self.shared.stream_name),
            self.packet_tx.clone(),
            self.config.listener_policy,
        );
        Ok(history)
    }

    fn write_history(&self, history: &PacketBuffer) {
        let backlog: Vec<SharedPacket> = history
            .packets
            .iter()
            .map(|p| {
                Arc::new(VideoPacket {
                    is_backlog: true,
                    ..VideoPacket::clone(p)
                })
            })
            .collect();
        self.shared
            .counters
            .history_packets
            .fetch_add(backlog.len() as u64, Ordering::Relaxed);
        info!(
            stream = %self.shared.stream_name,
            packets = backlog.len(),
            duration = ?history.duration(),
            "Writing recorder history"
        );

        self.write_packets(&backlog);
        // the backlog can be large enough to fill the archive's write buffer
        self.archive.trigger_flush();
    }

    fn write_packets(&self, packets: &[SharedPacket]) {
        let counters = &self.shared.counters;
        match self.try_write(packets) {
            Ok(()) => {
                counters
                    .packets_written
                    .fetch_add(packets.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.write_warning.tick() {
                    warn!(
                        stream = %self.shared.stream_name,
                        error = %e,
                        suppressed,
                        "Recorder failed to write to archive"
                    );
                }
            }
        }
    }

    fn try_write(&self, packets: &[SharedPacket]) -> RecorderResult<()> {
        let (width, height) = self.shared.dimensions.read().unwrap_or_default();
        let track = packets_to_track(packets, width, height)?;
        let tracks = HashMap::from([(VIDEO_TRACK.to_string(), track)]);
        self.archive
            .write(&self.shared.stream_name, tracks)
            .map_err(RecorderError::Archive)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use vigil_bitstream::{Codec, Nalu};
    use vigil_ringbuffer::FullChannelPolicy;

    use super::*;
    use crate::archive::MemoryArchive;
    use crate::config::BackoffPolicy;

    const SPS: [u8; 10] = [0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x03, 0x20, 0x4D, 0xF9, 0x50];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn packet(index: u64) -> VideoPacket {
        let pts = Duration::from_millis(index * 40);
        let nalus = if index % 10 == 0 {
            vec![
                Nalu::from_rbsp(SPS.to_vec()),
                Nalu::from_rbsp(PPS.to_vec()),
                Nalu::from_rbsp(vec![0x65, 0x88, 0x84]),
            ]
        } else {
            vec![Nalu::from_rbsp(vec![0x41, 0x9A, index as u8])]
        };
        VideoPacket::new(Codec::H264, nalus, pts, SystemTime::UNIX_EPOCH + pts)
    }

    fn fast_config() -> RecorderConfig {
        RecorderConfig {
            include_history: Duration::ZERO,
            listener_policy: FullChannelPolicy::Stall,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(5),
                multiplier: 1.0,
                max_exponent: 0,
            },
            ..RecorderConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_stop_before_keyframe() {
        let ring = Arc::new(VideoRingBuffer::with_max_weight(1 << 20));
        ring.add(packet(1));
        let archive = Arc::new(MemoryArchive::new());
        let mut recorder = VideoRecorder::start(Arc::clone(&ring), "cam", archive.clone(), fast_config()).unwrap();

        assert!(wait_for(|| recorder.stats().attempts >= 3));
        assert_eq!(recorder.state(), RecorderState::WaitingForKeyframe);

        recorder.stop();
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert_eq!(archive.write_count(), 0);
        assert_eq!(ring.listener_count(), 0);
    }

    #[test]
    fn test_history_then_live() {
        let ring = Arc::new(VideoRingBuffer::with_max_weight(1 << 20));
        for i in 0..15 {
            ring.add(packet(i));
        }
        let archive = Arc::new(MemoryArchive::new());
        let mut recorder = VideoRecorder::start(Arc::clone(&ring), "cam", archive.clone(), fast_config()).unwrap();

        assert!(wait_for(|| recorder.state() == RecorderState::Recording));
        assert_eq!(recorder.dimensions(), Some((800, 600)));
        assert_eq!(archive.flush_count(), 1);
        assert_eq!(ring.listener_count(), 1);

        // history starts at the newest keyframe, packet 10
        let history = archive.nalus("cam", VIDEO_TRACK);
        assert_eq!(history.len(), 3 + 4);
        assert_eq!(history[0].pts, SystemTime::UNIX_EPOCH + Duration::from_millis(400));

        ring.add(packet(15));
        assert!(wait_for(|| recorder.stats().packets_written == 6));

        recorder.stop();
        let stats = recorder.stats();
        assert_eq!(stats.history_packets, 5);
        assert_eq!(stats.state, RecorderState::Stopped);
        assert_eq!(ring.listener_count(), 0);
    }

    #[test]
    fn test_write_failures_are_counted() {
        let ring = Arc::new(VideoRingBuffer::with_max_weight(1 << 20));
        ring.add(packet(0));
        let archive = Arc::new(MemoryArchive::new());
        archive.set_fail_writes(true);
        let mut recorder = VideoRecorder::start(Arc::clone(&ring), "cam", archive.clone(), fast_config()).unwrap();

        assert!(wait_for(|| recorder.state() == RecorderState::Recording));
        ring.add(packet(1));
        ring.add(packet(2));
        assert!(wait_for(|| recorder.stats().write_failures == 3));

        archive.set_fail_writes(false);
        ring.add(packet(3));
        assert!(wait_for(|| recorder.stats().packets_written == 1));

        drop(recorder);
        assert_eq!(ring.listener_count(), 0);
    }
}
