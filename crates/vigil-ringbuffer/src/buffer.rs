//! Shared ring buffer with listener fan-out.
//!
//! Three locks protect a [`VideoRingBuffer`]: the packet storage, a delivery
//! lock that serializes fan-out, and the listener registry. They are always
//! taken in [`LockLevel`] order. `add` snapshots the listener registry while
//! it still holds the storage lock and then hands over to the delivery lock
//! before releasing storage, so a listener registered under a
//! [`RingBufferGuard`] receives exactly the packets added after the guard is
//! released.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, trace, warn};
use vigil_bitstream::AbstractNaluType;
use vigil_packet::{PacketBuffer, SharedPacket};

use crate::config::{ExtractMethod, ExtractMode, FullChannelPolicy, RingBufferConfig};
use crate::error::RingBufferError;
use crate::listener::{Delivery, Listener, ListenerStats};
use crate::lock_order::{self, LevelToken, LockLevel};
use crate::ring::{PushOutcome, WeightedRing};
use crate::RingBufferResult;

type ListenerList = Arc<Vec<Arc<Listener>>>;

/// Byte-budgeted history of one camera stream.
pub struct VideoRingBuffer {
    config: RingBufferConfig,
    ring: Mutex<WeightedRing<SharedPacket>>,
    delivery: Mutex<()>,
    listeners: Mutex<ListenerList>,
}

impl VideoRingBuffer {
    /// Create an empty ring buffer.
    pub fn new(config: RingBufferConfig) -> Self {
        info!(max_weight_bytes = config.max_weight_bytes, "Creating video ring buffer");
        Self {
            ring: Mutex::new(WeightedRing::new(config.max_weight_bytes)),
            delivery: Mutex::new(()),
            listeners: Mutex::new(Arc::new(Vec::new())),
            config,
        }
    }

    /// Create an empty ring buffer with the given byte budget.
    pub fn with_max_weight(max_weight_bytes: usize) -> Self {
        Self::new(RingBufferConfig {
            max_weight_bytes,
            ..RingBufferConfig::default()
        })
    }

    pub fn config(&self) -> &RingBufferConfig {
        &self.config
    }

    /// Lock the packet storage.
    ///
    /// Packets added by other threads wait until the guard is dropped. Any
    /// per-camera lock must be acquired before calling this.
    pub fn lock(&self) -> RingBufferGuard<'_> {
        let order = lock_order::acquire(LockLevel::RingBuffer);
        RingBufferGuard {
            owner: self,
            ring: self.ring.lock(),
            _order: order,
        }
    }

    /// Store a packet and deliver it to every listener.
    ///
    /// Blocks while a `Stall` listener's channel is full. A packet larger
    /// than the whole budget is delivered but not stored.
    pub fn add(&self, packet: impl Into<SharedPacket>) -> PushOutcome {
        let packet = packet.into();
        let weight = packet.payload_bytes();

        let (outcome, listeners, delivery) = {
            let mut guard = self.lock();
            let outcome = guard.ring.push(weight, Arc::clone(&packet));
            match outcome {
                PushOutcome::Stored { evicted } if evicted > 0 => {
                    trace!(evicted, weight_bytes = guard.ring.weight_bytes(), "Evicted packets");
                }
                PushOutcome::Rejected => {
                    warn!(
                        packet_bytes = weight,
                        max_weight_bytes = self.config.max_weight_bytes,
                        "Packet exceeds ring buffer budget, not storing it"
                    );
                }
                PushOutcome::Stored { .. } => {}
            }
            let listeners = self.snapshot_listeners();
            let delivery = DeliveryGuard::new(&self.delivery);
            (outcome, listeners, delivery)
        };

        let mut disconnected = Vec::new();
        for listener in listeners.iter() {
            if listener.deliver(&packet) == Delivery::Disconnected {
                disconnected.push(Arc::clone(listener));
            }
        }
        drop(delivery);

        if !disconnected.is_empty() {
            self.prune(&disconnected);
        }
        outcome
    }

    /// Extract a keyframe-anchored window covering at least `min_duration`.
    pub fn extract(
        &self,
        method: ExtractMethod,
        min_duration: Duration,
        mode: ExtractMode,
    ) -> RingBufferResult<PacketBuffer> {
        self.lock().extract(method, min_duration, mode)
    }

    /// Index of the newest packet carrying a keyframe.
    pub fn find_latest_idr_index(&self) -> Option<usize> {
        self.lock().find_latest_idr_index()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Bytes currently stored.
    pub fn weight_bytes(&self) -> usize {
        self.lock().weight_bytes()
    }

    pub fn max_weight_bytes(&self) -> usize {
        self.config.max_weight_bytes
    }

    /// Drop all stored packets, e.g. after the camera reconnects.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Register a live listener without taking the storage lock.
    pub fn add_listener(&self, name: impl Into<String>, sender: Sender<SharedPacket>, policy: FullChannelPolicy) {
        self.register(name.into(), sender, policy);
    }

    /// Unregister the listener that owns `sender`.
    ///
    /// When this returns, no delivery to the listener is in progress and
    /// none will start. Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, sender: &Sender<SharedPacket>) -> bool {
        let removed = {
            let _order = lock_order::acquire(LockLevel::Listeners);
            let mut listeners = self.listeners.lock();
            match listeners.iter().position(|l| l.is_channel(sender)) {
                Some(index) => {
                    let mut next = Vec::clone(&listeners);
                    let listener = next.remove(index);
                    listener.mark_removed();
                    *listeners = Arc::new(next);
                    Some(listener)
                }
                None => None,
            }
        };

        match removed {
            Some(listener) => {
                // wait out any delivery that started before the flag was set
                drop(DeliveryGuard::new(&self.delivery));
                info!(listener = listener.name(), "Removed ring buffer listener");
                true
            }
            None => {
                warn!("Tried to remove a listener that is not registered");
                false
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.snapshot_listeners().len()
    }

    /// Delivery counters of every registered listener.
    pub fn listener_stats(&self) -> Vec<ListenerStats> {
        self.snapshot_listeners().iter().map(|l| l.stats()).collect()
    }

    fn snapshot_listeners(&self) -> ListenerList {
        let _order = lock_order::acquire(LockLevel::Listeners);
        Arc::clone(&self.listeners.lock())
    }

    fn register(&self, name: String, sender: Sender<SharedPacket>, policy: FullChannelPolicy) {
        let _order = lock_order::acquire(LockLevel::Listeners);
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| l.is_channel(&sender)) {
            warn!(listener = %name, "Listener channel already registered");
            return;
        }
        info!(listener = %name, ?policy, "Added ring buffer listener");
        let mut next = Vec::clone(&listeners);
        next.push(Arc::new(Listener::new(
            name,
            sender,
            policy,
            self.config.drop_warning_interval,
        )));
        *listeners = Arc::new(next);
    }

    fn prune(&self, disconnected: &[Arc<Listener>]) {
        let _order = lock_order::acquire(LockLevel::Listeners);
        let mut listeners = self.listeners.lock();
        let next: Vec<_> = listeners
            .iter()
            .filter(|l| !disconnected.iter().any(|d| Arc::ptr_eq(l, d)))
            .cloned()
            .collect();
        for listener in disconnected {
            info!(listener = listener.name(), "Listener disconnected, removing it");
        }
        *listeners = Arc::new(next);
    }
}

/// Held while packets are handed to listeners.
struct DeliveryGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    _order: LevelToken,
}

impl<'a> DeliveryGuard<'a> {
    fn new(lock: &'a Mutex<()>) -> Self {
        let order = lock_order::acquire(LockLevel::Delivery);
        Self {
            _guard: lock.lock(),
            _order: order,
        }
    }
}

/// Exclusive access to the stored packets.
///
/// Extracting history and registering a listener through the same guard
/// guarantees the listener's first packet directly follows the extracted
/// window.
pub struct RingBufferGuard<'a> {
    owner: &'a VideoRingBuffer,
    ring: MutexGuard<'a, WeightedRing<SharedPacket>>,
    _order: LevelToken,
}

impl RingBufferGuard<'_> {
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn weight_bytes(&self) -> usize {
        self.ring.weight_bytes()
    }

    pub fn max_weight_bytes(&self) -> usize {
        self.ring.max_weight_bytes()
    }

    /// Stored packets, oldest first.
    pub fn packets(&self) -> impl Iterator<Item = &SharedPacket> {
        self.ring.iter()
    }

    /// Index of the newest packet carrying a keyframe.
    pub fn find_latest_idr_index(&self) -> Option<usize> {
        self.ring.iter().rposition(|p| p.has_idr())
    }

    pub fn clear(&mut self) {
        debug!(packets = self.ring.len(), "Clearing ring buffer");
        self.ring.clear();
    }

    /// Register a live listener while the storage is locked.
    pub fn add_listener(&self, name: impl Into<String>, sender: Sender<SharedPacket>, policy: FullChannelPolicy) {
        self.owner.register(name.into(), sender, policy);
    }

    /// Extract a keyframe-anchored window covering at least `min_duration`.
    ///
    /// The window starts at a keyframe, extended back over the parameter
    /// sets sent just before it. The newest keyframe old enough to cover
    /// `min_duration` is used. If none is old enough, `BestEffort` returns
    /// the window of the oldest usable keyframe and logs a warning, while
    /// `Strict` fails.
    #[instrument(name = "ring_extract", skip(self), fields(packets = self.ring.len()))]
    pub fn extract(
        &mut self,
        method: ExtractMethod,
        min_duration: Duration,
        mode: ExtractMode,
    ) -> RingBufferResult<PacketBuffer> {
        let packets: Vec<&SharedPacket> = self.ring.iter().collect();
        let newest = match packets.last() {
            Some(p) => p.pts,
            None => return Err(RingBufferError::NoVideoAvailable),
        };

        let mut saw_keyframe = false;
        let mut best: Option<(usize, Duration)> = None;
        for (i, packet) in packets.iter().enumerate().rev() {
            if !packet.has_idr() {
                continue;
            }
            saw_keyframe = true;
            let Some(start) = anchor_start(&packets, i) else {
                continue;
            };
            let covered = newest.saturating_sub(packet.pts);
            best = Some((start, covered));
            if covered >= min_duration {
                break;
            }
        }

        let (start, covered) = match best {
            Some(found) => found,
            None if saw_keyframe => {
                let codec = packets[packets.len() - 1].codec;
                return Err(RingBufferError::MissingEssentialMetadata(format!(
                    "no {codec} keyframe is preceded by its parameter sets"
                )));
            }
            None => return Err(RingBufferError::NoKeyframeAvailable(packets.len())),
        };

        if covered < min_duration {
            match mode {
                ExtractMode::Strict => {
                    return Err(RingBufferError::InsufficientHistory {
                        requested: min_duration,
                        available: covered,
                    });
                }
                ExtractMode::BestEffort => {
                    warn!(
                        requested_secs = min_duration.as_secs_f64(),
                        available_secs = covered.as_secs_f64(),
                        "Unable to satisfy history request, returning what is buffered"
                    );
                }
            }
        }

        let window_len = packets.len() - start;
        let out = match method {
            ExtractMethod::ShallowClone => packets[start..].iter().map(|p| Arc::clone(p)).collect(),
            ExtractMethod::DeepClone => packets[start..]
                .iter()
                .map(|p| Arc::new(p.deep_clone()))
                .collect(),
            ExtractMethod::Drain => {
                drop(packets);
                for _ in 0..start {
                    self.ring.pop_front();
                }
                let out: Vec<SharedPacket> = (0..window_len).filter_map(|_| self.ring.pop_front()).collect();
                if !self.ring.is_empty() || out.len() != window_len {
                    return Err(RingBufferError::InvariantViolated(format!(
                        "drain left {} packets behind",
                        self.ring.len()
                    )));
                }
                out
            }
        };

        debug!(
            ?method,
            start,
            packets = window_len,
            covered_secs = covered.as_secs_f64(),
            "Extracted history"
        );
        Ok(PacketBuffer::new(out))
    }
}

/// Start of the window anchored at the keyframe at `keyframe`.
///
/// Walks back over the non-picture packets directly before the keyframe.
/// Returns `None` if the keyframe and those packets do not carry every
/// parameter set the codec needs.
fn anchor_start(packets: &[&SharedPacket], keyframe: usize) -> Option<usize> {
    let is_picture =
        |p: &SharedPacket| p.has_abstract_type(AbstractNaluType::Keyframe) || p.has_abstract_type(AbstractNaluType::InterFrame);

    let mut start = keyframe;
    while start > 0 && !is_picture(packets[start - 1]) {
        start -= 1;
    }

    let required = packets[keyframe].codec.parameter_set_types();
    let window = &packets[start..=keyframe];
    required
        .iter()
        .all(|t| window.iter().any(|p| p.has_type(*t)))
        .then_some(start)
}
