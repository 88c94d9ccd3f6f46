//! Listener registration and per-listener delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, warn};
use vigil_packet::SharedPacket;

use crate::config::FullChannelPolicy;
use crate::rate_limit::RateLimitedLog;
use crate::STALL_POLL_INTERVAL;

/// Delivery counters of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub name: String,
    pub policy: FullChannelPolicy,
    /// Packets placed in the listener's channel.
    pub delivered: u64,
    /// Packets skipped because the channel was full.
    pub dropped: u64,
    /// Deliveries that had to wait for room in the channel.
    pub stalled: u64,
}

/// Outcome of delivering one packet to one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Dropped,
    /// The receiving end is gone; the listener should be pruned.
    Disconnected,
    /// The listener was removed while the packet was in flight.
    Removed,
}

/// A registered consumer of live packets.
pub(crate) struct Listener {
    name: String,
    sender: Sender<SharedPacket>,
    policy: FullChannelPolicy,
    removed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    stalled: AtomicU64,
    drop_log: RateLimitedLog,
}

impl Listener {
    pub fn new(
        name: String,
        sender: Sender<SharedPacket>,
        policy: FullChannelPolicy,
        drop_warning_interval: Duration,
    ) -> Self {
        Self {
            name,
            sender,
            policy,
            removed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            stalled: AtomicU64::new(0),
            drop_log: RateLimitedLog::new(drop_warning_interval),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this listener owns the given channel.
    pub fn is_channel(&self, sender: &Sender<SharedPacket>) -> bool {
        self.sender.same_channel(sender)
    }

    /// Stop any current and future delivery to this listener.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            name: self.name.clone(),
            policy: self.policy,
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
        }
    }

    /// Hand one packet to this listener according to its policy.
    pub fn deliver(&self, packet: &SharedPacket) -> Delivery {
        if self.is_removed() {
            return Delivery::Removed;
        }
        match self.policy {
            FullChannelPolicy::Drop => self.deliver_or_drop(packet),
            FullChannelPolicy::Stall => self.deliver_or_wait(packet),
        }
    }

    fn deliver_or_drop(&self, packet: &SharedPacket) -> Delivery {
        match self.sender.try_send(packet.clone()) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(suppressed) = self.drop_log.tick() {
                    warn!(
                        listener = %self.name,
                        dropped = total,
                        suppressed,
                        "Listener channel full, dropping packets"
                    );
                }
                Delivery::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Delivery::Disconnected,
        }
    }

    fn deliver_or_wait(&self, packet: &SharedPacket) -> Delivery {
        let mut pending = packet.clone();
        if self.sender.is_full() {
            self.stalled.fetch_add(1, Ordering::Relaxed);
            debug!(listener = %self.name, "Listener channel full, stalling producer");
        }
        loop {
            match self.sender.send_timeout(pending, STALL_POLL_INTERVAL) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    return Delivery::Sent;
                }
                Err(SendTimeoutError::Timeout(p)) => {
                    if self.is_removed() {
                        return Delivery::Removed;
                    }
                    pending = p;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Delivery::Disconnected,
            }
        }
    }
}
