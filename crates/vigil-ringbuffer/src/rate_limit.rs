//! Rate-limited warning helper.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Decides whether a repeated warning should be emitted now.
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    state: Mutex<RateState>,
}

#[derive(Debug, Default)]
struct RateState {
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl RateLimitedLog {
    /// Allow at most one emission per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(RateState::default()),
        }
    }

    /// Record one occurrence.
    ///
    /// Returns `Some(n)` when a log line should be emitted now, where `n` is
    /// the number of occurrences suppressed since the previous emission.
    pub fn tick(&self) -> Option<u64> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&self, now: Instant) -> Option<u64> {
        let mut state = self.state.lock();
        match state.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => {
                state.suppressed += 1;
                None
            }
            _ => {
                state.last_emit = Some(now);
                Some(std::mem::take(&mut state.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_emits() {
        let log = RateLimitedLog::new(Duration::from_secs(3));
        assert_eq!(log.tick(), Some(0));
    }

    #[test]
    fn test_suppresses_within_interval() {
        let log = RateLimitedLog::new(Duration::from_secs(3));
        let t0 = Instant::now();
        assert_eq!(log.tick_at(t0), Some(0));
        assert_eq!(log.tick_at(t0 + Duration::from_secs(1)), None);
        assert_eq!(log.tick_at(t0 + Duration::from_secs(2)), None);
        assert_eq!(log.tick_at(t0 + Duration::from_secs(3)), Some(2));
        assert_eq!(log.tick_at(t0 + Duration::from_secs(4)), None);
    }
}
