use std::time::{Duration, Instant};

/// This is a sliding-window byte rate accumulator. Bytes are accumulated into the 'current'
///  window, and `tick()` rolls a full window into an exponentially smoothed 'recent' rate.
///
/// It is used for the local send rate per destination, for the receive rate that a peer
///  reports back to us, and for the receive rate per sender on the reassembly side.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: Duration,
    window_start: Option<Instant>,
    window_bytes: u64,
    /// bytes per second
    recent_rate: f64,
    last_activity: Option<Instant>,
}

impl RateEstimator {
    /// weight of the newest window when smoothing
    const SMOOTHING: f64 = 0.5;

    /// After this many windows without new data, the smoothed rate carries no meaningful
    ///  information any more
    const DECAY_WINDOWS: u32 = 8;

    pub fn new(window: Duration) -> RateEstimator {
        assert!(!window.is_zero(), "rate estimator window must be non-zero");

        RateEstimator {
            window,
            window_start: None,
            window_bytes: 0,
            recent_rate: 0.0,
            last_activity: None,
        }
    }

    pub fn accumulate(&mut self, num_bytes: usize, now: Instant) {
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.window_bytes += num_bytes as u64;
        self.last_activity = Some(now);
    }

    /// Replaces the smoothed rate with an externally measured value, e.g. a rate reported by a
    ///  peer
    pub fn record_rate(&mut self, bytes_per_second: f64, now: Instant) {
        self.recent_rate = bytes_per_second.max(0.0);
        self.last_activity = Some(now);
    }

    pub fn tick(&mut self, now: Instant) {
        let Some(window_start) = self.window_start else {
            return;
        };

        let elapsed = now.saturating_duration_since(window_start);
        if elapsed < self.window {
            return;
        }

        let sample = self.window_bytes as f64 / elapsed.as_secs_f64();
        self.recent_rate = self.recent_rate * (1.0 - Self::SMOOTHING) + sample * Self::SMOOTHING;
        if self.recent_rate < 1.0 {
            self.recent_rate = 0.0;
        }

        self.window_bytes = 0;
        self.window_start = if self.recent_rate > 0.0 { Some(now) } else { None };
    }

    /// bytes per second, smoothed over the windows rolled so far
    pub fn recent_rate(&self) -> f64 {
        self.recent_rate
    }

    pub fn is_safe_to_discard(&self, now: Instant) -> bool {
        if self.window_bytes > 0 {
            return false;
        }
        match self.last_activity {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window * Self::DECAY_WINDOWS,
        }
    }
}
