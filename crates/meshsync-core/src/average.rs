//! Rate tracking: moving averages and rolling event windows.
//!
//! Time is passed in explicitly (monotonic milliseconds) so scheduling and
//! ban logic can be tested without a live clock.

use std::collections::VecDeque;

/// Moving average over the last `window` samples.
///
/// Used for the in/out request-rate counters updated once per timer tick.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    /// Create an average over `window` samples.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
            sum: 0.0,
        }
    }

    /// Record a sample and return the updated average.
    pub fn update(&mut self, value: f64) -> f64 {
        self.samples.push_back(value);
        self.sum += value;
        if self.samples.len() > self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.average()
    }

    /// Current average.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }
}

/// Rolling count of events inside a fixed time window.
///
/// Flood thresholds compare the count of hop sightings inside the short
/// (one-minute) and long (two-minute) windows against fixed limits.
#[derive(Debug, Clone)]
pub struct RollingRate {
    window_ms: u64,
    events: VecDeque<u64>,
}

impl RollingRate {
    /// Create a window of `window_ms` milliseconds.
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while matches!(self.events.front(), Some(&t) if t < cutoff) {
            self.events.pop_front();
        }
    }

    /// Record one event at `now_ms` and return the in-window count.
    pub fn hit(&mut self, now_ms: u64) -> usize {
        self.prune(now_ms);
        self.events.push_back(now_ms);
        self.events.len()
    }

    /// Count of events inside the window ending at `now_ms`.
    pub fn count(&mut self, now_ms: u64) -> usize {
        self.prune(now_ms);
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_window() {
        let mut avg = MovingAverage::new(3);
        assert_eq!(avg.update(3.0), 3.0);
        assert_eq!(avg.update(6.0), 4.5);
        assert_eq!(avg.update(9.0), 6.0);
        // 3.0 drops out of the window
        assert_eq!(avg.update(12.0), 9.0);
    }

    #[test]
    fn test_rolling_rate_expiry() {
        let mut rate = RollingRate::new(60_000);
        for i in 0..10 {
            rate.hit(i * 1000);
        }
        assert_eq!(rate.count(9_000), 10);
        // everything recorded before t=10s has aged out at t=70s
        assert_eq!(rate.count(70_000), 0);
    }

    #[test]
    fn test_rolling_rate_partial_expiry() {
        let mut rate = RollingRate::new(60_000);
        rate.hit(0);
        rate.hit(30_000);
        rate.hit(59_000);
        assert_eq!(rate.count(61_000), 2);
    }
}
