//! Adaptive rate throttle.
//!
//! The throttle pauses the caller every `interval` operations. Each time an
//! evaluation window of `target / 8` bytes has passed, the achieved rate is
//! compared with the target: the interval is scaled by `target / achieved`,
//! and when the scaled interval does not move, the pause length is nudged
//! instead. The same throttle shapes transmit and receive rates.

use std::time::{Duration, Instant};
use tracing::trace;

const MAX_PAUSE_MILLIS: u64 = 1_000;

#[derive(Debug)]
pub struct RateThrottle {
    target: u64,
    eval_bytes: u64,
    interval: u64,
    pause_millis: u64,
    count: u64,
    window_bytes: u64,
    window_start: Option<Instant>,
}

impl RateThrottle {
    fn new(target_bytes_per_sec: u64, interval: u64) -> Self {
        let target = target_bytes_per_sec.max(1);
        Self {
            target,
            eval_bytes: (target / 8).max(1),
            interval: interval.max(1),
            pause_millis: 1,
            count: 0,
            window_bytes: 0,
            window_start: None,
        }
    }

    /// Throttle for a sender of `avg_message`-byte messages
    pub fn for_transmit(target_bytes_per_sec: u64, avg_message: usize) -> Self {
        let per_window = target_bytes_per_sec / 8 / (avg_message.max(1) as u64);
        Self::new(target_bytes_per_sec, per_window / 8)
    }

    pub fn for_receive(target_bytes_per_sec: u64) -> Self {
        Self::new(target_bytes_per_sec, 1_000)
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_millis)
    }

    /// Account `bytes`; returns the pause the caller should take, if any
    pub fn record(&mut self, bytes: usize) -> Option<Duration> {
        self.record_at(bytes, Instant::now())
    }

    pub fn record_at(&mut self, bytes: usize, now: Instant) -> Option<Duration> {
        let start = *self.window_start.get_or_insert(now);
        self.count += 1;
        self.window_bytes += bytes as u64;

        if self.window_bytes >= self.eval_bytes {
            self.evaluate(now.saturating_duration_since(start));
            self.window_bytes = 0;
            self.window_start = Some(now);
        }

        if self.count % self.interval == 0 && self.pause_millis > 0 {
            Some(self.pause())
        } else {
            None
        }
    }

    fn evaluate(&mut self, elapsed: Duration) {
        if elapsed.is_zero() {
            self.interval += 1;
            return;
        }

        let achieved = self.window_bytes as f64 / elapsed.as_secs_f64();
        let factor = self.target as f64 / achieved;
        let scaled = (self.interval as f64 * factor).round() as u64;

        if scaled == 0 {
            self.interval = 1;
            self.pause_millis = (self.pause_millis + 1).min(MAX_PAUSE_MILLIS);
        } else if scaled == self.interval {
            if factor > 1.01 {
                self.pause_millis = self.pause_millis.saturating_sub(1);
            } else if factor < 0.99 {
                self.pause_millis = (self.pause_millis + 1).min(MAX_PAUSE_MILLIS);
            }
        } else {
            self.interval = scaled;
        }
        trace!(
            achieved = achieved as u64,
            target = self.target,
            interval = self.interval,
            pause_ms = self.pause_millis,
            "Throttle re-evaluated"
        );
    }
}
