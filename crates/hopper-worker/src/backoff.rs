//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter: each delay is drawn from the upper half
/// of a window that doubles up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let window = self.current;
        self.current = (self.current * 2).min(self.max);

        let half = window.as_millis() as u64 / 2;
        let jitter = rand::thread_rng().gen_range(0..=half);
        Duration::from_millis(window.as_millis() as u64 - half + jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
