//! Throughput counters.
//!
//! Every input, output, and ruleset instance tracks a monotonic `total` and
//! a sampled events-per-second rate. Both sides are safe under concurrent
//! increment and read: the total is a plain atomic, and the qps window is
//! resampled opportunistically whenever at least a second has passed since
//! the previous sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Sample window for the qps estimate.
const SAMPLE_SECS: f64 = 1.0;

#[derive(Debug)]
pub struct Counter {
    total: AtomicU64,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    sampled_at: Instant,
    sampled_total: u64,
    qps: f64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            window: Mutex::new(Window {
                sampled_at: Instant::now(),
                sampled_total: 0,
                qps: 0.0,
            }),
        }
    }

    pub fn record(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Events per second over the most recent completed window.
    pub fn qps(&self) -> f64 {
        let total = self.total();
        let mut window = self.window.lock().expect("counter window poisoned");
        let elapsed = window.sampled_at.elapsed().as_secs_f64();
        if elapsed >= SAMPLE_SECS {
            window.qps = (total.saturating_sub(window.sampled_total)) as f64 / elapsed;
            window.sampled_total = total;
            window.sampled_at = Instant::now();
        }
        window.qps
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn total_accumulates() {
        let c = Counter::new();
        c.record(3);
        c.record(2);
        assert_eq!(c.total(), 5);
    }

    #[test]
    fn qps_reflects_recent_window() {
        let c = Counter::new();
        c.record(10);
        std::thread::sleep(Duration::from_millis(1100));
        let qps = c.qps();
        assert!(qps > 0.0 && qps < 11.0, "qps was {qps}");
    }

    #[test]
    fn qps_is_zero_before_first_window() {
        let c = Counter::new();
        c.record(100);
        assert_eq!(c.qps(), 0.0);
    }
}
