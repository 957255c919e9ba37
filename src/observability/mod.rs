//! Dispatch metrics.
//!
//! Counters are plain atomics; read them through [`DispatchMetrics::snapshot`].
//! Logging goes through `tracing` when the `tracing` feature is enabled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Dispatch counters shared by a mailer and its tasks.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    sends_attempted: AtomicU64,
    sends_succeeded: AtomicU64,
    sends_failed: AtomicU64,
    rate_limit_waits: AtomicU64,
    rate_limit_wait_micros: AtomicU64,
    bytes_sent: AtomicU64,
}

impl DispatchMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of a send.
    pub fn record_attempt(&self) {
        self.sends_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a delivered message and its encoded size.
    pub fn record_success(&self, bytes: u64) {
        self.sends_succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a failed send.
    pub fn record_failure(&self) {
        self.sends_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records time spent held by the rate limiter. Zero waits are ignored.
    pub fn record_rate_limit_wait(&self, waited: Duration) {
        if waited.is_zero() {
            return;
        }
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        self.rate_limit_wait_micros
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sends_attempted: self.sends_attempted.load(Ordering::Relaxed),
            sends_succeeded: self.sends_succeeded.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            rate_limit_wait: Duration::from_micros(self.rate_limit_wait_micros.load(Ordering::Relaxed)),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DispatchMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Sends started, including ones rejected by validation.
    pub sends_attempted: u64,
    /// Messages accepted by the server.
    pub sends_succeeded: u64,
    /// Sends that returned an error.
    pub sends_failed: u64,
    /// Sends the rate limiter held back.
    pub rate_limit_waits: u64,
    /// Total time spent waiting on the rate limiter.
    pub rate_limit_wait: Duration,
    /// Encoded message bytes delivered.
    pub bytes_sent: u64,
}

impl MetricsSnapshot {
    /// Returns the share of finished sends that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.sends_succeeded + self.sends_failed;
        if total == 0 {
            1.0
        } else {
            self.sends_succeeded as f64 / total as f64
        }
    }
}

/// Measures how long an operation took.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    name: &'static str,
}

impl Timer {
    /// Starts a timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = DispatchMetrics::new();
        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_attempt();
        metrics.record_success(120);
        metrics.record_success(80);
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sends_attempted, 3);
        assert_eq!(snapshot.sends_succeeded, 2);
        assert_eq!(snapshot.bytes_sent, 200);
        assert!((snapshot.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_zero_wait_not_counted() {
        let metrics = DispatchMetrics::new();
        metrics.record_rate_limit_wait(Duration::ZERO);
        metrics.record_rate_limit_wait(Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rate_limit_waits, 1);
        assert_eq!(snapshot.rate_limit_wait, Duration::from_millis(5));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }
}
