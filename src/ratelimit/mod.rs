//! Send throttling.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

use crate::config::RateLimitConfig;

/// Longest spacing between ticks. Slower rates are treated as this one.
const MAX_PERIOD: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Fixed-interval limiter shared by every send on a mailer.
///
/// Each [`wait`](RateLimiter::wait) consumes one tick. The first tick is
/// available immediately; later ones are spaced by `1 / rate`. Ticks missed
/// while idle are not accumulated, so an idle limiter grants at most one
/// immediate send.
#[derive(Debug)]
pub struct RateLimiter {
    period: Duration,
    next: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter for `per_second` sends per second. Returns `None`
    /// for a rate that is not a positive finite number.
    pub fn new(per_second: f64) -> Option<Self> {
        Self::from_config(&RateLimitConfig::per_second(per_second))
    }

    /// Creates a limiter from configuration, or `None` if it is disabled.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        let period = config.interval()?;
        if period.is_zero() {
            return None;
        }
        Some(Self {
            period: period.min(MAX_PERIOD),
            next: Mutex::new(None),
        })
    }

    /// Returns the spacing between ticks.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next tick and returns how long the caller was held.
    ///
    /// There is no timeout; dropping the future abandons the wait without
    /// consuming a tick.
    pub async fn wait(&self) -> Duration {
        let started = Instant::now();
        let mut next = self.next.lock().await;
        if let Some(at) = *next {
            sleep_until(at).await;
        }
        *next = Some(Instant::now() + self.period);
        started.elapsed()
    }
}
