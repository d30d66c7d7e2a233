//! Reconnection backoff.
//!
//! Delays grow geometrically: the first wait is `minimum`, each following
//! one is the previous multiplied by `factor`. There is no jitter. A ceiling
//! applies only when `maximum` is configured.
//!
//! Waiting goes through a [`Clock`] so tests can observe delays without
//! sleeping.

use futures::future::BoxFuture;
use std::time::Duration;
use tether_types::config::ClientConfig;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of delays for the reconnection loop.
pub trait Clock: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

// ---------------------------------------------------------------------------
// Backoff state
// ---------------------------------------------------------------------------

/// Geometric backoff state for one reconnection loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    minimum: Duration,
    factor: f64,
    maximum: Option<Duration>,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff starting at `minimum`, multiplied by `factor` after each delay.
    pub fn new(minimum: Duration, factor: f64, maximum: Option<Duration>) -> Self {
        Self {
            minimum,
            factor,
            maximum,
            current: minimum,
            attempts: 0,
        }
    }

    /// Build from a client's reconnection settings.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.reconnection_minimum(),
            config.reconnection_factor,
            config.reconnection_maximum(),
        )
    }

    /// Return the delay to wait now and advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.capped(self.current);
        let nanos = (self.current.as_nanos() as f64 * self.factor).round();
        let grown = if nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        };
        self.current = self.capped(grown);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over from the minimum delay.
    pub fn reset(&mut self) {
        self.current = self.minimum;
        self.attempts = 0;
    }

    fn capped(&self, delay: Duration) -> Duration {
        match self.maximum {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Whole milliseconds in `delay`, saturating at `u64::MAX`.
pub fn delay_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn test_default_sequence() {
        let mut backoff = Backoff::from_config(&ClientConfig::default());
        assert_eq!(ms(backoff.next_delay()), 200);
        assert_eq!(ms(backoff.next_delay()), 230);
        // 200 * 1.15^2 = 264.5
        assert_eq!(ms(backoff.next_delay()), 264);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_grows_without_bound_by_default() {
        let mut backoff = Backoff::new(Duration::from_millis(100), 2.0, None);
        let delays: Vec<u128> = (0..6).map(|_| ms(backoff.next_delay())).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200]);
    }

    #[test]
    fn test_maximum_caps_delay() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            2.0,
            Some(Duration::from_millis(500)),
        );
        let delays: Vec<u128> = (0..5).map(|_| ms(backoff.next_delay())).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(50), 3.0, None);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(ms(backoff.next_delay()), 50);
    }

    #[test]
    fn test_huge_delays_saturate() {
        let mut backoff = Backoff::new(Duration::from_secs(u64::MAX / 2), 10.0, None);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::MAX);
        assert_eq!(delay_ms(backoff.next_delay()), u64::MAX);
    }

    #[test]
    fn test_delay_ms() {
        assert_eq!(delay_ms(Duration::from_micros(264_500)), 264);
        assert_eq!(delay_ms(Duration::ZERO), 0);
        assert_eq!(delay_ms(Duration::MAX), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleeps() {
        let start = tokio::time::Instant::now();
        TokioClock.sleep(Duration::from_millis(300)).await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
