//! Consecutive-failure circuit breaker shared by every request of one client.
//!
//! Two states: closed while `failures < threshold`, open from the moment the
//! threshold is crossed until `reset_time` has elapsed. Once the reset time
//! has passed the next call is let through and its own outcome decides: a
//! success closes the breaker, a failure re-stamps `opened_at`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct Counters {
    failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    counters: Mutex<Counters>,
    threshold: AtomicU32,
    reset_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_time: Duration) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            threshold: AtomicU32::new(threshold.max(1)),
            reset_ms: AtomicU64::new(reset_time.as_millis() as u64),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn reset_time(&self) -> Duration {
        Duration::from_millis(self.reset_ms.load(Ordering::Relaxed))
    }

    /// Takes effect immediately. Lowering the threshold to or below the
    /// current failure count opens the breaker now.
    pub fn set_threshold(&self, threshold: u32) {
        let threshold = threshold.max(1);
        let mut counters = self.lock();
        self.threshold.store(threshold, Ordering::Relaxed);
        if counters.failures >= threshold && counters.opened_at.is_none() {
            counters.opened_at = Some(Instant::now());
            warn!(
                failures = counters.failures,
                threshold, "circuit breaker opened by threshold change"
            );
        }
    }

    /// Takes effect immediately, including for a breaker that is already open.
    pub fn set_reset_time(&self, reset_time: Duration) {
        self.reset_ms
            .store(reset_time.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn state(&self) -> BreakerState {
        let counters = self.lock();
        if counters.failures >= self.threshold() && counters.opened_at.is_some() {
            BreakerState::Open
        } else {
            BreakerState::Closed
        }
    }

    /// Open and still inside the reset window.
    pub fn is_open(&self) -> bool {
        self.retry_in().is_some()
    }

    /// Time left until the breaker lets a call through, `None` when it already does.
    pub fn retry_in(&self) -> Option<Duration> {
        let counters = self.lock();
        if counters.failures < self.threshold() {
            return None;
        }
        let opened_at = counters.opened_at?;
        let until = opened_at + self.reset_time();
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn record_failure(&self) {
        let threshold = self.threshold();
        let reset = self.reset_time();
        let mut counters = self.lock();
        counters.failures = counters.failures.saturating_add(1);
        if counters.failures < threshold {
            return;
        }
        let now = Instant::now();
        let expired = counters.opened_at.is_none_or(|at| now >= at + reset);
        if expired {
            counters.opened_at = Some(now);
            warn!(
                failures = counters.failures,
                reset_secs = reset.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    pub fn record_success(&self) {
        let mut counters = self.lock();
        if counters.opened_at.is_some() {
            info!("circuit breaker closed");
        }
        counters.failures = 0;
        counters.opened_at = None;
    }

    /// Clear all state, for reusing a client across unrelated sessions.
    pub fn reset(&self) {
        *self.lock() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_reopens_after_failed_probe() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!breaker.is_open(), "reset time elapsed, next call may go through");

        // The probe fails: open again for a fresh window
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.failure_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn success_closes_and_zeroes() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
        tokio::time::advance(Duration::from_secs(6)).await;
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_reset_time_change_applies_to_open_breaker() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        assert!(breaker.is_open());
        tokio::time::advance(Duration::from_secs(2)).await;
        breaker.set_reset_time(Duration::from_secs(1));
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_threshold_change_applies() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
        breaker.set_threshold(5);
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn lowering_threshold_below_failures_opens() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());

        breaker.set_threshold(2);
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.retry_in(), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.is_open());
    }

    #[test]
    fn reset_clears_everything() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure();
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }
}
