//! How a granted reservation's wait is served.
//!
//! When a take commits, the engine knows exactly how long the caller
//! must be parked before its tokens have accrued; the idle reaper
//! likewise knows how far away a bucket's eviction deadline is.
//! Serving those waits is delegated to a [`Waiter`] so production code
//! parks on the tokio timer while tests complete instantly and assert
//! on the computed waits instead of burning real time.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Parks a task for a bounded duration.
pub trait Waiter: Send + Sync + std::fmt::Debug {
    /// Suspend until `wait` has elapsed. The engine only calls this
    /// with waits it has already bounded by the caller's patience and
    /// the bucket's debt limit.
    fn park(&self, wait: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production waiter: parks on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerWaiter;

impl Waiter for TimerWaiter {
    fn park(&self, wait: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(wait))
    }
}

/// Completes every wait immediately. For tests that only care about
/// grant decisions, not pacing.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateWaiter;

impl Waiter for ImmediateWaiter {
    fn park(&self, _wait: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Completes immediately while recording every wait it was asked to
/// serve, so tests can assert on the reservation arithmetic.
///
/// Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingWaiter {
    served: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every wait served so far, in commit order.
    pub fn served(&self) -> Vec<Duration> {
        self.served.lock().expect("recorded waits lock poisoned").clone()
    }

    /// Total virtual time callers would have spent parked.
    pub fn total_parked(&self) -> Duration {
        self.served.lock().expect("recorded waits lock poisoned").iter().sum()
    }

    pub fn clear(&self) {
        self.served.lock().expect("recorded waits lock poisoned").clear();
    }
}

impl Waiter for RecordingWaiter {
    fn park(&self, wait: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.served.lock().expect("recorded waits lock poisoned").push(wait);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_waiter_never_parks() {
        let start = std::time::Instant::now();
        ImmediateWaiter.park(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn recording_waiter_accumulates_served_waits() {
        let waiter = RecordingWaiter::new();
        waiter.park(Duration::from_millis(400)).await;
        waiter.park(Duration::from_millis(600)).await;

        assert_eq!(
            waiter.served(),
            vec![Duration::from_millis(400), Duration::from_millis(600)]
        );
        assert_eq!(waiter.total_parked(), Duration::from_secs(1));

        waiter.clear();
        assert!(waiter.served().is_empty());
        assert_eq!(waiter.total_parked(), Duration::ZERO);
    }

    #[tokio::test]
    async fn recording_waiter_clones_share_the_record() {
        let waiter = RecordingWaiter::new();
        let clone = waiter.clone();
        clone.park(Duration::from_millis(75)).await;
        assert_eq!(waiter.served(), vec![Duration::from_millis(75)]);
    }

    #[tokio::test]
    async fn timer_waiter_serves_real_time() {
        let start = std::time::Instant::now();
        TimerWaiter.park(Duration::from_millis(50)).await;
        // Small tolerance for timer jitter.
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
