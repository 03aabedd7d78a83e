//! Virtual-time token bucket.
//!
//! Instead of mutating a token counter on every accrual tick, the
//! bucket keeps a single cursor: the instant at which the next
//! unreserved token accrues. Granting `n` tokens advances the cursor
//! by `n` accrual periods; idle time moves the effective cursor
//! backwards, but never further than one full capacity's worth.
//! Everything is a compare-and-swap on one atomic, so concurrent
//! callers serialize only on the cursor arithmetic and acquire
//! contiguous slices of future time in commit order.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::bucket::Bucket;
use crate::clock::Clock;
use crate::config::BucketConfig;
use crate::waiting::Waiter;

const NANOS_PER_SEC: u64 = 1_000_000_000;

type DestroyCallback = Box<dyn FnOnce() + Send>;

/// In-memory reference implementation of the [`Bucket`] contract.
pub struct TokenBucket {
    cfg: Arc<BucketConfig>,
    dynamic: bool,
    /// Nanoseconds per token.
    period_nanos: i64,
    /// Idle credit horizon: `(size - 1)` periods.
    burst_nanos: i64,
    /// The accrual instant of the next unreserved token.
    nat: AtomicI64,
    clock: Arc<dyn Clock>,
    waiter: Arc<dyn Waiter>,
    destroyed: AtomicBool,
    on_destroy: Mutex<Option<DestroyCallback>>,
}

impl TokenBucket {
    /// A fresh bucket starts full: its cursor is back-dated a whole
    /// capacity so the first burst is granted without wait.
    pub fn new(
        cfg: Arc<BucketConfig>,
        dynamic: bool,
        clock: Arc<dyn Clock>,
        waiter: Arc<dyn Waiter>,
    ) -> Self {
        let period_nanos = (NANOS_PER_SEC / cfg.fill_rate.max(1)).max(1) as i64;
        let burst_nanos =
            i64::try_from(cfg.size.max(1) - 1).unwrap_or(i64::MAX).saturating_mul(period_nanos);
        let nat = AtomicI64::new(clock.now_nanos().saturating_sub(burst_nanos));
        Self {
            cfg,
            dynamic,
            period_nanos,
            burst_nanos,
            nat,
            clock,
            waiter,
            destroyed: AtomicBool::new(false),
            on_destroy: Mutex::new(None),
        }
    }

    /// Register a callback to run exactly once when the bucket is
    /// destroyed.
    pub fn set_destroy_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_destroy.lock().expect("destroy callback lock poisoned") = Some(Box::new(callback));
    }

    /// Current cursor value; exposed for diagnostics and tests.
    pub fn next_available_nanos(&self) -> i64 {
        self.nat.load(Ordering::Acquire)
    }

    fn duration_nanos(d: Duration) -> i128 {
        d.as_nanos().min(i128::MAX as u128) as i128
    }
}

#[async_trait]
impl Bucket for TokenBucket {
    async fn take(&self, tokens: u64, max_wait: Duration) -> (Duration, bool) {
        let period = self.period_nanos as i128;
        let allowed = Self::duration_nanos(max_wait)
            .min(Self::duration_nanos(self.cfg.max_debt()));

        loop {
            let now = self.clock.now_nanos();
            let nat = self.nat.load(Ordering::Acquire);
            // Idle accrual credits at most one capacity.
            let base = nat.max(now.saturating_sub(self.burst_nanos));
            // The caller is served once its last token has accrued.
            let ready = base as i128 + (tokens as i128 - 1) * period;
            let wait = (ready - now as i128).max(0);
            if wait > allowed {
                return (Duration::ZERO, false);
            }
            let advanced = (base as i128 + tokens as i128 * period).min(i64::MAX as i128) as i64;
            if self
                .nat
                .compare_exchange(nat, advanced, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let wait = Duration::from_nanos(wait.min(u64::MAX as i128) as u64);
                if !wait.is_zero() {
                    self.waiter.park(wait).await;
                }
                return (wait, true);
            }
            // Lost the race; re-read the cursor and try again.
        }
    }

    fn config(&self) -> Arc<BucketConfig> {
        self.cfg.clone()
    }

    fn dynamic(&self) -> bool {
        self.dynamic
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.on_destroy.lock().expect("destroy callback lock poisoned").take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
