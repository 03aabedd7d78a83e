//! The bucket contract and its factories.
//!
//! The container works exclusively against the [`Bucket`] trait so
//! that alternative engines (sharded, remote) can slot in behind the
//! same resolution and serving logic. [`TokenBucket`] is the in-memory
//! reference implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, MonotonicClock};
use crate::config::BucketConfig;
use crate::waiting::{TimerWaiter, Waiter};

pub mod token;

pub use token::TokenBucket;

/// A rate-limited resource instance.
///
/// Implementations must preserve the accounting guarantees of the
/// reference engine: idle accrual capped at `size`, reservation depth
/// capped at `max_debt_millis`, grants ordered by commit order, and a
/// caller never waiting longer than it agreed to.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Reserve `tokens`, waiting at most `max_wait`.
    ///
    /// Returns the wait that was served and whether the grant
    /// succeeded. On denial the bucket's accounting is untouched. The
    /// call returns only after the granted wait has elapsed.
    async fn take(&self, tokens: u64, max_wait: Duration) -> (Duration, bool);

    fn config(&self) -> Arc<BucketConfig>;

    /// Whether this bucket was materialized from a namespace template.
    fn dynamic(&self) -> bool;

    /// Idempotent teardown; the destruction callback, if any, runs
    /// exactly once.
    fn destroy(&self);
}

/// Produces buckets for the container.
pub trait BucketFactory: Send + Sync {
    fn create(
        &self,
        namespace: &str,
        name: &str,
        cfg: Arc<BucketConfig>,
        dynamic: bool,
    ) -> Arc<dyn Bucket>;
}

/// Factory for the in-memory [`TokenBucket`].
#[derive(Debug, Clone)]
pub struct MemoryBucketFactory {
    clock: Arc<dyn Clock>,
    waiter: Arc<dyn Waiter>,
}

impl MemoryBucketFactory {
    /// Production wiring: monotonic clock, tokio timer.
    pub fn new() -> Self {
        Self { clock: Arc::new(MonotonicClock::new()), waiter: Arc::new(TimerWaiter) }
    }

    /// Custom wiring, used by tests to make time hand-driven.
    pub fn with_parts(clock: Arc<dyn Clock>, waiter: Arc<dyn Waiter>) -> Self {
        Self { clock, waiter }
    }
}

impl Default for MemoryBucketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketFactory for MemoryBucketFactory {
    fn create(
        &self,
        _namespace: &str,
        _name: &str,
        cfg: Arc<BucketConfig>,
        dynamic: bool,
    ) -> Arc<dyn Bucket> {
        Arc::new(TokenBucket::new(cfg, dynamic, self.clock.clone(), self.waiter.clone()))
    }
}
