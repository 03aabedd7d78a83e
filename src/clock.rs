//! Time sources for the token-bucket engine.
//!
//! All bucket arithmetic runs on signed monotonic nanoseconds so that a
//! freshly created bucket can back-date its cursor to represent banked
//! tokens. Implementations must be safe to call concurrently.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Thread-safe monotonic time source.
///
/// Readings are nanoseconds relative to the implementer's origin and
/// must never decrease. Readings from independently created instances
/// are not comparable.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in nanoseconds since this clock's origin.
    fn now_nanos(&self) -> i64;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Clones share the same origin (the instant captured at creation).
/// Saturates at `i64::MAX` on the theoretical overflow.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Hand-driven clock for deterministic tests.
///
/// Clones share the same underlying reading; advancing one advances
/// all of them.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock with an explicit initial reading.
    pub fn starting_at(nanos: i64) -> Self {
        Self { nanos: Arc::new(AtomicI64::new(nanos)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let nanos = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Set the reading outright. Callers are responsible for keeping it
    /// monotone.
    pub fn set_nanos(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
