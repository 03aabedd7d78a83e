//! Per-namespace aggregation of decision events.
//!
//! [`StatsSink`] is an [`EventSink`] meant to be registered as the
//! stats listener. It is a pure consumer of the event stream and never
//! feeds back into serving decisions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::events::{Event, EventSink};

/// Counters accumulated for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceStats {
    /// Total tokens granted.
    pub tokens_served: u64,
    /// Successful grants.
    pub hits: u64,
    /// Resolution misses (including failed dynamic creation).
    pub misses: u64,
    /// Requests denied because the wait would be too long.
    pub timeouts: u64,
    /// Requests rejected by the per-request cap.
    pub oversized: u64,
    /// Dynamic buckets materialized.
    pub buckets_created: u64,
    /// Buckets destroyed by eviction or drain.
    pub buckets_removed: u64,
}

/// Aggregates events into per-namespace counters.
///
/// Clones share storage, so a clone can be registered as the stats
/// listener while the original is queried.
#[derive(Debug, Clone, Default)]
pub struct StatsSink {
    inner: Arc<Mutex<HashMap<String, NamespaceStats>>>,
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one namespace; zeroes if nothing was recorded.
    pub fn namespace(&self, namespace: &str) -> NamespaceStats {
        self.inner
            .lock()
            .expect("stats lock poisoned")
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Namespaces ranked by successful grants, highest first.
    pub fn top_hits(&self, limit: usize) -> Vec<(String, u64)> {
        self.ranked(limit, |s| s.hits)
    }

    /// Namespaces ranked by resolution misses, highest first.
    pub fn top_misses(&self, limit: usize) -> Vec<(String, u64)> {
        self.ranked(limit, |s| s.misses)
    }

    pub fn reset(&self) {
        self.inner.lock().expect("stats lock poisoned").clear();
    }

    fn ranked(&self, limit: usize, key: impl Fn(&NamespaceStats) -> u64) -> Vec<(String, u64)> {
        let guard = self.inner.lock().expect("stats lock poisoned");
        let mut rows: Vec<(String, u64)> =
            guard.iter().map(|(ns, stats)| (ns.clone(), key(stats))).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(limit);
        rows
    }
}

#[async_trait]
impl EventSink for StatsSink {
    async fn handle(&self, event: &Event) {
        let Some(namespace) = event.namespace() else { return };
        let mut guard = self.inner.lock().expect("stats lock poisoned");
        let stats = guard.entry(namespace.to_owned()).or_default();
        match event {
            Event::TokensServed { tokens, .. } => {
                stats.hits += 1;
                stats.tokens_served += tokens;
            }
            Event::TimedOut { .. } => stats.timeouts += 1,
            Event::TooManyTokensRequested { .. } => stats.oversized += 1,
            Event::BucketMissed { .. } => stats.misses += 1,
            Event::BucketCreated { .. } => stats.buckets_created += 1,
            Event::BucketRemoved { .. } => stats.buckets_removed += 1,
            Event::ConfigUpdated { .. } => {}
        }
    }
}
