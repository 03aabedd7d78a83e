//! Consumers of the event stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::event::Event;

/// A downstream consumer of decision events.
///
/// Sinks are invoked one event at a time by the producer's worker task
/// and must never feed back into the serving path. A slow sink delays
/// other sinks and, once the queue fills, causes drops — it never
/// blocks serving.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn handle(&self, _event: &Event) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn handle(&self, event: &Event) {
        tracing::info!(target: "tokengate::events", event = %event, "quota_event");
    }
}

/// Stores events in memory, evicting the oldest past `capacity`.
///
/// Clones share storage, so a clone can be registered as a listener
/// while the original is queried by a test or diagnostic endpoint.
#[derive(Debug, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("memory sink lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("memory sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().expect("memory sink lock poisoned").is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().expect("memory sink lock poisoned").clear();
    }

    /// Events discarded to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn handle(&self, event: &Event) {
        let mut guard = self.events.lock().expect("memory sink lock poisoned");
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event.clone());
    }
}
