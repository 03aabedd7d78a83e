//! Bounded, non-blocking fan-out from the serving path to listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::event::Event;
use super::sinks::EventSink;

/// Fans events out to an optional user sink and an optional stats
/// sink, in that order, from a single worker task.
///
/// [`EventProducer::emit`] enqueues without waiting; when the buffer is
/// full the event is dropped and counted. Clones share the queue and
/// the drop counter.
#[derive(Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventProducer {
    /// Spawn the worker and return the producer handle. `buffer` is
    /// clamped to at least 1.
    pub fn start(
        user: Option<Arc<dyn EventSink>>,
        stats: Option<Arc<dyn EventSink>>,
        buffer: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(buffer.max(1));
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Some(sink) = &user {
                    sink.handle(&event).await;
                }
                if let Some(sink) = &stats {
                    sink.handle(&event).await;
                }
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// A producer with no listeners; events go nowhere but drops are
    /// still impossible to observe from the serving path.
    pub fn disabled() -> Self {
        Self::start(None, None, 1)
    }

    /// Enqueue `event` without blocking. Full queue: drop and count.
    pub fn emit(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::sinks::MemorySink;
    use std::time::Duration;

    #[tokio::test]
    async fn events_reach_both_sinks_in_order() {
        let user = MemorySink::new();
        let stats = MemorySink::new();
        let producer = EventProducer::start(
            Some(Arc::new(user.clone())),
            Some(Arc::new(stats.clone())),
            16,
        );

        producer.emit(Event::ConfigUpdated { version: 1 });
        producer.emit(Event::ConfigUpdated { version: 2 });

        // Give the worker a moment to drain.
        for _ in 0..50 {
            if stats.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(user.events(), stats.events());
        assert_eq!(user.len(), 2);
        assert_eq!(producer.dropped(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        // No worker consumption keeps the queue full: a sink that never
        // completes stalls the worker after the first event.
        struct StalledSink;
        #[async_trait::async_trait]
        impl EventSink for StalledSink {
            async fn handle(&self, _event: &Event) {
                std::future::pending::<()>().await;
            }
        }

        let producer = EventProducer::start(Some(Arc::new(StalledSink)), None, 1);
        for version in 0..10 {
            producer.emit(Event::ConfigUpdated { version });
        }
        // One event may be in flight in the worker and one buffered;
        // everything else must have been dropped, not blocked on.
        assert!(producer.dropped() >= 8);
    }
}
