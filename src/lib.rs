#![forbid(unsafe_code)]

//! # tokengate
//!
//! A centralized quota service core: clients request N tokens against a
//! named bucket and are granted immediately, blocked up to a bounded
//! wait, or denied. One `tokengate` instance is the shared
//! rate-limiting authority for a fleet of services; transports map
//! their requests onto [`QuotaService::allow`].
//!
//! ## What's inside
//!
//! - **Token buckets on virtual time** — each bucket is a single
//!   atomic cursor; grants are lock-free and fair in commit order.
//! - **Hierarchical namespaces** — named buckets, templated dynamic
//!   buckets with idle eviction and per-namespace caps, and a default
//!   fall-through bucket.
//! - **Live configuration** — mutations persist through a pluggable
//!   [`config::ConfigPersister`]; its change signal atomically swaps in a
//!   freshly built bucket container without disturbing in-flight
//!   reservations.
//! - **Non-blocking telemetry** — every decision is fanned out to a
//!   user listener and a stats listener through a bounded queue that
//!   drops rather than back-pressures.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokengate::config::{apply_defaults, BucketConfig, NamespaceConfig, ServiceConfig};
//! use tokengate::{MemoryBucketFactory, MemoryPersister, QuotaService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut cfg = ServiceConfig::with_defaults();
//!     let mut ns = NamespaceConfig::named("api");
//!     ns.buckets.insert(
//!         "search".into(),
//!         BucketConfig { size: 100, fill_rate: 50, ..Default::default() },
//!     );
//!     cfg.namespaces.insert("api".into(), ns);
//!     apply_defaults(&mut cfg);
//!
//!     let persister = Arc::new(MemoryPersister::with_initial(cfg.to_bytes()?));
//!     let service = QuotaService::new(Arc::new(MemoryBucketFactory::new()), persister);
//!     service.start().await?;
//!
//!     let grant = service.allow("api", "search", 1, None).await?;
//!     println!("granted after {:?}", grant.wait);
//!     Ok(())
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod service;
pub mod stats;
pub mod waiting;

// Re-exports
pub use bucket::{Bucket, BucketFactory, MemoryBucketFactory, TokenBucket};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BucketConfig, ConfigPersister, ConfigPipeline, DiskPersister, MemoryPersister,
    NamespaceConfig, ServiceConfig, DEFAULT_BUCKET_NAME,
};
pub use container::{BucketContainer, Resolution};
pub use error::{AllowError, ConfigError, PersistError};
pub use events::{Event, EventProducer, EventSink, LogSink, MemorySink, NullSink};
pub use service::{AllowResult, LifecycleStatus, QuotaService, DEFAULT_EVENT_QUEUE_SIZE};
pub use stats::{NamespaceStats, StatsSink};
/// Wait serving: `TimerWaiter` for production, `ImmediateWaiter`/`RecordingWaiter` for tests.
pub use waiting::{ImmediateWaiter, RecordingWaiter, TimerWaiter, Waiter};
