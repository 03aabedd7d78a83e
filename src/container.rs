//! Namespace → bucket resolution, dynamic materialization and idle GC.
//!
//! A container is built whole from one [`ServiceConfig`] version and
//! never restructured afterwards: a config change builds a fresh
//! container and the service swaps the reference. Only the dynamic
//! bucket registries inside a live container mutate, under their own
//! locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bucket::{Bucket, BucketFactory};
use crate::clock::Clock;
use crate::config::{BucketConfig, NamespaceConfig, ServiceConfig, DEFAULT_BUCKET_NAME};
use crate::events::{Event, EventProducer};
use crate::waiting::Waiter;

/// Outcome of a container lookup.
pub enum Resolution {
    Found(Arc<dyn Bucket>),
    /// Nothing matched and no default exists.
    Miss,
    /// A dynamic bucket was called for but the namespace cap is
    /// exhausted.
    CapExceeded,
}

struct DynamicEntry {
    bucket: Arc<dyn Bucket>,
    last_access: Arc<AtomicI64>,
    reaper: Option<JoinHandle<()>>,
}

struct Namespace {
    cfg: Arc<NamespaceConfig>,
    template: Option<Arc<BucketConfig>>,
    /// Named buckets, including the default under its reserved name.
    named: HashMap<String, Arc<dyn Bucket>>,
    default_bucket: Option<Arc<dyn Bucket>>,
    dynamic: Mutex<HashMap<String, DynamicEntry>>,
}

/// The live bucket registry for one configuration version.
pub struct BucketContainer {
    version: u64,
    namespaces: HashMap<String, Namespace>,
    factory: Arc<dyn BucketFactory>,
    clock: Arc<dyn Clock>,
    waiter: Arc<dyn Waiter>,
    events: EventProducer,
    closed: AtomicBool,
}

impl BucketContainer {
    /// Build a container for `cfg`. All named and default buckets are
    /// created fresh; dynamic buckets materialize on first access.
    pub fn build(
        cfg: &ServiceConfig,
        factory: Arc<dyn BucketFactory>,
        clock: Arc<dyn Clock>,
        waiter: Arc<dyn Waiter>,
        events: EventProducer,
    ) -> Arc<Self> {
        let mut namespaces = HashMap::with_capacity(cfg.namespaces.len());
        for (ns_name, ns_cfg) in &cfg.namespaces {
            let mut named: HashMap<String, Arc<dyn Bucket>> =
                HashMap::with_capacity(ns_cfg.buckets.len() + 1);
            for (bucket_name, bucket_cfg) in &ns_cfg.buckets {
                let bucket = factory.create(
                    ns_name,
                    bucket_name,
                    Arc::new(bucket_cfg.clone()),
                    false,
                );
                named.insert(bucket_name.clone(), bucket);
            }
            let default_bucket = ns_cfg.default_bucket.as_ref().map(|bucket_cfg| {
                factory.create(ns_name, DEFAULT_BUCKET_NAME, Arc::new(bucket_cfg.clone()), false)
            });
            if let Some(bucket) = &default_bucket {
                named.insert(DEFAULT_BUCKET_NAME.to_string(), bucket.clone());
            }
            namespaces.insert(
                ns_name.clone(),
                Namespace {
                    template: ns_cfg.dynamic_bucket_template.clone().map(Arc::new),
                    cfg: Arc::new(ns_cfg.clone()),
                    named,
                    default_bucket,
                    dynamic: Mutex::new(HashMap::new()),
                },
            );
        }
        Arc::new(Self {
            version: cfg.version,
            namespaces,
            factory,
            clock,
            waiter,
            events,
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration version this container was built from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Resolve `(namespace, name)`: named bucket, then dynamic
    /// (existing or newly materialized), then the namespace default.
    pub fn find(self: &Arc<Self>, namespace: &str, name: &str) -> Resolution {
        let Some(ns) = self.namespaces.get(namespace) else {
            return Resolution::Miss;
        };

        if let Some(bucket) = ns.named.get(name) {
            return Resolution::Found(bucket.clone());
        }

        if let Some(template) = &ns.template {
            let mut dynamic =
                ns.dynamic.lock().expect("dynamic bucket registry lock poisoned");
            if let Some(entry) = dynamic.get(name) {
                entry.last_access.store(self.clock.now_nanos(), Ordering::Release);
                return Resolution::Found(entry.bucket.clone());
            }

            let cap = ns.cfg.max_dynamic_buckets;
            if cap > 0 && dynamic.len() as u64 >= cap {
                return Resolution::CapExceeded;
            }
            if self.closed.load(Ordering::Acquire) {
                // A drained container materializes nothing new.
                return Resolution::Miss;
            }

            let bucket = self.factory.create(namespace, name, template.clone(), true);
            let last_access = Arc::new(AtomicI64::new(self.clock.now_nanos()));
            let reaper = template.idle_timeout().map(|idle| {
                self.spawn_reaper(
                    namespace.to_string(),
                    name.to_string(),
                    idle,
                    last_access.clone(),
                )
            });
            dynamic.insert(
                name.to_string(),
                DynamicEntry { bucket: bucket.clone(), last_access, reaper },
            );
            self.events.emit(Event::BucketCreated {
                namespace: namespace.to_string(),
                bucket: name.to_string(),
                dynamic: true,
            });
            return Resolution::Found(bucket);
        }

        match &ns.default_bucket {
            Some(bucket) => Resolution::Found(bucket.clone()),
            None => Resolution::Miss,
        }
    }

    /// Materialized dynamic buckets in a namespace.
    pub fn dynamic_bucket_count(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.dynamic.lock().expect("dynamic bucket registry lock poisoned").len())
            .unwrap_or(0)
    }

    /// Destroy every bucket and cancel every idle reaper. Idempotent.
    /// In-flight `take` calls keep their own references and complete
    /// undisturbed.
    pub fn drain(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for ns in self.namespaces.values() {
            for bucket in ns.named.values() {
                bucket.destroy();
            }
            let mut dynamic =
                ns.dynamic.lock().expect("dynamic bucket registry lock poisoned");
            for (_, entry) in dynamic.drain() {
                if let Some(reaper) = entry.reaper {
                    reaper.abort();
                }
                entry.bucket.destroy();
            }
        }
        tracing::debug!(version = self.version, "bucket container drained");
    }

    fn spawn_reaper(
        self: &Arc<Self>,
        namespace: String,
        name: String,
        idle: Duration,
        last_access: Arc<AtomicI64>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let clock = self.clock.clone();
        let waiter = self.waiter.clone();
        let idle_nanos = i64::try_from(idle.as_nanos()).unwrap_or(i64::MAX);
        tokio::spawn(async move {
            loop {
                let now = clock.now_nanos();
                let deadline = last_access.load(Ordering::Acquire).saturating_add(idle_nanos);
                if now < deadline {
                    waiter.park(Duration::from_nanos((deadline - now) as u64)).await;
                    continue;
                }
                match Weak::upgrade(&weak) {
                    None => break,
                    Some(container) => {
                        if container.evict_idle(&namespace, &name, idle_nanos) {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Remove and destroy a dynamic bucket if it is still idle.
    /// Returns `true` when the reaper's work is done (evicted, or the
    /// entry is already gone); `false` when a concurrent touch won.
    fn evict_idle(&self, namespace: &str, name: &str, idle_nanos: i64) -> bool {
        let Some(ns) = self.namespaces.get(namespace) else {
            return true;
        };
        let mut dynamic = ns.dynamic.lock().expect("dynamic bucket registry lock poisoned");
        let Some(entry) = dynamic.remove(name) else {
            return true;
        };
        let now = self.clock.now_nanos();
        if now < entry.last_access.load(Ordering::Acquire).saturating_add(idle_nanos) {
            dynamic.insert(name.to_string(), entry);
            return false;
        }
        drop(dynamic);
        entry.bucket.destroy();
        self.events.emit(Event::BucketRemoved {
            namespace: namespace.to_string(),
            bucket: name.to_string(),
            dynamic: true,
        });
        tracing::debug!(namespace, bucket = name, "idle dynamic bucket evicted");
        true
    }
}
