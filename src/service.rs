//! Public facade: serving, lifecycle, listeners and admin mutations.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::bucket::BucketFactory;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{
    apply_defaults, BucketConfig, ConfigPersister, ConfigPipeline, MemoryPersister,
    NamespaceConfig, ServiceConfig, DEFAULT_BUCKET_NAME,
};
use crate::container::{BucketContainer, Resolution};
use crate::error::{AllowError, ConfigError, PersistError};
use crate::events::{Event, EventProducer, EventSink};
use crate::waiting::{TimerWaiter, Waiter};

const STATUS_INITIALIZED: u8 = 0;
const STATUS_STARTED: u8 = 1;
const STATUS_STOPPED: u8 = 2;

/// Queue size used when no listener registration supplied one.
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1;

/// Lifecycle of a [`QuotaService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    Initialized,
    Started,
    Stopped,
}

/// A successful grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowResult {
    /// The wait that was served before the tokens became available.
    pub wait: Duration,
    /// Whether the serving bucket was dynamically materialized.
    pub dynamic: bool,
}

struct ServiceInner {
    status: AtomicU8,
    pipeline: ConfigPipeline,
    factory: Arc<dyn BucketFactory>,
    clock: Arc<dyn Clock>,
    waiter: Arc<dyn Waiter>,
    container: ArcSwapOption<BucketContainer>,
    producer: OnceLock<EventProducer>,
    user_sink: Mutex<Option<Arc<dyn EventSink>>>,
    stats_sink: Mutex<Option<Arc<dyn EventSink>>>,
    event_queue_size: AtomicUsize,
    reload_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceInner {
    fn emit(&self, event: Event) {
        if let Some(producer) = self.producer.get() {
            producer.emit(event);
        }
    }

    /// The single install path: build a container for `cfg`, swap it
    /// in, drain the predecessor.
    fn install(&self, cfg: &Arc<ServiceConfig>) {
        let Some(producer) = self.producer.get() else { return };
        let container = BucketContainer::build(
            cfg,
            self.factory.clone(),
            self.clock.clone(),
            self.waiter.clone(),
            producer.clone(),
        );
        if let Some(previous) = self.container.swap(Some(container)) {
            previous.drain();
        }
        producer.emit(Event::ConfigUpdated { version: cfg.version });
        tracing::info!(version = cfg.version, user = %cfg.user, "configuration installed");
    }
}

/// The quota service core.
///
/// Clones share state; the service is cheap to hand to every
/// transport endpoint.
#[derive(Clone)]
pub struct QuotaService {
    inner: Arc<ServiceInner>,
}

impl QuotaService {
    /// A service over `persister`, with production clock and timer.
    pub fn new(factory: Arc<dyn BucketFactory>, persister: Arc<dyn ConfigPersister>) -> Self {
        Self::with_parts(factory, persister, Arc::new(MonotonicClock::new()), Arc::new(TimerWaiter))
    }

    /// Full wiring; tests use this to drive time by hand.
    pub fn with_parts(
        factory: Arc<dyn BucketFactory>,
        persister: Arc<dyn ConfigPersister>,
        clock: Arc<dyn Clock>,
        waiter: Arc<dyn Waiter>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                status: AtomicU8::new(STATUS_INITIALIZED),
                pipeline: ConfigPipeline::new(persister),
                factory,
                clock,
                waiter,
                container: ArcSwapOption::empty(),
                producer: OnceLock::new(),
                user_sink: Mutex::new(None),
                stats_sink: Mutex::new(None),
                event_queue_size: AtomicUsize::new(DEFAULT_EVENT_QUEUE_SIZE),
                reload_task: Mutex::new(None),
            }),
        }
    }

    /// A service over an in-memory persister primed with an empty
    /// default config. Useful for embedding and tests; namespaces are
    /// added through the mutation API afterwards.
    pub fn with_default_config(factory: Arc<dyn BucketFactory>) -> Self {
        let mut cfg = ServiceConfig::with_defaults();
        apply_defaults(&mut cfg);
        let raw = cfg.to_bytes().expect("default config serializes");
        Self::new(factory, Arc::new(MemoryPersister::with_initial(raw)))
    }

    pub fn status(&self) -> LifecycleStatus {
        match self.inner.status.load(Ordering::Acquire) {
            STATUS_INITIALIZED => LifecycleStatus::Initialized,
            STATUS_STARTED => LifecycleStatus::Started,
            _ => LifecycleStatus::Stopped,
        }
    }

    /// Register the user event listener and size the event queue.
    ///
    /// # Panics
    ///
    /// Panics if the service has already started; listeners are
    /// initialization-time state.
    pub fn set_listener(&self, sink: Arc<dyn EventSink>, queue_size: usize) {
        self.ensure_initialized("event listener");
        *self.inner.user_sink.lock().expect("listener lock poisoned") = Some(sink);
        self.inner.event_queue_size.store(queue_size.max(1), Ordering::Relaxed);
    }

    /// Register the stats listener.
    ///
    /// # Panics
    ///
    /// Panics if the service has already started.
    pub fn set_stats_listener(&self, sink: Arc<dyn EventSink>) {
        self.ensure_initialized("stats listener");
        *self.inner.stats_sink.lock().expect("listener lock poisoned") = Some(sink);
    }

    fn ensure_initialized(&self, what: &str) {
        if self.inner.status.load(Ordering::Acquire) != STATUS_INITIALIZED {
            panic!("cannot change the {} after the service has started", what);
        }
    }

    /// Install the first container and begin consuming change signals.
    ///
    /// Blocks until a persisted config has produced a live container:
    /// either the persister already holds one, or the first change
    /// signal delivers it. No [`allow`](Self::allow) succeeds before
    /// that point.
    ///
    /// # Panics
    ///
    /// Panics when called twice, or after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), ConfigError> {
        let inner = &self.inner;
        if inner
            .status
            .compare_exchange(
                STATUS_INITIALIZED,
                STATUS_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            panic!("quota service already started or stopped");
        }

        let user = inner.user_sink.lock().expect("listener lock poisoned").take();
        let stats = inner.stats_sink.lock().expect("listener lock poisoned").take();
        let queue_size = inner.event_queue_size.load(Ordering::Relaxed);
        let producer = EventProducer::start(user, stats, queue_size);
        let _ = inner.producer.set(producer);

        // Subscribe before the initial read so a concurrent persist is
        // never missed.
        let mut watcher = inner.pipeline.watch();
        match inner.pipeline.load().await {
            Ok(cfg) => inner.install(&cfg),
            Err(ConfigError::PersistenceFailed(PersistError::NoConfig)) => {
                loop {
                    match watcher.recv().await {
                        Ok(()) | Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => {
                            inner.status.store(STATUS_STOPPED, Ordering::Release);
                            return Err(ConfigError::PersistenceFailed(PersistError::NoConfig));
                        }
                    }
                }
                match inner.pipeline.load().await {
                    Ok(cfg) => inner.install(&cfg),
                    Err(e) => {
                        inner.status.store(STATUS_STOPPED, Ordering::Release);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                inner.status.store(STATUS_STOPPED, Ordering::Release);
                return Err(e);
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            reload_loop(weak, watcher).await;
        });
        *inner.reload_task.lock().expect("reload task lock poisoned") = Some(handle);
        tracing::info!("quota service started");
        Ok(())
    }

    /// Uninstall the container (subsequent allows fail), drain it and
    /// stop consuming change signals. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.status.swap(STATUS_STOPPED, Ordering::AcqRel) == STATUS_STOPPED {
            return;
        }
        if let Some(container) = inner.container.swap(None) {
            container.drain();
        }
        if let Some(handle) = inner.reload_task.lock().expect("reload task lock poisoned").take() {
            handle.abort();
        }
        tracing::info!("quota service stopped");
    }

    /// Request `tokens` from `(namespace, bucket)`.
    ///
    /// `max_wait_override` can only *reduce* the bucket's configured
    /// patience, never extend it. The call returns once the granted
    /// wait has been served, or immediately on denial.
    pub async fn allow(
        &self,
        namespace: &str,
        bucket: &str,
        tokens: u64,
        max_wait_override: Option<Duration>,
    ) -> Result<AllowResult, AllowError> {
        let inner = &self.inner;
        let Some(container) = inner.container.load_full() else {
            return Err(AllowError::NotRunning);
        };

        let resolved = match container.find(namespace, bucket) {
            Resolution::Found(bucket_ref) => bucket_ref,
            Resolution::Miss => {
                inner.emit(Event::BucketMissed {
                    namespace: namespace.to_string(),
                    bucket: bucket.to_string(),
                    attempted_dynamic_creation: false,
                });
                return Err(AllowError::NoBucket {
                    namespace: namespace.to_string(),
                    bucket: bucket.to_string(),
                });
            }
            Resolution::CapExceeded => {
                inner.emit(Event::BucketMissed {
                    namespace: namespace.to_string(),
                    bucket: bucket.to_string(),
                    attempted_dynamic_creation: true,
                });
                return Err(AllowError::TooManyBuckets {
                    namespace: namespace.to_string(),
                    bucket: bucket.to_string(),
                });
            }
        };

        let cfg = resolved.config();
        if let Some(cap) = cfg.request_cap() {
            if tokens > cap {
                inner.emit(Event::TooManyTokensRequested {
                    namespace: namespace.to_string(),
                    bucket: bucket.to_string(),
                    dynamic: resolved.dynamic(),
                    tokens,
                });
                return Err(AllowError::TooManyTokensRequested {
                    namespace: namespace.to_string(),
                    bucket: bucket.to_string(),
                    requested: tokens,
                    max: cap,
                });
            }
        }

        let max_wait = match max_wait_override {
            Some(override_wait) if override_wait < cfg.wait_timeout() => override_wait,
            _ => cfg.wait_timeout(),
        };

        let (wait, granted) = resolved.take(tokens, max_wait).await;
        if !granted {
            inner.emit(Event::TimedOut {
                namespace: namespace.to_string(),
                bucket: bucket.to_string(),
                dynamic: resolved.dynamic(),
                tokens,
            });
            return Err(AllowError::Timeout {
                namespace: namespace.to_string(),
                bucket: bucket.to_string(),
            });
        }

        inner.emit(Event::TokensServed {
            namespace: namespace.to_string(),
            bucket: bucket.to_string(),
            dynamic: resolved.dynamic(),
            tokens,
            wait,
        });
        Ok(AllowResult { wait, dynamic: resolved.dynamic() })
    }

    /// The config most recently loaded from the persister.
    pub fn current_config(&self) -> Arc<ServiceConfig> {
        self.inner.pipeline.current()
    }

    /// All readable persisted versions, newest version first.
    pub async fn historical_configs(&self) -> Result<Vec<ServiceConfig>, ConfigError> {
        self.inner.pipeline.historical().await
    }

    /// Events dropped because the queue was full. Zero before start.
    pub fn dropped_events(&self) -> u64 {
        self.inner.producer.get().map(EventProducer::dropped).unwrap_or(0)
    }

    // Admin mutation surface. Every method carries the mutating user
    // for the audit trail and goes through copy-update-persist-notify;
    // the resulting container swap arrives via the reload loop.

    pub async fn add_namespace(&self, user: &str, ns: NamespaceConfig) -> Result<(), ConfigError> {
        let name = ns.name.clone();
        self.inner
            .pipeline
            .mutate(user, move |cfg| {
                if name.is_empty() {
                    return Err(ConfigError::Invalid("namespace name must not be empty".into()));
                }
                if cfg.namespaces.contains_key(&name) {
                    return Err(ConfigError::Invalid(format!(
                        "namespace {:?} already exists",
                        name
                    )));
                }
                cfg.namespaces.insert(name, ns);
                Ok(())
            })
            .await
    }

    pub async fn update_namespace(
        &self,
        user: &str,
        ns: NamespaceConfig,
    ) -> Result<(), ConfigError> {
        let name = ns.name.clone();
        self.inner
            .pipeline
            .mutate(user, move |cfg| {
                if !cfg.namespaces.contains_key(&name) {
                    return Err(ConfigError::Invalid(format!("no namespace {:?}", name)));
                }
                cfg.namespaces.insert(name, ns);
                Ok(())
            })
            .await
    }

    pub async fn remove_namespace(&self, user: &str, name: &str) -> Result<(), ConfigError> {
        let name = name.to_string();
        self.inner
            .pipeline
            .mutate(user, move |cfg| {
                if cfg.namespaces.remove(&name).is_none() {
                    return Err(ConfigError::Invalid(format!("no namespace {:?}", name)));
                }
                Ok(())
            })
            .await
    }

    /// Add a bucket. The reserved name addresses the namespace's
    /// default bucket.
    pub async fn add_bucket(
        &self,
        user: &str,
        namespace: &str,
        name: &str,
        bucket: BucketConfig,
    ) -> Result<(), ConfigError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.inner
            .pipeline
            .mutate(user, move |cfg| {
                let ns = cfg.namespace_mut(&namespace).ok_or_else(|| {
                    ConfigError::Invalid(format!("no namespace {:?}", namespace))
                })?;
                if name == DEFAULT_BUCKET_NAME {
                    if ns.default_bucket.is_some() {
                        return Err(ConfigError::Invalid(format!(
                            "{}:{} already exists",
                            namespace, name
                        )));
                    }
                    ns.default_bucket = Some(bucket);
                } else {
                    if ns.buckets.contains_key(&name) {
                        return Err(ConfigError::Invalid(format!(
                            "{}:{} already exists",
                            namespace, name
                        )));
                    }
                    ns.buckets.insert(name, bucket);
                }
                Ok(())
            })
            .await
    }

    pub async fn update_bucket(
        &self,
        user: &str,
        namespace: &str,
        name: &str,
        bucket: BucketConfig,
    ) -> Result<(), ConfigError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.inner
            .pipeline
            .mutate(user, move |cfg| {
                let ns = cfg.namespace_mut(&namespace).ok_or_else(|| {
                    ConfigError::Invalid(format!("no namespace {:?}", namespace))
                })?;
                if name == DEFAULT_BUCKET_NAME {
                    if ns.default_bucket.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "no bucket {}:{}",
                            namespace, name
                        )));
                    }
                    ns.default_bucket = Some(bucket);
                } else {
                    if !ns.buckets.contains_key(&name) {
                        return Err(ConfigError::Invalid(format!(
                            "no bucket {}:{}",
                            namespace, name
                        )));
                    }
                    ns.buckets.insert(name, bucket);
                }
                Ok(())
            })
            .await
    }

    pub async fn remove_bucket(
        &self,
        user: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ConfigError> {
        let namespace = namespace.to_string();
        let name = name.to_string();
        self.inner
            .pipeline
            .mutate(user, move |cfg| {
                let ns = cfg.namespace_mut(&namespace).ok_or_else(|| {
                    ConfigError::Invalid(format!("no namespace {:?}", namespace))
                })?;
                if name == DEFAULT_BUCKET_NAME {
                    if ns.default_bucket.take().is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "no bucket {}:{}",
                            namespace, name
                        )));
                    }
                } else if ns.buckets.remove(&name).is_none() {
                    return Err(ConfigError::Invalid(format!("no bucket {}:{}", namespace, name)));
                }
                Ok(())
            })
            .await
    }
}

async fn reload_loop(
    weak: Weak<ServiceInner>,
    mut watcher: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        match watcher.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {
                let Some(inner) = weak.upgrade() else { break };
                if inner.status.load(Ordering::Acquire) != STATUS_STARTED {
                    break;
                }
                match inner.pipeline.load().await {
                    Ok(cfg) => inner.install(&cfg),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "configuration reload failed; previous version stays live"
                        );
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}
