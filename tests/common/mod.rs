use std::sync::Arc;
use std::time::Duration;

use tokengate::config::{apply_defaults, BucketConfig, NamespaceConfig, ServiceConfig};
use tokengate::{
    ManualClock, MemoryBucketFactory, MemoryPersister, QuotaService, RecordingWaiter,
};

/// A config with one namespace holding the given named buckets.
pub fn config_with_buckets(
    namespace: &str,
    buckets: &[(&str, BucketConfig)],
) -> ServiceConfig {
    let mut cfg = ServiceConfig::with_defaults();
    let mut ns = NamespaceConfig::named(namespace);
    for (name, bucket) in buckets {
        ns.buckets.insert((*name).to_string(), bucket.clone());
    }
    cfg.namespaces.insert(namespace.to_string(), ns);
    apply_defaults(&mut cfg);
    cfg
}

/// A service on hand-driven time, seeded with `cfg`.
pub fn manual_service(cfg: &ServiceConfig) -> (QuotaService, ManualClock, RecordingWaiter) {
    let clock = ManualClock::new();
    let waiter = RecordingWaiter::new();
    let factory = Arc::new(MemoryBucketFactory::with_parts(
        Arc::new(clock.clone()),
        Arc::new(waiter.clone()),
    ));
    let persister =
        Arc::new(MemoryPersister::with_initial(cfg.to_bytes().expect("config serializes")));
    let service = QuotaService::with_parts(
        factory,
        persister,
        Arc::new(clock.clone()),
        Arc::new(waiter.clone()),
    );
    (service, clock, waiter)
}

/// Poll until `predicate` holds or a couple of seconds elapse.
pub async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
