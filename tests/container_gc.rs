//! Dynamic bucket materialization, caps and idle eviction.

use std::sync::Arc;
use std::time::Duration;

use tokengate::config::{apply_defaults, BucketConfig, NamespaceConfig, ServiceConfig};
use tokengate::{
    BucketContainer, Event, EventProducer, MemoryBucketFactory, MemorySink, MonotonicClock,
    Resolution, TimerWaiter,
};

fn dynamic_namespace(max_dynamic: u64, max_idle_millis: u64) -> ServiceConfig {
    let mut cfg = ServiceConfig::with_defaults();
    let mut ns = NamespaceConfig::named("clients");
    ns.max_dynamic_buckets = max_dynamic;
    ns.dynamic_bucket_template = Some(BucketConfig {
        size: 5,
        fill_rate: 5,
        max_idle_millis: Some(max_idle_millis),
        ..Default::default()
    });
    cfg.namespaces.insert("clients".into(), ns);
    apply_defaults(&mut cfg);
    cfg
}

fn live_container(cfg: &ServiceConfig, sink: &MemorySink) -> Arc<BucketContainer> {
    let clock = Arc::new(MonotonicClock::new());
    let waiter = Arc::new(TimerWaiter);
    let factory = Arc::new(MemoryBucketFactory::with_parts(clock.clone(), waiter.clone()));
    let producer = EventProducer::start(Some(Arc::new(sink.clone())), None, 64);
    BucketContainer::build(cfg, factory, clock, waiter, producer)
}

async fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn cap_allows_two_then_rejects_the_third_name() {
    let sink = MemorySink::new();
    let container = live_container(&dynamic_namespace(2, 0), &sink);

    assert!(matches!(container.find("clients", "alpha"), Resolution::Found(_)));
    assert!(matches!(container.find("clients", "beta"), Resolution::Found(_)));
    assert!(matches!(container.find("clients", "gamma"), Resolution::CapExceeded));
    assert_eq!(container.dynamic_bucket_count("clients"), 2);

    // Known names keep resolving and count as touches, not creates.
    assert!(matches!(container.find("clients", "alpha"), Resolution::Found(_)));
    wait_for(|| sink.len() >= 2).await;
    let creates = sink
        .events()
        .iter()
        .filter(|e| matches!(e, Event::BucketCreated { .. }))
        .count();
    assert_eq!(creates, 2);
}

#[tokio::test]
async fn idle_bucket_is_evicted_and_recreated_on_next_access() {
    let sink = MemorySink::new();
    let container = live_container(&dynamic_namespace(0, 100), &sink);

    match container.find("clients", "tenant-1") {
        Resolution::Found(bucket) => assert!(bucket.dynamic()),
        _ => panic!("expected a dynamic bucket"),
    }
    assert_eq!(container.dynamic_bucket_count("clients"), 1);

    wait_for(|| container.dynamic_bucket_count("clients") == 0).await;
    let removed = sink
        .events()
        .iter()
        .any(|e| matches!(e, Event::BucketRemoved { bucket, .. } if bucket == "tenant-1"));
    assert!(removed, "eviction reports the removed bucket");

    // The name materializes afresh, back to a count of one.
    assert!(matches!(container.find("clients", "tenant-1"), Resolution::Found(_)));
    assert_eq!(container.dynamic_bucket_count("clients"), 1);
}

#[tokio::test]
async fn touches_keep_a_busy_bucket_alive() {
    let sink = MemorySink::new();
    let container = live_container(&dynamic_namespace(0, 150), &sink);

    assert!(matches!(container.find("clients", "busy"), Resolution::Found(_)));
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            matches!(container.find("clients", "busy"), Resolution::Found(_)),
            "touched bucket must survive its idle horizon"
        );
    }
    assert_eq!(container.dynamic_bucket_count("clients"), 1);

    // Left alone, it finally goes.
    wait_for(|| container.dynamic_bucket_count("clients") == 0).await;
}

#[tokio::test]
async fn drain_destroys_dynamic_buckets_and_stops_creation() {
    let sink = MemorySink::new();
    let container = live_container(&dynamic_namespace(0, 0), &sink);

    assert!(matches!(container.find("clients", "a"), Resolution::Found(_)));
    assert!(matches!(container.find("clients", "b"), Resolution::Found(_)));
    container.drain();

    assert_eq!(container.dynamic_bucket_count("clients"), 0);
    assert!(matches!(container.find("clients", "c"), Resolution::Miss));
}
