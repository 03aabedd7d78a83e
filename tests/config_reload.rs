//! The reload protocol: startup gating, atomic container swap, and
//! resilience to bad persisted bytes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config_with_buckets, manual_service, wait_for};
use tokengate::config::{apply_defaults, BucketConfig, NamespaceConfig, ServiceConfig};
use tokengate::{
    AllowError, ConfigPersister, MemoryBucketFactory, MemoryPersister, QuotaService,
};

fn non_blocking_bucket(size: u64, fill_rate: u64) -> BucketConfig {
    BucketConfig { size, fill_rate, wait_timeout_millis: Some(0), ..Default::default() }
}

/// Poll until `(namespace, bucket)` serves a token.
async fn wait_until_served(service: &QuotaService, namespace: &str, bucket: &str) {
    for _ in 0..200 {
        if service.allow(namespace, bucket, 1, None).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{}:{} never became servable", namespace, bucket);
}

#[tokio::test]
async fn start_blocks_until_a_config_is_persisted() {
    let persister = Arc::new(MemoryPersister::new());
    let service =
        QuotaService::new(Arc::new(MemoryBucketFactory::new()), persister.clone());

    let starter = service.clone();
    let startup = tokio::spawn(async move { starter.start().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!startup.is_finished(), "start must wait for the first persisted config");
    assert!(matches!(
        service.allow("api", "reads", 1, None).await,
        Err(AllowError::NotRunning)
    ));

    let cfg = config_with_buckets("api", &[("reads", non_blocking_bucket(10, 10))]);
    persister.persist_and_notify(cfg.to_bytes().unwrap()).await.unwrap();

    startup.await.unwrap().unwrap();
    assert!(service.allow("api", "reads", 1, None).await.is_ok());
    service.stop();
}

#[tokio::test]
async fn reload_swaps_in_the_new_rates() {
    let cfg = config_with_buckets("api", &[("writes", non_blocking_bucket(1, 1))]);
    let (service, _clock, _waiter) = manual_service(&cfg);
    service.start().await.unwrap();

    // The single banked token, then denial.
    assert!(service.allow("api", "writes", 1, None).await.is_ok());
    assert!(matches!(
        service.allow("api", "writes", 1, None).await,
        Err(AllowError::Timeout { .. })
    ));

    service
        .update_bucket("ops", "api", "writes", non_blocking_bucket(100, 100))
        .await
        .unwrap();
    wait_for(|| service.current_config().version == cfg.version + 1).await;
    wait_until_served(&service, "api", "writes").await;

    // The rebuilt bucket carries the new capacity: one token went to
    // the poll above, the other ninety-nine are banked.
    for n in 0..99 {
        assert!(
            service.allow("api", "writes", 1, None).await.is_ok(),
            "token {} of the new capacity",
            n + 1
        );
    }
    service.stop();
}

#[tokio::test]
async fn corrupt_persisted_bytes_keep_the_previous_container() {
    let cfg = config_with_buckets("api", &[("reads", non_blocking_bucket(10, 10))]);
    let persister = Arc::new(MemoryPersister::with_initial(cfg.to_bytes().unwrap()));
    let service =
        QuotaService::new(Arc::new(MemoryBucketFactory::new()), persister.clone());
    service.start().await.unwrap();

    persister.persist_and_notify(b"{not json".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(service.current_config().version, cfg.version);
    assert!(service.allow("api", "reads", 1, None).await.is_ok());

    // The reload loop is still alive and applies the next good config.
    let mut fixed = cfg.clone();
    fixed.version = cfg.version + 5;
    fixed.namespaces.insert("batch".into(), NamespaceConfig::named("batch"));
    apply_defaults(&mut fixed);
    persister.persist_and_notify(fixed.to_bytes().unwrap()).await.unwrap();
    wait_for(|| service.current_config().version == cfg.version + 5).await;
    service.stop();
}

#[tokio::test]
async fn externally_persisted_configs_install_through_the_same_path() {
    let cfg = config_with_buckets("api", &[("reads", non_blocking_bucket(10, 10))]);
    let persister = Arc::new(MemoryPersister::with_initial(cfg.to_bytes().unwrap()));
    let service =
        QuotaService::new(Arc::new(MemoryBucketFactory::new()), persister.clone());
    service.start().await.unwrap();

    assert!(matches!(
        service.allow("ext", "x", 1, None).await,
        Err(AllowError::NoBucket { .. })
    ));

    // An external editor writes a new version directly to the store.
    let mut edited = ServiceConfig::clone(&service.current_config());
    edited.version += 1;
    let mut ns = NamespaceConfig::named("ext");
    ns.buckets.insert("x".into(), non_blocking_bucket(3, 3));
    edited.namespaces.insert("ext".into(), ns);
    apply_defaults(&mut edited);
    persister.persist_and_notify(edited.to_bytes().unwrap()).await.unwrap();

    wait_for(|| service.current_config().version == cfg.version + 1).await;
    wait_until_served(&service, "ext", "x").await;
    service.stop();
}

#[tokio::test]
async fn in_flight_grants_survive_the_swap() {
    let cfg = config_with_buckets(
        "api",
        &[(
            "slow",
            BucketConfig {
                size: 1,
                fill_rate: 2,
                wait_timeout_millis: Some(2000),
                ..Default::default()
            },
        )],
    );
    let persister = Arc::new(MemoryPersister::with_initial(cfg.to_bytes().unwrap()));
    let service = QuotaService::new(Arc::new(MemoryBucketFactory::new()), persister);
    service.start().await.unwrap();

    // Consume the banked token, then park a caller on the next accrual
    // (~500ms out).
    assert!(service.allow("api", "slow", 1, None).await.is_ok());
    let waiter = service.clone();
    let blocked = tokio::spawn(async move { waiter.allow("api", "slow", 1, None).await });

    // Swap containers underneath the blocked reservation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    service
        .add_bucket("ops", "api", "fast", non_blocking_bucket(10, 10))
        .await
        .unwrap();
    wait_for(|| service.current_config().version == cfg.version + 1).await;

    let grant = blocked.await.unwrap().expect("reservation on the old container completes");
    assert!(grant.wait >= Duration::from_millis(300), "wait was {:?}", grant.wait);
    service.stop();
}

#[tokio::test]
async fn history_is_version_descending() {
    let cfg = config_with_buckets("api", &[("reads", non_blocking_bucket(10, 10))]);
    let (service, _clock, _waiter) = manual_service(&cfg);
    service.start().await.unwrap();

    service.add_namespace("alice", NamespaceConfig::named("one")).await.unwrap();
    service.add_namespace("bob", NamespaceConfig::named("two")).await.unwrap();

    let history = service.historical_configs().await.unwrap();
    let versions: Vec<u64> = history.iter().map(|c| c.version).collect();
    assert_eq!(versions, vec![cfg.version + 2, cfg.version + 1, cfg.version]);
    assert_eq!(history[0].user, "bob");
    service.stop();
}
