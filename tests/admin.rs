//! The admin mutation surface: namespace and bucket CRUD with audit
//! stamping, over the copy-update-persist-notify pipeline.

mod common;

use common::{config_with_buckets, manual_service, wait_for};
use tokengate::config::{BucketConfig, NamespaceConfig, DEFAULT_BUCKET_NAME};
use tokengate::ConfigError;

fn bucket(size: u64) -> BucketConfig {
    BucketConfig { size, fill_rate: 10, wait_timeout_millis: Some(0), ..Default::default() }
}

#[tokio::test]
async fn namespace_crud_round_trip() {
    let cfg = config_with_buckets("api", &[("reads", bucket(10))]);
    let (service, _clock, _waiter) = manual_service(&cfg);
    service.start().await.unwrap();

    let mut ns = NamespaceConfig::named("batch");
    ns.buckets.insert("imports".into(), bucket(50));
    service.add_namespace("alice", ns.clone()).await.unwrap();
    wait_for(|| service.current_config().namespaces.contains_key("batch")).await;
    assert_eq!(service.current_config().user, "alice");

    // Duplicate add is referential failure, not an upsert.
    assert!(matches!(
        service.add_namespace("alice", ns.clone()).await,
        Err(ConfigError::Invalid(_))
    ));

    ns.max_dynamic_buckets = 7;
    ns.dynamic_bucket_template = Some(bucket(5));
    service.update_namespace("bob", ns).await.unwrap();
    wait_for(|| service.current_config().namespaces["batch"].max_dynamic_buckets == 7).await;

    service.remove_namespace("carol", "batch").await.unwrap();
    wait_for(|| !service.current_config().namespaces.contains_key("batch")).await;

    assert!(matches!(
        service.remove_namespace("carol", "batch").await,
        Err(ConfigError::Invalid(_))
    ));
    service.stop();
}

#[tokio::test]
async fn bucket_crud_and_the_reserved_default_name() {
    let cfg = config_with_buckets("api", &[("reads", bucket(10))]);
    let (service, _clock, _waiter) = manual_service(&cfg);
    service.start().await.unwrap();

    service.add_bucket("ops", "api", "writes", bucket(20)).await.unwrap();
    wait_for(|| service.current_config().namespaces["api"].buckets.contains_key("writes")).await;

    assert!(matches!(
        service.add_bucket("ops", "api", "writes", bucket(20)).await,
        Err(ConfigError::Invalid(_))
    ));
    assert!(matches!(
        service.add_bucket("ops", "missing", "b", bucket(1)).await,
        Err(ConfigError::Invalid(_))
    ));

    // The reserved name addresses the namespace default.
    service.add_bucket("ops", "api", DEFAULT_BUCKET_NAME, bucket(30)).await.unwrap();
    wait_for(|| service.current_config().namespaces["api"].default_bucket.is_some()).await;
    assert_eq!(
        service.current_config().namespaces["api"].default_bucket.as_ref().unwrap().size,
        30
    );

    service.update_bucket("ops", "api", DEFAULT_BUCKET_NAME, bucket(40)).await.unwrap();
    wait_for(|| {
        service.current_config().namespaces["api"]
            .default_bucket
            .as_ref()
            .map(|b| b.size == 40)
            .unwrap_or(false)
    })
    .await;

    service.remove_bucket("ops", "api", DEFAULT_BUCKET_NAME).await.unwrap();
    wait_for(|| service.current_config().namespaces["api"].default_bucket.is_none()).await;
    assert!(matches!(
        service.remove_bucket("ops", "api", DEFAULT_BUCKET_NAME).await,
        Err(ConfigError::Invalid(_))
    ));

    service.remove_bucket("ops", "api", "writes").await.unwrap();
    wait_for(|| !service.current_config().namespaces["api"].buckets.contains_key("writes")).await;
    service.stop();
}

#[tokio::test]
async fn every_successful_mutation_bumps_the_version_by_one() {
    let cfg = config_with_buckets("api", &[("reads", bucket(10))]);
    let (service, _clock, _waiter) = manual_service(&cfg);
    service.start().await.unwrap();

    service.add_bucket("ops", "api", "a", bucket(1)).await.unwrap();
    let _ = service.add_bucket("ops", "api", "a", bucket(1)).await; // fails, no bump
    service.add_bucket("ops", "api", "b", bucket(1)).await.unwrap();

    let history = service.historical_configs().await.unwrap();
    let versions: Vec<u64> = history.iter().map(|c| c.version).collect();
    assert_eq!(versions, vec![cfg.version + 2, cfg.version + 1, cfg.version]);
    service.stop();
}

#[tokio::test]
async fn invalid_bucket_parameters_are_rejected_whole() {
    let cfg = config_with_buckets("api", &[("reads", bucket(10))]);
    let (service, _clock, _waiter) = manual_service(&cfg);
    service.start().await.unwrap();

    let before = service.historical_configs().await.unwrap().len();
    let result = service
        .add_bucket("ops", "api", "bad name", bucket(1))
        .await;
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
    assert_eq!(service.historical_configs().await.unwrap().len(), before);
    service.stop();
}
