//! Scope cache: one environment per key, created once, released once.

use crucible_harness::error::HarnessError;
use crucible_harness::lifecycle::{Environment, EnvironmentState, LifecycleSettings};
use crucible_harness::role::Role;
use crucible_harness::scope_cache::{ScopeCache, ScopeGranularity, ScopeKey};
use crucible_harness::topology::{TopologyBuilder, VariantFlags};
use crucible_test_utils::RecordingRuntime;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn launch(runtime: &Arc<RecordingRuntime>) -> Result<Arc<Environment>, HarnessError> {
    let topology = TopologyBuilder::new().build(VariantFlags::minimal())?;
    Environment::launch(topology, Arc::clone(runtime) as _, LifecycleSettings::default()).await
}

#[tokio::test]
async fn test_concurrent_requests_share_one_environment() {
    let runtime = Arc::new(RecordingRuntime::new());
    let cache = ScopeCache::new();
    let key = ScopeKey::for_scope(ScopeGranularity::Class, "OrderTest");
    let created = AtomicUsize::new(0);

    let requests = (0..8).map(|_| {
        cache.get_or_create(&key, || async {
            created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            launch(&runtime).await
        })
    });
    let environments: Vec<Arc<Environment>> = join_all(requests)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(created.load(Ordering::SeqCst), 1);
    for environment in &environments {
        assert!(Arc::ptr_eq(environment, &environments[0]));
    }
    assert_eq!(runtime.started_roles().len(), 2);
    assert_eq!(cache.len().await, 1);

    assert!(cache.release(&key).await);
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_environments() {
    let runtime = Arc::new(RecordingRuntime::new());
    let cache = ScopeCache::new();
    let orders = ScopeKey::for_scope(ScopeGranularity::Class, "OrderTest");
    let jobs = ScopeKey::for_scope(ScopeGranularity::Class, "JobTest");

    let a = cache.get_or_create(&orders, || launch(&runtime)).await.unwrap();
    let b = cache.get_or_create(&jobs, || launch(&runtime)).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_ne!(a.id(), b.id());
    assert_eq!(cache.release_all().await, 2);
    assert!(runtime.running_roles().is_empty());
}

#[tokio::test]
async fn test_failed_factory_fails_every_caller_of_the_key() {
    let failing = Arc::new(RecordingRuntime::builder().fail_start(Role::Engine).build());
    let cache = ScopeCache::new();
    let key = ScopeKey::for_scope(ScopeGranularity::Class, "OrderTest");
    let created = AtomicUsize::new(0);

    let requests = (0..5).map(|_| {
        cache.get_or_create(&key, || async {
            created.fetch_add(1, Ordering::SeqCst);
            launch(&failing).await
        })
    });
    let results = join_all(requests).await;

    assert_eq!(created.load(Ordering::SeqCst), 1);
    for result in results {
        assert!(matches!(
            result.unwrap_err(),
            HarnessError::StartupFailed {
                role: Role::Engine,
                ..
            }
        ));
    }
    let engine_starts = failing
        .started_roles()
        .into_iter()
        .filter(|role| *role == Role::Engine)
        .count();
    assert_eq!(engine_starts, 1);

    // Later callers see the same failure without another attempt.
    let err = cache
        .get_or_create(&key, || async {
            created.fetch_add(1, Ordering::SeqCst);
            launch(&failing).await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::StartupFailed { .. }));
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert!(cache.get(&key).await.is_none());
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_release_clears_failed_scope() {
    let failing = Arc::new(RecordingRuntime::builder().fail_start(Role::Engine).build());
    let healthy = Arc::new(RecordingRuntime::new());
    let cache = ScopeCache::new();
    let key = ScopeKey::for_scope(ScopeGranularity::Run, "ignored");

    cache
        .get_or_create(&key, || launch(&failing))
        .await
        .unwrap_err();

    // Nothing was running, so nothing is stopped.
    assert!(!cache.release(&key).await);

    let environment = cache.get_or_create(&key, || launch(&healthy)).await.unwrap();
    assert_eq!(environment.state().await, EnvironmentState::Running);

    cache.release_all().await;
}

#[tokio::test]
async fn test_release_waits_for_environment_being_created() {
    let runtime = Arc::new(RecordingRuntime::new());
    let cache = ScopeCache::new();
    let key = ScopeKey::for_scope(ScopeGranularity::Class, "OrderTest");

    let create = cache.get_or_create(&key, || async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        launch(&runtime).await
    });
    let release = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.release(&key).await
    };
    let (created, released) = tokio::join!(create, release);

    assert!(released);
    let environment = created.unwrap();
    assert_eq!(environment.state().await, EnvironmentState::Closed);
    assert!(runtime.running_roles().is_empty());
    assert_eq!(cache.release_all().await, 0);
}

#[tokio::test]
async fn test_release_all_waits_for_environment_being_created() {
    let runtime = Arc::new(RecordingRuntime::new());
    let cache = ScopeCache::new();
    let key = ScopeKey::for_scope(ScopeGranularity::Run, "ignored");

    let create = cache.get_or_create(&key, || async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        launch(&runtime).await
    });
    let release_all = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.release_all().await
    };
    let (created, released) = tokio::join!(create, release_all);

    assert_eq!(released, 1);
    assert_eq!(created.unwrap().state().await, EnvironmentState::Closed);
    assert!(runtime.running_roles().is_empty());
}

#[tokio::test]
async fn test_release_stops_environment_once() {
    let runtime = Arc::new(RecordingRuntime::new());
    let cache = ScopeCache::new();
    let key = ScopeKey::for_scope(ScopeGranularity::Class, "OrderTest");

    let environment = cache.get_or_create(&key, || launch(&runtime)).await.unwrap();

    assert!(cache.release(&key).await);
    assert!(!cache.release(&key).await);

    assert_eq!(environment.state().await, EnvironmentState::Closed);
    assert_eq!(runtime.stopped().len(), 2);
    assert!(cache.get(&key).await.is_none());
}

#[tokio::test]
async fn test_release_then_create_starts_fresh_environment() {
    let runtime = Arc::new(RecordingRuntime::new());
    let cache = ScopeCache::new();
    let key = ScopeKey::for_scope(ScopeGranularity::Class, "OrderTest");

    let first = cache.get_or_create(&key, || launch(&runtime)).await.unwrap();
    cache.release(&key).await;
    let second = cache.get_or_create(&key, || launch(&runtime)).await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(second.state().await, EnvironmentState::Running);
    assert_eq!(cache.release_all().await, 1);
}
