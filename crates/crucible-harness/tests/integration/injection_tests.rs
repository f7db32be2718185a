//! Fixture injection through the extension hooks.

use crucible_harness::client::EngineClient;
use crucible_harness::config::HarnessConfig;
use crucible_harness::error::HarnessError;
use crucible_harness::extension::{EnvironmentExtension, ScopeContext, TestContext};
use crucible_harness::client_factory::ClientFactory;
use crucible_harness::inject::{self, Credentials, FieldRef, InjectionContext, Slot, TestFixture};
use crucible_harness::lifecycle::{Environment, EnvironmentState, LifecycleSettings};
use crucible_harness::role::Role;
use crucible_harness::scope_cache::ScopeGranularity;
use crucible_harness::topology::{TopologyBuilder, VariantFlags};
use crucible_test_utils::RecordingRuntime;
use std::sync::Arc;
use std::time::Duration;

/// Base fixture other test types embed.
#[derive(Default)]
struct BaseFixture {
    client: Option<EngineClient>,
    environment: Option<Arc<Environment>>,
}

impl TestFixture for BaseFixture {
    fn declared_fields(&mut self) -> Vec<FieldRef<'_>> {
        vec![
            FieldRef::instance("client", Slot::EngineClient(&mut self.client)),
            FieldRef::instance("environment", Slot::Environment(&mut self.environment)),
        ]
    }
}

#[derive(Default)]
struct EnvironmentFixture {
    environment: Option<Arc<Environment>>,
}

impl TestFixture for EnvironmentFixture {
    fn declared_fields(&mut self) -> Vec<FieldRef<'_>> {
        vec![FieldRef::instance("environment", Slot::Environment(&mut self.environment))]
    }
}

#[derive(Default)]
struct OrderTest {
    base: BaseFixture,
    shared_client: Option<EngineClient>,
    audit_client: Option<EngineClient>,
}

impl TestFixture for OrderTest {
    fn declared_fields(&mut self) -> Vec<FieldRef<'_>> {
        vec![
            FieldRef::shared("shared_client", Slot::EngineClient(&mut self.shared_client)),
            FieldRef::instance("audit_client", Slot::EngineClient(&mut self.audit_client)),
        ]
    }

    fn supertype(&mut self) -> Option<&mut dyn TestFixture> {
        Some(&mut self.base)
    }
}

fn extension(config: HarnessConfig, runtime: &Arc<RecordingRuntime>) -> EnvironmentExtension {
    EnvironmentExtension::new(config, Arc::clone(runtime) as _).unwrap()
}

fn minimal_config() -> HarnessConfig {
    HarnessConfig {
        flags: VariantFlags::minimal(),
        ..HarnessConfig::default()
    }
}

#[tokio::test]
async fn test_before_each_fills_inherited_and_own_fields() {
    let runtime = Arc::new(RecordingRuntime::new());
    let extension = extension(minimal_config(), &runtime);
    let test = TestContext::new("OrderTest", "shouldShip");
    let mut fixture = OrderTest::default();

    let assigned = extension.before_each(&test, &mut fixture).await.unwrap();

    assert_eq!(assigned, 3);
    let client = fixture.base.client.as_ref().unwrap();
    assert_eq!(
        client.isolation_key().map(|key| key.as_str()),
        Some("OrderTest_shouldShip")
    );
    assert!(!client.is_authenticated());
    assert_eq!(
        fixture.audit_client.as_ref().unwrap().isolation_key(),
        client.isolation_key()
    );

    let environment = fixture.base.environment.as_ref().unwrap();
    assert_eq!(
        client.address(),
        &environment.address_of(Role::Engine).await.unwrap()
    );

    // Static fields are filled per scope, never per test.
    assert!(fixture.shared_client.is_none());

    extension.shutdown().await;
}

#[tokio::test]
async fn test_inject_shared_fills_only_static_fields() {
    let runtime = Arc::new(RecordingRuntime::new());
    let extension = extension(minimal_config(), &runtime);
    let scope = ScopeContext::new("OrderTest");
    let mut fixture = OrderTest::default();

    let assigned = extension.inject_shared(&scope, &mut fixture).await.unwrap();

    assert_eq!(assigned, 1);
    let shared = fixture.shared_client.as_ref().unwrap();
    assert!(shared.isolation_key().is_none());
    assert!(fixture.base.client.is_none());
    assert!(fixture.audit_client.is_none());

    extension.shutdown().await;
}

#[tokio::test]
async fn test_tests_of_one_class_share_environment() {
    let runtime = Arc::new(RecordingRuntime::new());
    let extension = extension(minimal_config(), &runtime);

    let mut first = OrderTest::default();
    let mut second = OrderTest::default();
    extension
        .before_each(&TestContext::new("OrderTest", "shouldShip"), &mut first)
        .await
        .unwrap();
    extension
        .before_each(&TestContext::new("OrderTest", "shouldCancel"), &mut second)
        .await
        .unwrap();

    let a = first.base.environment.unwrap();
    let b = second.base.environment.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(runtime.started_roles().len(), 2);

    assert_ne!(
        first.base.client.unwrap().isolation_key(),
        second.base.client.unwrap().isolation_key()
    );

    extension.shutdown().await;
}

#[tokio::test]
async fn test_after_scope_releases_class_environment() {
    let runtime = Arc::new(RecordingRuntime::new());
    let extension = extension(minimal_config(), &runtime);
    let scope = ScopeContext::new("OrderTest");

    let environment = extension.before_scope(&scope).await.unwrap();
    assert!(extension.after_scope(&scope).await);

    assert_eq!(environment.state().await, EnvironmentState::Closed);
    assert!(runtime.running_roles().is_empty());
    assert!(extension.environment(&scope).await.is_none());

    // The next class run starts over.
    let next = extension.before_scope(&scope).await.unwrap();
    assert_ne!(next.id(), environment.id());
    assert_eq!(extension.shutdown().await, 1);
}

#[tokio::test]
async fn test_run_granularity_shares_across_classes() {
    let runtime = Arc::new(RecordingRuntime::new());
    let extension = extension(
        HarnessConfig {
            scope: ScopeGranularity::Run,
            ..minimal_config()
        },
        &runtime,
    );

    let orders = ScopeContext::new("OrderTest");
    let jobs = ScopeContext::new("JobTest");
    let a = extension.before_scope(&orders).await.unwrap();
    let b = extension.before_scope(&jobs).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    assert!(!extension.after_scope(&orders).await);
    assert_eq!(a.state().await, EnvironmentState::Running);

    assert_eq!(extension.shutdown().await, 1);
    assert_eq!(a.state().await, EnvironmentState::Closed);
}

#[tokio::test]
async fn test_missing_engine_fails_client_injection() {
    let runtime = Arc::new(RecordingRuntime::new());
    let index_store_only = VariantFlags {
        engine: false,
        ..VariantFlags::minimal()
    };
    let extension = extension(
        HarnessConfig {
            flags: index_store_only,
            ..HarnessConfig::default()
        },
        &runtime,
    );
    let mut fixture = OrderTest::default();

    let err = extension
        .before_each(&TestContext::new("OrderTest", "shouldShip"), &mut fixture)
        .await
        .unwrap_err();

    match err {
        HarnessError::InjectionFailed { field, cause } => {
            assert_eq!(field, "client");
            assert!(cause.contains("engine"), "{cause}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.base.client.is_none());

    extension.shutdown().await;
}

#[tokio::test]
async fn test_startup_failure_fails_whole_scope_once() {
    let runtime = Arc::new(RecordingRuntime::builder().fail_start(Role::Engine).build());
    let extension = extension(minimal_config(), &runtime);

    for method in ["shouldShip", "shouldCancel", "shouldRefund"] {
        let mut fixture = OrderTest::default();
        let err = extension
            .before_each(&TestContext::new("OrderTest", method), &mut fixture)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::StartupFailed {
                role: Role::Engine,
                ..
            }
        ));
        assert!(fixture.base.environment.is_none());
    }

    // One attempt for the whole class.
    let engine_starts = || {
        runtime
            .started_roles()
            .into_iter()
            .filter(|role| *role == Role::Engine)
            .count()
    };
    assert_eq!(engine_starts(), 1);
    assert!(runtime.running_roles().is_empty());

    // The next run of the class tries again.
    let scope = ScopeContext::new("OrderTest");
    assert!(!extension.after_scope(&scope).await);
    extension.before_scope(&scope).await.unwrap_err();
    assert_eq!(engine_starts(), 2);

    assert_eq!(extension.shutdown().await, 0);
}

#[tokio::test]
async fn test_unavailable_credentials_fail_only_client_fields() {
    let runtime = Arc::new(RecordingRuntime::new());
    let topology = TopologyBuilder::new()
        .build(VariantFlags::minimal())
        .unwrap();
    let environment =
        Environment::launch(topology, Arc::clone(&runtime) as _, LifecycleSettings::default())
            .await
            .unwrap();
    let context = InjectionContext::resolve(
        Arc::clone(&environment),
        None,
        Credentials::Unavailable("token endpoint unreachable".to_string()),
        ClientFactory::new(Duration::from_secs(5)).unwrap(),
    )
    .await;

    let mut with_client = BaseFixture::default();
    match inject::inject(&mut with_client, &context).unwrap_err() {
        HarnessError::InjectionFailed { field, cause } => {
            assert_eq!(field, "client");
            assert_eq!(cause, "token endpoint unreachable");
        }
        other => panic!("unexpected error: {other}"),
    }

    let mut environment_only = EnvironmentFixture::default();
    assert_eq!(inject::inject(&mut environment_only, &context).unwrap(), 1);
    assert!(environment_only.environment.is_some());

    environment.stop().await;
}

#[tokio::test]
async fn test_invalid_variant_acquires_nothing() {
    let runtime = Arc::new(RecordingRuntime::new());
    let no_index_store = VariantFlags {
        index_store: false,
        ..VariantFlags::minimal()
    };
    let extension = extension(
        HarnessConfig {
            flags: no_index_store,
            ..HarnessConfig::default()
        },
        &runtime,
    );

    let err = extension
        .before_scope(&ScopeContext::new("OrderTest"))
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::InvalidTopology(_)));
    assert!(runtime.calls().is_empty());
}
