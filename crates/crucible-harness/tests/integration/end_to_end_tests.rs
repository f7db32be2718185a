//! Hook-driven flows against the in-process loopback runtime.
//!
//! Every role runs as local HTTP listeners; the engine serves the REST stub
//! from crucible-test-utils, so clients exercise real requests.

use crucible_harness::client::{ClientError, EngineClient};
use crucible_harness::config::HarnessConfig;
use crucible_harness::error::HarnessError;
use crucible_harness::extension::{EnvironmentExtension, ScopeContext, TestContext};
use crucible_harness::inject::{FieldRef, Slot, TestFixture};
use crucible_harness::role::Role;
use crucible_harness::topology::VariantFlags;
use crucible_test_utils::{BpmnProcess, LoopbackRuntime, DEFAULT_TENANT, LOOPBACK_ACCESS_TOKEN};
use serde_json::json;
use std::sync::Arc;

#[derive(Default)]
struct ProcessTest {
    client: Option<EngineClient>,
    shared_client: Option<EngineClient>,
}

impl TestFixture for ProcessTest {
    fn declared_fields(&mut self) -> Vec<FieldRef<'_>> {
        vec![
            FieldRef::instance("client", Slot::EngineClient(&mut self.client)),
            FieldRef::shared("shared_client", Slot::EngineClient(&mut self.shared_client)),
        ]
    }
}

fn extension(flags: VariantFlags, runtime: &Arc<LoopbackRuntime>) -> EnvironmentExtension {
    let config = HarnessConfig {
        flags,
        ..HarnessConfig::default()
    };
    EnvironmentExtension::new(config, Arc::clone(runtime) as _).unwrap()
}

#[tokio::test]
async fn test_minimal_environment_deploys_under_isolation_key() {
    let runtime = Arc::new(LoopbackRuntime::new());
    let extension = extension(VariantFlags::minimal(), &runtime);
    let test = TestContext::new("ProcessInstanceIntegrationTest", "shouldCreateInstance");
    let mut fixture = ProcessTest::default();

    extension.before_each(&test, &mut fixture).await.unwrap();
    let client = fixture.client.as_ref().unwrap();
    assert_eq!(
        client.isolation_key().map(|key| key.as_str()),
        Some("ProcessInstanceIntegrationTest")
    );

    let topology = client.topology().await.unwrap();
    assert_eq!(topology.cluster_size, 1);
    assert_eq!(topology.brokers.len(), 1);

    let process = BpmnProcess::new("order").service_task("charge", "payment");
    let deployment = client
        .deploy_resource(&process.resource_name(), process.to_bytes())
        .await
        .unwrap();
    assert_eq!(deployment.tenant_id, "ProcessInstanceIntegrationTest");
    let definition = deployment.process_definitions().next().unwrap();
    assert_eq!(definition.process_definition_id, "order");
    assert_eq!(definition.tenant_id, "ProcessInstanceIntegrationTest");

    let instance = client
        .create_instance("order", &json!({ "amount": 42 }))
        .await
        .unwrap();
    assert_eq!(instance.process_definition_key, definition.process_definition_key);
    assert_eq!(instance.tenant_id, "ProcessInstanceIntegrationTest");

    let recorded = runtime.engine().instances();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].variables, json!({ "amount": 42 }));

    let scope = test.scope();
    let environment = extension.environment(&scope).await.unwrap();
    assert!(extension.after_scope(&scope).await);

    assert!(matches!(
        environment.address_of(Role::Engine).await,
        Err(HarnessError::RoleNotStarted { role: Role::Engine })
    ));
    assert!(runtime.running_roles().is_empty());
    assert!(runtime.open_networks().is_empty());
}

#[tokio::test]
async fn test_tenants_do_not_see_each_others_definitions() {
    let runtime = Arc::new(LoopbackRuntime::new());
    let extension = extension(VariantFlags::minimal(), &runtime);

    let mut deploying = ProcessTest::default();
    let mut other = ProcessTest::default();
    extension
        .before_each(&TestContext::new("JobTest", "shouldDeploy"), &mut deploying)
        .await
        .unwrap();
    extension
        .before_each(&TestContext::new("JobTest", "shouldNotSee"), &mut other)
        .await
        .unwrap();

    let process = BpmnProcess::new("ship");
    deploying
        .client
        .as_ref()
        .unwrap()
        .deploy_resource(&process.resource_name(), process.to_bytes())
        .await
        .unwrap();

    let err = other
        .client
        .as_ref()
        .unwrap()
        .create_instance("ship", &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Status { status: 404, .. }));

    extension.shutdown().await;
}

#[tokio::test]
async fn test_shared_client_uses_default_tenant() {
    let runtime = Arc::new(LoopbackRuntime::new());
    let extension = extension(VariantFlags::minimal(), &runtime);
    let mut fixture = ProcessTest::default();

    extension
        .inject_shared(&ScopeContext::new("SharedTest"), &mut fixture)
        .await
        .unwrap();

    let process = BpmnProcess::new("shared");
    let deployment = fixture
        .shared_client
        .as_ref()
        .unwrap()
        .deploy_resource(&process.resource_name(), process.to_bytes())
        .await
        .unwrap();

    assert_eq!(deployment.tenant_id, DEFAULT_TENANT);
    assert_eq!(runtime.engine().deployments()[0].tenant_id, DEFAULT_TENANT);

    extension.shutdown().await;
}

#[tokio::test]
async fn test_job_completion_reaches_engine() {
    let runtime = Arc::new(LoopbackRuntime::new());
    let extension = extension(VariantFlags::minimal(), &runtime);
    let mut fixture = ProcessTest::default();

    extension
        .before_each(&TestContext::new("JobTest", "shouldComplete"), &mut fixture)
        .await
        .unwrap();
    fixture
        .client
        .as_ref()
        .unwrap()
        .complete_job(2_251_799_813_685_300, &json!({ "approved": true }))
        .await
        .unwrap();

    assert_eq!(runtime.engine().completed_jobs(), vec![2_251_799_813_685_300]);
    extension.shutdown().await;
}

#[tokio::test]
async fn test_identity_variant_authenticates_clients() {
    let runtime = Arc::new(LoopbackRuntime::new());
    let extension = extension(VariantFlags::minimal().with_identity(true), &runtime);
    let mut fixture = ProcessTest::default();

    extension
        .before_each(&TestContext::new("SecureTest", "shouldAuthenticate"), &mut fixture)
        .await
        .unwrap();

    let client = fixture.client.as_ref().unwrap();
    assert!(client.is_authenticated());
    client.topology().await.unwrap();

    assert_eq!(
        runtime.engine().bearer_tokens(),
        vec![LOOPBACK_ACCESS_TOKEN.to_string()]
    );
    assert_eq!(extension.shutdown().await, 1);
    assert!(runtime.running_roles().is_empty());
}

#[tokio::test]
async fn test_full_variant_starts_and_stops() {
    let runtime = Arc::new(LoopbackRuntime::new());
    let extension = extension(
        VariantFlags::minimal()
            .with_web_apps(true)
            .with_connectors(true)
            .with_identity(true),
        &runtime,
    );
    let scope = ScopeContext::new("EverythingTest");

    let environment = extension.before_scope(&scope).await.unwrap();
    assert_eq!(runtime.running_roles(), Role::ALL.to_vec());
    for role in Role::ALL {
        assert!(environment.address_of(role).await.is_ok(), "{role}");
    }

    assert!(extension.after_scope(&scope).await);
    assert!(runtime.running_roles().is_empty());
}
