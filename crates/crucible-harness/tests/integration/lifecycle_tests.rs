//! Environment start, rollback and shutdown against the recording runtime.

use crucible_harness::error::HarnessError;
use crucible_harness::lifecycle::{Environment, EnvironmentState, LifecycleSettings};
use crucible_harness::role::Role;
use crucible_harness::runtime::RuntimeError;
use crucible_harness::topology::{Topology, TopologyBuilder, VariantFlags};
use crucible_test_utils::{RecordingRuntime, RuntimeCall};
use std::sync::Arc;
use std::time::Duration;

fn topology(flags: VariantFlags) -> Topology {
    TopologyBuilder::new()
        .build(flags)
        .expect("variant should build")
}

fn full_flags() -> VariantFlags {
    VariantFlags::minimal()
        .with_web_apps(true)
        .with_connectors(true)
        .with_identity(true)
}

fn environment(flags: VariantFlags, runtime: &Arc<RecordingRuntime>) -> Environment {
    Environment::new(
        topology(flags),
        Arc::clone(runtime) as _,
        LifecycleSettings::default(),
    )
}

// ============================================================================
// Start
// ============================================================================

#[tokio::test]
async fn test_every_variant_publishes_addresses() {
    let variants = [
        VariantFlags::minimal(),
        VariantFlags::minimal().with_web_apps(true),
        VariantFlags::minimal().with_connectors(true),
        VariantFlags::minimal().with_identity(true),
        full_flags(),
    ];

    for flags in variants {
        let runtime = Arc::new(RecordingRuntime::new());
        let environment = environment(flags, &runtime);

        environment.start().await.unwrap();
        assert_eq!(environment.state().await, EnvironmentState::Running);

        for role in environment.roles() {
            let address = environment.address_of(role).await.unwrap();
            let primary = environment.topology().descriptor(role).unwrap().primary_port();
            assert_eq!(address.port(), primary, "{role} in {flags:?}");
        }

        environment.stop().await;
        assert!(runtime.running_roles().is_empty(), "{flags:?}");
        assert!(runtime.open_networks().is_empty(), "{flags:?}");
    }
}

#[tokio::test]
async fn test_tiers_start_in_dependency_order() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = environment(full_flags(), &runtime);

    environment.start().await.unwrap();

    let started = runtime.started_roles();
    let position = |role: Role| started.iter().position(|r| *r == role).unwrap();

    for role in environment.roles() {
        let descriptor = environment.topology().descriptor(role).unwrap();
        for dependency in descriptor.dependencies() {
            assert!(
                position(*dependency) < position(role),
                "{dependency} must start before {role}"
            );
        }
    }

    environment.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_tier_roles_start_concurrently() {
    let runtime = Arc::new(
        RecordingRuntime::builder()
            .start_delay(Duration::from_millis(100))
            .build(),
    );
    let environment = environment(VariantFlags::minimal(), &runtime);

    environment.start().await.unwrap();

    assert_eq!(runtime.max_concurrent_starts(), 2);
    environment.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_sequential_start_runs_one_role_at_a_time() {
    let runtime = Arc::new(
        RecordingRuntime::builder()
            .start_delay(Duration::from_millis(100))
            .build(),
    );
    let environment = Environment::new(
        topology(VariantFlags::minimal()),
        Arc::clone(&runtime) as _,
        LifecycleSettings {
            parallel_start: false,
            ..LifecycleSettings::default()
        },
    );

    environment.start().await.unwrap();

    assert_eq!(runtime.max_concurrent_starts(), 1);
    assert_eq!(runtime.started_roles(), vec![Role::IndexStore, Role::Engine]);
    environment.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_readiness_is_awaited() {
    let runtime = Arc::new(RecordingRuntime::builder().ready_after(3).build());
    let environment = environment(VariantFlags::minimal(), &runtime);

    environment.start().await.unwrap();

    assert_eq!(environment.state().await, EnvironmentState::Running);
    environment.stop().await;
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = environment(VariantFlags::minimal(), &runtime);

    environment.start().await.unwrap();
    let err = environment.start().await.unwrap_err();

    assert!(matches!(
        err,
        HarnessError::InvalidState {
            expected: EnvironmentState::NotStarted,
            actual: EnvironmentState::Running,
        }
    ));
    assert_eq!(runtime.started_roles().len(), 2);
    environment.stop().await;
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn test_readiness_failure_rolls_back_in_reverse_order() {
    let runtime = Arc::new(
        RecordingRuntime::builder()
            .fail_readiness(Role::Tasklist)
            .build(),
    );
    let environment = environment(
        VariantFlags::minimal()
            .with_web_apps(true)
            .with_connectors(true),
        &runtime,
    );

    let err = environment.start().await.unwrap_err();

    assert!(matches!(
        err,
        HarnessError::StartupFailed {
            role: Role::Tasklist,
            cause: RuntimeError::InstanceExited(_),
        }
    ));
    assert_eq!(environment.state().await, EnvironmentState::Closed);

    // Connectors sit in the tier after the web apps and never start.
    assert!(!runtime.started_roles().contains(&Role::Connectors));

    let stopped: Vec<Role> = runtime.stopped().into_iter().map(|(role, _)| role).collect();
    assert_eq!(
        stopped,
        vec![Role::Tasklist, Role::Operate, Role::Engine, Role::IndexStore]
    );
    assert!(runtime.running_roles().is_empty());
    assert!(runtime.open_networks().is_empty());
}

#[tokio::test]
async fn test_start_failure_stops_concurrent_siblings() {
    let runtime = Arc::new(RecordingRuntime::builder().fail_start(Role::Operate).build());
    let environment = environment(VariantFlags::minimal().with_web_apps(true), &runtime);

    let err = environment.start().await.unwrap_err();

    assert!(matches!(
        err,
        HarnessError::StartupFailed {
            role: Role::Operate,
            ..
        }
    ));
    let stopped: Vec<Role> = runtime.stopped().into_iter().map(|(role, _)| role).collect();
    assert_eq!(stopped, vec![Role::Tasklist, Role::Engine, Role::IndexStore]);
    assert!(runtime.running_roles().is_empty());
}

#[tokio::test]
async fn test_panicked_start_task_still_rolls_back_its_instance() {
    let runtime = Arc::new(
        RecordingRuntime::builder()
            .panic_readiness(Role::Engine)
            .build(),
    );
    let environment = environment(VariantFlags::minimal(), &runtime);

    let err = environment.start().await.unwrap_err();

    assert!(matches!(
        err,
        HarnessError::StartupFailed {
            role: Role::Engine,
            cause: RuntimeError::CommandFailed(_),
        }
    ));
    let stopped: Vec<Role> = runtime.stopped().into_iter().map(|(role, _)| role).collect();
    assert!(stopped.contains(&Role::Engine), "{stopped:?}");
    assert!(stopped.contains(&Role::IndexStore), "{stopped:?}");
    assert!(runtime.running_roles().is_empty());
    assert!(runtime.open_networks().is_empty());
}

#[tokio::test]
async fn test_sequential_start_stops_at_first_failure() {
    let runtime = Arc::new(RecordingRuntime::builder().fail_start(Role::Operate).build());
    let environment = Environment::new(
        topology(VariantFlags::minimal().with_web_apps(true)),
        Arc::clone(&runtime) as _,
        LifecycleSettings {
            parallel_start: false,
            ..LifecycleSettings::default()
        },
    );

    assert!(environment.start().await.is_err());

    assert!(!runtime.started_roles().contains(&Role::Tasklist));
    assert!(runtime.running_roles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_fails_startup() {
    let runtime = Arc::new(RecordingRuntime::builder().never_ready(Role::Engine).build());
    let environment = Environment::new(
        TopologyBuilder::new()
            .with_startup_timeout(Duration::from_secs(5))
            .build(VariantFlags::minimal())
            .unwrap(),
        Arc::clone(&runtime) as _,
        LifecycleSettings::default(),
    );

    let err = environment.start().await.unwrap_err();

    match err {
        HarnessError::StartupFailed { role, cause } => {
            assert_eq!(role, Role::Engine);
            assert!(matches!(
                cause,
                RuntimeError::ReadinessTimeout { timeout } if timeout == Duration::from_secs(5)
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(runtime.running_roles().is_empty());
}

#[tokio::test]
async fn test_network_failure_starts_nothing() {
    let runtime = Arc::new(RecordingRuntime::builder().fail_network().build());
    let environment = environment(VariantFlags::minimal(), &runtime);

    let err = environment.start().await.unwrap_err();

    assert!(matches!(err, HarnessError::Runtime(_)));
    assert!(runtime.started_roles().is_empty());
    assert_eq!(environment.state().await, EnvironmentState::Closed);
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test]
async fn test_only_engine_gets_graceful_stop() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = Environment::new(
        topology(VariantFlags::minimal().with_web_apps(true)),
        Arc::clone(&runtime) as _,
        LifecycleSettings {
            engine_shutdown_grace: Duration::from_secs(3),
            ..LifecycleSettings::default()
        },
    );

    environment.start().await.unwrap();
    environment.stop().await;

    for (role, grace) in runtime.stopped() {
        if role == Role::Engine {
            assert_eq!(grace, Some(Duration::from_secs(3)));
        } else {
            assert_eq!(grace, None, "{role}");
        }
    }
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = environment(VariantFlags::minimal(), &runtime);

    environment.start().await.unwrap();
    environment.stop().await;
    environment.stop().await;

    assert_eq!(runtime.stopped().len(), 2);
    let removals = runtime
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RuntimeCall::RemoveNetwork(_)))
        .count();
    assert_eq!(removals, 1);
    assert_eq!(environment.state().await, EnvironmentState::Closed);
}

#[tokio::test]
async fn test_stop_failure_does_not_abort_shutdown() {
    let runtime = Arc::new(RecordingRuntime::builder().fail_stop(Role::Operate).build());
    let environment = environment(VariantFlags::minimal().with_web_apps(true), &runtime);

    environment.start().await.unwrap();
    environment.stop().await;

    assert_eq!(runtime.stopped().len(), 4);
    assert_eq!(runtime.running_roles(), vec![Role::Operate]);
    assert!(runtime.open_networks().is_empty());
    assert_eq!(environment.state().await, EnvironmentState::Closed);
}

#[tokio::test]
async fn test_stop_before_start_closes_without_calls() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = environment(VariantFlags::minimal(), &runtime);

    environment.stop().await;

    assert!(runtime.calls().is_empty());
    assert_eq!(environment.state().await, EnvironmentState::Closed);
    assert!(environment.start().await.is_err());
}

// ============================================================================
// Addresses
// ============================================================================

#[tokio::test]
async fn test_addresses_only_while_running() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = environment(VariantFlags::minimal(), &runtime);

    assert!(matches!(
        environment.address_of(Role::Engine).await,
        Err(HarnessError::RoleNotStarted { role: Role::Engine })
    ));

    environment.start().await.unwrap();
    assert!(environment.address_of(Role::Engine).await.is_ok());

    environment.stop().await;
    assert!(matches!(
        environment.address_of(Role::Engine).await,
        Err(HarnessError::RoleNotStarted { role: Role::Engine })
    ));
}

#[tokio::test]
async fn test_address_of_absent_role() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = environment(VariantFlags::minimal(), &runtime);
    environment.start().await.unwrap();

    assert!(matches!(
        environment.address_of(Role::Operate).await,
        Err(HarnessError::RoleNotStarted { role: Role::Operate })
    ));
    environment.stop().await;
}

#[tokio::test]
async fn test_address_of_secondary_port() {
    let runtime = Arc::new(RecordingRuntime::new());
    let environment = environment(VariantFlags::minimal(), &runtime);
    environment.start().await.unwrap();

    let gateway = environment
        .address_of_port(Role::Engine, 26500)
        .await
        .unwrap();
    assert_eq!(gateway.port(), 26500);

    assert!(matches!(
        environment.address_of_port(Role::Engine, 1).await,
        Err(HarnessError::Runtime(RuntimeError::PortNotExposed { port: 1, .. }))
    ));
    environment.stop().await;
}
