//! Environment lifecycle.
//!
//! An [`Environment`] owns one started topology: the isolated network, every
//! instance it created and the published address of each role. It moves
//! through `NotStarted -> Starting -> Running -> Closing -> Closed`.
//!
//! # Startup
//!
//! Roles start tier by tier. All roles of a tier start concurrently (unless
//! parallel start is disabled) and the next tier begins only once every role
//! of the current one is ready. If any role fails, every instance created so
//! far is stopped in reverse creation order, the network is removed and the
//! failure is reported as `StartupFailed`. Later tiers never start.
//!
//! # Shutdown
//!
//! Instances stop in reverse creation order. The engine receives a graceful
//! stop with a bounded wait; the other roles are stopped immediately. Stop
//! failures are logged and never abort the remaining stops.

use crate::descriptor::ServiceDescriptor;
use crate::error::HarnessError;
use crate::readiness::wait_until_ready;
use crate::role::Role;
use crate::runtime::{InstanceRef, NetworkHandle, RuntimeError, ServiceAddress, ServiceRuntime};
use crate::topology::Topology;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default graceful shutdown budget of the engine.
pub const DEFAULT_ENGINE_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    NotStarted,
    Starting,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not-started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Knobs of the start and stop sequences.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Graceful stop budget of the engine.
    pub engine_shutdown_grace: Duration,
    /// Start the roles of one tier concurrently.
    pub parallel_start: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            engine_shutdown_grace: DEFAULT_ENGINE_SHUTDOWN_GRACE,
            parallel_start: true,
        }
    }
}

/// A role that passed readiness.
#[derive(Debug, Clone)]
struct StartedService {
    primary_port: u16,
    addresses: BTreeMap<u16, ServiceAddress>,
}

/// What readers may observe: the state and, while running, the addresses.
struct Published {
    state: EnvironmentState,
    services: BTreeMap<Role, StartedService>,
}

/// Resources held by the environment, released exactly once.
#[derive(Default)]
struct Resources {
    network: Option<NetworkHandle>,
    /// Instances in creation order.
    instances: Vec<InstanceRef>,
}

/// Result of starting one role.
struct RoleOutcome {
    role: Role,
    result: Result<StartedService, RuntimeError>,
}

/// Instances reported by start tasks as soon as the runtime created them.
type CreatedTx = mpsc::UnboundedSender<InstanceRef>;

/// One isolated, running set of services.
///
/// `start` and `stop` are serialized; `address_of` only reads the published
/// state and never waits for a start in progress.
pub struct Environment {
    id: String,
    topology: Topology,
    runtime: Arc<dyn ServiceRuntime>,
    settings: LifecycleSettings,
    resources: Mutex<Resources>,
    published: RwLock<Published>,
}

impl Environment {
    pub fn new(
        topology: Topology,
        runtime: Arc<dyn ServiceRuntime>,
        settings: LifecycleSettings,
    ) -> Self {
        let id = format!("crucible-{}", Uuid::new_v4().simple());
        Self {
            id,
            topology,
            runtime,
            settings,
            resources: Mutex::new(Resources::default()),
            published: RwLock::new(Published {
                state: EnvironmentState::NotStarted,
                services: BTreeMap::new(),
            }),
        }
    }

    /// Create and start an environment.
    ///
    /// # Errors
    ///
    /// Same as [`Environment::start`]. Nothing is left running on error.
    pub async fn launch(
        topology: Topology,
        runtime: Arc<dyn ServiceRuntime>,
        settings: LifecycleSettings,
    ) -> Result<Arc<Self>, HarnessError> {
        let environment = Arc::new(Self::new(topology, runtime, settings));
        environment.start().await?;
        Ok(environment)
    }

    /// Unique identifier; also the name of the environment network.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Roles of this environment in start order.
    pub fn roles(&self) -> Vec<Role> {
        self.topology.tiers().iter().flatten().copied().collect()
    }

    pub async fn state(&self) -> EnvironmentState {
        self.published.read().await.state
    }

    /// Start every role of the topology.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the environment was already started
    /// - `StartupFailed` naming the first failing role; everything created
    ///   before the failure has been stopped and the environment is closed
    #[instrument(skip_all, name = "crucible.lifecycle.start", fields(environment = %self.id))]
    pub async fn start(&self) -> Result<(), HarnessError> {
        let mut resources = self.resources.lock().await;

        {
            let mut published = self.published.write().await;
            if published.state != EnvironmentState::NotStarted {
                return Err(HarnessError::InvalidState {
                    expected: EnvironmentState::NotStarted,
                    actual: published.state,
                });
            }
            published.state = EnvironmentState::Starting;
        }

        info!(
            target: "crucible.lifecycle",
            environment = %self.id,
            roles = self.topology.len(),
            tiers = self.topology.tiers().len(),
            "Starting environment"
        );
        let started_at = Instant::now();

        match self.start_tiers(&mut resources).await {
            Ok(services) => {
                let mut published = self.published.write().await;
                published.services = services;
                published.state = EnvironmentState::Running;

                info!(
                    target: "crucible.lifecycle",
                    environment = %self.id,
                    elapsed_ms = started_at.elapsed().as_millis(),
                    "Environment running"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    target: "crucible.lifecycle",
                    environment = %self.id,
                    error = %err,
                    created = resources.instances.len(),
                    "Startup failed, rolling back"
                );

                self.published.write().await.state = EnvironmentState::Closing;
                self.release(&mut resources).await;
                self.published.write().await.state = EnvironmentState::Closed;
                Err(err)
            }
        }
    }

    async fn start_tiers(
        &self,
        resources: &mut Resources,
    ) -> Result<BTreeMap<Role, StartedService>, HarnessError> {
        let network = self.runtime.create_network(&self.id).await?;
        resources.network = Some(network.clone());

        let mut services = BTreeMap::new();
        let (created_tx, mut created_rx) = mpsc::unbounded_channel();

        for (index, tier) in self.topology.tiers().iter().enumerate() {
            debug!(target: "crucible.lifecycle", tier = index, roles = ?tier, "Starting tier");

            let outcomes = if self.settings.parallel_start {
                self.start_tier_concurrently(tier, &network, &created_tx).await
            } else {
                self.start_tier_sequentially(tier, &network, &created_tx).await
            };

            // Includes instances of tasks that did not report an outcome.
            while let Ok(instance) = created_rx.try_recv() {
                resources.instances.push(instance);
            }

            let mut failure = None;
            for outcome in outcomes {
                match outcome.result {
                    Ok(service) => {
                        services.insert(outcome.role, service);
                    }
                    Err(cause) => {
                        warn!(
                            target: "crucible.lifecycle",
                            role = %outcome.role,
                            error = %cause,
                            "Role failed to start"
                        );
                        if failure.is_none() {
                            failure = Some(HarnessError::StartupFailed {
                                role: outcome.role,
                                cause,
                            });
                        }
                    }
                }
            }

            if let Some(err) = failure {
                return Err(err);
            }
        }

        Ok(services)
    }

    /// Start all roles of a tier at once. Outcomes come back in tier order.
    async fn start_tier_concurrently(
        &self,
        tier: &[Role],
        network: &NetworkHandle,
        created: &CreatedTx,
    ) -> Vec<RoleOutcome> {
        let mut tasks = JoinSet::new();

        for role in tier {
            let Some(descriptor) = self.topology.descriptor(*role).cloned() else {
                continue;
            };
            let runtime = Arc::clone(&self.runtime);
            let network = network.clone();
            let created = created.clone();
            tasks.spawn(async move {
                start_role(runtime.as_ref(), &descriptor, &network, &created).await
            });
        }

        let mut outcomes = Vec::with_capacity(tier.len());
        let mut aborted = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => aborted = Some(join_error.to_string()),
            }
        }

        // A panicked task leaves its role without an outcome.
        if let Some(reason) = aborted {
            for role in tier {
                if !outcomes.iter().any(|outcome| outcome.role == *role) {
                    outcomes.push(RoleOutcome {
                        role: *role,
                        result: Err(RuntimeError::CommandFailed(format!(
                            "Start task aborted: {reason}"
                        ))),
                    });
                }
            }
        }

        outcomes.sort_by_key(|outcome| outcome.role);
        outcomes
    }

    /// Start the roles of a tier one after another, stopping at the first failure.
    async fn start_tier_sequentially(
        &self,
        tier: &[Role],
        network: &NetworkHandle,
        created: &CreatedTx,
    ) -> Vec<RoleOutcome> {
        let mut outcomes = Vec::with_capacity(tier.len());

        for role in tier {
            let Some(descriptor) = self.topology.descriptor(*role) else {
                continue;
            };
            let outcome = start_role(self.runtime.as_ref(), descriptor, network, created).await;
            let failed = outcome.result.is_err();
            outcomes.push(outcome);
            if failed {
                break;
            }
        }

        outcomes
    }

    /// Stop every instance and remove the network. Idempotent.
    ///
    /// Failures of individual stops are logged; the remaining instances are
    /// still stopped.
    #[instrument(skip_all, name = "crucible.lifecycle.stop", fields(environment = %self.id))]
    pub async fn stop(&self) {
        let mut resources = self.resources.lock().await;

        {
            let mut published = self.published.write().await;
            match published.state {
                EnvironmentState::Closed => {
                    debug!(target: "crucible.lifecycle", environment = %self.id, "Already closed");
                    return;
                }
                EnvironmentState::NotStarted => {
                    published.state = EnvironmentState::Closed;
                    return;
                }
                _ => {
                    published.state = EnvironmentState::Closing;
                    published.services.clear();
                }
            }
        }

        info!(
            target: "crucible.lifecycle",
            environment = %self.id,
            instances = resources.instances.len(),
            "Stopping environment"
        );

        self.release(&mut resources).await;
        self.published.write().await.state = EnvironmentState::Closed;

        info!(target: "crucible.lifecycle", environment = %self.id, "Environment closed");
    }

    /// Stop instances in reverse creation order, then remove the network.
    async fn release(&self, resources: &mut Resources) {
        while let Some(instance) = resources.instances.pop() {
            let grace = (instance.role() == Role::Engine)
                .then_some(self.settings.engine_shutdown_grace);

            match self.runtime.stop(&instance, grace).await {
                Ok(()) => {
                    debug!(target: "crucible.lifecycle", instance = %instance, "Instance stopped");
                }
                Err(e) => {
                    warn!(
                        target: "crucible.lifecycle",
                        instance = %instance,
                        error = %e,
                        "Failed to stop instance"
                    );
                }
            }
        }

        if let Some(network) = resources.network.take() {
            if let Err(e) = self.runtime.remove_network(&network).await {
                warn!(
                    target: "crucible.lifecycle",
                    network = %network.name(),
                    error = %e,
                    "Failed to remove network"
                );
            }
        }
    }

    /// Externally reachable address of the primary port of `role`.
    ///
    /// # Errors
    ///
    /// `RoleNotStarted` unless the environment is running and contains `role`.
    pub async fn address_of(&self, role: Role) -> Result<ServiceAddress, HarnessError> {
        let published = self.published.read().await;
        let service = Self::running_service(&published, role)?;

        service
            .addresses
            .get(&service.primary_port)
            .cloned()
            .ok_or(HarnessError::RoleNotStarted { role })
    }

    /// Externally reachable address of another exposed port of `role`.
    ///
    /// # Errors
    ///
    /// `RoleNotStarted` as for [`Environment::address_of`], or
    /// `PortNotExposed` if the role does not expose `port`.
    pub async fn address_of_port(
        &self,
        role: Role,
        port: u16,
    ) -> Result<ServiceAddress, HarnessError> {
        let published = self.published.read().await;
        let service = Self::running_service(&published, role)?;

        service.addresses.get(&port).cloned().ok_or_else(|| {
            HarnessError::Runtime(RuntimeError::PortNotExposed {
                instance: role.to_string(),
                port,
            })
        })
    }

    fn running_service(
        published: &Published,
        role: Role,
    ) -> Result<&StartedService, HarnessError> {
        if published.state != EnvironmentState::Running {
            return Err(HarnessError::RoleNotStarted { role });
        }
        published
            .services
            .get(&role)
            .ok_or(HarnessError::RoleNotStarted { role })
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("roles", &self.topology.roles())
            .finish_non_exhaustive()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let state = self.published.get_mut().state;
        let leaked = self.resources.get_mut().instances.len();

        if leaked > 0 {
            warn!(
                target: "crucible.lifecycle",
                environment = %self.id,
                state = %state,
                leaked,
                "Environment dropped without stop; instances left to the runtime"
            );
        }
    }
}

/// Start one role and wait for it: instance, readiness, then addresses.
///
/// The instance is reported on `created` before readiness polling so
/// rollback stops it even if this task dies.
async fn start_role(
    runtime: &dyn ServiceRuntime,
    descriptor: &ServiceDescriptor,
    network: &NetworkHandle,
    created: &CreatedTx,
) -> RoleOutcome {
    let role = descriptor.role();

    let instance = match runtime.start(descriptor, network).await {
        Ok(instance) => instance,
        Err(cause) => {
            return RoleOutcome {
                role,
                result: Err(cause),
            };
        }
    };
    if created.send(instance.clone()).is_err() {
        warn!(target: "crucible.lifecycle", instance = %instance, "Start sequence gone");
    }

    let result = async {
        wait_until_ready(
            runtime,
            &instance,
            descriptor.readiness(),
            descriptor.startup_timeout(),
        )
        .await?;

        let mut addresses = BTreeMap::new();
        for port in descriptor.exposed_ports() {
            addresses.insert(*port, runtime.address(&instance, *port).await?);
        }

        debug!(target: "crucible.lifecycle", instance = %instance, "Role ready");
        Ok(StartedService {
            primary_port: descriptor.primary_port(),
            addresses,
        })
    }
    .await;

    RoleOutcome { role, result }
}
