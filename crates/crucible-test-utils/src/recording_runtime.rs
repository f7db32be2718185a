//! Recording service runtime.
//!
//! [`RecordingRuntime`] starts nothing. It hands out fake instances, records
//! every call in order and fails where a test scripted it to, which makes
//! start order, rollback and shutdown observable.
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = RecordingRuntime::builder()
//!     .fail_readiness(Role::Tasklist)
//!     .fail_stop(Role::Operate)
//!     .build();
//! ```

use async_trait::async_trait;
use crucible_harness::descriptor::{ReadinessProbe, ServiceDescriptor};
use crucible_harness::role::Role;
use crucible_harness::runtime::{
    InstanceRef, NetworkHandle, RuntimeError, ServiceAddress, ServiceRuntime,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One observed runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    CreateNetwork(String),
    RemoveNetwork(String),
    Start(Role),
    Stop { role: Role, grace: Option<Duration> },
}

#[derive(Debug, Default, Clone)]
struct Script {
    fail_start: HashSet<Role>,
    fail_readiness: HashSet<Role>,
    panic_readiness: HashSet<Role>,
    never_ready: HashSet<Role>,
    fail_stop: HashSet<Role>,
    fail_network: bool,
    probes_until_ready: u32,
    start_delay: Option<Duration>,
}

#[derive(Debug)]
struct FakeInstance {
    role: Role,
    exposed_ports: Vec<u16>,
    probes: u32,
}

/// Mock runtime with a call log and scripted failures.
#[derive(Debug)]
pub struct RecordingRuntime {
    script: Script,
    calls: Mutex<Vec<RuntimeCall>>,
    instances: Mutex<HashMap<String, FakeInstance>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for RecordingRuntime {
    fn default() -> Self {
        Self::from_script(Script::default())
    }
}

impl RecordingRuntime {
    /// Runtime where every call succeeds and instances are ready at once.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> RecordingRuntimeBuilder {
        RecordingRuntimeBuilder::default()
    }

    fn from_script(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
            instances: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Roles passed to `start`, in call order.
    pub fn started_roles(&self) -> Vec<Role> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Start(role) => Some(role),
                _ => None,
            })
            .collect()
    }

    /// Stopped roles with the grace they received, in call order.
    pub fn stopped(&self) -> Vec<(Role, Option<Duration>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::Stop { role, grace } => Some((role, grace)),
                _ => None,
            })
            .collect()
    }

    /// Roles whose instance exists and has not been stopped.
    pub fn running_roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .map(|instance| instance.role)
            .collect();
        roles.sort();
        roles
    }

    /// Networks created and not removed.
    pub fn open_networks(&self) -> Vec<String> {
        let mut open = Vec::new();
        for call in self.calls() {
            match call {
                RuntimeCall::CreateNetwork(name) => open.push(name),
                RuntimeCall::RemoveNetwork(name) => open.retain(|n| *n != name),
                _ => {}
            }
        }
        open
    }

    /// Highest number of `start` calls that were in progress at once.
    pub fn max_concurrent_starts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceRuntime for RecordingRuntime {
    async fn create_network(&self, name: &str) -> Result<NetworkHandle, RuntimeError> {
        self.record(RuntimeCall::CreateNetwork(name.to_string()));
        if self.script.fail_network {
            return Err(RuntimeError::CommandFailed(format!(
                "scripted network failure for {name}"
            )));
        }
        Ok(NetworkHandle::new(format!("net-{name}"), name))
    }

    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RemoveNetwork(network.name().to_string()));
        Ok(())
    }

    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        _network: &NetworkHandle,
    ) -> Result<InstanceRef, RuntimeError> {
        let role = descriptor.role();
        self.record(RuntimeCall::Start(role));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.script.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.script.fail_start.contains(&role) {
            return Err(RuntimeError::CommandFailed(format!(
                "scripted start failure for {role}"
            )));
        }

        let id = format!("{role}-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.instances.lock().unwrap().insert(
            id.clone(),
            FakeInstance {
                role,
                exposed_ports: descriptor.exposed_ports().to_vec(),
                probes: 0,
            },
        );
        Ok(InstanceRef::new(id, role))
    }

    async fn stop(
        &self,
        instance: &InstanceRef,
        grace: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        let role = instance.role();
        self.record(RuntimeCall::Stop { role, grace });

        if self.script.fail_stop.contains(&role) {
            return Err(RuntimeError::CommandFailed(format!(
                "scripted stop failure for {role}"
            )));
        }

        self.instances.lock().unwrap().remove(instance.id());
        Ok(())
    }

    async fn address(
        &self,
        instance: &InstanceRef,
        port: u16,
    ) -> Result<ServiceAddress, RuntimeError> {
        let instances = self.instances.lock().unwrap();
        let fake = instances
            .get(instance.id())
            .ok_or_else(|| RuntimeError::UnknownInstance(instance.id().to_string()))?;

        if !fake.exposed_ports.contains(&port) {
            return Err(RuntimeError::PortNotExposed {
                instance: instance.id().to_string(),
                port,
            });
        }
        Ok(ServiceAddress::new(
            format!("{}.recording.test", fake.role),
            port,
        ))
    }

    async fn is_ready(
        &self,
        instance: &InstanceRef,
        _probe: &ReadinessProbe,
    ) -> Result<bool, RuntimeError> {
        let role = instance.role();
        if self.script.panic_readiness.contains(&role) {
            panic!("scripted readiness panic for {role}");
        }
        if self.script.fail_readiness.contains(&role) {
            return Err(RuntimeError::InstanceExited(instance.id().to_string()));
        }
        if self.script.never_ready.contains(&role) {
            return Ok(false);
        }

        let mut instances = self.instances.lock().unwrap();
        let fake = instances
            .get_mut(instance.id())
            .ok_or_else(|| RuntimeError::UnknownInstance(instance.id().to_string()))?;
        fake.probes += 1;
        Ok(fake.probes > self.script.probes_until_ready)
    }
}

/// Builder for [`RecordingRuntime`] scripts.
#[derive(Debug, Default)]
pub struct RecordingRuntimeBuilder {
    script: Script,
}

impl RecordingRuntimeBuilder {
    /// `start` of `role` fails without creating an instance.
    #[must_use]
    pub fn fail_start(mut self, role: Role) -> Self {
        self.script.fail_start.insert(role);
        self
    }

    /// The instance of `role` exits during readiness polling.
    #[must_use]
    pub fn fail_readiness(mut self, role: Role) -> Self {
        self.script.fail_readiness.insert(role);
        self
    }

    /// Readiness polling of `role` panics after its instance was created.
    #[must_use]
    pub fn panic_readiness(mut self, role: Role) -> Self {
        self.script.panic_readiness.insert(role);
        self
    }

    /// The instance of `role` runs but never reports ready.
    #[must_use]
    pub fn never_ready(mut self, role: Role) -> Self {
        self.script.never_ready.insert(role);
        self
    }

    /// `stop` of `role` fails and leaves the instance behind.
    #[must_use]
    pub fn fail_stop(mut self, role: Role) -> Self {
        self.script.fail_stop.insert(role);
        self
    }

    /// `create_network` fails.
    #[must_use]
    pub fn fail_network(mut self) -> Self {
        self.script.fail_network = true;
        self
    }

    /// Every instance answers `n` probes with "not ready" first.
    #[must_use]
    pub fn ready_after(mut self, probes: u32) -> Self {
        self.script.probes_until_ready = probes;
        self
    }

    /// Every `start` call takes `delay`.
    #[must_use]
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.script.start_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn build(self) -> RecordingRuntime {
        RecordingRuntime::from_script(self.script)
    }
}
