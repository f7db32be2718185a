//! Docker CLI runtime.
//!
//! Drives the `docker` binary with `tokio::process`. Every instance is a
//! detached container attached to the environment network under its role
//! aliases, with its exposed ports published on ephemeral host ports.
//!
//! Secret configuration entries are handed to `docker run` through the
//! child process environment (`-e KEY` without a value), so they never show
//! up on the command line.

use super::{InstanceRef, NetworkHandle, RuntimeError, ServiceAddress, ServiceRuntime};
use crate::descriptor::{ReadinessProbe, ServiceDescriptor};
use async_trait::async_trait;
use common::secret::ExposeSecret;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Label carrying the role of a container.
pub const ROLE_LABEL: &str = "crucible.role";

/// Label carrying the environment network of a container.
pub const NETWORK_LABEL: &str = "crucible.network";

/// CLI driven by the runtime.
const DOCKER_BINARY: &str = "docker";

/// Host under which published ports are reachable.
const PUBLISHED_HOST: &str = "127.0.0.1";

/// Timeout of a single readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime backed by the Docker CLI.
pub struct DockerRuntime {
    http: reqwest::Client,
    log_followers: Mutex<HashMap<String, CancellationToken>>,
}

impl DockerRuntime {
    /// Runtime using `docker` from `PATH`, publishing ports on `127.0.0.1`.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::CommandFailed` if the probe HTTP client cannot be built.
    pub fn new() -> Result<Self, RuntimeError> {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| {
                RuntimeError::CommandFailed(format!("Failed to build probe client: {e}"))
            })?;

        Ok(Self {
            http,
            log_followers: Mutex::new(HashMap::new()),
        })
    }

    /// Run a docker command and return its trimmed stdout.
    async fn run(&self, command: &mut Command) -> Result<String, RuntimeError> {
        let output = command
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn docker(&self) -> Command {
        Command::new(DOCKER_BINARY)
    }

    /// Server version of the daemon; fails if the daemon is unreachable.
    ///
    /// # Errors
    ///
    /// `CommandFailed` or `Io` if the CLI cannot reach a daemon.
    pub async fn server_version(&self) -> Result<String, RuntimeError> {
        let mut command = self.docker();
        command.args(["version", "--format", "{{.Server.Version}}"]);
        self.run(&mut command).await
    }

    /// Build the `docker run` command for a descriptor.
    fn run_command(&self, descriptor: &ServiceDescriptor, network: &NetworkHandle) -> Command {
        let mut command = self.docker();
        command.args(["run", "--detach", "--network", network.name()]);

        for alias in descriptor.network_aliases() {
            command.arg("--network-alias").arg(alias);
        }
        for port in descriptor.exposed_ports() {
            command
                .arg("--publish")
                .arg(format!("{PUBLISHED_HOST}::{port}"));
        }
        command
            .arg("--label")
            .arg(format!("{ROLE_LABEL}={}", descriptor.role()));
        command
            .arg("--label")
            .arg(format!("{NETWORK_LABEL}={}", network.name()));

        for (key, value) in descriptor.env() {
            command.arg("--env").arg(format!("{key}={value}"));
        }
        for (key, value) in descriptor.secrets() {
            command.arg("--env").arg(key);
            command.env(key, value.expose_secret());
        }

        command.arg(descriptor.image());
        command
    }

    /// Forward the container output as tracing events until cancelled.
    async fn follow_logs(&self, instance: &InstanceRef) -> Result<(), RuntimeError> {
        let mut child = self
            .docker()
            .args(["logs", "--follow", instance.id()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let token = CancellationToken::new();
        self.log_followers
            .lock()
            .await
            .insert(instance.id().to_string(), token.clone());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let role = instance.role();

        tokio::spawn(async move {
            let mut stdout = stdout.map(|s| BufReader::new(s).lines());
            let mut stderr = stderr.map(|s| BufReader::new(s).lines());

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    line = next_line(&mut stdout) => match line {
                        Some(line) => info!(target: "crucible.container", role = %role, "{line}"),
                        None => stdout = None,
                    },
                    line = next_line(&mut stderr) => match line {
                        Some(line) => info!(
                            target: "crucible.container",
                            role = %role,
                            stream = "stderr",
                            "{line}"
                        ),
                        None => stderr = None,
                    },
                }
                if stdout.is_none() && stderr.is_none() {
                    break;
                }
            }

            let _ = child.kill().await;
        });

        Ok(())
    }

    async fn stop_log_follower(&self, instance: &InstanceRef) {
        if let Some(token) = self.log_followers.lock().await.remove(instance.id()) {
            token.cancel();
        }
    }

    async fn probe(&self, address: &ServiceAddress, probe: &ReadinessProbe) -> bool {
        match probe {
            ReadinessProbe::Tcp { .. } => matches!(
                tokio::time::timeout(
                    PROBE_TIMEOUT,
                    TcpStream::connect((address.host(), address.port()))
                )
                .await,
                Ok(Ok(_))
            ),
            ReadinessProbe::Http { path, .. } => {
                let url = format!("{}{path}", address.http_url());
                match self.http.get(&url).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(_) => false,
                }
            }
        }
    }
}

type Lines<R> = Option<tokio::io::Lines<BufReader<R>>>;

/// Next line of an optional stream; pending forever once the stream is gone.
async fn next_line<R>(lines: &mut Lines<R>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Parse the first mapping printed by `docker port`, e.g. `0.0.0.0:49153`.
fn parse_port_mapping(output: &str) -> Option<u16> {
    output
        .lines()
        .next()
        .and_then(|line| line.trim().rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
}

fn is_missing(err: &RuntimeError) -> bool {
    matches!(err, RuntimeError::CommandFailed(message) if message.contains("No such"))
}

#[async_trait]
impl ServiceRuntime for DockerRuntime {
    #[instrument(skip_all, name = "crucible.docker.create_network", fields(network = %name))]
    async fn create_network(&self, name: &str) -> Result<NetworkHandle, RuntimeError> {
        let id = self
            .run(
                self.docker()
                    .args(["network", "create", "--label"])
                    .arg(format!("{NETWORK_LABEL}={name}"))
                    .arg(name),
            )
            .await?;

        debug!(target: "crucible.docker", network = %name, id = %id, "Network created");
        Ok(NetworkHandle::new(id, name))
    }

    #[instrument(
        skip_all,
        name = "crucible.docker.remove_network",
        fields(network = %network.name())
    )]
    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), RuntimeError> {
        match self.run(self.docker().args(["network", "rm", network.id()])).await {
            Err(err) if is_missing(&err) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    #[instrument(skip_all, name = "crucible.docker.start", fields(role = %descriptor.role()))]
    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        network: &NetworkHandle,
    ) -> Result<InstanceRef, RuntimeError> {
        let id = self.run(&mut self.run_command(descriptor, network)).await?;
        let instance = InstanceRef::new(id, descriptor.role());

        info!(
            target: "crucible.docker",
            instance = %instance,
            image = %descriptor.image(),
            "Container started"
        );

        if descriptor.forwards_logs() {
            if let Err(e) = self.follow_logs(&instance).await {
                warn!(
                    target: "crucible.docker",
                    instance = %instance,
                    error = %e,
                    "Failed to follow container logs"
                );
            }
        }

        Ok(instance)
    }

    #[instrument(skip_all, name = "crucible.docker.stop", fields(instance = %instance))]
    async fn stop(
        &self,
        instance: &InstanceRef,
        grace: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        self.stop_log_follower(instance).await;

        if let Some(grace) = grace {
            let seconds = grace.as_secs().to_string();
            match self
                .run(self.docker().args(["stop", "--time", seconds.as_str(), instance.id()]))
                .await
            {
                Err(err) if is_missing(&err) => return Ok(()),
                other => {
                    other?;
                }
            }
        }

        match self
            .run(self.docker().args(["rm", "--force", "--volumes", instance.id()]))
            .await
        {
            Err(err) if is_missing(&err) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn address(
        &self,
        instance: &InstanceRef,
        port: u16,
    ) -> Result<ServiceAddress, RuntimeError> {
        let output = self
            .run(
                self.docker()
                    .args(["port", instance.id()])
                    .arg(format!("{port}/tcp")),
            )
            .await
            .map_err(|err| {
                if is_missing(&err) {
                    RuntimeError::UnknownInstance(instance.to_string())
                } else {
                    RuntimeError::PortNotExposed {
                        instance: instance.to_string(),
                        port,
                    }
                }
            })?;

        let host_port = parse_port_mapping(&output).ok_or_else(|| RuntimeError::PortNotExposed {
            instance: instance.to_string(),
            port,
        })?;

        Ok(ServiceAddress::new(PUBLISHED_HOST, host_port))
    }

    async fn is_ready(
        &self,
        instance: &InstanceRef,
        probe: &ReadinessProbe,
    ) -> Result<bool, RuntimeError> {
        let running = self
            .run(self.docker().args([
                "inspect",
                "--format",
                "{{.State.Running}}",
                instance.id(),
            ]))
            .await
            .map_err(|err| {
                if is_missing(&err) {
                    RuntimeError::UnknownInstance(instance.to_string())
                } else {
                    err
                }
            })?;

        if running != "true" {
            return Err(RuntimeError::InstanceExited(instance.to_string()));
        }

        let address = self.address(instance, probe.port()).await?;
        Ok(self.probe(&address, probe).await)
    }
}
