//! Container runtime operations for sandbox lifecycle management.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{Config, StartContainerOptions, StopContainerOptions};
use bollard::models::{HealthStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use log::{debug, info, warn};

use crate::error_handling::types::ContainerError;

/// Image every sandbox is created from. The image carries its own
/// `HEALTHCHECK` probing sshd, which is what readiness is derived from.
const SANDBOX_IMAGE: &str = "sshh";

/// Hostname the sandbox presents to whoever lands a shell in it.
const SANDBOX_HOSTNAME: &str = "ecorp-finances";

const SSH_PORT_KEY: &str = "22/tcp";

/// Grace period given to a sandbox before the runtime kills it.
const STOP_GRACE_SECS: i64 = 5;

/// Lifecycle operations against the container runtime.
///
/// The contract for [`reachable_address`](SandboxRuntime::reachable_address)
/// is only that dialing the returned `host:port` reaches the container's
/// SSH daemon.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Creates a sandbox from the fixed image with SSH exposed on a
    /// runtime-chosen host port, starts it, and returns its handle.
    async fn create_and_start(&self) -> Result<String, ContainerError>;

    /// Starts a previously created sandbox; no-op if it is already running.
    async fn start_existing(&self, id: &str) -> Result<(), ContainerError>;

    /// Requests a stop with a short grace period. Errors are logged, not
    /// propagated; stopping an already-stopped or removed sandbox is fine.
    async fn stop(&self, id: &str);

    /// True once the image's SSH health probe reports healthy.
    async fn is_ssh_ready(&self, id: &str) -> Result<bool, ContainerError>;

    /// The `host:port` on which the proxy can dial the sandbox's sshd.
    async fn reachable_address(&self, id: &str) -> Result<String, ContainerError>;
}

/// Polls readiness every 500 ms until `timeout` elapses.
pub async fn wait_until_ready(
    runtime: &dyn SandboxRuntime,
    id: &str,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match runtime.is_ssh_ready(id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => debug!("readiness probe for {} failed: {}", id, e),
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// [`SandboxRuntime`] implementation against a local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the daemon and verifies it answers.
    pub async fn connect() -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::RuntimeUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| ContainerError::RuntimeUnavailable(e.to_string()))?;
        info!("connected to container runtime");
        Ok(Self { docker })
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create_and_start(&self) -> Result<String, ContainerError> {
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(SSH_PORT_KEY.to_string(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            SSH_PORT_KEY.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                // Empty port: the runtime picks an ephemeral one
                host_port: Some(String::new()),
            }]),
        );

        let config = Config {
            image: Some(SANDBOX_IMAGE.to_string()),
            hostname: Some(SANDBOX_HOSTNAME.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| ContainerError::CreationFailed(e.to_string()))?;
        let id = response.id;

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        debug!("created sandbox {}", id);
        Ok(id)
    }

    async fn start_existing(&self, id: &str) -> Result<(), ContainerError> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| ContainerError::InspectFailed(e.to_string()))?;

        if inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false)
        {
            return Ok(());
        }

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))
    }

    async fn stop(&self, id: &str) {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => debug!("stopped sandbox {}", id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("sandbox {} already stopped", id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!("sandbox {} is gone", id),
            Err(e) => warn!("failed to stop sandbox {}: {}", id, e),
        }
    }

    async fn is_ssh_ready(&self, id: &str) -> Result<bool, ContainerError> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| ContainerError::InspectFailed(e.to_string()))?;

        let status = inspect
            .state
            .and_then(|s| s.health)
            .and_then(|h| h.status);
        Ok(status == Some(HealthStatusEnum::HEALTHY))
    }

    async fn reachable_address(&self, id: &str) -> Result<String, ContainerError> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| ContainerError::InspectFailed(e.to_string()))?;

        let host_port = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(SSH_PORT_KEY).cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ContainerError::AddressUnavailable(id.to_string()))?;

        Ok(format!("127.0.0.1:{}", host_port))
    }
}
