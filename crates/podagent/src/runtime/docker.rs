//! Docker-flavoured runtime lookups over the daemon's unix socket.

use async_trait::async_trait;
use bollard::Docker;
use bollard::API_DEFAULT_VERSION;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

use crate::runtime::ContainerRuntime;
use crate::runtime::RuntimeError;

const DOCKER_NETNS_FMT: &str = "/proc/{pid}/ns/net";

/// Label the kubelet puts on every workload container, pointing at the pod
/// sandbox that owns it.
const KUBERNETES_SANDBOX_ID_LABEL: &str = "io.kubernetes.sandbox.id";

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the docker daemon and verify it answers.
    pub async fn connect(endpoint: &str) -> Result<Self, Report<RuntimeError>> {
        let socket = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
        let client = Docker::connect_with_unix(socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .change_context(RuntimeError::ConnectionFailed {
                message: format!("failed to open docker endpoint {endpoint}"),
            })?;

        let version = client
            .version()
            .await
            .change_context(RuntimeError::ConnectionFailed {
                message: format!("docker daemon at {endpoint} did not answer"),
            })?;
        info!(
            server_version = version.version.as_deref().unwrap_or("unknown"),
            "Connected to docker daemon"
        );

        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn get_sandbox_id(&self, container_id: &str) -> Result<String, Report<RuntimeError>> {
        let container = self
            .client
            .inspect_container(container_id, None)
            .await
            .change_context(RuntimeError::Lookup {
                message: format!("failed to inspect container {container_id}"),
            })?;

        container
            .config
            .and_then(|config| config.labels)
            .and_then(|labels| labels.get(KUBERNETES_SANDBOX_ID_LABEL).cloned())
            .ok_or_else(|| {
                Report::new(RuntimeError::Lookup {
                    message: format!(
                        "cannot find label {KUBERNETES_SANDBOX_ID_LABEL} in container {container_id}"
                    ),
                })
            })
    }

    async fn get_netns(&self, sandbox_id: &str) -> Result<String, Report<RuntimeError>> {
        let container = self
            .client
            .inspect_container(sandbox_id, None)
            .await
            .change_context(RuntimeError::Lookup {
                message: format!("failed to inspect sandbox {sandbox_id}"),
            })?;

        // Docker reports pid 0 for an exited container.
        let pid = container.state.and_then(|state| state.pid).unwrap_or(0);
        if pid == 0 {
            return Err(Report::new(RuntimeError::Lookup {
                message: format!(
                    "cannot find network namespace for the terminated container {sandbox_id}"
                ),
            }));
        }

        let netns = DOCKER_NETNS_FMT.replace("{pid}", &pid.to_string());
        debug!(sandbox_id, netns, "Resolved sandbox network namespace");
        Ok(netns)
    }
}
