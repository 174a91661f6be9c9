//! CRI-flavoured runtime lookups over the runtime's gRPC unix socket.

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;
use tracing::info;

use crate::runtime::ContainerRuntime;
use crate::runtime::RuntimeError;

pub(crate) mod pb {
    tonic::include_proto!("runtime.v1");
}

use pb::runtime_service_client::RuntimeServiceClient;

const CRI_NETNS_FMT: &str = "/var/run/netns/{name}";

/// The verbose `PodSandboxStatus` response carries the runtime spec as a
/// JSON document under the `info` key; only the namespace list matters here.
#[derive(Debug, Default, Deserialize)]
struct SandboxStatusInfo {
    #[serde(rename = "runtimeSpec", default)]
    runtime_spec: RuntimeSpecInfo,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeSpecInfo {
    #[serde(default)]
    linux: LinuxSpecInfo,
}

#[derive(Debug, Default, Deserialize)]
struct LinuxSpecInfo {
    #[serde(default)]
    namespaces: Vec<NamespaceInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct NamespaceInfo {
    #[serde(rename = "type")]
    ns_type: String,
    #[serde(default)]
    path: String,
}

pub struct CriRuntime {
    client: RuntimeServiceClient<Channel>,
}

impl CriRuntime {
    /// Dial the runtime socket and verify it answers a `Version` call.
    pub async fn connect(endpoint: &str) -> Result<Self, Report<RuntimeError>> {
        let socket = endpoint
            .strip_prefix("unix://")
            .unwrap_or(endpoint)
            .to_string();

        // The URI is required by the endpoint builder but never resolved;
        // the connector always dials the unix socket.
        let channel = Endpoint::try_from("http://localhost")
            .change_context(RuntimeError::ConnectionFailed {
                message: format!("invalid runtime endpoint {endpoint}"),
            })?
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move {
                    let stream = UnixStream::connect(socket).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .change_context(RuntimeError::ConnectionFailed {
                message: format!(
                    "failed to connect runtime endpoint {endpoint}, make sure you are running as root and the runtime has been started"
                ),
            })?;

        let mut client = RuntimeServiceClient::new(channel);
        let version = client
            .version(pb::VersionRequest::default())
            .await
            .change_context(RuntimeError::ConnectionFailed {
                message: format!("runtime at {endpoint} did not answer a Version call"),
            })?
            .into_inner();
        info!(
            runtime_name = %version.runtime_name,
            runtime_version = %version.runtime_version,
            "Connected to CRI runtime"
        );

        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for CriRuntime {
    async fn get_sandbox_id(&self, container_id: &str) -> Result<String, Report<RuntimeError>> {
        if container_id.is_empty() {
            return Err(Report::new(RuntimeError::Lookup {
                message: "container ID cannot be empty".to_string(),
            }));
        }

        let request = pb::ListContainersRequest {
            filter: Some(pb::ContainerFilter {
                id: container_id.to_string(),
                ..Default::default()
            }),
        };
        let containers = self
            .client
            .clone()
            .list_containers(request)
            .await
            .change_context(RuntimeError::Lookup {
                message: format!("ListContainers failed for container {container_id}"),
            })?
            .into_inner()
            .containers;

        match containers.as_slice() {
            [container] => {
                debug!(
                    container_id,
                    sandbox_id = %container.pod_sandbox_id,
                    "Resolved container to sandbox"
                );
                Ok(container.pod_sandbox_id.clone())
            }
            [] => Err(Report::new(RuntimeError::Lookup {
                message: format!("didn't find any container with ID {container_id}"),
            })),
            _ => Err(Report::new(RuntimeError::Lookup {
                message: format!("found more than one container with ID {container_id}"),
            })),
        }
    }

    async fn get_netns(&self, sandbox_id: &str) -> Result<String, Report<RuntimeError>> {
        if sandbox_id.is_empty() {
            return Err(Report::new(RuntimeError::Lookup {
                message: "sandbox ID cannot be empty".to_string(),
            }));
        }

        let request = pb::PodSandboxStatusRequest {
            pod_sandbox_id: sandbox_id.to_string(),
            verbose: true,
        };
        let response = self
            .client
            .clone()
            .pod_sandbox_status(request)
            .await
            .change_context(RuntimeError::Lookup {
                message: format!("PodSandboxStatus failed for sandbox {sandbox_id}"),
            })?
            .into_inner();

        let info = response.info.get("info").ok_or_else(|| {
            Report::new(RuntimeError::Lookup {
                message: format!("verbose status of sandbox {sandbox_id} carries no info"),
            })
        })?;
        let status_info: SandboxStatusInfo =
            serde_json::from_str(info).change_context(RuntimeError::Lookup {
                message: format!("failed to decode verbose status of sandbox {sandbox_id}"),
            })?;

        // An empty path is handled as a failure by the caller.
        let netns = status_info
            .runtime_spec
            .linux
            .namespaces
            .iter()
            .find(|namespace| namespace.ns_type == "network")
            .and_then(|namespace| namespace.path.rsplit('/').next())
            .map(|name| CRI_NETNS_FMT.replace("{name}", name))
            .unwrap_or_default();
        debug!(sandbox_id, netns, "Resolved sandbox network namespace");
        Ok(netns)
    }
}
