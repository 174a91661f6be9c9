//! Container-runtime lookups: container → pod sandbox → netns path.

mod cri;
mod docker;

pub use cri::CriRuntime;
pub use docker::DockerRuntime;

use async_trait::async_trait;
use error_stack::Report;
use thiserror::Error;

/// Errors raised by runtime lookups.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to connect to container runtime: {message}")]
    ConnectionFailed { message: String },
    #[error("Container lookup failed: {message}")]
    Lookup { message: String },
}

/// Resolves pod-level identifiers against the node's container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the ID of the sandbox ("pause") container owning the given
    /// container.
    async fn get_sandbox_id(&self, container_id: &str) -> Result<String, Report<RuntimeError>>;

    /// Returns the network-namespace path of the given sandbox. The ID
    /// supplied is typically a pod sandbox ID; this getter does not try to
    /// map non-sandbox IDs to their sandboxes.
    async fn get_netns(&self, sandbox_id: &str) -> Result<String, Report<RuntimeError>>;
}
