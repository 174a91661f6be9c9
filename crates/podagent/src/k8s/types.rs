use thiserror::Error;

/// Errors that can occur in the pod-observer layer.
///
/// Observer-layer failures are logged and the offending pod event is
/// dropped; the next informer update re-evaluates the pod.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to watch pods: {message}")]
    WatchFailed { message: String },
    #[error("Failed to parse networks annotation: {message}")]
    AnnotationParse { message: String },
    #[error("Failed to resolve pod container: {message}")]
    ContainerLookup { message: String },
    #[error("Failed to update config store: {message}")]
    StoreWrite { message: String },
}
