//! Error taxonomy for container orchestration.

use bt_core::BtError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    /// Container failed to start (daemon unreachable, image pull failed,
    /// create/start call rejected). Retryable under the worker's policy.
    #[error("container start failed: {0}")]
    StartFailed(String),

    /// The Docker daemon itself is unreachable or returned a transport-level
    /// error, as opposed to a well-formed rejection of the request.
    #[error("docker daemon error: {0}")]
    DaemonError(String),

    #[error("container not found: {0}")]
    NotFound(String),

    /// Any on-disk artifact (strategy file, merged config file) failed to
    /// materialize. Never retryable at this layer — a caller-level retry
    /// starts a fresh attempt with a fresh temp dir.
    #[error("failed to materialize container inputs: {0}")]
    Io(String),

    #[error("invalid container configuration: {0}")]
    InvalidConfig(String),
}

impl From<ContainerError> for BtError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::StartFailed(msg) => BtError::Infrastructure(format!("container start failed: {msg}")),
            ContainerError::DaemonError(msg) => BtError::Infrastructure(format!("docker daemon error: {msg}")),
            ContainerError::NotFound(msg) => BtError::NotFound(msg),
            ContainerError::Io(msg) => BtError::Infrastructure(msg),
            ContainerError::InvalidConfig(msg) => BtError::Validation(msg),
        }
    }
}

impl From<bollard::errors::Error> for ContainerError {
    fn from(err: bollard::errors::Error) -> Self {
        ContainerError::DaemonError(err.to_string())
    }
}

impl From<std::io::Error> for ContainerError {
    fn from(err: std::io::Error) -> Self {
        ContainerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ContainerError {
    fn from(err: serde_json::Error) -> Self {
        ContainerError::Io(err.to_string())
    }
}
