//! Error types for the fedsync Kubernetes operator.

use fedsync_core::SyncError;
use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Sync engine error.
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubeconfig could not be loaded or turned into a client.
    #[error("Invalid kubeconfig for {source_name}: {reason}")]
    Kubeconfig {
        /// Where the kubeconfig came from (path or secret).
        source_name: String,
        /// What went wrong.
        reason: String,
    },

    /// Secret missing or lacking the expected key.
    #[error("Secret {namespace}/{name}: {reason}")]
    SecretError {
        /// Secret namespace.
        namespace: String,
        /// Secret name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}
