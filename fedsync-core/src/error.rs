//! Error types for the synchronization engine.
//!
//! Errors fall into four classes that decide how the engine reacts:
//!
//! - **Transient** (network, timeout, throttling): retried with backoff.
//! - **Conflict** (concurrent modification): re-fetch and retry immediately.
//! - **Permanent** (bad template, unknown cluster, adapter rejection): written
//!   to status, never retried until the federated object changes.
//! - **Not found**: usually an expected outcome (deletion), never retried.

use thiserror::Error;

/// Errors that can occur while synchronizing federated resources.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The requested object does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource namespace.
        namespace: String,
        /// Resource name.
        name: String,
    },

    /// Optimistic concurrency failure (stale resourceVersion).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Create of an object that already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: String,
        /// Resource namespace.
        namespace: String,
        /// Resource name.
        name: String,
    },

    /// Network, timeout or server-side transient failure.
    #[error("Transient API error: {0}")]
    Transient(String),

    /// The API server rejected the request for a non-retryable reason.
    #[error("API request rejected ({code}): {message}")]
    Rejected {
        /// HTTP status code.
        code: u16,
        /// Server-provided message.
        message: String,
    },

    /// The federated template is missing or malformed.
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// An override entry is malformed.
    #[error("Invalid override: {0}")]
    InvalidOverride(String),

    /// The placement is malformed.
    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),

    /// Placement references a cluster that is not registered.
    #[error("Placement references unknown cluster '{0}'")]
    UnknownCluster(String),

    /// The adapter refused the object.
    #[error("Adapter rejected object: {0}")]
    AdapterRejected(String),

    /// No adapter is registered for the kind.
    #[error("No adapter registered for kind '{0}'")]
    UnknownKind(String),

    /// A controller for this kind is already running.
    #[error("Controller for kind '{0}' is already running")]
    AlreadyRunning(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The component is shutting down.
    #[error("Shutting down")]
    ShuttingDown,
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Build a not-found error.
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build an already-exists error.
    pub fn already_exists(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True for concurrent-modification failures, which are retried
    /// immediately after re-reading the object.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::AlreadyExists { .. })
    }

    /// True when the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for configuration errors in the federated object itself. These are
    /// surfaced in status and not retried until the federated object changes.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidTemplate(_)
                | Self::InvalidOverride(_)
                | Self::InvalidPlacement(_)
                | Self::UnknownCluster(_)
                | Self::AdapterRejected(_)
        )
    }

    /// Short machine-readable reason used in status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Transient(_) => "TransientError",
            Self::Rejected { .. } => "Rejected",
            Self::InvalidTemplate(_) => "InvalidTemplate",
            Self::InvalidOverride(_) => "InvalidOverride",
            Self::InvalidPlacement(_) => "InvalidPlacement",
            Self::UnknownCluster(_) => "UnknownCluster",
            Self::AdapterRejected(_) => "AdapterRejected",
            Self::UnknownKind(_) => "UnknownKind",
            Self::AlreadyRunning(_) => "AlreadyRunning",
            Self::Serialization(_) => "SerializationError",
            Self::Config(_) => "ConfigError",
            Self::ShuttingDown => "ShuttingDown",
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn error_is_send_sync() {
        _assert_send_sync::<SyncError>();
    }

    #[test]
    fn classification() {
        assert!(SyncError::Transient("timeout".into()).is_transient());
        assert!(SyncError::Conflict("stale".into()).is_conflict());
        assert!(SyncError::already_exists("Job", "default", "x").is_conflict());
        assert!(SyncError::not_found("Job", "default", "x").is_not_found());
        assert!(SyncError::UnknownCluster("mars".into()).is_permanent());
        assert!(!SyncError::Transient("timeout".into()).is_permanent());
        assert!(!SyncError::Rejected {
            code: 422,
            message: "invalid".into()
        }
        .is_transient());
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(
            SyncError::InvalidTemplate("x".into()).reason(),
            "InvalidTemplate"
        );
        assert_eq!(SyncError::UnknownCluster("x".into()).reason(), "UnknownCluster");
    }
}
