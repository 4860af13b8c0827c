//! Error types for the Volume Orchestrator
//!
//! One error enum covers the persistent store, the transaction log, the
//! backend registry, the volume lifecycle and the self-healing loop. Each
//! variant knows whether a caller may retry it.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Persistent Store Errors
    // =========================================================================
    #[error("Persistent store unavailable during {operation} on '{key}': {reason}")]
    StoreUnavailable {
        operation: String,
        key: String,
        reason: String,
    },

    #[error("Corrupt record at '{key}': {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Store schema version {found} is not supported (supported: {supported}); downgrade not supported")]
    UnsupportedStoreVersion { found: u32, supported: u32 },

    #[error("Store schema version {found} is too old to migrate (oldest migratable: {oldest})")]
    StoreSchemaTooOld { found: u32, oldest: u32 },

    // =========================================================================
    // Bootstrap Errors
    // =========================================================================
    #[error("Bootstrap failed after {attempts} attempts: {reason}")]
    BootstrapFailed { attempts: u32, reason: String },

    #[error("Orchestrator is not ready: bootstrap has not completed")]
    NotReady,

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Unsupported platform version {version}: supported range is {min} to {max}")]
    UnsupportedVersion {
        version: String,
        min: String,
        max: String,
    },

    // =========================================================================
    // Entity Errors
    // =========================================================================
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Invalid {kind} state transition for {name}: {from} -> {to}")]
    InvalidStateTransition {
        kind: String,
        name: String,
        from: String,
        to: String,
    },

    // =========================================================================
    // Backend Registry Errors
    // =========================================================================
    #[error("Backend UUID already registered: {uuid}")]
    DuplicateUuid { uuid: String },

    #[error("Unknown backend: {uuid}")]
    UnknownBackend { uuid: String },

    #[error("Backend {uuid} is still referenced by {volumes} volume(s)")]
    BackendInUse { uuid: String, volumes: usize },

    #[error("Backend {uuid} is not online (state: {state})")]
    BackendNotOnline { uuid: String, state: String },

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    #[error("Conflicting transaction for {target}: {pending_op} is already pending")]
    ConflictingTransaction { target: String, pending_op: String },

    // =========================================================================
    // Volume Lifecycle Errors
    // =========================================================================
    #[error("No eligible backend for protocol {protocol} with access mode {access_mode}")]
    NoEligibleBackend {
        protocol: String,
        access_mode: String,
    },

    #[error("Volume {name} is not online (state: {state})")]
    VolumeNotOnline { name: String, state: String },

    #[error("Driver error on backend {backend_uuid} during {operation} of {target}: {reason}")]
    DriverError {
        backend_uuid: String,
        operation: String,
        target: String,
        reason: String,
    },

    #[error("Operation {operation} on {target} was cancelled: {reason}")]
    Cancelled {
        operation: String,
        target: String,
        reason: String,
    },

    // =========================================================================
    // Node Session Errors
    // =========================================================================
    #[error("iSCSI error for {target}: {reason}")]
    Iscsi { target: String, reason: String },

    #[error("LUKS error on device {device}: {reason}")]
    Luks { device: String, reason: String },

    #[error("Command {command} failed: {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error for a caller that drives retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, the request or the process state must change first
    NoRetry,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::StoreUnavailable { .. }
            | Error::Kube(_)
            | Error::Io(_)
            | Error::DriverError { .. }
            | Error::Iscsi { .. } => ErrorAction::RetryWithBackoff,

            // Bootstrap still running - wait
            Error::NotReady => ErrorAction::RetryAfter(Duration::from_secs(5)),

            // Backend may come back online
            Error::BackendNotOnline { .. } | Error::NoEligibleBackend { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(60))
            }

            // Invariant violations, version and validation errors are never
            // retried blindly
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::UnsupportedVersion { .. }
            | Error::UnsupportedStoreVersion { .. }
            | Error::StoreSchemaTooOld { .. }
            | Error::BootstrapFailed { .. }
            | Error::DuplicateUuid { .. }
            | Error::ConflictingTransaction { .. }
            | Error::AlreadyExists { .. }
            | Error::NotFound { .. }
            | Error::UnknownBackend { .. }
            | Error::BackendInUse { .. }
            | Error::InvalidStateTransition { .. }
            | Error::VolumeNotOnline { .. }
            | Error::CorruptRecord { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRetry,

            // All other errors - retry with backoff
            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable { .. }
                | Error::Kube(_)
                | Error::NotReady
                | Error::Iscsi { .. }
        )
    }

    /// Check if this error reports an absent entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Stable machine-readable name used by the REST layer
    pub fn code(&self) -> &'static str {
        match self {
            Error::Internal(_) => "Internal",
            Error::Configuration(_) => "Configuration",
            Error::Validation(_) => "Validation",
            Error::StoreUnavailable { .. } => "StoreUnavailable",
            Error::CorruptRecord { .. } => "CorruptRecord",
            Error::UnsupportedStoreVersion { .. } => "UnsupportedStoreVersion",
            Error::StoreSchemaTooOld { .. } => "StoreSchemaTooOld",
            Error::BootstrapFailed { .. } => "BootstrapFailed",
            Error::NotReady => "NotReady",
            Error::Kube(_) => "Kubernetes",
            Error::UnsupportedVersion { .. } => "UnsupportedVersion",
            Error::NotFound { .. } => "NotFound",
            Error::AlreadyExists { .. } => "AlreadyExists",
            Error::InvalidStateTransition { .. } => "InvalidStateTransition",
            Error::DuplicateUuid { .. } => "DuplicateUUID",
            Error::UnknownBackend { .. } => "UnknownBackend",
            Error::BackendInUse { .. } => "BackendInUse",
            Error::BackendNotOnline { .. } => "BackendNotOnline",
            Error::ConflictingTransaction { .. } => "ConflictingTransaction",
            Error::NoEligibleBackend { .. } => "NoEligibleBackend",
            Error::VolumeNotOnline { .. } => "VolumeNotOnline",
            Error::DriverError { .. } => "DriverError",
            Error::Cancelled { .. } => "Cancelled",
            Error::Iscsi { .. } => "Iscsi",
            Error::Luks { .. } => "Luks",
            Error::Command { .. } => "Command",
            Error::JsonParse(_) => "JsonParse",
            Error::YamlParse(_) => "YamlParse",
            Error::Io(_) => "Io",
        }
    }

    pub(crate) fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    pub(crate) fn store_unavailable(
        operation: &str,
        key: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::StoreUnavailable {
            operation: operation.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::NotReady;
        assert_eq!(err.action(), ErrorAction::RetryAfter(Duration::from_secs(5)));

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRetry);

        let err = Error::ConflictingTransaction {
            target: "volume/pvc-1".into(),
            pending_op: "AddVolume".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRetry);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::store_unavailable("get", "/vorch/version", "timed out");
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let version = Error::UnsupportedVersion {
            version: "1.20".into(),
            min: "1.26".into(),
            max: "1.34".into(),
        };
        assert!(!version.is_retryable());
        assert!(!version.is_transient());
    }

    #[test]
    fn test_unsupported_version_names_both_bounds() {
        let err = Error::UnsupportedVersion {
            version: "1.40".into(),
            min: "1.26".into(),
            max: "1.34".into(),
        };
        let message = err.to_string();
        assert!(message.contains("1.26"));
        assert!(message.contains("1.34"));
    }

    #[test]
    fn test_driver_error_is_retryable_but_not_transient() {
        let err = Error::DriverError {
            backend_uuid: "b1".into(),
            operation: "create".into(),
            target: "pvc-1".into(),
            reason: "array busy".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_transient());
        assert_eq!(err.code(), "DriverError");
    }
}
