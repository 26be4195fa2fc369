//! Error taxonomy for the scheduling core.

use thiserror::Error;

/// Crate-wide error type.
///
/// Workspace-layer failures (`ProvisioningFailed`, `CheckpointFailed`,
/// `RollbackFailed`) are retried a bounded number of times by their owning
/// component. `CapacityExhausted` is an expected scheduling outcome, never
/// surfaced to the caller. `InvalidTransition` indicates a state machine
/// violation and is treated as fatal rather than retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Provisioning failed for rig {rig}: {message}")]
    ProvisioningFailed { rig: String, message: String },

    #[error("Checkpoint failed for hook {hook_id}: {message}")]
    CheckpointFailed { hook_id: String, message: String },

    #[error("Rollback failed for hook {hook_id}: {message}")]
    RollbackFailed { hook_id: String, message: String },

    #[error("No runtime capacity for role {role}")]
    CapacityExhausted { role: String },

    #[error("Malformed plan: {message}")]
    MalformedPlan { message: String },

    #[error("Runtime execution failed: {message}")]
    RuntimeExecutionFailed { message: String },

    #[error("Verification failed: {errors:?}")]
    VerificationFailed { errors: Vec<String> },

    #[error("Invalid bead transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl Error {
    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create a provisioning failure for a rig
    pub fn provisioning<S1: Into<String>, S2: Into<String>>(rig: S1, message: S2) -> Self {
        Self::ProvisioningFailed {
            rig: rig.into(),
            message: message.into(),
        }
    }

    /// Create a checkpoint failure for a hook
    pub fn checkpoint<S1: Into<String>, S2: Into<String>>(hook_id: S1, message: S2) -> Self {
        Self::CheckpointFailed {
            hook_id: hook_id.into(),
            message: message.into(),
        }
    }

    /// Create a rollback failure for a hook
    pub fn rollback<S1: Into<String>, S2: Into<String>>(hook_id: S1, message: S2) -> Self {
        Self::RollbackFailed {
            hook_id: hook_id.into(),
            message: message.into(),
        }
    }

    /// Create a malformed plan error
    pub fn malformed_plan<S: Into<String>>(message: S) -> Self {
        Self::MalformedPlan {
            message: message.into(),
        }
    }

    /// Create a runtime execution failure
    pub fn runtime_execution<S: Into<String>>(message: S) -> Self {
        Self::RuntimeExecutionFailed {
            message: message.into(),
        }
    }

    /// Create an invalid transition error
    pub fn invalid_transition<S1: Into<String>, S2: Into<String>>(from: S1, to: S2) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Check if this error is a transient infrastructure failure worth a
    /// local retry inside the owning component
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ProvisioningFailed { .. }
                | Error::CheckpointFailed { .. }
                | Error::RollbackFailed { .. }
                | Error::RuntimeExecutionFailed { .. }
                | Error::Io(_)
                | Error::Database(_)
        )
    }

    /// Check if this error triggers the attempt/requeue policy on a bead
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            Error::RuntimeExecutionFailed { .. } | Error::VerificationFailed { .. }
        )
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::ProvisioningFailed { .. } => "provisioning_failed",
            Error::CheckpointFailed { .. } => "checkpoint_failed",
            Error::RollbackFailed { .. } => "rollback_failed",
            Error::CapacityExhausted { .. } => "capacity_exhausted",
            Error::MalformedPlan { .. } => "malformed_plan",
            Error::RuntimeExecutionFailed { .. } => "runtime_execution_failed",
            Error::VerificationFailed { .. } => "verification_failed",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Serialization(_) => "serialization",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

/// Convenience result type for scheduling operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::provisioning("backend-api", "dirty base branch");
        assert_eq!(err.category(), "provisioning_failed");
        assert!(err.is_recoverable());

        let err = Error::malformed_plan("cycle: a -> b -> a");
        assert_eq!(err.category(), "malformed_plan");
        assert!(!err.is_recoverable());

        let err = Error::invalid_transition("completed", "queued");
        assert_eq!(err.category(), "invalid_transition");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_attempt_failures() {
        assert!(Error::runtime_execution("worker exited 1").is_attempt_failure());
        assert!(Error::VerificationFailed {
            errors: vec!["tests failed".into()]
        }
        .is_attempt_failure());
        assert!(!Error::validation("empty title").is_attempt_failure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::checkpoint("hook-1", "nothing to commit");
        let display = format!("{}", err);
        assert!(display.contains("Checkpoint failed"));
        assert!(display.contains("hook-1"));
    }
}
