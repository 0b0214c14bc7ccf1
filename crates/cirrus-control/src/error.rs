//! Error types for cirrus-control.

use std::time::Duration;

use cirrus_build::{BuildError, DeployStage};

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Request failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Function, deployment or version not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A function with the same name already exists for the owner.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A pipeline stage failed during deploy or rollback.
    #[error("deploy failed during {stage}: {source}")]
    Deploy {
        /// Stage that failed.
        stage: DeployStage,
        /// Underlying build error.
        #[source]
        source: BuildError,
    },

    /// Rollback target has neither an image nor a stored source archive.
    #[error("no image or source archive for {function_id} v{version}")]
    ArchiveMissing {
        /// Function identifier.
        function_id: String,
        /// Target version.
        version: u32,
    },

    /// Invocation payload exceeds the configured limit.
    #[error("payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// Invocation exceeded its time limit.
    #[error("execution timed out after {limit:?}")]
    ExecutionTimeout {
        /// Time limit that was exceeded.
        limit: Duration,
    },

    /// Handler or runtime reported an error.
    #[error("execution failed: {0}")]
    ExecutionRuntime(String),

    /// A concurrent operation claimed the same row first.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Too many in-flight invocations for the function.
    #[error("function {function_id} is overloaded (waited {waited:?} for a slot)")]
    Overloaded {
        /// Function identifier.
        function_id: String,
        /// How long the request queued before being rejected.
        waited: Duration,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Object storage error outside a pipeline stage.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Attribute a build error to a pipeline stage.
    #[must_use]
    pub fn deploy(stage: DeployStage, source: BuildError) -> Self {
        Self::Deploy { stage, source }
    }

    /// HTTP status an inbound adapter should respond with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::PayloadTooLarge { .. } => 413,
            Self::Overloaded { .. } => 503,
            _ => 500,
        }
    }

    /// Stable snake_case name for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::Deploy { .. } => "deploy",
            Self::ArchiveMissing { .. } => "archive_missing",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::ExecutionRuntime(_) => "execution_runtime",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Overloaded { .. } => "overloaded",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::Database(_) => "database",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Serialisation(_) => "serialisation",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<BuildError> for ControlError {
    fn from(err: BuildError) -> Self {
        match err.stage() {
            Some(stage) => Self::Deploy { stage, source: err },
            None => match err {
                BuildError::ArchiveNotFound(key) => Self::Storage(format!("archive not found: {key}")),
                BuildError::Storage(msg) => Self::Storage(msg),
                other => Self::Internal(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(ControlError::validation("bad").status_code(), 400);
        assert_eq!(ControlError::not_found("fn").status_code(), 404);
        assert_eq!(
            ControlError::PayloadTooLarge { size: 10, limit: 5 }.status_code(),
            413
        );
        assert_eq!(
            ControlError::Overloaded {
                function_id: "f".to_owned(),
                waited: Duration::from_secs(1),
            }
            .status_code(),
            503
        );
        assert_eq!(
            ControlError::ExecutionTimeout {
                limit: Duration::from_secs(1)
            }
            .status_code(),
            500
        );
        assert_eq!(ControlError::internal("x").status_code(), 500);
    }

    #[test]
    fn build_errors_keep_their_stage() {
        let err: ControlError = BuildError::synthesis("no lib").into();
        match err {
            ControlError::Deploy { stage, .. } => assert_eq!(stage, DeployStage::Synthesis),
            other => panic!("expected Deploy, got {other:?}"),
        }

        let err: ControlError = BuildError::Storage("down".to_owned()).into();
        assert_eq!(err.kind(), "storage");
    }

    #[test]
    fn deploy_error_message_names_stage() {
        let err = ControlError::deploy(DeployStage::Build, BuildError::internal("boom"));
        assert_eq!(err.to_string(), "deploy failed during build: internal error: boom");
    }
}
