use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::ExecutionStatus;

/// Engine-level error taxonomy.
///
/// A user program crashing inside the sandbox is *not* an error here: it is
/// a `Completed` execution with a non-zero exit code and populated stderr.
/// These variants cover validation rejections, policy rejections and host
/// side infrastructure faults only.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("no active environment matches language '{language}' version {version:?}")]
    EnvironmentNotFound {
        language: String,
        version: Option<String>,
    },

    #[error("environment '{0}' is already registered")]
    DuplicateEnvironment(String),

    #[error("workspace preparation failed: {0}")]
    WorkspacePrep(String),

    #[error("quota exceeded: {reason} (resets at {resets_at})")]
    QuotaExceeded {
        reason: String,
        resets_at: DateTime<Utc>,
    },

    #[error("failed to launch sandbox: {0}")]
    SandboxLaunch(String),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("execution is owned by another user")]
    AccessDenied,

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("internal error: {0}")]
    Internal(String),
}
