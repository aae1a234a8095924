//! Error taxonomy surfaced to callers of an execution.

use thiserror::Error;
use tracing::error;

/// Outcome classes reported to whoever asked for an execution.
///
/// Everything that is a host fault collapses into `Internal`; the detail is
/// logged where the error is created and never rendered to the caller.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error")]
    Internal(String),
}

impl ExecError {
    /// Log `err` in full and wrap it as an opaque internal error.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        let detail = err.to_string();
        error!(error = %detail, "internal error");
        ExecError::Internal(detail)
    }

    /// Short machine-readable code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::InvalidArgument(_) => "invalid_argument",
            ExecError::NotFound(_) => "not_found",
            ExecError::PermissionDenied(_) => "permission_denied",
            ExecError::FailedPrecondition(_) => "failed_precondition",
            ExecError::Unavailable(_) => "unavailable",
            ExecError::Internal(_) => "internal",
        }
    }
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;
