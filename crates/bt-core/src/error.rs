//! Error taxonomy shared across component boundaries.
//!
//! Each crate that owns I/O defines its own `thiserror` error enum
//! (`bt_storage::RepoError`, `bt_container::ContainerError`, ...) and
//! converts into `BtError` at the points where a single error type is
//! needed — the worker's `JobResult`, the optimization tracker's control
//! operations, and anything surfaced across the (out-of-scope) API edge.

use thiserror::Error;

/// The small status enum every caller-visible error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Internal,
}

#[derive(Debug, Error)]
pub enum BtError {
    /// Input is malformed (bad UUID, missing required config key). Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Referenced entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// State-transition rejected (duplicate hash, job not cancellable, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database, container daemon, or transport disconnect. Retried where
    /// retry is meaningful.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// The container exited non-zero or the parser detected a known error
    /// signature in its output. Never retried.
    #[error("backtest error: {0}")]
    StrategyCodeError(String),

    /// Job exceeded its deadline. Infrastructure-class; retried up to
    /// `max_retries`.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl BtError {
    pub fn status(&self) -> ErrorStatus {
        match self {
            BtError::Validation(_) => ErrorStatus::InvalidArgument,
            BtError::NotFound(_) => ErrorStatus::NotFound,
            BtError::Conflict(_) => ErrorStatus::FailedPrecondition,
            BtError::Infrastructure(_) => ErrorStatus::Internal,
            BtError::StrategyCodeError(_) => ErrorStatus::FailedPrecondition,
            BtError::Timeout(_) => ErrorStatus::Internal,
        }
    }

    /// Whether a failure of this class is worth retrying under the
    /// worker pool's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BtError::Infrastructure(_) | BtError::Timeout(_))
    }
}
