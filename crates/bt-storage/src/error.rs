use bt_core::BtError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<RepoError> for BtError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Validation(msg) => BtError::Validation(msg),
            RepoError::NotFound(msg) => BtError::NotFound(msg),
            RepoError::Conflict(msg) => BtError::Conflict(msg),
            RepoError::Database(err) => BtError::Infrastructure(err.to_string()),
        }
    }
}
