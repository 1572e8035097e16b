use thiserror::Error;
use trueque_storage::StorageError;

/// Domain error taxonomy shared by every core service.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    InsufficientFunds(String),

    #[error("{0}")]
    InvalidTransition(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Conflict(String),

    /// An external connector could not answer.
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable machine-readable kind, used as the wire discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InsufficientFunds(_) => "insufficient_funds",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => Self::NotFound(msg),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            // A failed compare-and-set means the caller raced a stale status.
            StorageError::InvariantViolation(msg) => Self::InvalidTransition(msg),
            StorageError::InsufficientFunds(msg) => Self::InsufficientFunds(msg),
            StorageError::InvalidInput(msg) => Self::InvalidInput(msg),
            StorageError::Serialization(msg) | StorageError::Backend(msg) => Self::Internal(msg),
        }
    }
}
