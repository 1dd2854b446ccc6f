//! Error types for the records core

use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Rejected before any write was attempted.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A session for the same date, subject, section and period exists.
    #[error("attendance for this period was already marked (session {session_id})")]
    DuplicateSession { session_id: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether the caller may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}
