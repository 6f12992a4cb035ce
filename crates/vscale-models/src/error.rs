//! Model validation errors.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid artifact reference: {0}")]
    InvalidArtifact(String),

    #[error("Invalid status value: {0}")]
    InvalidStatus(String),

    #[error("Invalid dispatch message: {0}")]
    InvalidDispatch(String),
}

impl ModelError {
    pub fn invalid_artifact(msg: impl Into<String>) -> Self {
        Self::InvalidArtifact(msg.into())
    }

    pub fn invalid_dispatch(msg: impl Into<String>) -> Self {
        Self::InvalidDispatch(msg.into())
    }
}
