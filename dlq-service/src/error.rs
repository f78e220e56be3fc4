use thiserror::Error;

use dlq_common::eventbus::PublishError;

use crate::model::Status;

/// Errors of a [`crate::store::MessageStore`]. Errors from sqlx are wrapped with the command
/// that failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

#[derive(Error, Debug)]
pub enum UsecaseError {
    #[error("message {0} not found")]
    NotFound(String),
    #[error("page and size must be at least 1")]
    InvalidPage,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to republish message: {0}")]
    Publish(#[from] PublishError),
}

impl UsecaseError {
    pub fn status(&self) -> Status {
        match self {
            UsecaseError::NotFound(_) => Status::NotFoundError,
            UsecaseError::InvalidPage => Status::BadRequestError,
            UsecaseError::Store(_) | UsecaseError::Publish(_) => Status::InternalServerError,
        }
    }
}
