use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::{models::ObjectId, services::document_store::StoreError};

/// Failures surfaced by `Repository` and `FileStorage`.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("output file name must be specified")]
    MissingFilename,
    #[error("source file path must be specified")]
    MissingSource,
    #[error("name must be unique")]
    DuplicateName,
    #[error("email must be unique")]
    DuplicateEmail,
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("stream error: {0}")]
    Stream(#[source] io::Error),
    #[error("unable to rename file with id {id}")]
    RenameFailed {
        id: ObjectId,
        #[source]
        source: StoreError,
    },
    #[error("unable to delete file with id {id}")]
    DeleteFailed {
        id: ObjectId,
        #[source]
        source: StoreError,
    },
    #[error("invalid id `{0}`")]
    InvalidId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        let status = match &err {
            RepositoryError::InvalidInput(_)
            | RepositoryError::MissingFilename
            | RepositoryError::MissingSource
            | RepositoryError::InvalidModel(_)
            | RepositoryError::InvalidId(_) => StatusCode::BAD_REQUEST,
            RepositoryError::DuplicateName | RepositoryError::DuplicateEmail => {
                StatusCode::CONFLICT
            }
            RepositoryError::FileNotFound(_) => StatusCode::NOT_FOUND,
            RepositoryError::RenameFailed { source, .. }
            | RepositoryError::DeleteFailed { source, .. }
                if matches!(source, StoreError::NotFound(_)) =>
            {
                StatusCode::NOT_FOUND
            }
            RepositoryError::Store(StoreError::Query(_)) => StatusCode::BAD_REQUEST,
            RepositoryError::Store(StoreError::DuplicateKey { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::query::QueryError;

    #[test]
    fn repository_errors_map_to_http_status() {
        let cases = [
            (RepositoryError::DuplicateName, StatusCode::CONFLICT),
            (RepositoryError::DuplicateEmail, StatusCode::CONFLICT),
            (RepositoryError::MissingFilename, StatusCode::BAD_REQUEST),
            (RepositoryError::InvalidId("x".into()), StatusCode::BAD_REQUEST),
            (
                RepositoryError::FileNotFound("a.png".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                RepositoryError::DeleteFailed {
                    id: ObjectId::new(),
                    source: StoreError::NotFound("blob".into()),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                RepositoryError::Store(StoreError::Query(QueryError::MixedProjection)),
                StatusCode::BAD_REQUEST,
            ),
            (
                RepositoryError::Stream(io::Error::other("disk gone")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn messages_carry_the_kind() {
        assert_eq!(RepositoryError::DuplicateName.to_string(), "name must be unique");
        let err = RepositoryError::RenameFailed {
            id: ObjectId::parse_str("5f1d7a0c9e1b2a3c4d5e6f7a").unwrap(),
            source: StoreError::NotFound("blob".into()),
        };
        assert_eq!(
            err.to_string(),
            "unable to rename file with id 5f1d7a0c9e1b2a3c4d5e6f7a"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn app_error_display_uses_message() {
        let err = AppError::bad_request("nope");
        assert_eq!(err.to_string(), "nope");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
