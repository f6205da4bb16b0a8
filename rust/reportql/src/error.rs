use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("either table_name or a resolvable data_source_id must be provided")]
    MissingSource,

    #[error("alias '{0}' collides with another output or a source column")]
    AliasCollision(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store {operation} failed: {message}")]
    ExecutorFailure {
        operation: &'static str,
        message: String,
    },

    #[error("object storage {operation} failed: {message}")]
    StorageFailure {
        operation: &'static str,
        message: String,
    },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn executor(operation: &'static str, message: impl Into<String>) -> Self {
        Self::ExecutorFailure {
            operation,
            message: message.into(),
        }
    }

    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::StorageFailure {
            operation,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "config",
            ServiceError::Auth => "auth",
            ServiceError::InvalidIdentifier(_) => "invalid_identifier",
            ServiceError::InvalidFilter(_) => "invalid_filter",
            ServiceError::MissingSource => "missing_source",
            ServiceError::AliasCollision(_) => "alias_collision",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::ExecutorFailure { .. } => "executor_failure",
            ServiceError::StorageFailure { .. } => "storage_failure",
            ServiceError::Internal(_) => "internal",
        }
    }

    /// Translation errors are raised before any store call is issued.
    pub fn is_translation_error(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidIdentifier(_)
                | ServiceError::InvalidFilter(_)
                | ServiceError::MissingSource
                | ServiceError::AliasCollision(_)
                | ServiceError::InvalidRequest(_)
        )
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        ServiceError::InvalidRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidIdentifier(_)
            | ServiceError::InvalidFilter(_)
            | ServiceError::MissingSource
            | ServiceError::AliasCollision(_)
            | ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ExecutorFailure { .. } | ServiceError::StorageFailure { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !self.is_translation_error()
            && !matches!(self, ServiceError::Auth | ServiceError::NotFound(_))
        {
            error!(error = %self, kind = self.kind(), "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}
