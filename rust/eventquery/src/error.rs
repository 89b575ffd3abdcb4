use axum::{
    response::{IntoResponse, Response},
    Json,
};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Failures surfaced by the query layer. Every variant aborts the whole call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteQueryError {
    /// Rejected locally before anything was sent to the store.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The store accepted the request but refused to run it.
    #[error("query execution failed: {message}")]
    QueryExecution { message: String },

    /// The store could not be reached or did not answer in time.
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),
}

impl RemoteQueryError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::QueryExecution {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::RemoteUnavailable(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Query(#[from] RemoteQueryError),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Query(RemoteQueryError::InvalidQuery(_)) => StatusCode::BAD_REQUEST,
            ServiceError::Query(RemoteQueryError::QueryExecution { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ServiceError::Query(RemoteQueryError::RemoteUnavailable(_)) => StatusCode::BAD_GATEWAY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !matches!(
            self,
            ServiceError::InvalidRequest(_)
                | ServiceError::Auth
                | ServiceError::Query(RemoteQueryError::InvalidQuery(_))
        ) {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
