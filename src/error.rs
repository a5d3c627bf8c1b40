//! Error taxonomy and the single error-to-response translator.
//!
//! Handlers propagate `ApiError` with `?`; the `IntoResponse` impl renders
//! every variant as a `{status, name, message}` JSON body. Internal failure
//! detail is redacted outside debug builds.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("resource not found")]
    NotFound,

    #[error("{}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{0}")]
    Conflict(String),

    #[error("internal server error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(vec![message.into()])
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ApiError::NotFound => "NotFoundError",
            ApiError::Validation(_) => "ValidationError",
            ApiError::Conflict(_) => "ConflictError",
            ApiError::Internal(_) => "InternalServerError",
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return ApiError::Conflict(db_err.message().to_string());
            }
        }
        ApiError::Internal(err.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
        }

        let message = match &self {
            ApiError::Internal(err) => {
                if cfg!(debug_assertions) {
                    err.to_string()
                } else {
                    "internal server error".to_string()
                }
            }
            other => other.to_string(),
        };

        let body = json!({
            "status": status.as_u16(),
            "name": self.name(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}
