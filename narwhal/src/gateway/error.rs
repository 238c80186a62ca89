use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::coordinator::CoordinatorError;
use crate::store::RunStoreError;

/// API error types mapped to HTTP responses.
///
/// Internal error details never leak to clients; the JSON body carries a
/// stable code and a human-readable message only.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Overflow,
    Internal(String),
}

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "missing or invalid bearer token".to_string(),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Overflow => (
                StatusCode::TOO_MANY_REQUESTS,
                "CLIENT_OVERFLOW",
                "client cannot keep up with the stream".to_string(),
            ),
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<RunStoreError> for ApiError {
    fn from(err: RunStoreError) -> Self {
        match err {
            RunStoreError::NotFound(id) => ApiError::NotFound(format!("run {id} not found")),
            RunStoreError::Conflict(_) => {
                ApiError::Internal("run store conflict".to_string())
            }
            RunStoreError::Backend(_) => {
                ApiError::Internal("run store unavailable".to_string())
            }
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Store(e) => e.into(),
            CoordinatorError::Launch { message, .. } => ApiError::Internal(format!(
                "failed to schedule run execution: {message}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunId;

    #[test]
    fn test_error_response_serialization() {
        let err = ErrorResponse {
            error: "test error".to_string(),
            code: "TEST_ERROR".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("test error"));
        assert!(json.contains("TEST_ERROR"));
    }

    #[test]
    fn test_not_found_mapping() {
        let id = RunId::new();
        let api: ApiError = RunStoreError::NotFound(id).into();
        assert!(matches!(api, ApiError::NotFound(_)));
    }

    #[test]
    fn test_backend_errors_do_not_leak_details() {
        let api: ApiError =
            RunStoreError::Backend(anyhow::anyhow!("password=hunter2 refused")).into();
        match api {
            ApiError::Internal(msg) => assert!(!msg.contains("hunter2")),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
