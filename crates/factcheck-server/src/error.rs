//! HTTP error mapping.
//!
//! Every error body carries the engine's structured context so the
//! dashboard can act on it:
//!
//! ```json
//! { "error": "not_found", "message": "...", "context": { ... } }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use factcheck_core::EngineError;
use serde::Serialize;

#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    BadRequest {
        message: String,
        context: serde_json::Value,
    },
}

impl AppError {
    pub fn bad_request(message: impl Into<String>, context: serde_json::Value) -> Self {
        Self::BadRequest {
            message: message.into(),
            context,
        }
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    context: serde_json::Value,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Engine(e) => {
                let status = StatusCode::from_u16(e.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!(kind = e.kind(), error = %e, "request failed");
                }
                (
                    status,
                    ErrorResponse {
                        error: e.kind().to_string(),
                        message: e.to_string(),
                        context: e.context(),
                    },
                )
            }
            AppError::BadRequest { message, context } => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: "bad_request".to_string(),
                    message,
                    context,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_engine_errors_keep_their_status() {
        let resp = AppError::from(EngineError::NotFound("audit event x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = AppError::from(EngineError::ResolutionTimeout {
            claim_id: Uuid::new_v4(),
            cohort_id: "finance".into(),
            timeout_ms: 2000,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_bad_request() {
        let resp = AppError::bad_request("nope", serde_json::Value::Null).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
