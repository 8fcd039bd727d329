//! Mapping from domain errors to `{ "error": ..., "code": ... }` responses.

use axum::extract::FromRequest;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use kiln_core::{Error, GenerationError, RoutingError, StoreError};
use serde::{Deserialize, Serialize};

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_parameters",
            message: message.into(),
        }
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "not_found" => StatusCode::NOT_FOUND,
        "invalid_parameters" | "no_model_loaded" => StatusCode::BAD_REQUEST,
        "peer_unreachable" | "busy" => StatusCode::SERVICE_UNAVAILABLE,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let code = e.code();
        Self {
            status: status_for(code),
            code,
            message: e.to_string(),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        Error::from(e).into()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Error::from(e).into()
    }
}

impl From<RoutingError> for ApiError {
    fn from(e: RoutingError) -> Self {
        Error::from(e).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = self.code, error = %self.message, "Request failed");
        }
        let body = ErrorBody {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

/// `Json` extractor whose rejections use the structured error body.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::LoadFailureCause;

    #[test]
    fn status_mapping() {
        let cases: Vec<(ApiError, StatusCode, &str)> = vec![
            (
                StoreError::ConversationNotFound("c".into()).into(),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                StoreError::Storage("disk".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
            ),
            (
                GenerationError::NoModelLoaded.into(),
                StatusCode::BAD_REQUEST,
                "no_model_loaded",
            ),
            (
                GenerationError::InvalidParameters("top_p".into()).into(),
                StatusCode::BAD_REQUEST,
                "invalid_parameters",
            ),
            (
                GenerationError::ModelLoadFailed {
                    cause: LoadFailureCause::Network,
                    message: "offline".into(),
                }
                .into(),
                StatusCode::INTERNAL_SERVER_ERROR,
                "model_load_failed",
            ),
            (
                GenerationError::Busy { waited_ms: 10 }.into(),
                StatusCode::SERVICE_UNAVAILABLE,
                "busy",
            ),
            (
                GenerationError::Timeout { timeout_ms: 10 }.into(),
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
            ),
            (
                RoutingError::PeerUnreachable {
                    endpoint: "http://x".into(),
                    reason: "refused".into(),
                }
                .into(),
                StatusCode::SERVICE_UNAVAILABLE,
                "peer_unreachable",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status, status, "{code}");
            assert_eq!(err.code, code);
        }
    }
}
