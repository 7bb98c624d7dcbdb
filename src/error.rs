//! Gateway error taxonomy.
//!
//! Every user-visible failure carries a stable, uuid-like string code
//! so clients can branch on failures without parsing prose. HTTP
//! handlers convert [`ApiError`] into a JSON envelope
//! `{ "code": "<uuid>", "error": "<short>" }`; streaming sessions
//! convert it into a `response.error` SSE payload instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

// Stable error codes. These are part of the wire contract: never
// renumber, only append.
pub const CODE_INVALID_REQUEST: &str = "0a9c7d2e-2cbe-7518-8b4f-5e6a1c3d9f02";
pub const CODE_UNAUTHORIZED: &str = "7b1f4e8a-90cd-4f2e-b6a3-1d5c8e0f7a24";
pub const CODE_FORBIDDEN_PROVIDER: &str = "c4d2a6b8-13ef-45c0-9a7d-2f8b5e1c6d93";
pub const CODE_NOT_FOUND: &str = "5e8b1c7f-a2d4-4e96-8c3b-7f0d9a6e2b51";
pub const CODE_CONFLICT: &str = "9f3a5d1b-6c8e-42f7-b0a9-4e7d2c5f8a16";
pub const CODE_UPSTREAM_FAILED: &str = "2c6e9a4d-7f1b-48e3-a5c8-0b3d6f9e2a74";
pub const CODE_UPSTREAM_TIMEOUT: &str = "8d4f7b2a-5e9c-41d6-b3f0-6a1e8c4d7b29";
pub const CODE_CLIENT_DISCONNECTED: &str = "3b7d0f5c-8a2e-46b9-a1d4-9e6f3a0b5d82";
pub const CODE_PRECONDITION_FAILED: &str = "6a2c8e4f-1d7b-49a3-8e5c-3f0b7d2a9c61";
pub const CODE_INTERNAL: &str = "e1c5a9d3-4b8f-47e2-a6d0-8c3f1b5e9a47";

/// A user-visible gateway failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden provider: {0}")]
    ForbiddenProvider(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream call failed: {0}")]
    UpstreamFailed(String),

    #[error("upstream call timed out after {0}s")]
    UpstreamTimeout(u64),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The stable string code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => CODE_INVALID_REQUEST,
            ApiError::Unauthorized(_) => CODE_UNAUTHORIZED,
            ApiError::ForbiddenProvider(_) => CODE_FORBIDDEN_PROVIDER,
            ApiError::NotFound(_) => CODE_NOT_FOUND,
            ApiError::Conflict(_) => CODE_CONFLICT,
            ApiError::UpstreamFailed(_) => CODE_UPSTREAM_FAILED,
            ApiError::UpstreamTimeout(_) => CODE_UPSTREAM_TIMEOUT,
            ApiError::ClientDisconnected => CODE_CLIENT_DISCONNECTED,
            ApiError::PreconditionFailed(_) => CODE_PRECONDITION_FAILED,
            ApiError::Internal(_) => CODE_INTERNAL,
        }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::ForbiddenProvider(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            // The connection is already gone; the status is never sent.
            ApiError::ClientDisconnected => StatusCode::BAD_REQUEST,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Payload for a streaming `response.error` SSE event.
    pub fn sse_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }

    /// JSON-encoded form stored on failed response records.
    pub fn record_payload(&self) -> String {
        self.sse_payload().to_string()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// JSON error envelope returned by every handler.
#[derive(serde::Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            code: self.code().to_string(),
            error: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let codes = [
            CODE_INVALID_REQUEST,
            CODE_UNAUTHORIZED,
            CODE_FORBIDDEN_PROVIDER,
            CODE_NOT_FOUND,
            CODE_CONFLICT,
            CODE_UPSTREAM_FAILED,
            CODE_UPSTREAM_TIMEOUT,
            CODE_CLIENT_DISCONNECTED,
            CODE_PRECONDITION_FAILED,
            CODE_INTERNAL,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn invalid_request_keeps_published_code() {
        let e = ApiError::InvalidRequest("messages must not be empty".into());
        assert!(e.code().contains("2cbe-7518"));
        assert_eq!(e.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let e = ApiError::UpstreamTimeout(120);
        assert_eq!(e.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(e.to_string(), "upstream call timed out after 120s");
    }

    #[test]
    fn sse_payload_carries_code_and_message() {
        let e = ApiError::UpstreamFailed("boom".into());
        let p = e.sse_payload();
        assert_eq!(p["code"], CODE_UPSTREAM_FAILED);
        assert!(p["message"].as_str().unwrap().contains("boom"));
    }
}
