//! API error type and response handling.
//!
//! Every failure is answered with the same error envelope the host gets
//! over any transport: `{"t":2,"d":{"msg","code","suggestion"?}}`. The HTTP
//! status comes from [`BridgeError::http_status_code`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scanbridge_core::{BridgeError, ResponseEnvelope};

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// A bridge error on its way to an HTTP client.
#[derive(Debug)]
pub struct ApiError(BridgeError);

impl ApiError {
    /// Status code for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.0.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The underlying bridge error.
    #[must_use]
    pub const fn inner(&self) -> &BridgeError {
        &self.0
    }
}

impl From<BridgeError> for ApiError {
    fn from(error: BridgeError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.0.error_code(), error = %self.0, "Command request failed");
        } else {
            tracing::debug!(code = self.0.error_code(), error = %self.0, "Command request refused");
        }
        (status, Json(ResponseEnvelope::error(&self.0))).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status(), self.0)
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}
