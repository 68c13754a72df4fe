//! HTTP error mapping (spec §7).
//!
//! A single dispatch from [`QntxError`] to status code; the JSON body always
//! carries `error` and, when the error accumulated context, `details`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use qntx_core::error::QntxError;
use serde::Serialize;

pub struct ApiError(pub QntxError);

impl From<QntxError> for ApiError {
    fn from(e: QntxError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, details) = match &self.0 {
            QntxError::NotFound(_) => (StatusCode::NOT_FOUND, vec![]),
            QntxError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, vec![]),
            QntxError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, vec![]),
            QntxError::Forbidden(_) => (StatusCode::FORBIDDEN, vec![]),
            QntxError::Conflict(_) => (StatusCode::CONFLICT, vec![]),
            QntxError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, vec![]),
            QntxError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, vec![]),
            QntxError::InvalidTransition(_) => (StatusCode::CONFLICT, vec![]),
            QntxError::HandlerUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, vec![]),
            QntxError::ParseError(_) => (StatusCode::BAD_REQUEST, vec![]),
            QntxError::ValidationError(_) => (StatusCode::BAD_REQUEST, vec![]),
        };

        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
                details,
            }),
        )
            .into_response()
    }
}
