//! Maps core errors onto HTTP responses with a `{ "error": ... }` body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::TelemetryError;

// ---

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<TelemetryError> for ApiError {
    fn from(err: TelemetryError) -> Self {
        // ---
        let status = match &err {
            TelemetryError::InvalidReading { .. } | TelemetryError::InvalidTarget { .. } => StatusCode::BAD_REQUEST,
            TelemetryError::NotFound { .. } | TelemetryError::NoActivePhase { .. } => StatusCode::NOT_FOUND,
            TelemetryError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TelemetryError::OutOfOrderRejected { .. } => StatusCode::ACCEPTED,
            _ => {
                error!("Request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
