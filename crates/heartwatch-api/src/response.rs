//! Response envelope and error mapping shared by all handlers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use heartwatch_state::StateError;
use heartwatch_tracker::TrackerError;
use tracing::warn;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Unknown devices are 404; unreachable or slow infrastructure is 503 so
/// the client retries on its next heartbeat.
pub(crate) fn tracker_error(err: TrackerError) -> Response {
    let status = match &err {
        TrackerError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    error_response(&err.to_string(), status)
}

pub(crate) fn state_error(err: StateError) -> Response {
    let status = match &err {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::AlreadyExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "store request failed");
    }
    error_response(&err.to_string(), status)
}
