//! Device, heartbeat and report handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::info;

use crate::ApiState;
use crate::response::{ApiResponse, error_response, state_error, tracker_error};

/// Provision request body.
#[derive(Debug, serde::Deserialize)]
pub struct ProvisionRequest {
    pub id: String,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct PollIntervalResponse {
    pub device_id: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ReportResponse {
    pub persisted: bool,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/')
}

// ── Devices ────────────────────────────────────────────────────

/// GET /api/v1/devices
pub async fn list_devices(State(state): State<ApiState>) -> Response {
    match state.store.list_devices() {
        Ok(devices) => ApiResponse::ok(devices).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/devices
pub async fn provision_device(
    State(state): State<ApiState>,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    if !valid_id(&req.id) || req.group_id.as_deref().is_some_and(|g| !valid_id(g)) {
        return error_response("device and group ids must be non-empty and contain no '/'", StatusCode::BAD_REQUEST);
    }
    match state
        .store
        .provision_device(&req.id, req.group_id.as_deref(), state.clock.now_ms())
    {
        Ok(record) => {
            info!(device_id = %record.id, group_id = ?record.group_id, "device provisioned");
            (StatusCode::CREATED, ApiResponse::ok(record)).into_response()
        }
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/devices/{id}
pub async fn get_device(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.tracker.device_status(&id) {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => tracker_error(e),
    }
}

/// DELETE /api/v1/devices/{id}
pub async fn delete_device(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.delete_device(&id) {
        Ok(true) => {
            if let Err(e) = state.tracker.forget(&id).await {
                return tracker_error(e);
            }
            info!(device_id = %id, "device deleted");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("device not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

// ── Heartbeats ─────────────────────────────────────────────────

/// POST /api/v1/devices/{id}/heartbeat
pub async fn heartbeat(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.tracker.capture_heartbeat(&id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => tracker_error(e),
    }
}

/// GET /api/v1/devices/{id}/poll-interval
pub async fn poll_interval(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get_device(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("device not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(e),
    }
    match state.tracker.effective_poll_interval(&id) {
        Ok(poll_interval_ms) => ApiResponse::ok(PollIntervalResponse {
            device_id: id,
            poll_interval_ms,
        })
        .into_response(),
        Err(e) => tracker_error(e),
    }
}

// ── Reports ────────────────────────────────────────────────────

/// POST /api/v1/devices/{id}/reports/{kind}
pub async fn submit_report(
    State(state): State<ApiState>,
    Path((id, kind)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Response {
    match state.throttle.record(&id, &kind, value).await {
        Ok(persisted) => ApiResponse::ok(ReportResponse { persisted }).into_response(),
        Err(e) => tracker_error(e),
    }
}

// ── Stats ──────────────────────────────────────────────────────

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.tracker.stats()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use heartwatch_core::HeartbeatState;
    use serde_json::json;

    fn provision(id: &str) -> Json<ProvisionRequest> {
        Json(ProvisionRequest {
            id: id.to_string(),
            group_id: Some("fleet".to_string()),
        })
    }

    #[tokio::test]
    async fn provision_then_get() {
        let state = test_state();
        let resp = provision_device(State(state.clone()), provision("dev-1")).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_device(State(state), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_provision_conflicts() {
        let state = test_state();
        provision_device(State(state.clone()), provision("dev-1")).await;
        let resp = provision_device(State(state), provision("dev-1")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn provision_rejects_bad_ids() {
        let state = test_state();
        let resp = provision_device(State(state.clone()), provision("")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = provision_device(State(state), provision("a/b")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_unknown_device() {
        let state = test_state();
        let resp = get_device(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_returns_no_content() {
        let state = test_state();
        provision_device(State(state.clone()), provision("dev-1")).await;

        let resp = heartbeat(State(state.clone()), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            state.store.read_device_state("dev-1").unwrap(),
            HeartbeatState::Online
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_for_unknown_device_is_404() {
        let state = test_state();
        let resp = heartbeat(State(state), Path("ghost".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn poll_interval_for_known_and_unknown() {
        let state = test_state();
        provision_device(State(state.clone()), provision("dev-1")).await;

        let resp = poll_interval(State(state.clone()), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = poll_interval(State(state), Path("ghost".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn report_for_unknown_device_is_404() {
        let state = test_state();
        let resp = submit_report(
            State(state),
            Path(("ghost".to_string(), "battery".to_string())),
            Json(json!(50)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_forgets_device() {
        let state = test_state();
        provision_device(State(state.clone()), provision("dev-1")).await;
        heartbeat(State(state.clone()), Path("dev-1".to_string())).await;

        let resp = delete_device(State(state.clone()), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        // The cached Online entry must not let a heartbeat through.
        let resp = heartbeat(State(state.clone()), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = delete_device(State(state), Path("dev-1".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_endpoint_is_ok() {
        let state = test_state();
        let resp = stats(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
