//! Layered configuration handlers.
//!
//! Values live at system, group or device scope. Writes invalidate the
//! resolved-settings cache of this instance; other instances pick the
//! change up when their snapshots expire.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use heartwatch_core::keys;
use heartwatch_state::ConfigScope;
use serde_json::Value;
use tracing::info;

use crate::ApiState;
use crate::response::{ApiResponse, error_response, state_error};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ConfigValue {
    pub scope: ConfigScope,
    pub key: String,
    pub value: Value,
}

/// Reject values the resolver could never use for a known key.
fn validate(key: &str, value: &Value) -> Result<(), String> {
    match key {
        keys::POLL_INTERVAL_MS => match value.as_u64() {
            Some(v) if (1..=keys::MAX_POLL_INTERVAL_MS).contains(&v) => Ok(()),
            _ => Err(format!(
                "{key} must be an integer between 1 and {}",
                keys::MAX_POLL_INTERVAL_MS
            )),
        },
        keys::TIMEOUT_GRACE_SECONDS => match value.as_u64() {
            Some(v) if v <= keys::MAX_TIMEOUT_GRACE_SECONDS => Ok(()),
            _ => Err(format!(
                "{key} must be an integer between 0 and {}",
                keys::MAX_TIMEOUT_GRACE_SECONDS
            )),
        },
        keys::ONLINE_UPDATE_CACHE_TIMEOUT_MS => {
            if value.is_null() || value.is_u64() {
                Ok(())
            } else {
                Err(format!("{key} must be null or a non-negative integer"))
            }
        }
        _ => Ok(()),
    }
}

fn invalidate(state: &ApiState, scope: &ConfigScope) {
    match scope {
        ConfigScope::Device(id) => state.tracker.resolver().invalidate(id),
        ConfigScope::Group(_) | ConfigScope::System => state.tracker.resolver().clear(),
    }
}

fn list(state: &ApiState, scope: ConfigScope) -> Response {
    match state.store.list_config(&scope) {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => state_error(e),
    }
}

fn get(state: &ApiState, scope: ConfigScope, key: String) -> Response {
    match state.store.get_config(&scope, &key) {
        Ok(Some(value)) => ApiResponse::ok(ConfigValue { scope, key, value }).into_response(),
        Ok(None) => error_response("config key not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

fn put(state: &ApiState, scope: ConfigScope, key: String, value: Value) -> Response {
    if let Err(msg) = validate(&key, &value) {
        return error_response(&msg, StatusCode::BAD_REQUEST);
    }
    match state
        .store
        .put_config(&scope, &key, value.clone(), state.clock.now_ms())
    {
        Ok(()) => {
            invalidate(state, &scope);
            info!(?scope, %key, %value, "config updated");
            ApiResponse::ok(ConfigValue { scope, key, value }).into_response()
        }
        Err(e) => state_error(e),
    }
}

fn delete(state: &ApiState, scope: ConfigScope, key: String) -> Response {
    match state.store.delete_config(&scope, &key) {
        Ok(true) => {
            invalidate(state, &scope);
            info!(?scope, %key, "config removed");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("config key not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

// ── System ─────────────────────────────────────────────────────

/// GET /api/v1/config/system
pub async fn list_system(State(state): State<ApiState>) -> Response {
    list(&state, ConfigScope::System)
}

/// GET /api/v1/config/system/{key}
pub async fn get_system(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    get(&state, ConfigScope::System, key)
}

/// PUT /api/v1/config/system/{key}
pub async fn put_system(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> Response {
    put(&state, ConfigScope::System, key, value)
}

/// DELETE /api/v1/config/system/{key}
pub async fn delete_system(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    delete(&state, ConfigScope::System, key)
}

// ── Groups ─────────────────────────────────────────────────────

/// GET /api/v1/config/groups/{gid}
pub async fn list_group(State(state): State<ApiState>, Path(gid): Path<String>) -> Response {
    list(&state, ConfigScope::Group(gid))
}

/// GET /api/v1/config/groups/{gid}/{key}
pub async fn get_group(
    State(state): State<ApiState>,
    Path((gid, key)): Path<(String, String)>,
) -> Response {
    get(&state, ConfigScope::Group(gid), key)
}

/// PUT /api/v1/config/groups/{gid}/{key}
pub async fn put_group(
    State(state): State<ApiState>,
    Path((gid, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Response {
    put(&state, ConfigScope::Group(gid), key, value)
}

/// DELETE /api/v1/config/groups/{gid}/{key}
pub async fn delete_group(
    State(state): State<ApiState>,
    Path((gid, key)): Path<(String, String)>,
) -> Response {
    delete(&state, ConfigScope::Group(gid), key)
}

// ── Devices ────────────────────────────────────────────────────

/// GET /api/v1/config/devices/{id}
pub async fn list_device(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    list(&state, ConfigScope::Device(id))
}

/// GET /api/v1/config/devices/{id}/{key}
pub async fn get_device(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    get(&state, ConfigScope::Device(id), key)
}

/// PUT /api/v1/config/devices/{id}/{key}
pub async fn put_device(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Response {
    put(&state, ConfigScope::Device(id), key, value)
}

/// DELETE /api/v1/config/devices/{id}/{key}
pub async fn delete_device(
    State(state): State<ApiState>,
    Path((id, key)): Path<(String, String)>,
) -> Response {
    delete(&state, ConfigScope::Device(id), key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use serde_json::json;

    #[test]
    fn known_keys_are_validated() {
        assert!(validate("poll_interval_ms", &json!(1000)).is_ok());
        assert!(validate("poll_interval_ms", &json!(0)).is_err());
        assert!(validate("poll_interval_ms", &json!("fast")).is_err());
        assert!(validate("poll_interval_ms", &json!(keys::MAX_POLL_INTERVAL_MS + 1)).is_err());
        assert!(validate("timeout_grace_seconds", &json!(0)).is_ok());
        assert!(validate("timeout_grace_seconds", &json!(u64::MAX)).is_err());
        assert!(validate("online_update_cache_timeout_ms", &Value::Null).is_ok());
        assert!(validate("online_update_cache_timeout_ms", &json!(-1)).is_err());
        assert!(validate("custom", &json!({"any": "thing"})).is_ok());
    }

    #[tokio::test]
    async fn put_get_delete_system_value() {
        let state = test_state();
        let resp = put_system(
            State(state.clone()),
            Path("poll_interval_ms".to_string()),
            Json(json!(120_000)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_system(State(state.clone()), Path("poll_interval_ms".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = delete_system(State(state.clone()), Path("poll_interval_ms".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_system(State(state), Path("poll_interval_ms".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn device_override_takes_effect_immediately() {
        let state = test_state();
        state.store.provision_device("dev-1", None, 0).unwrap();
        let before = state.tracker.effective_poll_interval("dev-1").unwrap();

        put_device(
            State(state.clone()),
            Path(("dev-1".to_string(), "poll_interval_ms".to_string())),
            Json(json!(600_000)),
        )
        .await;

        let after = state.tracker.effective_poll_interval("dev-1").unwrap();
        assert!(after > before);
        assert_eq!(after, 900_000);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_grace_is_rejected_and_heartbeats_keep_working() {
        let state = test_state();
        state.store.provision_device("dev-1", None, 0).unwrap();
        let resp = put_system(
            State(state.clone()),
            Path("timeout_grace_seconds".to_string()),
            Json(json!(u64::MAX)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            state.store.get_config(&ConfigScope::System, "timeout_grace_seconds").unwrap(),
            None
        );
        state.tracker.capture_heartbeat("dev-1").await.unwrap();
    }

    #[tokio::test]
    async fn invalid_value_is_rejected() {
        let state = test_state();
        let resp = put_group(
            State(state.clone()),
            Path(("fleet".to_string(), "poll_interval_ms".to_string())),
            Json(json!("soon")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = list_group(State(state), Path("fleet".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn null_is_a_storable_value() {
        let state = test_state();
        let resp = put_device(
            State(state.clone()),
            Path(("dev-1".to_string(), "online_update_cache_timeout_ms".to_string())),
            Json(Value::Null),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_device(
            State(state),
            Path(("dev-1".to_string(), "online_update_cache_timeout_ms".to_string())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
