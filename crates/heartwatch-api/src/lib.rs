//! heartwatch-api: REST API for Heartwatch.
//!
//! Authentication happens in front of this router; a request that reaches
//! a handler is already trusted.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/devices` | List devices |
//! | POST | `/api/v1/devices` | Provision a device |
//! | GET | `/api/v1/devices/{id}` | Device heartbeat state |
//! | DELETE | `/api/v1/devices/{id}` | Remove a device |
//! | POST | `/api/v1/devices/{id}/heartbeat` | Record a heartbeat |
//! | GET | `/api/v1/devices/{id}/poll-interval` | Effective poll interval |
//! | POST | `/api/v1/devices/{id}/reports/{kind}` | Submit a telemetry report |
//! | GET | `/api/v1/stats` | Tracker counters for the current window |
//! | GET | `/api/v1/config/system` | List system config |
//! | GET/PUT/DELETE | `/api/v1/config/system/{key}` | System config value |
//! | GET | `/api/v1/config/groups/{gid}` | List group config |
//! | GET/PUT/DELETE | `/api/v1/config/groups/{gid}/{key}` | Group config value |
//! | GET | `/api/v1/config/devices/{id}` | List device config |
//! | GET/PUT/DELETE | `/api/v1/config/devices/{id}/{key}` | Device config value |

pub mod config_handlers;
pub mod handlers;
mod response;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use heartwatch_core::Clock;
use heartwatch_state::StateStore;
use heartwatch_tracker::{HeartbeatTracker, ReportThrottle};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub tracker: Arc<HeartbeatTracker>,
    pub throttle: Arc<ReportThrottle>,
    pub clock: Arc<dyn Clock>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/devices", get(handlers::list_devices).post(handlers::provision_device))
        .route("/devices/{id}", get(handlers::get_device).delete(handlers::delete_device))
        .route("/devices/{id}/heartbeat", post(handlers::heartbeat))
        .route("/devices/{id}/poll-interval", get(handlers::poll_interval))
        .route("/devices/{id}/reports/{kind}", post(handlers::submit_report))
        .route("/stats", get(handlers::stats))
        .route("/config/system", get(config_handlers::list_system))
        .route(
            "/config/system/{key}",
            get(config_handlers::get_system)
                .put(config_handlers::put_system)
                .delete(config_handlers::delete_system),
        )
        .route("/config/groups/{gid}", get(config_handlers::list_group))
        .route(
            "/config/groups/{gid}/{key}",
            get(config_handlers::get_group)
                .put(config_handlers::put_group)
                .delete(config_handlers::delete_group),
        )
        .route("/config/devices/{id}", get(config_handlers::list_device))
        .route(
            "/config/devices/{id}/{key}",
            get(config_handlers::get_device)
                .put(config_handlers::put_device)
                .delete(config_handlers::delete_device),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
