//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `devices` - Scanning, link control, snapshots and the event stream
//! - `calibration` - Two-point calibration
//! - `alerts` - Alert acknowledgment
//! - `health` - Service health checks
//! - `error` - API error types

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod alerts;
pub mod calibration;
pub mod devices;
pub mod error;
pub mod health;

pub use error::{ApiError, ApiResult, ErrorResponse};

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                          - Health check
/// /api
/// ├── POST /scan                   - Scan and wait for the window
/// ├── POST /scan/stop              - Stop the running scan
/// ├── GET  /devices                - Candidates of the last scan
/// ├── GET  /connection             - Link status
/// ├── POST /connect                - Connect to a bottle
/// ├── POST /disconnect             - Close the link
/// ├── POST /calibrate              - Calibrate the selected bottle
/// ├── POST /status-request         - Ask the bottle for diagnostics
/// ├── GET  /devices/{id}/snapshot  - Current snapshot
/// ├── GET  /devices/{id}/events    - Snapshot stream (SSE)
/// └── POST /alerts/{id}/acknowledge
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/scan", post(devices::scan))
                .route("/scan/stop", post(devices::stop_scan))
                .route("/devices", get(devices::list_devices))
                .route("/connection", get(devices::connection))
                .route("/connect", post(devices::connect))
                .route("/disconnect", post(devices::disconnect))
                .route("/calibrate", post(calibration::calibrate))
                .route("/status-request", post(devices::request_status))
                .route("/devices/{id}/snapshot", get(devices::snapshot))
                .route("/devices/{id}/events", get(devices::events))
                .route("/alerts/{id}/acknowledge", post(alerts::acknowledge)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
