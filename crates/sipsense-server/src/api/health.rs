//! Health check API endpoint.
//!
//! Provides a simple health check endpoint for monitoring and load balancers.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sipsense_core::ConnectionState;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,

    /// Service version from Cargo.toml.
    pub version: String,

    /// Seconds since the server started.
    pub uptime_secs: u64,

    /// Current link state.
    pub connection_state: ConnectionState,
}

/// Creates the health router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", get(health_check))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let state_guard = state.read().await;

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state_guard.started_at.elapsed().as_secs(),
        connection_state: state_guard.orchestrator.connection_status().state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            uptime_secs: 12,
            connection_state: ConnectionState::Idle,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"connection_state\":\"idle\""));
    }
}
