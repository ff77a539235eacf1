//! Link and device API endpoints.
//!
//! Scanning, connecting, per-device snapshots and the snapshot event stream.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use sipsense_core::{
    is_valid_device_id, ConnectionError, ConnectionState, ConnectionStatus, DeviceId,
    DeviceSnapshot, DiscoveredDevice,
};
use tracing::{debug, info};

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Longest scan window a client may ask for.
const MAX_SCAN_TIMEOUT_MS: u64 = 60_000;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /api/scan`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    /// Scan window. The configured window when absent.
    pub timeout_ms: Option<u64>,
}

/// Result of a completed scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    /// Candidates, in discovery order.
    pub devices: Vec<DiscoveredDevice>,
    /// How long the scan ran.
    pub scan_duration_ms: u64,
    /// When the scan ended.
    pub scanned_at_utc: DateTime<Utc>,
}

/// Candidate list of the current or last scan.
#[derive(Debug, Clone, Serialize)]
pub struct DevicesResponse {
    /// Candidates, in discovery order.
    pub devices: Vec<DiscoveredDevice>,
}

/// Link status.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionResponse {
    /// State machine state.
    pub state: ConnectionState,
    /// Selected device.
    pub device_id: Option<DeviceId>,
    /// Current reconnection attempt, 0 when not reconnecting.
    pub attempt: u32,
    /// Code of the last link failure.
    pub last_error_code: Option<String>,
    /// Description of the last link failure.
    pub last_error: Option<String>,
    /// When the state last changed.
    pub changed_at_utc: DateTime<Utc>,
}

impl From<ConnectionStatus> for ConnectionResponse {
    fn from(status: ConnectionStatus) -> Self {
        let code = status
            .last_error
            .clone()
            .map(|e| sipsense_core::SipsenseError::from(e).error_code().to_string());
        Self {
            state: status.state,
            device_id: status.device_id,
            attempt: status.attempt,
            last_error_code: code,
            last_error: status.last_error.map(|e| e.to_string()),
            changed_at_utc: status.changed_at,
        }
    }
}

/// Body of `POST /api/connect`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    /// Radio address of the bottle.
    pub device_id: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Scan and wait for the window to close.
///
/// Stopping the scan early (`POST /api/scan/stop`) returns what was found so far.
pub async fn scan(
    State(state): State<SharedState>,
    body: Bytes,
) -> ApiResult<Json<ScanResponse>> {
    // The body is optional; an empty one means the configured window.
    let request: ScanRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ScanRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest {
            error_code: "invalid_body".to_string(),
            message: e.to_string(),
        })?
    };
    let timeout = match request.timeout_ms {
        Some(0) | None => None,
        Some(ms) if ms > MAX_SCAN_TIMEOUT_MS => {
            return Err(ApiError::BadRequest {
                error_code: "invalid_scan_timeout".to_string(),
                message: format!("timeout_ms must be at most {MAX_SCAN_TIMEOUT_MS}"),
            });
        }
        Some(ms) => Some(Duration::from_millis(ms)),
    };

    let orchestrator = state.read().await.orchestrator.clone();
    let started = Instant::now();
    let handle = orchestrator.scan(timeout).await?;
    let devices = match handle.finished().await {
        Ok(devices) => devices,
        Err(ConnectionError::Timeout | ConnectionError::Cancelled) => {
            orchestrator.discovered_devices()
        }
        Err(e) => return Err(e.into()),
    };
    info!(found = devices.len(), "Scan request finished");

    Ok(Json(ScanResponse {
        devices,
        scan_duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        scanned_at_utc: Utc::now(),
    }))
}

/// Stop the running scan.
pub async fn stop_scan(State(state): State<SharedState>) -> StatusCode {
    let orchestrator = state.read().await.orchestrator.clone();
    orchestrator.stop_scan().await;
    StatusCode::NO_CONTENT
}

/// Candidates of the current or last scan.
pub async fn list_devices(State(state): State<SharedState>) -> Json<DevicesResponse> {
    let devices = state.read().await.orchestrator.discovered_devices();
    Json(DevicesResponse { devices })
}

/// Current link status.
pub async fn connection(State(state): State<SharedState>) -> Json<ConnectionResponse> {
    let status = state.read().await.orchestrator.connection_status();
    Json(status.into())
}

/// Connect to a discovered bottle.
pub async fn connect(
    State(state): State<SharedState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Json<ConnectionResponse>> {
    if !is_valid_device_id(request.device_id.trim()) {
        return Err(ApiError::BadRequest {
            error_code: "invalid_device_id".to_string(),
            message: format!("'{}' is not a device address", request.device_id),
        });
    }
    let device_id = DeviceId::new(&request.device_id);
    let orchestrator = state.read().await.orchestrator.clone();
    orchestrator.connect(&device_id).await?;
    Ok(Json(orchestrator.connection_status().into()))
}

/// Close the link.
pub async fn disconnect(State(state): State<SharedState>) -> Json<ConnectionResponse> {
    let orchestrator = state.read().await.orchestrator.clone();
    orchestrator.disconnect().await;
    Json(orchestrator.connection_status().into())
}

/// Ask the bottle for a status reply; it arrives as snapshot diagnostics.
pub async fn request_status(State(state): State<SharedState>) -> ApiResult<StatusCode> {
    let orchestrator = state.read().await.orchestrator.clone();
    orchestrator.request_status().await?;
    Ok(StatusCode::ACCEPTED)
}

/// Current snapshot of a device.
pub async fn snapshot(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeviceSnapshot>> {
    let orchestrator = state.read().await.orchestrator.clone();
    Ok(Json(orchestrator.snapshot(&DeviceId::new(&id)).await?))
}

/// Server-sent events: one `snapshot` event now and one per change.
pub async fn events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let device_id = DeviceId::new(&id);
    let orchestrator = state.read().await.orchestrator.clone();
    let rx = orchestrator.subscribe(&device_id).await?;
    debug!(device_id = %device_id, "Snapshot stream opened");
    Ok(Sse::new(snapshot_events(rx)).keep_alive(KeepAlive::default()))
}

fn snapshot_events(
    rx: tokio::sync::watch::Receiver<DeviceSnapshot>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let snapshot = rx.borrow_and_update().clone();
        let event = Event::default()
            .event("snapshot")
            .json_data(&snapshot)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Some((Ok(event), (rx, false)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_request_defaults() {
        let request: ScanRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.timeout_ms, None);
        let request: ScanRequest = serde_json::from_str(r#"{"timeout_ms": 1500}"#).unwrap();
        assert_eq!(request.timeout_ms, Some(1500));
    }

    #[test]
    fn connection_response_names_the_error() {
        let status = ConnectionStatus {
            state: ConnectionState::Idle,
            device_id: Some(DeviceId::new("AA:BB:CC:DD:EE:FF")),
            attempt: 0,
            last_error: Some(ConnectionError::Lost { attempts: 8 }),
            changed_at: Utc::now(),
        };
        let response = ConnectionResponse::from(status);
        assert_eq!(response.last_error_code.as_deref(), Some("CONNECTION_LOST"));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"state\":\"idle\""));
    }
}
