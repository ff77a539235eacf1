//! Calibration API endpoint.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use sipsense_core::CalibrationProfile;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Body of `POST /api/calibrate`.
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrateRequest {
    /// Distance reading with the bottle empty.
    pub empty_distance_mm: u32,
    /// Distance reading with the bottle full.
    pub full_distance_mm: u32,
    /// Bottle capacity.
    pub bottle_volume_ml: f64,
}

/// Save and activate a two-point calibration for the selected bottle.
///
/// The profile is saved before it takes effect; a failed save leaves the previous
/// calibration active.
pub async fn calibrate(
    State(state): State<SharedState>,
    Json(request): Json<CalibrateRequest>,
) -> ApiResult<Json<CalibrationProfile>> {
    let orchestrator = state.read().await.orchestrator.clone();
    let profile = orchestrator
        .calibrate(
            request.empty_distance_mm,
            request.full_distance_mm,
            request.bottle_volume_ml,
        )
        .await?;
    Ok(Json(profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibrate_request_deserialization() {
        let json = r#"{"empty_distance_mm": 200, "full_distance_mm": 20, "bottle_volume_ml": 750}"#;
        let request: CalibrateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.empty_distance_mm, 200);
        assert!((request.bottle_volume_ml - 750.0).abs() < f64::EPSILON);
    }
}
