//! Alert API endpoints.

use axum::extract::{Path, State};
use axum::Json;
use sipsense_core::Alert;
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Acknowledge an open alert. A later recurrence may raise a fresh one.
pub async fn acknowledge(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Alert>> {
    let orchestrator = state.read().await.orchestrator.clone();
    Ok(Json(orchestrator.acknowledge_alert(id).await?))
}
