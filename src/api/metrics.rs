use crate::services::status::{MetricsSnapshot, StatusRegistry};
use axum::Json;
use axum::extract::State;
use std::sync::Arc;

/// `GET /metrics` — JSON snapshot of agent state for local dashboards.
pub async fn snapshot(State(status): State<Arc<StatusRegistry>>) -> Json<MetricsSnapshot> {
    Json(status.snapshot())
}
