use crate::services::status::StatusRegistry;
use axum::Router;
use axum::routing::get;
use std::sync::Arc;

pub mod metrics;

/// Management router bound to the loopback metrics port.
pub fn mgmt_router(status: Arc<StatusRegistry>) -> Router {
    Router::new().route("/metrics", get(metrics::snapshot)).with_state(status)
}
