//! GET /health: liveness plus a few engine counters.

use std::sync::Arc;

use axum::{Extension, Json};
use factcheck_core::AuditEngine;

pub async fn health(Extension(engine): Extension<Arc<AuditEngine>>) -> Json<serde_json::Value> {
    let health = engine.health().await;
    Json(serde_json::json!({
        "status": "ok",
        "cohorts": health.cohorts,
        "pending_events": health.pending_events,
        "claims_for_review": health.claims_for_review,
    }))
}
