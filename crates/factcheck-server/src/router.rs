//! Router construction for the factcheck server.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use factcheck_core::AuditEngine;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Build the full axum router with all routes and middleware.
pub fn build_router(engine: Arc<AuditEngine>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        // Ingestion
        .route("/observations", post(handlers::observations::submit))
        .route(
            "/observations/:id/claims",
            get(handlers::observations::claims),
        )
        // Audit queue. The stream route must precede /:id.
        .route("/audit-events", get(handlers::audit_events::list))
        .route("/audit-events/stream", get(handlers::audit_events::stream))
        .route("/audit-events/:id", get(handlers::audit_events::get))
        .route(
            "/audit-events/:id/versions",
            get(handlers::audit_events::versions),
        )
        .route(
            "/audit-events/:id/resolve",
            post(handlers::audit_events::resolve),
        )
        // Drill-down
        .route("/deviations/:claim_id", get(handlers::details::deviation))
        .route("/anomalies", get(handlers::details::anomalies))
        .route(
            "/sentiment-windows",
            get(handlers::details::sentiment_windows),
        )
        // Claim ledger
        .route("/claims/review", get(handlers::claims::review))
        .route("/claims/:id", get(handlers::claims::get))
        .layer(Extension(engine))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
