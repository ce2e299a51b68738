//! Claim ledger routes.

use std::sync::Arc;

use axum::{extract::Path, Extension, Json};
use factcheck_core::{AuditEngine, ClaimRecord};
use uuid::Uuid;

use crate::error::AppError;

/// GET /claims/review: claims whose verification kept failing.
pub async fn review(Extension(engine): Extension<Arc<AuditEngine>>) -> Json<Vec<ClaimRecord>> {
    Json(engine.claims_for_review().await)
}

pub async fn get(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClaimRecord>, AppError> {
    Ok(Json(engine.claim(id).await?))
}
