//! POST /observations: submit one raw observation.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{extract::Path, Extension, Json};
use factcheck_core::{AuditEngine, ClaimRecord, RawInput, SourceChannel, Submission};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub channel: SourceChannel,
    #[serde(flatten)]
    pub raw: RawInput,
}

pub async fn submit(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Submission>), AppError> {
    let submission = engine.submit_observation(req.raw, req.channel).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

/// GET /observations/:id/claims
pub async fn claims(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Path(id): Path<Uuid>,
) -> Json<Vec<ClaimRecord>> {
    Json(engine.claims_from(id).await)
}
