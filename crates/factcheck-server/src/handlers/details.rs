//! Drill-down routes behind an audit event.

use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use factcheck_core::{AnomalyRecord, AuditEngine, DeviationRecord, SentimentWindow, TimeRange};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

const DEFAULT_RANGE_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub cohort_id: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl RangeParams {
    fn range(&self) -> Result<TimeRange, AppError> {
        let to = self.to.unwrap_or_else(Utc::now);
        let from = self
            .from
            .unwrap_or_else(|| {
                to.checked_sub_signed(Duration::days(DEFAULT_RANGE_DAYS))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            });
        if from >= to {
            return Err(AppError::bad_request(
                "from must be before to",
                serde_json::json!({ "from": from, "to": to }),
            ));
        }
        Ok(TimeRange::new(from, to))
    }
}

#[derive(Debug, Serialize)]
pub struct DeviationDetail {
    pub current: DeviationRecord,
    /// Earlier scorings replaced by a ledger correction.
    pub superseded: Vec<DeviationRecord>,
}

/// GET /deviations/:claim_id
pub async fn deviation(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Path(claim_id): Path<Uuid>,
) -> Result<Json<DeviationDetail>, AppError> {
    let current = engine.get_deviation_detail(claim_id).await?;
    let superseded = engine.superseded_deviations(claim_id).await;
    Ok(Json(DeviationDetail { current, superseded }))
}

/// GET /anomalies?cohort_id=..&from=..&to=..
pub async fn anomalies(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<AnomalyRecord>>, AppError> {
    let range = params.range()?;
    Ok(Json(engine.get_anomaly_detail(&params.cohort_id, &range).await))
}

/// GET /sentiment-windows?cohort_id=..&from=..&to=..
pub async fn sentiment_windows(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<SentimentWindow>>, AppError> {
    let range = params.range()?;
    Ok(Json(engine.sentiment_windows(&params.cohort_id, &range).await))
}
