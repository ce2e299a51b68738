//! Audit event queue: list, detail, resolve, live stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use factcheck_core::{AuditEngine, AuditEvent, AuditFilter, AuditKind, AuditStatus, Severity};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;

/// Query string form of [`AuditFilter`]. Values arrive as raw strings so a
/// bad value yields a structured 400 instead of axum's plain-text rejection.
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    pub severity: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub cohort_id: Option<String>,
}

fn parse_field<T>(field: &str, raw: Option<&str>) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
{
    raw.map(|v| {
        v.parse::<T>().map_err(|_| {
            AppError::bad_request(
                format!("invalid {field}: {v}"),
                serde_json::json!({ "field": field, "value": v }),
            )
        })
    })
    .transpose()
}

impl FilterParams {
    pub fn into_filter(self) -> Result<AuditFilter, AppError> {
        Ok(AuditFilter {
            severity: parse_field::<Severity>("severity", self.severity.as_deref())?,
            kind: parse_field::<AuditKind>("kind", self.kind.as_deref())?,
            status: parse_field::<AuditStatus>("status", self.status.as_deref())?,
            cohort_id: self.cohort_id,
        })
    }
}

pub async fn list(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Query(params): Query<FilterParams>,
) -> Result<Json<Vec<AuditEvent>>, AppError> {
    let filter = params.into_filter()?;
    Ok(Json(engine.list_audit_events(&filter).await))
}

pub async fn get(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AuditEvent>, AppError> {
    Ok(Json(engine.get_audit_event(id).await?))
}

/// GET /audit-events/:id/versions: superseded versions, oldest first.
pub async fn versions(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AuditEvent>>, AppError> {
    Ok(Json(engine.archived_versions(id).await?))
}

pub async fn resolve(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AuditEvent>, AppError> {
    let event = engine.resolve_event(id).await?;
    tracing::info!(event_id = %id, revision = event.revision, "audit event resolved");
    Ok(Json(event))
}

/// GET /audit-events/stream: SSE feed of new and revised events.
pub async fn stream(
    Extension(engine): Extension<Arc<AuditEngine>>,
    Query(params): Query<FilterParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let filter = params.into_filter()?;
    let events = engine.subscribe(filter).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default()
            .event("audit_event")
            .id(format!("{}:{}", event.id, event.revision))
            .data(data))
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}
