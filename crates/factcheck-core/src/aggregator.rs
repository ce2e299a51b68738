//! Case aggregation
//!
//! Turns deviation and anomaly records into [`AuditEvent`]s, keeps an
//! append-only log of every event version, and fans new versions out to
//! subscribers.
//!
//! Severity is copied from the underlying record as-is. Deviations are
//! deduplicated per claim: a second record for the same claim produces a new
//! revision of the same event and archives the previous revision.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::scorer::format_value;
use crate::types::{
    AnomalyRecord, AuditEvent, AuditFilter, AuditKind, AuditStatus, DetailRef, DeviationRecord,
    TimeRange,
};

/// Live audit events. Delivery is at-least-once: after a lagging subscriber
/// is caught up from the current view, an event may be seen twice.
pub type AuditEventStream = BoxStream<'static, AuditEvent>;

#[derive(Default)]
struct AggregatorState {
    /// Every version of every event, in write order.
    log: Vec<AuditEvent>,
    current: HashMap<Uuid, AuditEvent>,
    event_for_claim: HashMap<Uuid, Uuid>,
    deviations: HashMap<Uuid, DeviationRecord>,
    superseded_deviations: HashMap<Uuid, Vec<DeviationRecord>>,
    anomalies: Vec<AnomalyRecord>,
}

impl AggregatorState {
    fn record(&mut self, event: AuditEvent) {
        self.log.push(event.clone());
        self.current.insert(event.id, event);
    }
}

pub struct CaseAggregator {
    config: Arc<EngineConfig>,
    state: Arc<RwLock<AggregatorState>>,
    tx: broadcast::Sender<AuditEvent>,
}

impl CaseAggregator {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let (tx, _) = broadcast::channel(config.subscription_buffer);
        Self {
            config,
            state: Arc::new(RwLock::new(AggregatorState::default())),
            tx,
        }
    }

    fn publish(&self, event: &AuditEvent) {
        // no receivers is fine
        let _ = self.tx.send(event.clone());
    }

    pub async fn on_deviation(&self, record: DeviationRecord) -> AuditEvent {
        let now = Utc::now();
        let title = format!(
            "{} reported {} of {} against {} on record",
            record.actor_id,
            record.metric,
            format_value(record.asserted_value),
            format_value(record.resolved_value)
        );

        let mut state = self.state.write().await;
        let prior = state
            .event_for_claim
            .get(&record.claim_id)
            .and_then(|id| state.current.get(id))
            .cloned();
        if let (Some(prior), Some(stored)) = (&prior, state.deviations.get(&record.claim_id)) {
            if stored.scored_at > record.scored_at {
                tracing::debug!(
                    event_id = %prior.id,
                    claim_id = %record.claim_id,
                    "ignoring deviation scored before the current one"
                );
                return prior.clone();
            }
        }
        let event = match prior {
            Some(prior) => {
                if let Some(old) = state.deviations.remove(&record.claim_id) {
                    state
                        .superseded_deviations
                        .entry(record.claim_id)
                        .or_default()
                        .push(old);
                }
                tracing::info!(
                    event_id = %prior.id,
                    claim_id = %record.claim_id,
                    revision = prior.revision + 1,
                    "deviation superseded prior revision"
                );
                AuditEvent {
                    severity: record.severity,
                    title,
                    summary: record.root_cause_narrative.clone(),
                    subject_actor_id: Some(record.actor_id.clone()),
                    updated_at: now,
                    status: AuditStatus::Pending,
                    revision: prior.revision + 1,
                    ..prior
                }
            }
            None => {
                let event = AuditEvent {
                    id: Uuid::new_v4(),
                    kind: AuditKind::FactDeviation,
                    severity: record.severity,
                    title,
                    summary: record.root_cause_narrative.clone(),
                    subject_actor_id: Some(record.actor_id.clone()),
                    department_or_cohort: record.cohort_id.clone(),
                    owner: self.config.owner_for(&record.cohort_id),
                    created_at: now,
                    updated_at: now,
                    status: AuditStatus::Pending,
                    revision: 1,
                    detail_ref: DetailRef::Deviation {
                        claim_id: record.claim_id,
                    },
                };
                state.event_for_claim.insert(record.claim_id, event.id);
                tracing::info!(
                    event_id = %event.id,
                    claim_id = %record.claim_id,
                    severity = %event.severity,
                    "fact deviation recorded"
                );
                event
            }
        };

        state.deviations.insert(record.claim_id, record);
        state.record(event.clone());
        self.publish(&event);
        event
    }

    pub async fn on_anomaly(&self, record: AnomalyRecord) -> AuditEvent {
        let now = Utc::now();
        let summary = format!(
            "Private sentiment averaged {:.2} over {} messages while public sentiment averaged {:.2} \
             between {} and {}.{}",
            record.private_mean,
            record.private_sample_count,
            record.public_mean,
            record.window_start.format("%Y-%m-%d %H:%M"),
            record.window_end.format("%Y-%m-%d %H:%M"),
            if record.trigger_keywords.is_empty() {
                String::new()
            } else {
                format!(" Recurring terms: {}.", record.trigger_keywords.join(", "))
            }
        );
        let event = AuditEvent {
            id: Uuid::new_v4(),
            kind: AuditKind::SentimentAnomaly,
            severity: record.severity,
            title: format!(
                "Private sentiment diverges from public in {} ({:.2})",
                record.cohort_id, record.divergence_score
            ),
            summary,
            subject_actor_id: None,
            department_or_cohort: record.cohort_id.clone(),
            owner: self.config.owner_for(&record.cohort_id),
            created_at: now,
            updated_at: now,
            status: AuditStatus::Pending,
            revision: 1,
            detail_ref: DetailRef::Anomaly {
                anomaly_id: record.id,
            },
        };

        let mut state = self.state.write().await;
        state.anomalies.push(record);
        state.record(event.clone());
        self.publish(&event);
        tracing::info!(event_id = %event.id, cohort = %event.department_or_cohort, "sentiment anomaly recorded");
        event
    }

    pub async fn get(&self, event_id: Uuid) -> Option<AuditEvent> {
        self.state.read().await.current.get(&event_id).cloned()
    }

    /// Current versions matching `filter`, most recently updated first.
    pub async fn list(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let state = self.state.read().await;
        let mut out: Vec<_> = state
            .current
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Pending events matching the rest of `filter`. Any status in the
    /// filter is overridden.
    pub async fn list_pending(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let pending = AuditFilter {
            status: Some(AuditStatus::Pending),
            ..filter.clone()
        };
        self.list(&pending).await
    }

    /// Superseded versions of one event, oldest first.
    pub async fn archived_versions(&self, event_id: Uuid) -> Vec<AuditEvent> {
        let state = self.state.read().await;
        let mut versions: Vec<_> = state
            .log
            .iter()
            .filter(|e| e.id == event_id)
            .cloned()
            .collect();
        versions.pop();
        versions
    }

    /// Mark an event resolved. Resolving an already-resolved event returns
    /// it unchanged.
    pub async fn resolve(&self, event_id: Uuid) -> Result<AuditEvent> {
        let mut state = self.state.write().await;
        let current = state
            .current
            .get(&event_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("audit event {event_id}")))?;
        if current.status == AuditStatus::Resolved {
            return Ok(current);
        }
        let resolved = AuditEvent {
            status: AuditStatus::Resolved,
            updated_at: Utc::now(),
            revision: current.revision + 1,
            ..current
        };
        state.record(resolved.clone());
        self.publish(&resolved);
        tracing::info!(event_id = %event_id, "audit event resolved");
        Ok(resolved)
    }

    pub async fn deviation_detail(&self, claim_id: Uuid) -> Option<DeviationRecord> {
        self.state.read().await.deviations.get(&claim_id).cloned()
    }

    pub async fn superseded_deviations(&self, claim_id: Uuid) -> Vec<DeviationRecord> {
        self.state
            .read()
            .await
            .superseded_deviations
            .get(&claim_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn anomaly_detail(&self, cohort_id: &str, range: &TimeRange) -> Vec<AnomalyRecord> {
        self.state
            .read()
            .await
            .anomalies
            .iter()
            .filter(|a| a.cohort_id == cohort_id && range.overlaps(a.window_start, a.window_end))
            .cloned()
            .collect()
    }

    /// New event versions matching `filter`, as they are written.
    pub fn subscribe(&self, filter: AuditFilter) -> AuditEventStream {
        let sub = Subscription {
            inner: BroadcastStream::new(self.tx.subscribe()),
            filter,
            state: self.state.clone(),
            last_seen: None,
            backlog: VecDeque::new(),
        };
        stream::unfold(sub, |mut sub| async move {
            let event = sub.next_event().await?;
            Some((event, sub))
        })
        .boxed()
    }
}

struct Subscription {
    inner: BroadcastStream<AuditEvent>,
    filter: AuditFilter,
    state: Arc<RwLock<AggregatorState>>,
    last_seen: Option<DateTime<Utc>>,
    backlog: VecDeque<AuditEvent>,
}

impl Subscription {
    async fn next_event(&mut self) -> Option<AuditEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                self.last_seen = Some(event.updated_at);
                return Some(event);
            }
            match self.inner.next().await? {
                Ok(event) if self.filter.matches(&event) => {
                    self.last_seen = Some(event.updated_at);
                    return Some(event);
                }
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "audit subscriber lagged, replaying current view");
                    self.backlog = self.catch_up().await;
                }
            }
        }
    }

    async fn catch_up(&self) -> VecDeque<AuditEvent> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .current
            .values()
            .filter(|e| self.filter.matches(e))
            .filter(|e| self.last_seen.map_or(true, |seen| e.updated_at >= seen))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.updated_at);
        events.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn deviation(claim_id: Uuid, severity: Severity, narrative: &str) -> DeviationRecord {
        DeviationRecord {
            claim_id,
            cohort_id: "finance".into(),
            actor_id: "cfo".into(),
            metric: "q3 revenue".into(),
            asserted_value: 5.2e6,
            resolved_value: 3.8e6,
            delta_absolute: 1.4e6,
            delta_percent: Some(1.4 / 3.8),
            severity,
            confidence: 0.9,
            evidence_observation_ids: vec![Uuid::new_v4()],
            root_cause_narrative: narrative.into(),
            impact_estimate: BTreeMap::new(),
            scored_at: Utc::now(),
        }
    }

    fn anomaly(cohort: &str, start: DateTime<Utc>) -> AnomalyRecord {
        AnomalyRecord {
            id: Uuid::new_v4(),
            cohort_id: cohort.into(),
            public_window_id: Uuid::new_v4(),
            private_window_id: Uuid::new_v4(),
            public_mean: 0.3,
            private_mean: -0.6,
            private_sample_count: 12,
            divergence_score: 0.9,
            severity: Severity::High,
            trigger_keywords: vec!["delay".into()],
            window_start: start,
            window_end: start + chrono::Duration::days(1),
            detected_at: Utc::now(),
        }
    }

    fn aggregator() -> CaseAggregator {
        let mut config = EngineConfig::default();
        config.owners.insert("finance".into(), "controller".into());
        CaseAggregator::new(Arc::new(config))
    }

    #[tokio::test]
    async fn test_deviation_severity_passes_through() {
        let agg = aggregator();
        for sev in [Severity::Low, Severity::Medium, Severity::High, Severity::Unscored] {
            let event = agg.on_deviation(deviation(Uuid::new_v4(), sev, "n")).await;
            assert_eq!(event.severity, sev);
            assert_eq!(event.kind, AuditKind::FactDeviation);
            assert_eq!(event.owner.as_deref(), Some("controller"));
        }
    }

    #[tokio::test]
    async fn test_same_claim_collapses_to_one_event() {
        let agg = aggregator();
        let claim_id = Uuid::new_v4();
        let first = agg.on_deviation(deviation(claim_id, Severity::High, "first")).await;
        agg.resolve(first.id).await.unwrap();
        let second = agg.on_deviation(deviation(claim_id, Severity::Medium, "second")).await;

        assert_eq!(first.id, second.id);
        assert_eq!(second.revision, 3);
        assert_eq!(second.status, AuditStatus::Pending);
        assert_eq!(second.severity, Severity::Medium);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(agg.list(&AuditFilter::default()).await.len(), 1);
        assert_eq!(agg.archived_versions(first.id).await.len(), 2);

        let detail = agg.deviation_detail(claim_id).await.unwrap();
        assert_eq!(detail.root_cause_narrative, "second");
        let archived = agg.superseded_deviations(claim_id).await;
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].root_cause_narrative, "first");
    }

    #[tokio::test]
    async fn test_older_score_does_not_overwrite_newer() {
        let agg = aggregator();
        let claim_id = Uuid::new_v4();
        let mut stale = deviation(claim_id, Severity::High, "stale");
        stale.scored_at = Utc::now() - chrono::Duration::seconds(30);
        let fresh = deviation(claim_id, Severity::Low, "fresh");

        let current = agg.on_deviation(fresh).await;
        let after = agg.on_deviation(stale).await;

        assert_eq!(after, current);
        assert_eq!(after.severity, Severity::Low);
        assert_eq!(after.revision, 1);
        let detail = agg.deviation_detail(claim_id).await.unwrap();
        assert_eq!(detail.root_cause_narrative, "fresh");
        assert!(agg.superseded_deviations(claim_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let agg = aggregator();
        let event = agg
            .on_deviation(deviation(Uuid::new_v4(), Severity::High, "n"))
            .await;
        let once = agg.resolve(event.id).await.unwrap();
        let twice = agg.resolve(event.id).await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.status, AuditStatus::Resolved);
        assert_eq!(agg.archived_versions(event.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_pending_skips_resolved() {
        let agg = aggregator();
        let open = agg
            .on_deviation(deviation(Uuid::new_v4(), Severity::High, "open"))
            .await;
        let closed = agg
            .on_deviation(deviation(Uuid::new_v4(), Severity::Low, "closed"))
            .await;
        agg.resolve(closed.id).await.unwrap();

        let filter = AuditFilter {
            status: Some(AuditStatus::Resolved),
            ..Default::default()
        };
        let pending = agg.list_pending(&filter).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open.id);
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_not_found() {
        let agg = aggregator();
        let err = agg.resolve(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_anomaly_has_no_subject_and_filters_by_range() {
        let agg = aggregator();
        let start = Utc::now() - chrono::Duration::days(3);
        let event = agg.on_anomaly(anomaly("eng", start)).await;
        assert!(event.subject_actor_id.is_none());
        assert_eq!(event.kind, AuditKind::SentimentAnomaly);
        assert!(event.owner.is_none());

        let hit = TimeRange::new(start, start + chrono::Duration::hours(1));
        let miss = TimeRange::new(start - chrono::Duration::days(5), start);
        assert_eq!(agg.anomaly_detail("eng", &hit).await.len(), 1);
        assert!(agg.anomaly_detail("eng", &miss).await.is_empty());
        assert!(agg.anomaly_detail("ops", &hit).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let agg = aggregator();
        agg.on_deviation(deviation(Uuid::new_v4(), Severity::High, "n")).await;
        agg.on_deviation(deviation(Uuid::new_v4(), Severity::Low, "n")).await;
        agg.on_anomaly(anomaly("eng", Utc::now())).await;

        let high = AuditFilter {
            severity: Some(Severity::High),
            ..Default::default()
        };
        assert_eq!(agg.list(&high).await.len(), 2);
        let deviations = AuditFilter {
            kind: Some(AuditKind::FactDeviation),
            ..Default::default()
        };
        assert_eq!(agg.list(&deviations).await.len(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_receives_matching_events() {
        let agg = aggregator();
        let mut stream = agg.subscribe(AuditFilter {
            kind: Some(AuditKind::SentimentAnomaly),
            ..Default::default()
        });
        agg.on_deviation(deviation(Uuid::new_v4(), Severity::High, "n")).await;
        let published = agg.on_anomaly(anomaly("eng", Utc::now())).await;

        let got = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, published.id);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_catches_up() {
        let mut config = EngineConfig::default();
        config.subscription_buffer = 2;
        let agg = CaseAggregator::new(Arc::new(config));
        let mut stream = agg.subscribe(AuditFilter::default());

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(
                agg.on_deviation(deviation(Uuid::new_v4(), Severity::Low, "n"))
                    .await
                    .id,
            );
        }

        let mut seen = std::collections::HashSet::new();
        while seen.len() < ids.len() {
            let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap();
            seen.insert(event.id);
        }
        assert!(ids.iter().all(|id| seen.contains(id)));
    }
}
