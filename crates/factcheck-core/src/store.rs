//! Observation persistence.
//!
//! The resolver and the engine talk to evidence exclusively through
//! [`ObservationStore`], so a database-backed pool can replace the in-memory
//! one without touching the pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::types::{normalize_metric, Observation, SourceChannel, Visibility};

/// Selection criteria for evidence lookups. Time bounds are inclusive.
#[derive(Debug, Clone)]
pub struct EvidenceQuery {
    pub cohort_id: String,
    /// Empty means every channel.
    pub channels: Vec<SourceChannel>,
    pub actor_id: Option<String>,
    /// Matched against normalized record metrics; text payloads never match.
    pub metric: Option<String>,
    pub visibility: Option<Visibility>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl EvidenceQuery {
    pub fn for_cohort(cohort_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            cohort_id: cohort_id.to_string(),
            channels: Vec::new(),
            actor_id: None,
            metric: None,
            visibility: None,
            from,
            to,
        }
    }

    pub fn matches(&self, obs: &Observation) -> bool {
        if obs.cohort_id != self.cohort_id || obs.timestamp < self.from || obs.timestamp > self.to
        {
            return false;
        }
        if !self.channels.is_empty() && !self.channels.contains(&obs.source_channel) {
            return false;
        }
        if let Some(actor) = &self.actor_id {
            if &obs.actor_id != actor {
                return false;
            }
        }
        if let Some(vis) = self.visibility {
            if obs.visibility != vis {
                return false;
            }
        }
        match &self.metric {
            Some(metric) => obs
                .record()
                .is_some_and(|(m, _, _)| normalize_metric(m) == *metric),
            None => true,
        }
    }
}

/// Append-only observation pool.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Persist an observation. Rejects a `supersedes` reference to an
    /// unknown observation or one from another cohort; nothing is stored then.
    async fn insert(&self, observation: Observation) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Observation>>;

    /// Current (non-superseded) observations matching `query`, oldest first.
    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<Observation>>;

    async fn is_superseded(&self, id: Uuid) -> Result<bool>;
}

#[derive(Default)]
struct CohortLog {
    observations: Vec<Observation>,
    superseded: HashSet<Uuid>,
}

/// In-memory store partitioned per cohort so writers to different cohorts
/// never contend on the same lock.
#[derive(Default)]
pub struct MemoryObservationStore {
    cohorts: RwLock<HashMap<String, Arc<RwLock<CohortLog>>>>,
    index: RwLock<HashMap<Uuid, String>>,
}

impl MemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cohort(&self, cohort_id: &str) -> Arc<RwLock<CohortLog>> {
        if let Some(log) = self.cohorts.read().await.get(cohort_id) {
            return log.clone();
        }
        self.cohorts
            .write()
            .await
            .entry(cohort_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ObservationStore for MemoryObservationStore {
    async fn insert(&self, observation: Observation) -> Result<()> {
        let log = self.cohort(&observation.cohort_id).await;
        let mut log = log.write().await;

        if let Some(target) = observation.supersedes {
            let known = log.observations.iter().any(|o| o.id == target);
            if !known {
                return Err(EngineError::MalformedObservation {
                    channel: observation.source_channel,
                    reason: format!(
                        "supersedes unknown observation {target} in cohort {}",
                        observation.cohort_id
                    ),
                });
            }
            log.superseded.insert(target);
        }

        self.index
            .write()
            .await
            .insert(observation.id, observation.cohort_id.clone());
        log.observations.push(observation);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Observation>> {
        let Some(cohort_id) = self.index.read().await.get(&id).cloned() else {
            return Ok(None);
        };
        let log = self.cohort(&cohort_id).await;
        let log = log.read().await;
        Ok(log.observations.iter().find(|o| o.id == id).cloned())
    }

    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<Observation>> {
        let Some(log) = self.cohorts.read().await.get(&query.cohort_id).cloned() else {
            return Ok(Vec::new());
        };
        let log = log.read().await;
        let mut out: Vec<Observation> = log
            .observations
            .iter()
            .filter(|o| !log.superseded.contains(&o.id) && query.matches(o))
            .cloned()
            .collect();
        out.sort_by_key(|o| o.ordering_key());
        Ok(out)
    }

    async fn is_superseded(&self, id: Uuid) -> Result<bool> {
        let Some(cohort_id) = self.index.read().await.get(&id).cloned() else {
            return Err(EngineError::NotFound(format!("observation {id}")));
        };
        let log = self.cohort(&cohort_id).await;
        let superseded = log.read().await.superseded.contains(&id);
        Ok(superseded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RawInput, SourceAdapter};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_query_filters_by_cohort_metric_and_time() {
        let adapter = SourceAdapter::new();
        let store = MemoryObservationStore::new();
        for (cohort, metric, days) in [
            ("finance", "Revenue", 1),
            ("finance", "budget", 2),
            ("ops", "revenue", 3),
            ("finance", "revenue", 200),
        ] {
            let obs = adapter
                .ingest(
                    RawInput::record("erp", cohort, metric, 1.0).at(t0() + Duration::days(days)),
                    SourceChannel::Ledger,
                    t0(),
                )
                .unwrap();
            store.insert(obs).await.unwrap();
        }

        let mut q = EvidenceQuery::for_cohort("finance", t0(), t0() + Duration::days(30));
        q.metric = Some("revenue".into());
        let hits = store.query(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record().unwrap().0, "Revenue");
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn test_superseded_observations_are_hidden() {
        let adapter = SourceAdapter::new();
        let store = MemoryObservationStore::new();
        let old = adapter
            .ingest(
                RawInput::record("erp", "finance", "revenue", 1.0).at(t0()),
                SourceChannel::Ledger,
                t0(),
            )
            .unwrap();
        let old_id = old.id;
        store.insert(old).await.unwrap();

        let mut raw = RawInput::record("erp", "finance", "revenue", 2.0).at(t0());
        raw.supersedes = Some(old_id);
        let newer = adapter.ingest(raw, SourceChannel::Ledger, t0()).unwrap();
        store.insert(newer).await.unwrap();

        let q = EvidenceQuery::for_cohort("finance", t0(), t0() + Duration::days(1));
        let hits = store.query(&q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record().unwrap().1, 2.0);
        assert!(store.is_superseded(old_id).await.unwrap());
        // still retrievable by id
        assert!(store.get(old_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_supersede_unknown_is_rejected_without_storing() {
        let adapter = SourceAdapter::new();
        let store = MemoryObservationStore::new();
        let mut raw = RawInput::record("erp", "finance", "revenue", 2.0);
        raw.supersedes = Some(Uuid::new_v4());
        let obs = adapter.ingest(raw, SourceChannel::Ledger, t0()).unwrap();
        let err = store.insert(obs).await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedObservation { .. }));
        assert!(store.is_empty().await);
    }
}
