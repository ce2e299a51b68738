//! `AuditEngine`: the service facade wiring the pipeline together.
//!
//! Submission path for one observation:
//!
//! 1. normalize ([`SourceAdapter`]) and persist ([`ObservationStore`])
//! 2. resequence per `(cohort, channel)` under the cohort lock
//! 3. released observations are routed in order: messages into sentiment
//!    windows, meeting/document text into claims
//! 4. new claims are resolved, scored and handed to the aggregator, outside
//!    the cohort lock
//!
//! Periodic work (skipping stale sequence gaps, finalizing windows, retrying
//! unverifiable claims) happens in [`AuditEngine::tick`], driven by the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{RawInput, SourceAdapter};
use crate::aggregator::{AuditEventStream, CaseAggregator};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::extractor::{ClaimExtractor, ClaimMatcher, PatternMatcher};
use crate::resequence::{Offer, Resequencer};
use crate::resolver::GroundTruthResolver;
use crate::scorer::{DeviationScorer, NarrativeSummarizer, TemplateSummarizer};
use crate::sentiment::{LexiconScorer, SentimentDetector, SentimentScorer};
use crate::store::{EvidenceQuery, MemoryObservationStore, ObservationStore};
use crate::types::{
    AnomalyRecord, AuditEvent, AuditFilter, Claim, ClaimRecord, ClaimStatus,
    DeviationRecord, IngestOutcome, Observation, SentimentWindow, SourceChannel, TimeRange,
    Visibility,
};

/// Result of `submit_observation`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub observation_id: Uuid,
    pub outcome: IngestOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Observations released from resequencing buffers by skipping stale gaps.
    pub released: usize,
    pub skipped_sequences: u64,
    pub anomalies: usize,
    pub claims_retried: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub cohorts: usize,
    pub pending_events: usize,
    pub claims_for_review: usize,
}

#[derive(Default)]
struct CohortPipeline {
    resequencers: HashMap<SourceChannel, Resequencer<Observation>>,
    /// Bumped whenever the cohort receives a record observation.
    evidence_epoch: u64,
}

struct ClaimEntry {
    record: ClaimRecord,
    /// Cohort evidence epoch at the last verification attempt.
    epoch_seen: u64,
    /// Evidence cited by the last successful verification.
    evidence: Vec<Uuid>,
    /// Position of the statement within its source observation.
    ordinal: usize,
}

pub struct AuditEngine {
    config: Arc<EngineConfig>,
    adapter: SourceAdapter,
    store: Arc<dyn ObservationStore>,
    extractor: ClaimExtractor,
    resolver: GroundTruthResolver,
    scorer: DeviationScorer,
    detector: SentimentDetector,
    aggregator: CaseAggregator,
    pipelines: RwLock<HashMap<String, Arc<Mutex<CohortPipeline>>>>,
    claims: RwLock<HashMap<Uuid, ClaimEntry>>,
}

impl AuditEngine {
    /// Engine with the in-memory store and the built-in matcher,
    /// summarizer and sentiment scorer.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            adapter: SourceAdapter::new(),
            store: Arc::new(MemoryObservationStore::new()),
            extractor: ClaimExtractor::new(Arc::new(PatternMatcher::new(
                config.claim_rules.clone(),
            ))),
            resolver: GroundTruthResolver::new(config.clone()),
            scorer: DeviationScorer::new(config.severity_thresholds, Arc::new(TemplateSummarizer)),
            detector: SentimentDetector::new(config.clone(), Arc::new(LexiconScorer::default())),
            aggregator: CaseAggregator::new(config.clone()),
            pipelines: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ObservationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_claim_matcher(mut self, matcher: Arc<dyn ClaimMatcher>) -> Self {
        self.extractor = ClaimExtractor::new(matcher);
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn NarrativeSummarizer>) -> Self {
        self.scorer = DeviationScorer::new(self.config.severity_thresholds, summarizer);
        self
    }

    pub fn with_sentiment_scorer(mut self, scorer: Arc<dyn SentimentScorer>) -> Self {
        self.detector = SentimentDetector::new(self.config.clone(), scorer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Ingestion ─────────────────────────────────────────────

    /// Validate, persist and process one raw input. A malformed input is
    /// rejected before anything is stored. Claim verification failures are
    /// recorded in the claim ledger, never returned here.
    pub async fn submit_observation(
        &self,
        raw: RawInput,
        channel: SourceChannel,
    ) -> Result<Submission> {
        if let (Some(target), Some(cohort)) = (raw.supersedes, raw.cohort_id.as_deref()) {
            self.check_supersedes(target, cohort.trim(), channel).await?;
        }
        let observation = self
            .adapter
            .ingest(raw, channel, Utc::now())
            .inspect_err(|e| warn!(channel = %channel, error = %e, "observation rejected"))?;
        let observation_id = observation.id;
        self.store.insert(observation.clone()).await?;
        debug!(
            observation_id = %observation_id,
            cohort_id = %observation.cohort_id,
            channel = %channel,
            cohort_sequence = observation.cohort_sequence,
            "observation stored"
        );

        let mut rescore = Vec::new();
        if let Some(target) = observation.supersedes {
            self.invalidate_claims_from(target).await;
            rescore = self.claims_citing(target).await;
        }

        let pipeline = self.pipeline(&observation.cohort_id).await;
        let (outcome, claims) = {
            let mut p = pipeline.lock().await;
            if observation.record().is_some() {
                p.evidence_epoch += 1;
            }
            let capacity = self.config.late_buffer_capacity;
            let sequence = observation.cohort_sequence;
            let offer = p
                .resequencers
                .entry(channel)
                .or_insert_with(|| Resequencer::new(capacity))
                .offer(sequence, observation, Utc::now());
            match offer {
                Offer::Late(obs) => {
                    warn!(
                        observation_id = %obs.id,
                        cohort_id = %obs.cohort_id,
                        channel = %channel,
                        cohort_sequence = sequence,
                        "observation arrived behind the resequencing cursor"
                    );
                    let outcome = IngestOutcome::LateObservationDropped {
                        reason: format!(
                            "sequence {sequence} already passed for {channel} in cohort {}",
                            obs.cohort_id
                        ),
                    };
                    (outcome, Vec::new())
                }
                Offer::Ready(released) => {
                    let mut outcome = IngestOutcome::Buffered;
                    let mut claims = Vec::new();
                    for obs in released {
                        let (o, extracted) = self.process_in_order(&obs).await;
                        claims.extend(extracted);
                        if obs.id == observation_id {
                            outcome = o;
                        }
                    }
                    (outcome, claims)
                }
            }
        };

        for claim in claims {
            self.run_claim(claim.id, false).await;
        }
        for claim_id in rescore {
            self.run_claim(claim_id, true).await;
        }

        Ok(Submission {
            observation_id,
            outcome,
        })
    }

    async fn check_supersedes(
        &self,
        target: Uuid,
        cohort_id: &str,
        channel: SourceChannel,
    ) -> Result<()> {
        match self.store.get(target).await? {
            Some(prev) if prev.cohort_id == cohort_id => Ok(()),
            Some(_) => Err(EngineError::MalformedObservation {
                channel,
                reason: format!("supersedes observation {target} from another cohort"),
            }),
            None => Err(EngineError::MalformedObservation {
                channel,
                reason: format!("supersedes unknown observation {target}"),
            }),
        }
    }

    async fn pipeline(&self, cohort_id: &str) -> Arc<Mutex<CohortPipeline>> {
        if let Some(p) = self.pipelines.read().await.get(cohort_id) {
            return p.clone();
        }
        self.pipelines
            .write()
            .await
            .entry(cohort_id.to_string())
            .or_default()
            .clone()
    }

    /// Route one released observation. Called with the cohort pipeline
    /// locked, in sequence order.
    async fn process_in_order(&self, obs: &Observation) -> (IngestOutcome, Vec<Claim>) {
        if obs.source_channel == SourceChannel::Message {
            return match self.detector.route(obs).await {
                Ok(outcome) => (outcome, Vec::new()),
                Err(e) => {
                    error!(observation_id = %obs.id, error = %e, "sentiment routing failed");
                    (IngestOutcome::Stored { claims_extracted: 0 }, Vec::new())
                }
            };
        }

        let claims = self.extractor.extract(obs);
        if !claims.is_empty() {
            let now = Utc::now();
            let mut ledger = self.claims.write().await;
            for (ordinal, claim) in claims.iter().enumerate() {
                debug!(
                    claim_id = %claim.id,
                    cohort_id = %claim.cohort_id,
                    metric = %claim.asserted_metric,
                    value = claim.asserted_value,
                    "claim extracted"
                );
                ledger.insert(
                    claim.id,
                    ClaimEntry {
                        record: ClaimRecord {
                            claim: claim.clone(),
                            status: ClaimStatus::Pending,
                            attempts: 0,
                            last_error: None,
                            updated_at: now,
                        },
                        epoch_seen: 0,
                        evidence: Vec::new(),
                        ordinal,
                    },
                );
            }
        }
        (
            IngestOutcome::Stored {
                claims_extracted: claims.len(),
            },
            claims,
        )
    }

    async fn invalidate_claims_from(&self, observation_id: Uuid) {
        let now = Utc::now();
        let mut ledger = self.claims.write().await;
        for entry in ledger
            .values_mut()
            .filter(|e| e.record.claim.source_observation_id == observation_id)
        {
            info!(claim_id = %entry.record.claim.id, "claim invalidated by superseding observation");
            entry.record.status = ClaimStatus::Invalidated;
            entry.record.updated_at = now;
        }
    }

    /// Verified claims whose resolution cited `observation_id`.
    async fn claims_citing(&self, observation_id: Uuid) -> Vec<Uuid> {
        self.claims
            .read()
            .await
            .values()
            .filter(|e| e.record.status == ClaimStatus::Verified && e.evidence.contains(&observation_id))
            .map(|e| e.record.claim.id)
            .collect()
    }

    // ── Claim verification ────────────────────────────────────

    /// Resolve, score and report one claim, retrying timeouts with backoff.
    async fn run_claim(&self, claim_id: Uuid, rescore: bool) {
        let claim = {
            let ledger = self.claims.read().await;
            let Some(entry) = ledger.get(&claim_id) else {
                return;
            };
            let runnable = match entry.record.status {
                ClaimStatus::Pending | ClaimStatus::Unverifiable => true,
                ClaimStatus::Verified => rescore,
                _ => false,
            };
            if !runnable {
                return;
            }
            entry.record.claim.clone()
        };

        let epoch = self.evidence_epoch(&claim.cohort_id).await;
        let correlated = self.correlated(&claim).await.unwrap_or_else(|e| {
            warn!(claim_id = %claim_id, error = %e, "correlated message lookup failed");
            Vec::new()
        });

        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.verify_once(&claim, correlated.clone()).await {
                Ok(record) => {
                    let evidence = record.evidence_observation_ids.clone();
                    if self
                        .record_attempt(claim_id, ClaimStatus::Verified, None, epoch, Some(evidence))
                        .await
                    {
                        self.aggregator.on_deviation(record).await;
                    }
                    return;
                }
                Err(e @ EngineError::InsufficientEvidence { .. }) => {
                    info!(claim_id = %claim_id, cohort_id = %claim.cohort_id, "claim cannot be verified yet");
                    self.record_attempt(claim_id, ClaimStatus::Unverifiable, Some(e.to_string()), epoch, None)
                        .await;
                    return;
                }
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let backoff = policy.backoff(attempt);
                    warn!(
                        claim_id = %claim_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "claim verification failed, retrying"
                    );
                    self.record_attempt(claim_id, ClaimStatus::Pending, Some(e.to_string()), epoch, None)
                        .await;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        claim_id = %claim_id,
                        cohort_id = %claim.cohort_id,
                        attempts = attempt,
                        error = %e,
                        "claim verification failed, marked for review"
                    );
                    let status = ClaimStatus::VerificationFailed {
                        stage: failure_stage(&e).to_string(),
                        reason: e.to_string(),
                    };
                    self.record_attempt(claim_id, status, Some(e.to_string()), epoch, None)
                        .await;
                    return;
                }
            }
        }
    }

    async fn verify_once(
        &self,
        claim: &Claim,
        correlated: Vec<Observation>,
    ) -> Result<DeviationRecord> {
        let verification = self
            .resolver
            .resolve(claim, self.store.as_ref(), self.config.resolution_timeout())
            .await?;
        self.scorer
            .score(claim, &verification, correlated, self.config.narrative_timeout())
            .await
    }

    /// Update the ledger after an attempt. Returns false when the claim was
    /// invalidated meanwhile, in which case the status is left alone.
    async fn record_attempt(
        &self,
        claim_id: Uuid,
        status: ClaimStatus,
        error: Option<String>,
        epoch: u64,
        evidence: Option<Vec<Uuid>>,
    ) -> bool {
        let mut ledger = self.claims.write().await;
        let Some(entry) = ledger.get_mut(&claim_id) else {
            return false;
        };
        entry.record.attempts += 1;
        entry.record.updated_at = Utc::now();
        entry.epoch_seen = epoch;
        if entry.record.status == ClaimStatus::Invalidated {
            return false;
        }
        entry.record.status = status;
        entry.record.last_error = error;
        if let Some(evidence) = evidence {
            entry.evidence = evidence;
        }
        true
    }

    async fn evidence_epoch(&self, cohort_id: &str) -> u64 {
        let Some(p) = self.pipelines.read().await.get(cohort_id).cloned() else {
            return 0;
        };
        let epoch = p.lock().await.evidence_epoch;
        epoch
    }

    /// Same actor's message observations around the claim.
    async fn correlated(&self, claim: &Claim) -> Result<Vec<Observation>> {
        let window = self.config.correlation_window();
        let range = TimeRange::around(claim.asserted_at, window, window);
        let mut query = EvidenceQuery::for_cohort(&claim.cohort_id, range.from, range.to);
        query.channels = vec![SourceChannel::Message];
        query.actor_id = Some(claim.actor_id.clone());
        if !self.config.correlate_private {
            query.visibility = Some(Visibility::Public);
        }
        self.store.query(&query).await
    }

    // ── Periodic work ─────────────────────────────────────────

    /// Skip resequencing gaps held longer than the configured hold, finalize
    /// due sentiment buckets, report anomalies and retry unverifiable claims
    /// whose cohort has new evidence.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut claims = Vec::new();

        let cutoff = now
            .checked_sub_signed(self.config.resequence_hold())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let pipelines: Vec<_> = self.pipelines.read().await.values().cloned().collect();
        for pipeline in pipelines {
            let mut p = pipeline.lock().await;
            let mut released = Vec::new();
            for (channel, reseq) in p.resequencers.iter_mut() {
                let before = reseq.skipped();
                released.extend(reseq.flush_stale(cutoff));
                let skipped = reseq.skipped() - before;
                if skipped > 0 {
                    warn!(channel = %channel, skipped, "resequencing gap abandoned");
                }
                report.skipped_sequences += skipped;
            }
            report.released += released.len();
            for obs in &released {
                let (_, extracted) = self.process_in_order(obs).await;
                claims.extend(extracted);
            }
        }

        let anomalies = self.detector.tick(now).await?;
        report.anomalies = anomalies.len();
        for anomaly in anomalies {
            self.aggregator.on_anomaly(anomaly).await;
        }

        for claim in claims {
            self.run_claim(claim.id, false).await;
        }
        report.claims_retried = self.retry_unverifiable().await;

        debug!(
            released = report.released,
            anomalies = report.anomalies,
            claims_retried = report.claims_retried,
            "engine tick complete"
        );
        Ok(report)
    }

    async fn retry_unverifiable(&self) -> usize {
        let candidates: Vec<(Uuid, String, u64)> = self
            .claims
            .read()
            .await
            .values()
            .filter(|e| e.record.status == ClaimStatus::Unverifiable)
            .map(|e| (e.record.claim.id, e.record.claim.cohort_id.clone(), e.epoch_seen))
            .collect();

        let mut retried = 0;
        for (claim_id, cohort_id, seen) in candidates {
            if self.evidence_epoch(&cohort_id).await > seen {
                retried += 1;
                self.run_claim(claim_id, false).await;
            }
        }
        retried
    }

    // ── Queries ───────────────────────────────────────────────

    pub async fn get_audit_event(&self, event_id: Uuid) -> Result<AuditEvent> {
        self.aggregator
            .get(event_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("audit event {event_id}")))
    }

    pub async fn list_audit_events(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.aggregator.list(filter).await
    }

    pub async fn archived_versions(&self, event_id: Uuid) -> Result<Vec<AuditEvent>> {
        self.get_audit_event(event_id).await?;
        Ok(self.aggregator.archived_versions(event_id).await)
    }

    pub async fn get_deviation_detail(&self, claim_id: Uuid) -> Result<DeviationRecord> {
        self.aggregator
            .deviation_detail(claim_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("deviation for claim {claim_id}")))
    }

    /// Scorings replaced by a later rescoring of the same claim, oldest first.
    pub async fn superseded_deviations(&self, claim_id: Uuid) -> Vec<DeviationRecord> {
        self.aggregator.superseded_deviations(claim_id).await
    }

    pub async fn get_anomaly_detail(
        &self,
        cohort_id: &str,
        range: &TimeRange,
    ) -> Vec<AnomalyRecord> {
        self.aggregator.anomaly_detail(cohort_id, range).await
    }

    pub async fn sentiment_windows(
        &self,
        cohort_id: &str,
        range: &TimeRange,
    ) -> Vec<SentimentWindow> {
        self.detector.windows(cohort_id, range).await
    }

    pub async fn resolve_event(&self, event_id: Uuid) -> Result<AuditEvent> {
        self.aggregator.resolve(event_id).await
    }

    pub fn subscribe(&self, filter: AuditFilter) -> AuditEventStream {
        self.aggregator.subscribe(filter)
    }

    pub async fn claim(&self, claim_id: Uuid) -> Result<ClaimRecord> {
        self.claims
            .read()
            .await
            .get(&claim_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| EngineError::NotFound(format!("claim {claim_id}")))
    }

    /// Claims extracted from one observation, in statement order.
    pub async fn claims_from(&self, observation_id: Uuid) -> Vec<ClaimRecord> {
        let ledger = self.claims.read().await;
        let mut entries: Vec<_> = ledger
            .values()
            .filter(|e| e.record.claim.source_observation_id == observation_id)
            .collect();
        entries.sort_by_key(|e| e.ordinal);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Claims whose verification kept failing, oldest first.
    pub async fn claims_for_review(&self) -> Vec<ClaimRecord> {
        let mut out: Vec<_> = self
            .claims
            .read()
            .await
            .values()
            .filter(|e| matches!(e.record.status, ClaimStatus::VerificationFailed { .. }))
            .map(|e| e.record.clone())
            .collect();
        out.sort_by_key(|r| r.updated_at);
        out
    }

    pub async fn health(&self) -> EngineHealth {
        EngineHealth {
            cohorts: self.pipelines.read().await.len(),
            pending_events: self
                .aggregator
                .list_pending(&AuditFilter::default())
                .await
                .len(),
            claims_for_review: self.claims_for_review().await.len(),
        }
    }
}

fn failure_stage(e: &EngineError) -> &'static str {
    match e {
        EngineError::ResolutionTimeout { .. } | EngineError::InsufficientEvidence { .. } => {
            "resolution"
        }
        EngineError::NarrativeTimeout { .. } | EngineError::InvalidVerification(_) => "scoring",
        _ => "pipeline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Delegates to the memory store but never answers evidence lookups.
    struct StalledEvidence(MemoryObservationStore);

    #[async_trait]
    impl ObservationStore for StalledEvidence {
        async fn insert(&self, observation: Observation) -> Result<()> {
            self.0.insert(observation).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Observation>> {
            self.0.get(id).await
        }

        async fn query(&self, query: &EvidenceQuery) -> Result<Vec<Observation>> {
            if query.channels.contains(&SourceChannel::Ledger) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.0.query(query).await
        }

        async fn is_superseded(&self, id: Uuid) -> Result<bool> {
            self.0.is_superseded(id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_retries_and_surface_for_review() {
        let engine = AuditEngine::new(EngineConfig::default())
            .unwrap()
            .with_store(Arc::new(StalledEvidence(MemoryObservationStore::new())));

        let submission = engine
            .submit_observation(
                RawInput::text("cfo", "finance", "Q3 revenue is $5.2M"),
                SourceChannel::Meeting,
            )
            .await
            .unwrap();
        assert_eq!(
            submission.outcome,
            IngestOutcome::Stored {
                claims_extracted: 1
            }
        );

        let review = engine.claims_for_review().await;
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].attempts, 3);
        match &review[0].status {
            ClaimStatus::VerificationFailed { stage, .. } => assert_eq!(stage, "resolution"),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(engine.list_audit_events(&AuditFilter::default()).await.is_empty());
        assert_eq!(engine.health().await.claims_for_review, 1);
    }

    /// Holds back inserts of messages mentioning "slow", so a later
    /// submission overtakes them on the way to the resequencer.
    struct SlowInserts(MemoryObservationStore);

    #[async_trait]
    impl ObservationStore for SlowInserts {
        async fn insert(&self, observation: Observation) -> Result<()> {
            if observation.text().is_some_and(|t| t.contains("slow")) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.0.insert(observation).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Observation>> {
            self.0.get(id).await
        }

        async fn query(&self, query: &EvidenceQuery) -> Result<Vec<Observation>> {
            self.0.query(query).await
        }

        async fn is_superseded(&self, id: Uuid) -> Result<bool> {
            self.0.is_superseded(id).await
        }
    }

    /// Scores a message by its leading number.
    struct LeadingNumber;

    impl SentimentScorer for LeadingNumber {
        fn score(&self, text: &str) -> crate::sentiment::SentimentScore {
            let score = text
                .split_whitespace()
                .next()
                .and_then(|w| w.parse().ok())
                .unwrap_or(0.0);
            crate::sentiment::SentimentScore {
                score,
                keywords: Vec::new(),
            }
        }
    }

    /// Submits a delayed message (sequence 1) and then a prompt one
    /// (sequence 2) that overtakes it.
    async fn overtaken_pair(
        engine: &Arc<AuditEngine>,
        at: DateTime<Utc>,
    ) -> tokio::task::JoinHandle<Result<Submission>> {
        let delayed = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit_observation(
                        RawInput::text("dev", "eng", "0.9 slow").at(at),
                        SourceChannel::Message,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        let prompt = engine
            .submit_observation(RawInput::text("dev", "eng", "0.1").at(at), SourceChannel::Message)
            .await
            .unwrap();
        assert_eq!(prompt.outcome, IngestOutcome::Buffered);
        delayed
    }

    fn delayed_engine() -> Arc<AuditEngine> {
        Arc::new(
            AuditEngine::new(EngineConfig::default())
                .unwrap()
                .with_store(Arc::new(SlowInserts(MemoryObservationStore::new())))
                .with_sentiment_scorer(Arc::new(LeadingNumber)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_overtaken_message_is_folded_in_sequence_order() {
        let engine = delayed_engine();
        let at = Utc::now();
        let delayed = overtaken_pair(&engine, at).await;

        // a tick while the gap is young leaves it open
        let report = engine.tick(Utc::now()).await.unwrap();
        assert_eq!(report.released, 0);
        assert_eq!(report.skipped_sequences, 0);

        let delayed = delayed.await.unwrap().unwrap();
        assert!(matches!(delayed.outcome, IngestOutcome::Accumulated { .. }));

        let day = chrono::Duration::days(1);
        let windows = engine
            .sentiment_windows("eng", &TimeRange::around(at, day, day))
            .await;
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].sample_count, 2);
        let mut expected = 0.0_f64;
        for (i, score) in [0.9_f64, 0.1].iter().enumerate() {
            expected += (score - expected) / (i as f64 + 1.0);
        }
        assert_eq!(windows[0].mean_score.to_bits(), expected.to_bits());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_older_than_hold_is_skipped() {
        let engine = delayed_engine();
        let delayed = overtaken_pair(&engine, Utc::now()).await;

        let later = Utc::now() + engine.config().resequence_hold() + chrono::Duration::seconds(1);
        let report = engine.tick(later).await.unwrap();
        assert_eq!(report.released, 1);
        assert_eq!(report.skipped_sequences, 1);

        let delayed = delayed.await.unwrap().unwrap();
        assert!(matches!(
            delayed.outcome,
            IngestOutcome::LateObservationDropped { .. }
        ));
    }

    #[tokio::test]
    async fn test_supersede_of_unknown_observation_is_rejected() {
        let engine = AuditEngine::new(EngineConfig::default()).unwrap();
        let mut raw = RawInput::record("erp", "finance", "revenue", 1.0);
        raw.supersedes = Some(Uuid::new_v4());
        let err = engine
            .submit_observation(raw, SourceChannel::Ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedObservation { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.late_buffer_capacity = 0;
        assert!(matches!(
            AuditEngine::new(config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_failure_stage() {
        let e = EngineError::NarrativeTimeout {
            claim_id: Uuid::new_v4(),
            timeout_ms: 1,
        };
        assert_eq!(failure_stage(&e), "scoring");
    }
}
