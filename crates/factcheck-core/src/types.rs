//! Domain types shared by every stage of the pipeline.
//!
//! Observations are immutable once ingested. Everything downstream (claims,
//! verifications, windows, audit events) is derived from them and refers back
//! by id.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

// ── Channels & visibility ─────────────────────────────────────

/// Origin of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    Meeting,
    Ledger,
    Message,
    Document,
    Sensor,
}

impl SourceChannel {
    pub const ALL: [SourceChannel; 5] = [
        Self::Meeting,
        Self::Ledger,
        Self::Message,
        Self::Document,
        Self::Sensor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Meeting => "meeting",
            Self::Ledger => "ledger",
            Self::Message => "message",
            Self::Document => "document",
            Self::Sensor => "sensor",
        }
    }

    /// Channels whose text is parsed for checkable claims.
    pub fn is_reporting(&self) -> bool {
        matches!(self, Self::Meeting | Self::Document)
    }
}

impl fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceChannel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "meeting" => Ok(Self::Meeting),
            "ledger" => Ok(Self::Ledger),
            "message" => Ok(Self::Message),
            "document" => Ok(Self::Document),
            "sensor" => Ok(Self::Sensor),
            _ => Err(format!("Unknown source channel: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Public => Self::Private,
            Self::Private => Self::Public,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Observation ───────────────────────────────────────────────

/// Channel-specific content of an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ObservationPayload {
    /// Spoken, transcribed, or written free text.
    Text { text: String },
    /// A structured system-of-record entry (ledger line, sensor reading,
    /// tabular document figure).
    Record {
        metric: String,
        value: f64,
        /// The record is one component of a summed metric.
        #[serde(default)]
        additive: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
}

/// An atomic, timestamped unit of evidence from one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub source_channel: SourceChannel,
    /// Monotonic per channel; breaks timestamp ties deterministically.
    pub sequence: u64,
    /// Contiguous per (cohort, channel), starting at 1. Drives resequencing.
    pub cohort_sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub cohort_id: String,
    pub payload: ObservationPayload,
    pub visibility: Visibility,
    /// A newer observation replacing an older one. The older one stays stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
}

impl Observation {
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            ObservationPayload::Text { text } => Some(text),
            ObservationPayload::Record { .. } => None,
        }
    }

    /// `(metric, value, additive)` for record payloads.
    pub fn record(&self) -> Option<(&str, f64, bool)> {
        match &self.payload {
            ObservationPayload::Record {
                metric,
                value,
                additive,
                ..
            } => Some((metric.as_str(), *value, *additive)),
            ObservationPayload::Text { .. } => None,
        }
    }

    /// Total order used wherever observations must be replayed identically.
    pub fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}

/// Lower-cased, whitespace-collapsed metric name used for matching.
pub fn normalize_metric(metric: &str) -> String {
    metric
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ── Claim & verification ──────────────────────────────────────

/// A checkable assertion extracted from one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub source_observation_id: Uuid,
    pub actor_id: String,
    pub cohort_id: String,
    pub asserted_metric: String,
    pub asserted_value: f64,
    pub asserted_at: DateTime<Utc>,
    pub statement_text: String,
}

/// One link in a verification's evidence chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub observation_id: Uuid,
    pub justification: String,
}

/// Resolution of one claim against independent evidence.
///
/// Fields are private so the non-empty evidence invariant holds for every
/// value that exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    claim_id: Uuid,
    resolved_value: f64,
    evidence: Vec<EvidenceRef>,
    confidence: f64,
    resolved_at: DateTime<Utc>,
}

impl Verification {
    pub fn new(
        claim_id: Uuid,
        resolved_value: f64,
        evidence: Vec<EvidenceRef>,
        confidence: f64,
        resolved_at: DateTime<Utc>,
    ) -> Result<Self> {
        if evidence.is_empty() {
            return Err(EngineError::InvalidVerification(format!(
                "claim {claim_id}: verification requires at least one evidence observation"
            )));
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::InvalidVerification(format!(
                "claim {claim_id}: confidence {confidence} outside [0, 1]"
            )));
        }
        if !resolved_value.is_finite() {
            return Err(EngineError::InvalidVerification(format!(
                "claim {claim_id}: resolved value is not finite"
            )));
        }
        Ok(Self {
            claim_id,
            resolved_value,
            evidence,
            confidence,
            resolved_at,
        })
    }

    pub fn claim_id(&self) -> Uuid {
        self.claim_id
    }

    pub fn resolved_value(&self) -> f64 {
        self.resolved_value
    }

    pub fn evidence(&self) -> &[EvidenceRef] {
        &self.evidence
    }

    pub fn evidence_observation_ids(&self) -> Vec<Uuid> {
        self.evidence.iter().map(|e| e.observation_id).collect()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn resolved_at(&self) -> DateTime<Utc> {
        self.resolved_at
    }
}

// ── Deviation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Deviation could not be computed (resolved value of zero).
    Unscored,
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unscored => "unscored",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unscored" => Ok(Self::Unscored),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    OverReported,
    UnderReported,
    Accurate,
    Undefined,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OverReported => "over_reported",
            Self::UnderReported => "under_reported",
            Self::Accurate => "accurate",
            Self::Undefined => "undefined",
        }
    }
}

/// Output of comparing a claim with its verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationRecord {
    pub claim_id: Uuid,
    pub cohort_id: String,
    pub actor_id: String,
    pub metric: String,
    pub asserted_value: f64,
    pub resolved_value: f64,
    pub delta_absolute: f64,
    /// Signed fraction (`-0.269` is 26.9% under the resolved value).
    /// `None` when the resolved value is zero.
    pub delta_percent: Option<f64>,
    pub severity: Severity,
    pub confidence: f64,
    pub evidence_observation_ids: Vec<Uuid>,
    pub root_cause_narrative: String,
    pub impact_estimate: BTreeMap<String, String>,
    pub scored_at: DateTime<Utc>,
}

// ── Sentiment ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Collecting,
    Finalized,
    Compared,
}

/// Aggregated sentiment for one `(cohort, visibility, bucket)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentWindow {
    pub id: Uuid,
    pub cohort_id: String,
    pub visibility: Visibility,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub mean_score: f64,
    pub sample_count: u32,
    pub keyword_histogram: BTreeMap<String, u32>,
    pub state: WindowState,
}

impl SentimentWindow {
    pub fn new(
        cohort_id: impl Into<String>,
        visibility: Visibility,
        bucket_start: DateTime<Utc>,
        bucket_end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cohort_id: cohort_id.into(),
            visibility,
            bucket_start,
            bucket_end,
            mean_score: 0.0,
            sample_count: 0,
            keyword_histogram: BTreeMap::new(),
            state: WindowState::Collecting,
        }
    }

    /// Fold one score into the running mean without recomputing.
    pub fn accumulate(&mut self, score: f64, keywords: &[String]) {
        self.sample_count += 1;
        self.mean_score += (score - self.mean_score) / f64::from(self.sample_count);
        for kw in keywords {
            *self.keyword_histogram.entry(kw.clone()).or_insert(0) += 1;
        }
    }

    /// Half-open `[bucket_start, bucket_end)` overlap.
    pub fn overlaps(&self, other: &SentimentWindow) -> bool {
        self.bucket_start < other.bucket_end && other.bucket_start < self.bucket_end
    }

    /// Most frequent keywords, ties broken alphabetically.
    pub fn top_keywords(&self, n: usize) -> Vec<String> {
        let mut entries: Vec<_> = self.keyword_histogram.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().take(n).map(|(k, _)| k.clone()).collect()
    }
}

/// A flagged divergence between public and private sentiment of one cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: Uuid,
    pub cohort_id: String,
    pub public_window_id: Uuid,
    pub private_window_id: Uuid,
    pub public_mean: f64,
    pub private_mean: f64,
    pub private_sample_count: u32,
    pub divergence_score: f64,
    pub severity: Severity,
    pub trigger_keywords: Vec<String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

// ── Audit events ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    FactDeviation,
    SentimentAnomaly,
}

impl FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fact_deviation" => Ok(Self::FactDeviation),
            "sentiment_anomaly" => Ok(Self::SentimentAnomaly),
            _ => Err(format!("Unknown audit kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    Resolved,
}

impl FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Unknown audit status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DetailRef {
    Deviation { claim_id: Uuid },
    Anomaly { anomaly_id: Uuid },
}

/// The unified, externally consumed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditKind,
    pub severity: Severity,
    pub title: String,
    pub summary: String,
    /// Absent for anomalies: private channels are reported per cohort only.
    pub subject_actor_id: Option<String>,
    pub department_or_cohort: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: AuditStatus,
    pub revision: u32,
    pub detail_ref: DetailRef,
}

/// Query filter; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub kind: Option<AuditKind>,
    #[serde(default)]
    pub status: Option<AuditStatus>,
    #[serde(default)]
    pub cohort_id: Option<String>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.severity.map_or(true, |s| s == event.severity)
            && self.kind.map_or(true, |k| k == event.kind)
            && self.status.map_or(true, |s| s == event.status)
            && self
                .cohort_id
                .as_deref()
                .map_or(true, |c| c == event.department_or_cohort)
    }
}

/// Half-open `[from, to)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// `[at - before, at + after]`, clamped to chrono's representable range.
    pub fn around(at: DateTime<Utc>, before: chrono::Duration, after: chrono::Duration) -> Self {
        Self {
            from: at
                .checked_sub_signed(before)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            to: at
                .checked_add_signed(after)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.to && self.from < end
    }
}

// ── Claim ledger & ingest outcome ─────────────────────────────

/// Lifecycle of a claim inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ClaimStatus {
    Pending,
    Verified,
    /// No qualifying evidence yet; retried when the cohort receives evidence.
    Unverifiable,
    /// External dependencies kept failing; needs manual review.
    VerificationFailed { stage: String, reason: String },
    /// The source observation was superseded.
    Invalidated,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimRecord {
    pub claim: Claim,
    pub status: ClaimStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// What happened to a submitted observation after it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum IngestOutcome {
    /// Stored as evidence or reporting input.
    Stored { claims_extracted: usize },
    /// Routed into a sentiment window.
    Accumulated { window_id: Uuid },
    /// Held in the resequencing buffer awaiting earlier observations.
    Buffered,
    /// Arrived after its bucket was finalized or its slot was passed.
    LateObservationDropped { reason: String },
}
