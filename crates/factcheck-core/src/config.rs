//! Engine configuration
//!
//! Loaded from YAML. Every field has a default so a partial file (or no file
//! at all) yields a working engine. Thresholds are calibration values, not
//! correctness constants; `validate()` only rejects values that would break
//! the engine's invariants.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{Severity, SourceChannel};

/// Root configuration for the detection engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How far before a claim's assertion time evidence is considered.
    pub lookback_days: i64,
    /// Trust ranking per channel. Channels with weight 0 never count as evidence.
    pub authority_weights: BTreeMap<SourceChannel, f64>,
    /// Evidence strength halves every this many days of age.
    pub recency_half_life_days: f64,
    /// Maximum credence a single, fresh, full-authority record contributes.
    pub evidence_credence: f64,
    /// Relative tolerance under which two values are considered to agree.
    pub agreement_tolerance: f64,
    /// Metrics resolved by summing partial records (normalized names).
    pub additive_metrics: Vec<String>,
    pub severity_thresholds: SeverityThresholds,
    pub anomaly_severity_thresholds: SeverityThresholds,
    /// Minimum `|public - private|` mean difference that flags an anomaly.
    pub divergence_threshold: f64,
    /// Private windows with fewer samples never trigger anomalies.
    pub min_sample_size: u32,
    pub bucket_width_secs: i64,
    /// Resequencing holding buffer size per cohort.
    pub late_buffer_capacity: usize,
    /// How long a tick leaves a sequence gap open before skipping it.
    pub resequence_hold_secs: i64,
    /// Finalized windows kept per cohort for detail queries.
    pub window_retention: usize,
    /// Half-width of the window used to correlate an actor's messages with a claim.
    pub correlation_window_hours: i64,
    /// Include private messages when correlating. Off by default.
    pub correlate_private: bool,
    pub resolution_timeout_ms: u64,
    pub narrative_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub tick_interval_secs: u64,
    pub claim_rules: Vec<ClaimRule>,
    /// Cohort → owner assignment for audit events.
    pub owners: HashMap<String, String>,
    /// Capacity of the audit-event broadcast channel.
    pub subscription_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut authority_weights = BTreeMap::new();
        authority_weights.insert(SourceChannel::Ledger, 1.0);
        authority_weights.insert(SourceChannel::Document, 0.7);
        authority_weights.insert(SourceChannel::Sensor, 0.5);
        authority_weights.insert(SourceChannel::Message, 0.4);
        authority_weights.insert(SourceChannel::Meeting, 0.0);

        Self {
            lookback_days: 90,
            authority_weights,
            recency_half_life_days: 30.0,
            evidence_credence: 0.7,
            agreement_tolerance: 0.005,
            additive_metrics: Vec::new(),
            severity_thresholds: SeverityThresholds::default(),
            anomaly_severity_thresholds: SeverityThresholds {
                medium: 0.5,
                high: 0.8,
            },
            divergence_threshold: 0.4,
            min_sample_size: 5,
            bucket_width_secs: 86_400,
            late_buffer_capacity: 50,
            resequence_hold_secs: 120,
            window_retention: 256,
            correlation_window_hours: 72,
            correlate_private: false,
            resolution_timeout_ms: 2_000,
            narrative_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
            tick_interval_secs: 60,
            claim_rules: ClaimRule::defaults(),
            owners: HashMap::new(),
            subscription_buffer: 1024,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.severity_thresholds.validate("severity_thresholds")?;
        self.anomaly_severity_thresholds
            .validate("anomaly_severity_thresholds")?;
        if self.lookback_days <= 0 {
            return Err(EngineError::InvalidConfig(
                "lookback_days must be positive".into(),
            ));
        }
        if self.bucket_width_secs <= 0 {
            return Err(EngineError::InvalidConfig(
                "bucket_width_secs must be positive".into(),
            ));
        }
        if self.recency_half_life_days <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "recency_half_life_days must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.evidence_credence) || self.evidence_credence == 0.0 {
            return Err(EngineError::InvalidConfig(
                "evidence_credence must be in (0, 1)".into(),
            ));
        }
        if let Some((channel, w)) = self
            .authority_weights
            .iter()
            .find(|(_, w)| !(0.0..=1.0).contains(*w))
        {
            return Err(EngineError::InvalidConfig(format!(
                "authority weight for {channel} is {w}, expected [0, 1]"
            )));
        }
        if self.divergence_threshold <= 0.0 || self.divergence_threshold > 2.0 {
            return Err(EngineError::InvalidConfig(
                "divergence_threshold must be in (0, 2]".into(),
            ));
        }
        if self.late_buffer_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "late_buffer_capacity must be at least 1".into(),
            ));
        }
        if self.resequence_hold_secs < 0 {
            return Err(EngineError::InvalidConfig(
                "resequence_hold_secs must not be negative".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.subscription_buffer == 0 {
            return Err(EngineError::InvalidConfig(
                "subscription_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn authority_weight(&self, channel: SourceChannel) -> f64 {
        self.authority_weights.get(&channel).copied().unwrap_or(0.0)
    }

    pub fn is_additive(&self, normalized_metric: &str) -> bool {
        self.additive_metrics
            .iter()
            .any(|m| crate::types::normalize_metric(m) == normalized_metric)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.lookback_days)
    }

    pub fn bucket_width(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bucket_width_secs)
    }

    pub fn resequence_hold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.resequence_hold_secs)
    }

    pub fn correlation_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.correlation_window_hours)
    }

    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.resolution_timeout_ms)
    }

    pub fn narrative_timeout(&self) -> Duration {
        Duration::from_millis(self.narrative_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn owner_for(&self, cohort_id: &str) -> Option<String> {
        self.owners.get(cohort_id).cloned()
    }
}

/// Absolute-value cut-offs for Medium and High. Everything below `medium` is Low.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub medium: f64,
    pub high: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            medium: 0.05,
            high: 0.20,
        }
    }
}

impl SeverityThresholds {
    fn validate(&self, name: &str) -> Result<()> {
        if !(self.medium.is_finite() && self.high.is_finite())
            || self.medium < 0.0
            || self.medium > self.high
        {
            return Err(EngineError::InvalidConfig(format!(
                "{name}: expected 0 <= medium <= high, got medium={} high={}",
                self.medium, self.high
            )));
        }
        Ok(())
    }

    /// Pure function of the magnitude; `None` (undefined) is `Unscored`.
    pub fn classify(&self, magnitude: Option<f64>) -> Severity {
        match magnitude {
            Some(m) if m.is_finite() => {
                let m = m.abs();
                if m >= self.high {
                    Severity::High
                } else if m >= self.medium {
                    Severity::Medium
                } else {
                    Severity::Low
                }
            }
            _ => Severity::Unscored,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.base_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Keyword rule for the pattern claim matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRule {
    pub metric: String,
    pub keywords: Vec<String>,
}

impl ClaimRule {
    pub fn new(metric: &str, keywords: &[&str]) -> Self {
        Self {
            metric: metric.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn defaults() -> Vec<ClaimRule> {
        vec![
            ClaimRule::new("revenue", &["revenue", "sales", "营收", "收入"]),
            ClaimRule::new("budget", &["budget", "spend", "预算"]),
            ClaimRule::new("cash balance", &["cash", "现金"]),
            ClaimRule::new("headcount", &["headcount", "staff", "人数"]),
            ClaimRule::new("completion", &["complete", "completion", "progress", "进度"]),
        ]
    }
}
