//! Deviation scoring
//!
//! Severity is a pure function of `delta_percent` and the configured
//! thresholds; nothing else feeds it. Narrative synthesis is delegated to a
//! [`NarrativeSummarizer`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::SeverityThresholds;
use crate::error::{EngineError, Result};
use crate::types::{Claim, DeviationRecord, Direction, Observation, Severity, Verification};

/// Everything a summarizer may look at.
#[derive(Debug, Clone)]
pub struct NarrativeRequest {
    pub claim: Claim,
    pub verification: Verification,
    /// Contemporaneous observations from the same actor.
    pub correlated: Vec<Observation>,
    pub delta_percent: Option<f64>,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Narrative {
    pub text: String,
    pub impact_tags: BTreeMap<String, String>,
}

/// Root-cause narrative generation (template, rules, or a model call).
#[async_trait]
pub trait NarrativeSummarizer: Send + Sync {
    async fn summarize(&self, request: &NarrativeRequest) -> anyhow::Result<Narrative>;
}

/// `(asserted - resolved, (asserted - resolved) / resolved)`.
/// The fraction is `None` when the resolved value is zero.
///
/// The fraction is relative to the resolved value and signed by direction:
/// asserting 5.2M against 3.8M on record gives `+0.368` (over-reported),
/// while asserting 3.8M against 5.2M gives `-0.269`.
pub fn compute_delta(asserted: f64, resolved: f64) -> (f64, Option<f64>) {
    let delta = asserted - resolved;
    let pct = if resolved == 0.0 || !delta.is_finite() {
        None
    } else {
        Some(delta / resolved)
    };
    (delta, pct)
}

pub fn direction_of(delta_absolute: f64) -> Direction {
    if !delta_absolute.is_finite() {
        Direction::Undefined
    } else if delta_absolute > 0.0 {
        Direction::OverReported
    } else if delta_absolute < 0.0 {
        Direction::UnderReported
    } else {
        Direction::Accurate
    }
}

/// Recompute a stored record's severity from its own delta.
pub fn rederive_severity(record: &DeviationRecord, thresholds: &SeverityThresholds) -> Severity {
    thresholds.classify(record.delta_percent)
}

pub struct DeviationScorer {
    thresholds: SeverityThresholds,
    summarizer: Arc<dyn NarrativeSummarizer>,
}

impl DeviationScorer {
    pub fn new(thresholds: SeverityThresholds, summarizer: Arc<dyn NarrativeSummarizer>) -> Self {
        Self {
            thresholds,
            summarizer,
        }
    }

    pub fn thresholds(&self) -> &SeverityThresholds {
        &self.thresholds
    }

    pub async fn score(
        &self,
        claim: &Claim,
        verification: &Verification,
        correlated: Vec<Observation>,
        timeout: Duration,
    ) -> Result<DeviationRecord> {
        if verification.claim_id() != claim.id {
            return Err(EngineError::InvalidVerification(format!(
                "verification for claim {} used to score claim {}",
                verification.claim_id(),
                claim.id
            )));
        }

        let (delta_absolute, delta_percent) =
            compute_delta(claim.asserted_value, verification.resolved_value());
        let severity = self.thresholds.classify(delta_percent);
        let direction = direction_of(delta_absolute);

        let request = NarrativeRequest {
            claim: claim.clone(),
            verification: verification.clone(),
            correlated,
            delta_percent,
            direction,
        };
        let narrative = tokio::time::timeout(timeout, self.summarizer.summarize(&request))
            .await
            .map_err(|_| EngineError::NarrativeTimeout {
                claim_id: claim.id,
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(EngineError::Internal)?;

        let mut impact_estimate = narrative.impact_tags;
        impact_estimate.insert("direction".into(), direction.as_str().into());

        Ok(DeviationRecord {
            claim_id: claim.id,
            cohort_id: claim.cohort_id.clone(),
            actor_id: claim.actor_id.clone(),
            metric: claim.asserted_metric.clone(),
            asserted_value: claim.asserted_value,
            resolved_value: verification.resolved_value(),
            delta_absolute,
            delta_percent,
            severity,
            confidence: verification.confidence(),
            evidence_observation_ids: verification.evidence_observation_ids(),
            root_cause_narrative: narrative.text,
            impact_estimate,
            scored_at: Utc::now(),
        })
    }
}

/// Deterministic narrative built from the request fields alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateSummarizer;

#[async_trait]
impl NarrativeSummarizer for TemplateSummarizer {
    async fn summarize(&self, request: &NarrativeRequest) -> anyhow::Result<Narrative> {
        let claim = &request.claim;
        let v = &request.verification;

        let delta = match request.delta_percent {
            Some(p) => format!("{:+.1}%", p * 100.0),
            None => "deviation undefined, resolved value is zero".to_string(),
        };
        let mut text = format!(
            "{} reported {} of {} against a system-of-record value of {} ({}, {}). \
             Resolution drew on {} evidence record(s) at {:.0}% confidence.",
            claim.actor_id,
            claim.asserted_metric,
            format_value(claim.asserted_value),
            format_value(v.resolved_value()),
            delta,
            request.direction.as_str().replace('_', " "),
            v.evidence().len(),
            v.confidence() * 100.0,
        );
        if !request.correlated.is_empty() {
            text.push_str(&format!(
                " {} contemporaneous message(s) from the same actor were correlated",
                request.correlated.len()
            ));
            if let Some(latest) = request.correlated.iter().rev().find_map(|o| o.text()) {
                text.push_str(&format!(", most recent: \"{}\"", truncate(latest, 120)));
            }
            text.push('.');
        }

        let mut impact_tags = BTreeMap::new();
        impact_tags.insert(
            "dimension".to_string(),
            dimension_for(&claim.asserted_metric).to_string(),
        );
        impact_tags.insert(
            "confidence".to_string(),
            confidence_band(v.confidence()).to_string(),
        );

        Ok(Narrative { text, impact_tags })
    }
}

fn dimension_for(metric: &str) -> &'static str {
    let m = metric.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| m.contains(w));
    if any(&["revenue", "cash", "receivable", "sales", "营收", "收入", "现金"]) {
        "cashflow"
    } else if any(&["budget", "spend", "cost", "预算"]) {
        "budget"
    } else if any(&["completion", "progress", "milestone", "schedule", "进度"]) {
        "schedule"
    } else {
        "general"
    }
}

fn confidence_band(confidence: f64) -> &'static str {
    if confidence >= 0.8 {
        "high"
    } else if confidence >= 0.5 {
        "medium"
    } else {
        "low"
    }
}

pub fn format_value(v: f64) -> String {
    let a = v.abs();
    if a >= 1e9 {
        format!("{:.2}B", v / 1e9)
    } else if a >= 1e6 {
        format!("{:.2}M", v / 1e6)
    } else if a >= 1e4 {
        format!("{:.1}K", v / 1e3)
    } else {
        format!("{}", v)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EvidenceRef;
    use chrono::{DateTime, TimeZone};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 9, 0, 0).unwrap()
    }

    fn claim(value: f64) -> Claim {
        Claim {
            id: Uuid::new_v4(),
            source_observation_id: Uuid::new_v4(),
            actor_id: "cfo".into(),
            cohort_id: "finance".into(),
            asserted_metric: "q3 revenue".into(),
            asserted_value: value,
            asserted_at: t0(),
            statement_text: "Q3 revenue is $5.2M".into(),
        }
    }

    fn verification(claim: &Claim, resolved: f64, confidence: f64) -> Verification {
        let evidence = (0..2)
            .map(|i| EvidenceRef {
                observation_id: Uuid::new_v4(),
                justification: format!("ledger entry {i}"),
            })
            .collect();
        Verification::new(claim.id, resolved, evidence, confidence, t0()).unwrap()
    }

    fn scorer() -> DeviationScorer {
        DeviationScorer::new(SeverityThresholds::default(), Arc::new(TemplateSummarizer))
    }

    #[tokio::test]
    async fn test_revenue_overstatement_is_high() {
        let c = claim(5.2e6);
        let v = verification(&c, 3.8e6, 0.9);
        let rec = scorer()
            .score(&c, &v, vec![], Duration::from_secs(1))
            .await
            .unwrap();
        let pct = rec.delta_percent.unwrap();
        // (5.2 - 3.8) / 3.8
        assert!((pct - 0.368_421).abs() < 1e-4, "pct {pct}");
        assert_eq!(rec.severity, Severity::High);
        assert_eq!(rec.impact_estimate["direction"], "over_reported");
        assert_eq!(rec.impact_estimate["dimension"], "cashflow");
        assert_eq!(rec.confidence, 0.9);
        assert_eq!(rec.evidence_observation_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_understatement_preserves_direction() {
        let c = claim(3.8e6);
        let v = verification(&c, 5.2e6, 0.9);
        let rec = scorer()
            .score(&c, &v, vec![], Duration::from_secs(1))
            .await
            .unwrap();
        let pct = rec.delta_percent.unwrap();
        assert!((pct + 0.269_23).abs() < 1e-4, "pct {pct}");
        assert_eq!(rec.severity, Severity::High);
        assert_eq!(rec.impact_estimate["direction"], "under_reported");
    }

    #[tokio::test]
    async fn test_zero_resolved_value_is_unscored() {
        let c = claim(1.0);
        let v = verification(&c, 0.0, 0.5);
        let rec = scorer()
            .score(&c, &v, vec![], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(rec.delta_percent, None);
        assert_eq!(rec.severity, Severity::Unscored);
        assert!(rec.root_cause_narrative.contains("undefined"));
    }

    #[tokio::test]
    async fn test_mismatched_verification_rejected() {
        let c = claim(1.0);
        let other = claim(1.0);
        let v = verification(&other, 1.0, 0.5);
        let err = scorer()
            .score(&c, &v, vec![], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidVerification(_)));
    }

    struct HangingSummarizer;

    #[async_trait]
    impl NarrativeSummarizer for HangingSummarizer {
        async fn summarize(&self, _: &NarrativeRequest) -> anyhow::Result<Narrative> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::bail!("unreachable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_summarizer_surfaces_narrative_timeout() {
        let s = DeviationScorer::new(SeverityThresholds::default(), Arc::new(HangingSummarizer));
        let c = claim(2.0);
        let v = verification(&c, 1.0, 0.5);
        let err = s
            .score(&c, &v, vec![], Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NarrativeTimeout {
                timeout_ms: 250,
                ..
            }
        ));
    }

    #[test]
    fn test_compute_delta() {
        assert_eq!(compute_delta(5.0, 0.0), (5.0, None));
        let (d, p) = compute_delta(90.0, 100.0);
        assert_eq!(d, -10.0);
        assert!((p.unwrap() + 0.1).abs() < 1e-12);
        assert_eq!(direction_of(0.0), Direction::Accurate);
    }

    #[test]
    fn test_delta_is_relative_to_resolved_value() {
        let (_, over) = compute_delta(5.2e6, 3.8e6);
        assert!((over.unwrap() - 0.368).abs() < 1e-3);
        let (_, under) = compute_delta(3.8e6, 5.2e6);
        assert!((under.unwrap() + 0.269).abs() < 1e-3);
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(5.2e6), "5.20M");
        assert_eq!(format_value(800_000.0), "800.0K");
        assert_eq!(format_value(42.0), "42");
    }

    proptest! {
        #[test]
        fn prop_severity_is_reproducible_and_monotone(
            asserted in -1.0e9f64..1.0e9,
            resolved in 1.0f64..1.0e9,
            scale in 1.0f64..10.0,
        ) {
            let thresholds = SeverityThresholds::default();
            let (_, pct) = compute_delta(asserted, resolved);
            let severity = thresholds.classify(pct);
            prop_assert_eq!(severity, thresholds.classify(pct));

            let wider = pct.map(|p| p * scale);
            prop_assert!(thresholds.classify(wider) >= severity);
        }
    }
}
