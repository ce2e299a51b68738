//! Ground-truth resolution
//!
//! Cross-references a [`Claim`] against system-of-record observations of the
//! same cohort inside the lookback window that precedes the assertion, plus
//! later corrections of records from that window.
//!
//! Candidates are ranked by channel authority, then recency. The resolved
//! value is the latest value of the most authoritative channel, or the sum of
//! that channel's records when the metric is additive. Confidence combines
//! every supporting record as independent evidence:
//!
//! ```text
//! strength(e)  = authority(e) * 0.5 ^ (age(e) / half_life)
//! support      = 1 - Π (1 - credence * strength(e))      over supporting e
//! penalty      = 1 - 0.5 * dissent / (support_w + dissent)
//! confidence   = support * penalty
//! ```
//!
//! Adding a supporting record can only grow `support` and shrink the dissent
//! share, so confidence never decreases with more corroboration; older records
//! contribute less.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::store::{EvidenceQuery, ObservationStore};
use crate::types::{
    normalize_metric, Claim, EvidenceRef, Observation, SourceChannel, TimeRange, Verification,
};

/// Share of confidence removed when all evidence weight dissents.
const MAX_DISSENT_PENALTY: f64 = 0.5;

pub struct GroundTruthResolver {
    config: Arc<EngineConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    Supports,
    Component,
    Dissents,
    Stale,
}

struct Candidate {
    observation: Observation,
    value: f64,
    authority: f64,
    strength: f64,
}

impl GroundTruthResolver {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self { config }
    }

    /// Channels that may serve as evidence, most authoritative first.
    fn evidence_channels(&self) -> Vec<SourceChannel> {
        let mut channels: Vec<(SourceChannel, f64)> = self
            .config
            .authority_weights
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .map(|(c, w)| (*c, *w))
            .collect();
        channels.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        channels.into_iter().map(|(c, _)| c).collect()
    }

    /// Query `pool` and resolve. The pool lookups are bounded by `timeout`.
    ///
    /// A correction filed after the assertion still counts when it
    /// supersedes a record from inside the window: it stands in for that
    /// record, dated at the record's timestamp.
    pub async fn resolve(
        &self,
        claim: &Claim,
        pool: &dyn ObservationStore,
        timeout: Duration,
    ) -> Result<Verification> {
        let window = TimeRange::around(
            claim.asserted_at,
            self.config.lookback(),
            chrono::Duration::zero(),
        );
        let query = EvidenceQuery {
            cohort_id: claim.cohort_id.clone(),
            channels: self.evidence_channels(),
            actor_id: None,
            metric: Some(normalize_metric(&claim.asserted_metric)),
            visibility: None,
            from: window.from,
            to: window.to,
        };

        let gather = async {
            let mut candidates = pool.query(&query).await?;
            let later = EvidenceQuery {
                from: claim.asserted_at,
                to: DateTime::<Utc>::MAX_UTC,
                ..query.clone()
            };
            for correction in pool.query(&later).await? {
                if correction.timestamp <= claim.asserted_at {
                    continue;
                }
                if let Some(at) = replaced_at(&correction, claim.asserted_at, pool).await? {
                    if at >= window.from {
                        candidates.push(Observation {
                            timestamp: at,
                            ..correction
                        });
                    }
                }
            }
            Ok::<_, EngineError>(candidates)
        };

        let candidates = tokio::time::timeout(timeout, gather)
            .await
            .map_err(|_| EngineError::ResolutionTimeout {
                claim_id: claim.id,
                cohort_id: claim.cohort_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        self.resolve_from(claim, candidates, Utc::now())
    }

    /// Resolve against an already-selected candidate set.
    pub fn resolve_from(
        &self,
        claim: &Claim,
        observations: Vec<Observation>,
        resolved_at: DateTime<Utc>,
    ) -> Result<Verification> {
        let mut candidates: Vec<Candidate> = observations
            .into_iter()
            .filter(|o| o.id != claim.source_observation_id && o.timestamp <= claim.asserted_at)
            .filter_map(|o| {
                let (_, value, _) = o.record()?;
                let authority = self.config.authority_weight(o.source_channel);
                if authority <= 0.0 {
                    return None;
                }
                let age_days =
                    (claim.asserted_at - o.timestamp).num_seconds().max(0) as f64 / 86_400.0;
                let decay = 0.5_f64.powf(age_days / self.config.recency_half_life_days);
                Some(Candidate {
                    value,
                    authority,
                    strength: authority * decay,
                    observation: o,
                })
            })
            .collect();

        if candidates.is_empty() {
            return Err(EngineError::InsufficientEvidence {
                claim_id: claim.id,
                cohort_id: claim.cohort_id.clone(),
                metric: claim.asserted_metric.clone(),
            });
        }

        candidates.sort_by(|a, b| {
            b.authority
                .partial_cmp(&a.authority)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.observation.ordering_key().cmp(&a.observation.ordering_key()))
        });

        let top_channel = candidates[0].observation.source_channel;
        let metric = normalize_metric(&claim.asserted_metric);
        let additive = self.config.is_additive(&metric)
            || candidates
                .iter()
                .filter(|c| c.observation.source_channel == top_channel)
                .any(|c| c.observation.record().is_some_and(|(_, _, a)| a));

        let resolved_value = if additive {
            candidates
                .iter()
                .filter(|c| c.observation.source_channel == top_channel)
                .map(|c| c.value)
                .sum()
        } else {
            candidates[0].value
        };

        let roles: Vec<Role> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let same_channel = c.observation.source_channel == top_channel;
                if additive && same_channel {
                    Role::Component
                } else if self.agrees(c.value, resolved_value) {
                    Role::Supports
                } else if same_channel && i > 0 {
                    Role::Stale
                } else {
                    Role::Dissents
                }
            })
            .collect();

        let confidence = self.confidence(&candidates, &roles);

        let evidence = candidates
            .iter()
            .zip(&roles)
            .map(|(c, role)| EvidenceRef {
                observation_id: c.observation.id,
                justification: justify(c, *role),
            })
            .collect();

        debug!(
            claim_id = %claim.id,
            cohort_id = %claim.cohort_id,
            metric = %metric,
            resolved_value,
            confidence,
            additive,
            "claim resolved"
        );

        Verification::new(claim.id, resolved_value, evidence, confidence, resolved_at)
    }

    fn agrees(&self, a: f64, b: f64) -> bool {
        let scale = a.abs().max(b.abs());
        if scale == 0.0 {
            return true;
        }
        (a - b).abs() / scale <= self.config.agreement_tolerance
    }

    fn confidence(&self, candidates: &[Candidate], roles: &[Role]) -> f64 {
        let credence = self.config.evidence_credence;
        let mut disbelief = 1.0;
        let mut support_w = 0.0;
        let mut dissent_w = 0.0;

        for (c, role) in candidates.iter().zip(roles) {
            match role {
                Role::Supports | Role::Component => {
                    disbelief *= 1.0 - credence * c.strength;
                    support_w += c.strength;
                }
                Role::Dissents => dissent_w += c.strength,
                Role::Stale => {}
            }
        }

        let support = 1.0 - disbelief;
        let total = support_w + dissent_w;
        let penalty = if total > 0.0 {
            1.0 - MAX_DISSENT_PENALTY * dissent_w / total
        } else {
            1.0
        };
        (support * penalty).clamp(0.0, 1.0)
    }
}

/// Longest supersede chain followed back from a correction.
const MAX_CORRECTION_DEPTH: usize = 16;

/// Timestamp of the earliest record at or before `cutoff` that `correction`
/// replaces, directly or through earlier corrections.
async fn replaced_at(
    correction: &Observation,
    cutoff: DateTime<Utc>,
    pool: &dyn ObservationStore,
) -> Result<Option<DateTime<Utc>>> {
    let mut target = correction.supersedes;
    for _ in 0..MAX_CORRECTION_DEPTH {
        let Some(id) = target else {
            return Ok(None);
        };
        let Some(prev) = pool.get(id).await? else {
            return Ok(None);
        };
        if prev.timestamp <= cutoff {
            return Ok(Some(prev.timestamp));
        }
        target = prev.supersedes;
    }
    Ok(None)
}

fn justify(c: &Candidate, role: Role) -> String {
    let (metric, value, _) = c.observation.record().unwrap_or(("?", c.value, false));
    let role = match role {
        Role::Supports => "supports resolved value",
        Role::Component => "component of summed value",
        Role::Dissents => "disagrees with resolved value",
        Role::Stale => "superseded by a newer record",
    };
    format!(
        "{} record '{}' = {} on {} (authority {:.2}): {}",
        c.observation.source_channel,
        metric,
        value,
        c.observation.timestamp.format("%Y-%m-%d"),
        c.authority,
        role
    )
}
