//! Sentiment anomaly detection
//!
//! Message observations are scored and folded into per-cohort
//! [`SentimentWindow`]s keyed by `(visibility, bucket)`. A window moves
//! `Collecting -> Finalized` once its bucket has closed, and `Finalized ->
//! Compared` once it has been paired with the overlapping window of the
//! opposite visibility.
//!
//! ```text
//!   Message ──► scorer ──► route ──► [cohort lock] window.accumulate
//!                                          │
//!   tick(now) ─────────────────────────────┴──► finalize ──► pair ──► AnomalyRecord
//! ```
//!
//! Each cohort has its own lock; routing into one cohort never waits on
//! another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::types::{
    AnomalyRecord, IngestOutcome, Observation, SentimentWindow, SourceChannel, TimeRange,
    Visibility, WindowState,
};

/// Polarity in `[-1, 1]` plus the lexicon hits that drove it.
#[derive(Debug, Clone, PartialEq)]
pub struct SentimentScore {
    pub score: f64,
    pub keywords: Vec<String>,
}

pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> SentimentScore;
}

const NEGATORS: &[&str] = &["not", "no", "never", "hardly", "isn't", "don't", "won't"];

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "happy", "confident", "ahead", "growth", "win", "success",
    "smooth", "strong", "optimistic", "progress", "顺利", "满意", "增长", "不错", "成功", "乐观",
];

const NEGATIVE: &[&str] = &[
    "bad", "worried", "concerned", "behind", "delay", "delayed", "risk", "problem", "issue",
    "late", "overdue", "stressed", "frustrated", "burnout", "blocked", "quit", "unpaid", "担心",
    "延期", "风险", "问题", "焦虑", "拖欠", "加班", "离职",
];

/// Word-list scorer. English terms match whole words (a preceding negator
/// flips polarity); CJK terms match as substrings.
#[derive(Debug, Clone)]
pub struct LexiconScorer {
    positive: Vec<String>,
    negative: Vec<String>,
}

impl Default for LexiconScorer {
    fn default() -> Self {
        Self::new(
            POSITIVE.iter().map(|s| s.to_string()).collect(),
            NEGATIVE.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl LexiconScorer {
    pub fn new(positive: Vec<String>, negative: Vec<String>) -> Self {
        let lower = |v: Vec<String>| v.into_iter().map(|s| s.to_lowercase()).collect();
        Self {
            positive: lower(positive),
            negative: lower(negative),
        }
    }
}

impl SentimentScorer for LexiconScorer {
    fn score(&self, text: &str) -> SentimentScore {
        let lowered = text.to_lowercase();
        let mut pos = 0usize;
        let mut neg = 0usize;
        let mut keywords = Vec::new();

        let tokens: Vec<&str> = lowered
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '\''))
            .filter(|t| !t.is_empty())
            .collect();
        for (i, token) in tokens.iter().enumerate() {
            let negated = i > 0 && NEGATORS.contains(&tokens[i - 1]);
            let polarity = if self.positive.iter().any(|p| p == token) {
                1
            } else if self.negative.iter().any(|n| n == token) {
                -1
            } else {
                continue;
            };
            if (polarity > 0) != negated {
                pos += 1;
            } else {
                neg += 1;
            }
            keywords.push(token.to_string());
        }

        for (terms, counter) in [(&self.positive, &mut pos), (&self.negative, &mut neg)] {
            for term in terms.iter().filter(|t| !t.is_ascii()) {
                let hits = lowered.matches(term.as_str()).count();
                if hits > 0 {
                    *counter += hits;
                    keywords.push(term.clone());
                }
            }
        }

        let total = pos + neg;
        let score = if total == 0 {
            0.0
        } else {
            (pos as f64 - neg as f64) / total as f64
        };
        SentimentScore { score, keywords }
    }
}

/// Epoch-aligned `[start, end)` bucket containing `ts`.
pub fn bucket_bounds(ts: DateTime<Utc>, width_secs: i64) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = ts.timestamp().div_euclid(width_secs) * width_secs;
    let to_dt = |secs: i64| {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("timestamp {secs} out of range")))
    };
    Ok((to_dt(start)?, to_dt(start + width_secs)?))
}

/// Pure divergence rule. Returns `None` when the private window is too
/// sparse or the means are closer than the threshold.
pub fn evaluate_divergence(
    public: &SentimentWindow,
    private: &SentimentWindow,
    config: &EngineConfig,
    detected_at: DateTime<Utc>,
) -> Option<AnomalyRecord> {
    if private.sample_count < config.min_sample_size || public.sample_count == 0 {
        return None;
    }
    let divergence = (public.mean_score - private.mean_score).abs();
    if !divergence.is_finite() || divergence < config.divergence_threshold {
        return None;
    }
    Some(AnomalyRecord {
        id: Uuid::new_v4(),
        cohort_id: private.cohort_id.clone(),
        public_window_id: public.id,
        private_window_id: private.id,
        public_mean: public.mean_score,
        private_mean: private.mean_score,
        private_sample_count: private.sample_count,
        divergence_score: divergence,
        severity: config.anomaly_severity_thresholds.classify(Some(divergence)),
        trigger_keywords: private.top_keywords(5),
        window_start: public.bucket_start.min(private.bucket_start),
        window_end: public.bucket_end.max(private.bucket_end),
        detected_at,
    })
}

#[derive(Debug, Default)]
struct CohortSentiment {
    windows: Vec<SentimentWindow>,
    compared_pairs: HashSet<(Uuid, Uuid)>,
    /// Buckets ending at or before this instant accept no more samples.
    finalized_through: Option<DateTime<Utc>>,
}

impl CohortSentiment {
    fn is_closed(&self, bucket_end: DateTime<Utc>) -> bool {
        self.finalized_through.is_some_and(|w| bucket_end <= w)
    }

    fn prune(&mut self, retention: usize) {
        if self.windows.len() <= retention {
            return;
        }
        self.windows.sort_by_key(|w| (w.bucket_start, w.visibility.as_str()));
        let mut excess = self.windows.len() - retention;
        let mut dropped = HashSet::new();
        self.windows.retain(|w| {
            if excess > 0 && w.state != WindowState::Collecting {
                excess -= 1;
                dropped.insert(w.id);
                false
            } else {
                true
            }
        });
        self.compared_pairs
            .retain(|(a, b)| !dropped.contains(a) && !dropped.contains(b));
    }
}

pub struct SentimentDetector {
    config: Arc<EngineConfig>,
    scorer: Arc<dyn SentimentScorer>,
    cohorts: RwLock<HashMap<String, Arc<Mutex<CohortSentiment>>>>,
    /// Highest watermark any tick has reached. Seeds cohorts seen later.
    watermark: RwLock<Option<DateTime<Utc>>>,
}

impl SentimentDetector {
    pub fn new(config: Arc<EngineConfig>, scorer: Arc<dyn SentimentScorer>) -> Self {
        Self {
            config,
            scorer,
            cohorts: RwLock::new(HashMap::new()),
            watermark: RwLock::new(None),
        }
    }

    async fn cohort(&self, cohort_id: &str) -> Arc<Mutex<CohortSentiment>> {
        if let Some(state) = self.cohorts.read().await.get(cohort_id) {
            return state.clone();
        }
        let mut cohorts = self.cohorts.write().await;
        let finalized_through = *self.watermark.read().await;
        cohorts
            .entry(cohort_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CohortSentiment {
                    finalized_through,
                    ..Default::default()
                }))
            })
            .clone()
    }

    /// Fold a message observation into its window.
    pub async fn route(&self, observation: &Observation) -> Result<IngestOutcome> {
        let text = match (observation.source_channel, observation.text()) {
            (SourceChannel::Message, Some(text)) => text,
            _ => return Ok(IngestOutcome::Stored { claims_extracted: 0 }),
        };
        let (bucket_start, bucket_end) =
            bucket_bounds(observation.timestamp, self.config.bucket_width_secs)?;

        let state = self.cohort(&observation.cohort_id).await;
        let mut state = state.lock().await;

        let existing = state.windows.iter().position(|w| {
            w.visibility == observation.visibility && w.bucket_start == bucket_start
        });
        let closed = state.is_closed(bucket_end)
            || existing.is_some_and(|i| state.windows[i].state != WindowState::Collecting);
        if closed {
            tracing::warn!(
                observation_id = %observation.id,
                cohort_id = %observation.cohort_id,
                bucket_start = %bucket_start,
                "dropping late message for finalized sentiment bucket"
            );
            return Ok(IngestOutcome::LateObservationDropped {
                reason: format!("sentiment bucket starting {bucket_start} is already finalized"),
            });
        }

        let scored = self.scorer.score(text);
        let idx = match existing {
            Some(i) => i,
            None => {
                state.windows.push(SentimentWindow::new(
                    observation.cohort_id.clone(),
                    observation.visibility,
                    bucket_start,
                    bucket_end,
                ));
                state.windows.len() - 1
            }
        };
        let window = &mut state.windows[idx];
        window.accumulate(scored.score, &scored.keywords);
        Ok(IngestOutcome::Accumulated {
            window_id: window.id,
        })
    }

    /// Finalize closed buckets in every cohort and compare the newly
    /// finalized windows against their counterparts.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<AnomalyRecord>> {
        let (watermark, _) = bucket_bounds(now, self.config.bucket_width_secs)?;
        {
            let mut global = self.watermark.write().await;
            *global = Some(global.map_or(watermark, |w| w.max(watermark)));
        }
        let cohorts: Vec<_> = self.cohorts.read().await.values().cloned().collect();

        let mut anomalies = Vec::new();
        for cohort in cohorts {
            let mut state = cohort.lock().await;
            anomalies.extend(self.finalize_cohort(&mut state, watermark, now));
            state.prune(self.config.window_retention);
        }
        Ok(anomalies)
    }

    fn finalize_cohort(
        &self,
        state: &mut CohortSentiment,
        watermark: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyRecord> {
        state.finalized_through = Some(state.finalized_through.map_or(watermark, |w| w.max(watermark)));

        let mut newly_finalized = Vec::new();
        for w in state.windows.iter_mut() {
            if w.state == WindowState::Collecting && w.bucket_end <= watermark {
                w.state = WindowState::Finalized;
                tracing::debug!(
                    window_id = %w.id,
                    cohort_id = %w.cohort_id,
                    visibility = w.visibility.as_str(),
                    samples = w.sample_count,
                    mean = w.mean_score,
                    "sentiment window finalized"
                );
                newly_finalized.push(w.id);
            }
        }

        let mut anomalies = Vec::new();
        for id in newly_finalized {
            let Some(window) = state.windows.iter().find(|w| w.id == id).cloned() else {
                continue;
            };
            let partners: Vec<SentimentWindow> = state
                .windows
                .iter()
                .filter(|o| {
                    o.visibility == window.visibility.opposite()
                        && o.state != WindowState::Collecting
                        && o.overlaps(&window)
                })
                .cloned()
                .collect();

            for partner in partners {
                let (public, private) = match window.visibility {
                    Visibility::Public => (&window, &partner),
                    Visibility::Private => (&partner, &window),
                };
                if !state.compared_pairs.insert((public.id, private.id)) {
                    continue;
                }
                if let Some(anomaly) = evaluate_divergence(public, private, &self.config, now) {
                    tracing::info!(
                        anomaly_id = %anomaly.id,
                        cohort_id = %anomaly.cohort_id,
                        divergence = anomaly.divergence_score,
                        severity = %anomaly.severity,
                        "sentiment anomaly detected"
                    );
                    anomalies.push(anomaly);
                }
                for w in state.windows.iter_mut() {
                    if w.id == public.id || w.id == private.id {
                        w.state = WindowState::Compared;
                    }
                }
            }
        }
        anomalies
    }

    /// Windows of a cohort overlapping `range`, oldest first.
    pub async fn windows(&self, cohort_id: &str, range: &TimeRange) -> Vec<SentimentWindow> {
        let Some(state) = self.cohorts.read().await.get(cohort_id).cloned() else {
            return Vec::new();
        };
        let state = state.lock().await;
        let mut out: Vec<_> = state
            .windows
            .iter()
            .filter(|w| range.overlaps(w.bucket_start, w.bucket_end))
            .cloned()
            .collect();
        out.sort_by_key(|w| (w.bucket_start, w.visibility.as_str()));
        out
    }
}
