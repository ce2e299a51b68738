//! Source adapters
//!
//! Normalize raw channel input into [`Observation`]s. Ingestion is
//! all-or-nothing per record: validation runs before any sequence number is
//! consumed, so a rejected record leaves no trace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::types::{Observation, ObservationPayload, SourceChannel, Visibility};

/// Raw, channel-agnostic input as submitted by producers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInput {
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub cohort_id: Option<String>,
    /// Defaults to ingestion time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub additive: Option<bool>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub supersedes: Option<Uuid>,
}

impl RawInput {
    pub fn text(actor_id: &str, cohort_id: &str, text: &str) -> Self {
        Self {
            actor_id: Some(actor_id.to_string()),
            cohort_id: Some(cohort_id.to_string()),
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    pub fn record(actor_id: &str, cohort_id: &str, metric: &str, value: f64) -> Self {
        Self {
            actor_id: Some(actor_id.to_string()),
            cohort_id: Some(cohort_id.to_string()),
            metric: Some(metric.to_string()),
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn additive(mut self) -> Self {
        self.additive = Some(true);
        self
    }
}

/// Accepted observation years. Keeps window arithmetic far from chrono's
/// representable limits.
const TIMESTAMP_YEARS: std::ops::RangeInclusive<i32> = 1900..=9999;

/// Assigns ids and sequence numbers; stateless apart from counters.
pub struct SourceAdapter {
    channel_seq: [AtomicU64; 5],
    cohort_seq: Mutex<HashMap<(String, SourceChannel), u64>>,
}

impl Default for SourceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceAdapter {
    pub fn new() -> Self {
        Self {
            channel_seq: Default::default(),
            cohort_seq: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and normalize one raw record.
    pub fn ingest(
        &self,
        raw: RawInput,
        channel: SourceChannel,
        now: DateTime<Utc>,
    ) -> Result<Observation> {
        let malformed = |reason: &str| EngineError::MalformedObservation {
            channel,
            reason: reason.to_string(),
        };

        let actor_id = non_blank(raw.actor_id).ok_or_else(|| malformed("missing actor_id"))?;
        let cohort_id = non_blank(raw.cohort_id).ok_or_else(|| malformed("missing cohort_id"))?;
        let payload = build_payload(
            channel,
            non_blank(raw.text),
            non_blank(raw.metric),
            raw.value,
            raw.additive.unwrap_or(false),
            non_blank(raw.reference),
        )
        .map_err(|reason| malformed(&reason))?;

        let timestamp = raw.timestamp.unwrap_or(now);
        if !TIMESTAMP_YEARS.contains(&timestamp.year()) {
            return Err(malformed(&format!(
                "timestamp {timestamp} outside supported range"
            )));
        }

        let (sequence, cohort_sequence) = self.next_sequences(&cohort_id, channel);

        Ok(Observation {
            id: Uuid::new_v4(),
            source_channel: channel,
            sequence,
            cohort_sequence,
            timestamp,
            actor_id,
            cohort_id,
            payload,
            visibility: raw.visibility.unwrap_or_default(),
            supersedes: raw.supersedes,
        })
    }

    fn next_sequences(&self, cohort_id: &str, channel: SourceChannel) -> (u64, u64) {
        let mut cohorts = self
            .cohort_seq
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sequence = self.channel_seq[channel_index(channel)].fetch_add(1, Ordering::SeqCst) + 1;
        let slot = cohorts
            .entry((cohort_id.to_string(), channel))
            .or_insert(0);
        *slot += 1;
        (sequence, *slot)
    }
}

fn channel_index(channel: SourceChannel) -> usize {
    match channel {
        SourceChannel::Meeting => 0,
        SourceChannel::Ledger => 1,
        SourceChannel::Message => 2,
        SourceChannel::Document => 3,
        SourceChannel::Sensor => 4,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn build_payload(
    channel: SourceChannel,
    text: Option<String>,
    metric: Option<String>,
    value: Option<f64>,
    additive: bool,
    reference: Option<String>,
) -> std::result::Result<ObservationPayload, String> {
    let record = || -> std::result::Result<ObservationPayload, String> {
        let metric = metric.clone().ok_or("missing metric")?;
        let value = value.ok_or("missing value")?;
        if !value.is_finite() {
            return Err("value is not a finite number".into());
        }
        Ok(ObservationPayload::Record {
            metric,
            value,
            additive,
            reference: reference.clone(),
        })
    };

    match channel {
        SourceChannel::Meeting | SourceChannel::Message => text
            .map(|text| ObservationPayload::Text { text })
            .ok_or_else(|| "missing text".to_string()),
        SourceChannel::Ledger | SourceChannel::Sensor => record(),
        SourceChannel::Document => {
            if metric.is_some() || value.is_some() {
                record()
            } else {
                text.map(|text| ObservationPayload::Text { text })
                    .ok_or_else(|| "document needs text or a metric/value record".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cohort_is_malformed() {
        let adapter = SourceAdapter::new();
        let raw = RawInput {
            actor_id: Some("cfo".into()),
            text: Some("revenue was 5M".into()),
            ..Default::default()
        };
        let err = adapter
            .ingest(raw, SourceChannel::Meeting, Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedObservation { .. }));
    }

    #[test]
    fn test_out_of_range_timestamp_is_malformed() {
        let adapter = SourceAdapter::new();
        for at in [DateTime::<Utc>::MAX_UTC, DateTime::<Utc>::MIN_UTC] {
            let raw = RawInput::text("cfo", "finance", "revenue is 5M").at(at);
            let err = adapter
                .ingest(raw, SourceChannel::Meeting, Utc::now())
                .unwrap_err();
            assert!(matches!(err, EngineError::MalformedObservation { .. }));
        }
    }

    #[test]
    fn test_blank_actor_is_malformed() {
        let adapter = SourceAdapter::new();
        let raw = RawInput::text("   ", "finance", "hello");
        assert!(adapter.ingest(raw, SourceChannel::Message, Utc::now()).is_err());
    }

    #[test]
    fn test_rejection_consumes_no_sequence() {
        let adapter = SourceAdapter::new();
        let bad = RawInput {
            actor_id: Some("a".into()),
            cohort_id: Some("c".into()),
            ..Default::default()
        };
        assert!(adapter.ingest(bad, SourceChannel::Ledger, Utc::now()).is_err());
        let obs = adapter
            .ingest(
                RawInput::record("a", "c", "revenue", 1.0),
                SourceChannel::Ledger,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(obs.sequence, 1);
        assert_eq!(obs.cohort_sequence, 1);
    }

    #[test]
    fn test_sequences_per_channel_and_cohort() {
        let adapter = SourceAdapter::new();
        let now = Utc::now();
        let a1 = adapter
            .ingest(RawInput::text("u", "a", "hi"), SourceChannel::Message, now)
            .unwrap();
        let b1 = adapter
            .ingest(RawInput::text("u", "b", "hi"), SourceChannel::Message, now)
            .unwrap();
        let a2 = adapter
            .ingest(RawInput::text("u", "a", "hi"), SourceChannel::Message, now)
            .unwrap();
        let l1 = adapter
            .ingest(
                RawInput::record("u", "a", "revenue", 2.0),
                SourceChannel::Ledger,
                now,
            )
            .unwrap();

        assert_eq!((a1.sequence, b1.sequence, a2.sequence), (1, 2, 3));
        assert_eq!((a1.cohort_sequence, b1.cohort_sequence, a2.cohort_sequence), (1, 1, 2));
        assert_eq!((l1.sequence, l1.cohort_sequence), (1, 1));
    }

    #[test]
    fn test_document_accepts_text_or_record() {
        let adapter = SourceAdapter::new();
        let now = Utc::now();
        let text = adapter
            .ingest(RawInput::text("u", "c", "Budget is 2M"), SourceChannel::Document, now)
            .unwrap();
        assert!(text.text().is_some());
        let rec = adapter
            .ingest(
                RawInput::record("u", "c", "budget", 1.5e6).additive(),
                SourceChannel::Document,
                now,
            )
            .unwrap();
        assert_eq!(rec.record(), Some(("budget", 1.5e6, true)));
    }

    #[test]
    fn test_non_finite_value_rejected() {
        let adapter = SourceAdapter::new();
        let raw = RawInput::record("u", "c", "revenue", f64::INFINITY);
        assert!(adapter.ingest(raw, SourceChannel::Ledger, Utc::now()).is_err());
    }
}
