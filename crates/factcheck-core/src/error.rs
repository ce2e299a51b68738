use thiserror::Error;
use uuid::Uuid;

use crate::types::SourceChannel;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed {channel} observation: {reason}")]
    MalformedObservation {
        channel: SourceChannel,
        reason: String,
    },

    #[error("insufficient evidence for claim {claim_id} ({metric} in cohort {cohort_id})")]
    InsufficientEvidence {
        claim_id: Uuid,
        cohort_id: String,
        metric: String,
    },

    #[error("evidence resolution for claim {claim_id} (cohort {cohort_id}) timed out after {timeout_ms}ms")]
    ResolutionTimeout {
        claim_id: Uuid,
        cohort_id: String,
        timeout_ms: u64,
    },

    #[error("narrative generation for claim {claim_id} timed out after {timeout_ms}ms")]
    NarrativeTimeout { claim_id: Uuid, timeout_ms: u64 },

    #[error("invalid verification: {0}")]
    InvalidVerification(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MalformedObservation { .. } => 400,
            Self::InvalidConfig(_) => 400,
            Self::NotFound(_) => 404,
            Self::InsufficientEvidence { .. } => 422,
            Self::InvalidVerification(_) => 422,
            Self::ResolutionTimeout { .. } | Self::NarrativeTimeout { .. } => 504,
            Self::Internal(_) => 500,
        }
    }

    /// Timeouts against external dependencies are retried with backoff;
    /// everything else is terminal for the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResolutionTimeout { .. } | Self::NarrativeTimeout { .. }
        )
    }

    /// Stable machine-readable kind, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedObservation { .. } => "malformed_observation",
            Self::InsufficientEvidence { .. } => "insufficient_evidence",
            Self::ResolutionTimeout { .. } => "resolution_timeout",
            Self::NarrativeTimeout { .. } => "narrative_timeout",
            Self::InvalidVerification(_) => "invalid_verification",
            Self::InvalidConfig(_) => "invalid_config",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// Structured context for human-facing boundaries.
    pub fn context(&self) -> serde_json::Value {
        match self {
            Self::MalformedObservation { channel, .. } => {
                serde_json::json!({ "channel": channel })
            }
            Self::InsufficientEvidence {
                claim_id,
                cohort_id,
                metric,
            } => serde_json::json!({
                "claim_id": claim_id,
                "cohort_id": cohort_id,
                "metric": metric,
            }),
            Self::ResolutionTimeout {
                claim_id,
                cohort_id,
                timeout_ms,
            } => serde_json::json!({
                "claim_id": claim_id,
                "cohort_id": cohort_id,
                "timeout_ms": timeout_ms,
            }),
            Self::NarrativeTimeout {
                claim_id,
                timeout_ms,
            } => serde_json::json!({ "claim_id": claim_id, "timeout_ms": timeout_ms }),
            _ => serde_json::Value::Null,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_malformed() {
        let e = EngineError::MalformedObservation {
            channel: SourceChannel::Message,
            reason: "missing cohort_id".into(),
        };
        assert_eq!(e.http_status(), 400);
        assert_eq!(e.to_string(), "malformed message observation: missing cohort_id");
    }

    #[test]
    fn http_status_not_found() {
        assert_eq!(EngineError::NotFound("x".into()).http_status(), 404);
    }

    #[test]
    fn timeouts_are_retryable() {
        let id = Uuid::new_v4();
        assert!(EngineError::NarrativeTimeout {
            claim_id: id,
            timeout_ms: 10
        }
        .is_retryable());
        assert!(EngineError::ResolutionTimeout {
            claim_id: id,
            cohort_id: "c".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!EngineError::InsufficientEvidence {
            claim_id: id,
            cohort_id: "c".into(),
            metric: "revenue".into()
        }
        .is_retryable());
    }

    #[test]
    fn insufficient_evidence_carries_context() {
        let id = Uuid::new_v4();
        let e = EngineError::InsufficientEvidence {
            claim_id: id,
            cohort_id: "proj-apollo".into(),
            metric: "q3 revenue".into(),
        };
        let ctx = e.context();
        assert_eq!(ctx["cohort_id"], "proj-apollo");
        assert_eq!(ctx["metric"], "q3 revenue");
        assert_eq!(e.kind(), "insufficient_evidence");
    }

    #[test]
    fn display_internal() {
        let e = EngineError::Internal(anyhow::anyhow!("boom"));
        assert_eq!(e.to_string(), "internal: boom");
        assert_eq!(e.http_status(), 500);
    }
}
