//! Factcheck Core - Fact Deviation & Sentiment Anomaly Engine
//!
//! Ingests observations from heterogeneous channels (meetings, ledgers,
//! messages, documents, sensors), checks the quantitative claims people make
//! against authoritative records, compares public and private sentiment per
//! cohort, and reports both kinds of finding as audit events.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Producers: meeting transcripts, ERP, chat, documents, sensors  │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │        SourceAdapter  ──►  ObservationStore  ──►  Resequencer    │
//! └─────────────────────────────────────────────────────────────────┘
//!                │                                   │
//!        meeting / document                       message
//!                ▼                                   ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │ ClaimExtractor               │   │ SentimentDetector            │
//! │   ► GroundTruthResolver      │   │   windows per cohort/bucket  │
//! │   ► DeviationScorer          │   │   finalize ► compare         │
//! └──────────────────────────────┘   └──────────────────────────────┘
//!                │ DeviationRecord                   │ AnomalyRecord
//!                ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          CaseAggregator  (event log, current view, stream)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use factcheck_core::{AuditEngine, EngineConfig, RawInput, Scheduler, SourceChannel};
//!
//! let config = EngineConfig::from_file("config/factcheck.yaml")?;
//! let engine = Arc::new(AuditEngine::new(config)?);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let scheduler = Scheduler::new(engine.clone());
//! tokio::spawn(async move { scheduler.run(shutdown_rx).await });
//!
//! engine
//!     .submit_observation(
//!         RawInput::text("cfo", "finance", "Q3 revenue is $5.2M"),
//!         SourceChannel::Meeting,
//!     )
//!     .await?;
//! ```

pub mod adapter;
pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod resequence;
pub mod resolver;
pub mod scheduler;
pub mod scorer;
pub mod sentiment;
pub mod store;
pub mod types;

// Re-export main types
pub use adapter::{RawInput, SourceAdapter};
pub use aggregator::{AuditEventStream, CaseAggregator};
pub use config::{ClaimRule, EngineConfig, RetryPolicy, SeverityThresholds};
pub use engine::{AuditEngine, EngineHealth, Submission, TickReport};
pub use error::{EngineError, Result};
pub use extractor::{ClaimExtractor, ClaimMatcher, MetricMatch, PatternMatcher};
pub use resolver::GroundTruthResolver;
pub use scheduler::Scheduler;
pub use scorer::{DeviationScorer, Narrative, NarrativeRequest, NarrativeSummarizer, TemplateSummarizer};
pub use sentiment::{LexiconScorer, SentimentDetector, SentimentScore, SentimentScorer};
pub use store::{EvidenceQuery, MemoryObservationStore, ObservationStore};
pub use types::*;
