//! Scheduler: background loop driving [`AuditEngine::tick`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::engine::AuditEngine;

pub struct Scheduler {
    engine: Arc<AuditEngine>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<AuditEngine>) -> Self {
        let interval = engine.config().tick_interval();
        Self { engine, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Tick until the shutdown flag flips to `true`. Spawn via `tokio::spawn`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started (interval={:?})", self.interval);

        loop {
            if *shutdown.borrow() {
                info!("Scheduler shutting down");
                break;
            }

            match self.engine.tick(Utc::now()).await {
                Ok(report) if report.anomalies > 0 || report.claims_retried > 0 => {
                    info!(
                        anomalies = report.anomalies,
                        claims_retried = report.claims_retried,
                        "tick produced work"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "engine tick failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
