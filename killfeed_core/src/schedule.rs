use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::pipeline::{BatchReport, IngestionPipeline};
use crate::{Error, Result};

/// Periodically runs the ingestion pipeline over every registered profile.
pub struct IngestionScheduler {
    pipeline: Arc<IngestionPipeline>,
    poll_interval: Duration,
}

impl IngestionScheduler {
    #[tracing::instrument(level = "debug", skip(pipeline))]
    pub fn new(pipeline: Arc<IngestionPipeline>, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        Ok(Self {
            pipeline,
            poll_interval,
        })
    }

    /// Run until `cancel` fires. Tick failures are logged and do not stop the loop.
    #[tracing::instrument(level = "info", skip_all, fields(poll_interval_ms = self.poll_interval.as_millis() as u64))]
    pub async fn run_loop(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("ingestion scheduler cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&cancel).await {
                        tracing::warn!(error = %e, "ingestion scheduler tick failed");
                    }
                }
            }
        }
    }

    pub async fn tick(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        self.pipeline.run_all(cancel).await
    }
}
