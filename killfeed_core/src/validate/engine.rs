use std::sync::Arc;

use crate::ingest::IngestionReport;
use crate::isolation::IsolationContext;
use crate::leaderboard::DEFAULT_LEADERBOARD_LIMIT;
use crate::store::{AggregateTotals, Metric, RecordStore};
use crate::validate::models::{ReconciliationMismatch, ValidationSummary};
use crate::{Error, Result};

/// Audits the record store after an ingestion run. Never returns an error.
pub struct ValidationEngine {
    store: Arc<dyn RecordStore>,
    limit: usize,
}

impl ValidationEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            limit: DEFAULT_LEADERBOARD_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(tenant_id = %ctx.tenant_id(), server_id = %ctx.server_id(), mode = %ctx.mode())
    )]
    pub async fn validate(
        &self,
        ctx: &IsolationContext,
        ingestion: &Result<IngestionReport>,
    ) -> ValidationSummary {
        let mut summary =
            ValidationSummary::new(ctx.tenant_id(), ctx.server_id().clone(), ctx.mode());

        let report = match ingestion {
            Ok(report) => Some(report),
            Err(e) => {
                summary.fail(format!("ingestion failed: {e}"));
                None
            }
        };
        if let Some(report) = report {
            copy_report(&mut summary, report);
        }

        if let Err(e) = self.check_queries(ctx, &mut summary).await {
            tracing::warn!(error = %e, "validation queries failed");
            summary.fail(format!("validation query failed: {e}"));
        }

        if ctx.is_restricted() {
            tracing::info!("validation completed for restricted server");
            summary.finish();
            return summary;
        }

        if let Some(report) = report {
            match self.recompute_totals(ctx).await {
                Ok((players, actual)) => {
                    summary.players_total = players;
                    let expected = report.expected_totals();
                    if actual != expected {
                        tracing::warn!(?expected, ?actual, "reconciliation mismatch");
                        summary.mismatch = Some(ReconciliationMismatch { expected, actual });
                    }
                }
                Err(e) => summary.fail(format!("total recomputation failed: {e}")),
            }
        }

        summary.finish();
        tracing::info!(
            successful = summary.successful,
            players = summary.players_total,
            mismatch = summary.mismatch.is_some(),
            duration_ms = summary.duration_ms,
            "validation completed"
        );
        summary
    }

    async fn check_queries(
        &self,
        ctx: &IsolationContext,
        summary: &mut ValidationSummary,
    ) -> Result<()> {
        summary.top_kills_entries = self.top_entries(ctx, Metric::Kills).await?;
        summary.top_deaths_entries = self.top_entries(ctx, Metric::Deaths).await?;
        summary.top_kd_entries = self.top_entries(ctx, Metric::KillDeathRatio).await?;
        Ok(())
    }

    async fn top_entries(&self, ctx: &IsolationContext, metric: Metric) -> Result<usize> {
        if ctx.is_restricted() {
            return Ok(0);
        }
        let rows = self
            .store
            .query_top_by_metric(ctx.tenant_id(), ctx.server_id(), metric, self.limit)
            .await?;
        if let Some(foreign) = rows.iter().find(|p| !ctx.verify_entity(*p)) {
            return Err(Error::Unauthorized(format!(
                "store returned player '{}' from {}/{}",
                foreign.player_name, foreign.tenant_id, foreign.server_id
            )));
        }
        Ok(rows.len())
    }

    async fn recompute_totals(&self, ctx: &IsolationContext) -> Result<(u64, AggregateTotals)> {
        let count = self
            .store
            .count_players(ctx.tenant_id(), ctx.server_id())
            .await?;
        let players = self
            .store
            .query_top_by_metric(
                ctx.tenant_id(),
                ctx.server_id(),
                Metric::Kills,
                usize::try_from(count).unwrap_or(usize::MAX),
            )
            .await?;
        let mut totals = AggregateTotals::default();
        for p in &players {
            totals.add_player(p);
        }
        Ok((count, totals))
    }
}

fn copy_report(summary: &mut ValidationSummary, report: &IngestionReport) {
    summary.files_found = report.files_found;
    summary.files_processed = report.files_processed;
    summary.lines_processed = report.lines_processed;
    summary.events_applied = report.events_applied;
    summary.parse_errors = report.parse_errors;
    summary.file_errors = report.file_errors;
    summary.log_events_processed = report.log_events_processed;
    summary.rotation_detected = report.rotation_detected;
    summary.connection_error = report.connection_error.clone();
    if let Some(started) = report.started_at {
        summary.started_at = started;
    }
    if let Some(err) = &report.commit_error {
        summary.fail(format!("commit failed: {err}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IsolationMode, ServerId, TenantId};
    use crate::store::{EventCommit, MemoryRecordStore, StatDelta};

    fn ctx(mode: IsolationMode) -> IsolationContext {
        IsolationContext::new(TenantId(3), "s", mode).unwrap()
    }

    async fn store_with_one_kill() -> MemoryRecordStore {
        let store = MemoryRecordStore::new();
        store
            .upsert_player_stats(
                TenantId(3),
                &ServerId::from("s"),
                &[EventCommit {
                    dedupe_key: "k".to_string(),
                    deltas: vec![
                        StatDelta {
                            kills: 1,
                            ..StatDelta::for_player("A")
                        },
                        StatDelta {
                            deaths: 1,
                            ..StatDelta::for_player("B")
                        },
                    ],
                }],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn sentinel_summary_is_successful_and_empty() {
        let engine = ValidationEngine::new(Arc::new(store_with_one_kill().await));
        let report = IngestionReport {
            restricted: true,
            ..IngestionReport::default()
        };
        let summary = engine.validate(&ctx(IsolationMode::Sentinel), &Ok(report)).await;
        assert!(summary.successful);
        assert!(summary.error_message.is_none());
        assert_eq!(summary.top_kills_entries, 0);
        assert_eq!(summary.top_deaths_entries, 0);
        assert_eq!(summary.top_kd_entries, 0);
        assert_eq!(summary.players_total, 0);
        assert!(summary.mismatch.is_none());
    }

    #[tokio::test]
    async fn sentinel_summary_keeps_ingestion_failure() {
        let engine = ValidationEngine::new(Arc::new(store_with_one_kill().await));
        let summary = engine
            .validate(
                &ctx(IsolationMode::Sentinel),
                &Err(Error::Conflict("busy".to_string())),
            )
            .await;
        assert!(!summary.successful);
        assert_eq!(summary.top_kills_entries, 0);
        assert!(summary.error_message.unwrap().contains("busy"));
    }

    #[tokio::test]
    async fn matching_totals_have_no_mismatch() {
        let engine = ValidationEngine::new(Arc::new(store_with_one_kill().await));
        let report = IngestionReport {
            applied_totals: AggregateTotals {
                kills: 1,
                deaths: 1,
                suicides: 0,
            },
            ..IngestionReport::default()
        };
        let summary = engine.validate(&ctx(IsolationMode::Standard), &Ok(report)).await;
        assert!(summary.successful);
        assert_eq!(summary.players_total, 2);
        assert_eq!(summary.top_kills_entries, 2);
        assert!(summary.mismatch.is_none());
    }

    #[tokio::test]
    async fn mismatch_is_advisory() {
        let engine = ValidationEngine::new(Arc::new(store_with_one_kill().await));
        let summary = engine
            .validate(&ctx(IsolationMode::Standard), &Ok(IngestionReport::default()))
            .await;
        assert!(summary.successful);
        let mismatch = summary.mismatch.unwrap();
        assert_eq!(mismatch.expected.kills, 0);
        assert_eq!(mismatch.actual.kills, 1);
    }

    #[tokio::test]
    async fn ingestion_error_is_captured() {
        let engine = ValidationEngine::new(Arc::new(MemoryRecordStore::new()));
        let summary = engine
            .validate(
                &ctx(IsolationMode::Standard),
                &Err(Error::Conflict("busy".to_string())),
            )
            .await;
        assert!(!summary.successful);
        assert!(summary.error_message.unwrap().contains("busy"));
    }
}
