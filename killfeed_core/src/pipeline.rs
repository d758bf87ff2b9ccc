use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::ingest::IngestionEngine;
use crate::isolation::IsolationManager;
use crate::models::{ServerId, TenantId};
use crate::store::{ListQuery, TenantDirectory};
use crate::validate::{ValidationEngine, ValidationSummary};
use crate::{Error, Result};

const PAGE_SIZE: usize = 200;

/// Outcome of one pass over every registered profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub profiles_total: u64,
    pub profiles_succeeded: u64,
    pub profiles_failed: u64,
    pub events_applied: u64,
    pub cancelled: bool,
    pub successful: bool,
    pub summaries: Vec<ValidationSummary>,
}

/// enter -> ingest -> validate -> exit, per profile.
pub struct IngestionPipeline {
    isolation: Arc<IsolationManager>,
    directory: Arc<dyn TenantDirectory>,
    ingestion: Arc<IngestionEngine>,
    validation: Arc<ValidationEngine>,
    max_concurrency: usize,
}

impl IngestionPipeline {
    pub fn new(
        isolation: Arc<IsolationManager>,
        directory: Arc<dyn TenantDirectory>,
        ingestion: Arc<IngestionEngine>,
        validation: Arc<ValidationEngine>,
    ) -> Self {
        Self {
            isolation,
            directory,
            ingestion,
            validation,
            max_concurrency: 4,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Run one profile. Per-profile problems are reported in the summary, never raised.
    #[tracing::instrument(level = "info", skip(self, cancel))]
    pub async fn run_profile(
        &self,
        tenant_id: TenantId,
        server_id: ServerId,
        cancel: &CancellationToken,
    ) -> ValidationSummary {
        let scoped = match self.isolation.enter(tenant_id, server_id.clone()).await {
            Ok(scoped) => scoped,
            Err(e) => {
                tracing::warn!(error = %e, "cannot enter isolation context");
                return ValidationSummary::rejected(tenant_id, server_id, e.to_string());
            }
        };

        let ingestion = match scoped.profile().cloned() {
            Some(profile) => self.ingestion.run(&scoped, &profile, cancel).await,
            None => Err(Error::NotFound(format!(
                "no server profile registered for {tenant_id}/{server_id}"
            ))),
        };
        let summary = self.validation.validate(&scoped, &ingestion).await;
        scoped.exit();
        summary
    }

    /// Run every registered profile with bounded concurrency.
    ///
    /// Directory failures abort the batch; profile failures are reported per summary.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_all(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        let started_at = Utc::now();
        let mut scopes = Vec::new();
        let mut offset = 0usize;
        loop {
            let batch = self
                .directory
                .list_profiles(ListQuery {
                    limit: PAGE_SIZE,
                    offset,
                })
                .await?;
            if batch.is_empty() {
                break;
            }
            let len = batch.len();
            scopes.extend(batch.into_iter().map(|p| (p.tenant_id, p.server_id)));
            if len < PAGE_SIZE {
                break;
            }
            offset += len;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut futures = FuturesUnordered::new();
        for (tenant_id, server_id) in scopes {
            let semaphore = semaphore.clone();
            futures.push(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::BackendMessage("pipeline semaphore closed".to_string()))?;
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                Ok::<_, Error>(Some(self.run_profile(tenant_id, server_id, cancel).await))
            });
        }

        let mut summaries = Vec::new();
        while let Some(result) = futures.next().await {
            if let Some(summary) = result? {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| {
            (a.tenant_id, &a.server_id).cmp(&(b.tenant_id, &b.server_id))
        });

        let succeeded = summaries.iter().filter(|s| s.successful).count() as u64;
        let report = BatchReport {
            batch_id: uuid::Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            profiles_total: summaries.len() as u64,
            profiles_succeeded: succeeded,
            profiles_failed: summaries.len() as u64 - succeeded,
            events_applied: summaries.iter().map(|s| s.events_applied).sum(),
            cancelled: cancel.is_cancelled(),
            successful: succeeded == summaries.len() as u64,
            summaries,
        };
        tracing::info!(
            batch_id = %report.batch_id,
            profiles = report.profiles_total,
            failed = report.profiles_failed,
            events_applied = report.events_applied,
            "ingestion batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorSettings, MemoryTransport, RemoteFileConnector};
    use crate::models::{Credentials, IsolationMode, ServerProfile};
    use crate::store::{MemoryRecordStore, MemoryTenantDirectory, RecordStore};

    async fn pipeline_with(
        profiles: Vec<ServerProfile>,
        transport: &MemoryTransport,
        store: &MemoryRecordStore,
    ) -> (IngestionPipeline, Arc<IsolationManager>) {
        let directory = Arc::new(MemoryTenantDirectory::with_profiles(profiles).await);
        let connector = Arc::new(RemoteFileConnector::new(
            Arc::new(transport.clone()),
            ConnectorSettings::default(),
        ));
        let isolation = Arc::new(IsolationManager::new(directory.clone()));
        let ingestion = Arc::new(IngestionEngine::new(
            connector,
            Arc::new(store.clone()),
            directory.clone(),
        ));
        let validation = Arc::new(ValidationEngine::new(Arc::new(store.clone())));
        (
            IngestionPipeline::new(isolation.clone(), directory, ingestion, validation),
            isolation,
        )
    }

    fn standard(tenant: i64, server: &str) -> ServerProfile {
        ServerProfile::new(TenantId(tenant), server, "Server", IsolationMode::Standard, None)
            .unwrap()
            .with_primary(Credentials::new("host.example.net", 22, "admin", "pw"))
    }

    #[tokio::test]
    async fn run_profile_ingests_and_releases_context() {
        let transport = MemoryTransport::new();
        transport
            .put_file(
                "data/deathlogs/2024.05.01-00.00.00.csv",
                "2024-05-01T00:00:00Z,kill,A,B,AK-47,10\n",
                Utc::now(),
            )
            .await;
        let store = MemoryRecordStore::new();
        let (pipeline, isolation) = pipeline_with(vec![standard(1, "s1")], &transport, &store).await;

        let summary = pipeline
            .run_profile(TenantId(1), ServerId::from("s1"), &CancellationToken::new())
            .await;
        assert!(summary.successful, "{:?}", summary.error_message);
        assert_eq!(summary.events_applied, 1);
        assert!(summary.mismatch.is_none());
        assert_eq!(isolation.active_contexts(TenantId(1), &ServerId::from("s1")), 0);
    }

    #[tokio::test]
    async fn invalid_scope_is_reported_not_raised() {
        let (pipeline, _) =
            pipeline_with(vec![], &MemoryTransport::new(), &MemoryRecordStore::new()).await;
        let summary = pipeline
            .run_profile(TenantId(-1), ServerId::from("s1"), &CancellationToken::new())
            .await;
        assert!(!summary.successful);
        assert!(summary.error_message.unwrap().contains("invalid scope"));
    }

    #[tokio::test]
    async fn run_all_keeps_tenants_apart() {
        let transport = MemoryTransport::new();
        transport
            .put_file(
                "data/deathlogs/2024.05.01-00.00.00.csv",
                "2024-05-01T00:00:00Z,kill,A,B,AK-47,10\n",
                Utc::now(),
            )
            .await;
        let store = MemoryRecordStore::new();
        let sentinel = ServerProfile::sentinel(TenantId(3), "default").unwrap();
        let (pipeline, _) = pipeline_with(
            vec![standard(1, "s1"), standard(2, "s1"), sentinel],
            &transport,
            &store,
        )
        .await;

        let report = pipeline
            .with_max_concurrency(2)
            .run_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.profiles_total, 3);
        assert!(report.successful);
        assert_eq!(report.events_applied, 2);
        for tenant in [1, 2] {
            assert_eq!(
                store
                    .count_players(TenantId(tenant), &ServerId::from("s1"))
                    .await
                    .unwrap(),
                2
            );
        }
        assert_eq!(
            store
                .count_players(TenantId(3), &ServerId::from("default"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn cancelled_batch_runs_nothing() {
        let store = MemoryRecordStore::new();
        let (pipeline, _) =
            pipeline_with(vec![standard(1, "s1")], &MemoryTransport::new(), &store).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = pipeline.run_all(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.profiles_total, 0);
    }
}
