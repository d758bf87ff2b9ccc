use crate::Result;
use crate::models::{ServerId, ServerProfile, TenantId, Watermark};
use crate::store::models::{CommitOutcome, EventCommit, ListQuery, Metric, PlayerStats};
use async_trait::async_trait;

/// Persistence for derived player statistics.
///
/// Implementations must scope every call to the given (tenant, server) pair and
/// must ignore commits whose `dedupe_key` has already been applied.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert_player_stats(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
        commits: &[EventCommit],
    ) -> Result<CommitOutcome>;

    /// Players ordered by `metric` descending, ties broken by name.
    async fn query_top_by_metric(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
        metric: Metric,
        limit: usize,
    ) -> Result<Vec<PlayerStats>>;

    async fn count_players(&self, tenant_id: TenantId, server_id: &ServerId) -> Result<u64>;
}

/// Registry of server profiles and their ingestion watermarks.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get_profile(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
    ) -> Result<Option<ServerProfile>>;

    async fn list_profiles(&self, query: ListQuery) -> Result<Vec<ServerProfile>>;

    async fn upsert_profile(&self, profile: &ServerProfile) -> Result<()>;

    async fn update_watermark(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
        watermark: &Watermark,
    ) -> Result<()>;
}
