use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::models::{ServerId, ServerProfile, TenantId, Watermark};
use crate::store::models::{
    CommitOutcome, EventCommit, ListQuery, Metric, PlayerStats, RecordSnapshot, ScopeSnapshot,
};
use crate::store::traits::{RecordStore, TenantDirectory};
use crate::{Error, Result};

type ScopeKey = (TenantId, ServerId);

#[derive(Default)]
struct ScopeRecords {
    players: BTreeMap<String, PlayerStats>,
    applied_keys: HashSet<String>,
}

/// In-memory RecordStore for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    scopes: Arc<Mutex<HashMap<ScopeKey, ScopeRecords>>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one scope's players keyed by name (primarily for tests).
    pub async fn players(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
    ) -> BTreeMap<String, PlayerStats> {
        self.scopes
            .lock()
            .await
            .get(&(tenant_id, server_id.clone()))
            .map(|s| s.players.clone())
            .unwrap_or_default()
    }

    /// Copy of every scope, ordered by tenant then server.
    pub async fn export(&self) -> RecordSnapshot {
        let scopes = self.scopes.lock().await;
        let mut out: Vec<ScopeSnapshot> = scopes
            .iter()
            .map(|((tenant_id, server_id), records)| {
                let mut applied_keys: Vec<String> = records.applied_keys.iter().cloned().collect();
                applied_keys.sort();
                ScopeSnapshot {
                    tenant_id: *tenant_id,
                    server_id: server_id.clone(),
                    players: records.players.values().cloned().collect(),
                    applied_keys,
                }
            })
            .collect();
        out.sort_by(|a, b| {
            (a.tenant_id, a.server_id.as_str()).cmp(&(b.tenant_id, b.server_id.as_str()))
        });
        RecordSnapshot { scopes: out }
    }

    /// Replace the store contents with `snapshot`. Rejects players filed under a
    /// scope they do not belong to and leaves the store untouched on error.
    #[tracing::instrument(level = "info", skip_all, fields(scopes = snapshot.scopes.len()))]
    pub async fn import(&self, snapshot: RecordSnapshot) -> Result<()> {
        let mut loaded = HashMap::with_capacity(snapshot.scopes.len());
        for scope in snapshot.scopes {
            let mut records = ScopeRecords::default();
            for player in scope.players {
                if player.tenant_id != scope.tenant_id || player.server_id != scope.server_id {
                    return Err(Error::Unauthorized(format!(
                        "player '{}' of {}/{} filed under {}/{}",
                        player.player_name,
                        player.tenant_id,
                        player.server_id,
                        scope.tenant_id,
                        scope.server_id
                    )));
                }
                records.players.insert(player.player_name.clone(), player);
            }
            records.applied_keys.extend(scope.applied_keys);
            loaded.insert((scope.tenant_id, scope.server_id), records);
        }
        *self.scopes.lock().await = loaded;
        Ok(())
    }

    /// Make the next `upsert_player_stats` call fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    #[tracing::instrument(level = "debug", skip(self, commits), fields(commits = commits.len()))]
    async fn upsert_player_stats(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
        commits: &[EventCommit],
    ) -> Result<CommitOutcome> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(Error::BackendMessage("injected commit failure".to_string()));
        }

        let now = Utc::now();
        let mut scopes = self.scopes.lock().await;
        let scope = scopes.entry((tenant_id, server_id.clone())).or_default();
        let mut outcome = CommitOutcome::default();

        for commit in commits {
            if !scope.applied_keys.insert(commit.dedupe_key.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            for delta in &commit.deltas {
                let stats = scope
                    .players
                    .entry(delta.player.clone())
                    .or_insert_with(|| {
                        outcome.players_created += 1;
                        PlayerStats::new(tenant_id, server_id.clone(), delta.player.clone(), now)
                    });
                stats.apply(delta, now);
                outcome.totals.add_delta(delta);
            }
            outcome.applied += 1;
        }
        Ok(outcome)
    }

    async fn query_top_by_metric(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
        metric: Metric,
        limit: usize,
    ) -> Result<Vec<PlayerStats>> {
        let scopes = self.scopes.lock().await;
        let Some(scope) = scopes.get(&(tenant_id, server_id.clone())) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<PlayerStats> = scope.players.values().cloned().collect();
        rows.sort_by(|a, b| {
            metric
                .value(b)
                .total_cmp(&metric.value(a))
                .then_with(|| a.player_name.cmp(&b.player_name))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_players(&self, tenant_id: TenantId, server_id: &ServerId) -> Result<u64> {
        let scopes = self.scopes.lock().await;
        Ok(scopes
            .get(&(tenant_id, server_id.clone()))
            .map(|s| s.players.len() as u64)
            .unwrap_or(0))
    }
}

/// In-memory TenantDirectory for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryTenantDirectory {
    profiles: Arc<Mutex<BTreeMap<ScopeKey, ServerProfile>>>,
}

impl MemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_profiles(profiles: impl IntoIterator<Item = ServerProfile>) -> Self {
        let dir = Self::new();
        {
            let mut map = dir.profiles.lock().await;
            for p in profiles {
                map.insert((p.tenant_id, p.server_id.clone()), p);
            }
        }
        dir
    }
}

#[async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn get_profile(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
    ) -> Result<Option<ServerProfile>> {
        Ok(self
            .profiles
            .lock()
            .await
            .get(&(tenant_id, server_id.clone()))
            .cloned())
    }

    async fn list_profiles(&self, query: ListQuery) -> Result<Vec<ServerProfile>> {
        Ok(self
            .profiles
            .lock()
            .await
            .values()
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn upsert_profile(&self, profile: &ServerProfile) -> Result<()> {
        if !profile.tenant_id.is_valid() || profile.server_id.is_blank() {
            return Err(Error::InvalidScope(format!(
                "cannot store profile for {}/{}",
                profile.tenant_id, profile.server_id
            )));
        }
        self.profiles.lock().await.insert(
            (profile.tenant_id, profile.server_id.clone()),
            profile.clone(),
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, watermark))]
    async fn update_watermark(
        &self,
        tenant_id: TenantId,
        server_id: &ServerId,
        watermark: &Watermark,
    ) -> Result<()> {
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .get_mut(&(tenant_id, server_id.clone()))
            .ok_or_else(|| Error::NotFound(format!("profile {tenant_id}/{server_id}")))?;
        profile.watermark = watermark.clone();
        profile.touch(Utc::now());
        Ok(())
    }
}
