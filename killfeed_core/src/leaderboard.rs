//! Tenant-scoped leaderboards over the record store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::isolation::IsolationContext;
use crate::models::{ServerId, ServerProfile, TenantId};
use crate::store::{Metric, PlayerStats, RecordStore};

pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Why a leaderboard is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum Notice {
    Restricted(String),
    ConfigurationMissing,
    NoDataYet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub player_name: String,
    pub value: f64,
    pub kills: u64,
    pub deaths: u64,
    /// Weapon of the longest kill, for distance boards.
    pub weapon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardView {
    pub tenant_id: TenantId,
    pub server_id: ServerId,
    pub metric: Metric,
    pub entries: Vec<LeaderboardEntry>,
    pub notice: Option<Notice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaponEntry {
    pub weapon: String,
    pub kills: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeaponBoard {
    pub tenant_id: TenantId,
    pub server_id: ServerId,
    pub weapons: Vec<WeaponEntry>,
    pub notice: Option<Notice>,
}

pub struct LeaderboardService {
    store: Arc<dyn RecordStore>,
    default_limit: usize,
}

impl LeaderboardService {
    pub fn new(store: Arc<dyn RecordStore>, default_limit: usize) -> Self {
        Self {
            store,
            default_limit: default_limit.max(1),
        }
    }

    /// Top players by `metric`. Restricted contexts never touch the store.
    #[tracing::instrument(level = "debug", skip(self, ctx, profile), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn leaderboard(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        metric: Metric,
        limit: Option<usize>,
    ) -> Result<LeaderboardView> {
        ctx.ensure_entity(profile)?;
        let mut view = LeaderboardView {
            tenant_id: ctx.tenant_id(),
            server_id: ctx.server_id().clone(),
            metric,
            entries: Vec::new(),
            notice: None,
        };
        if let Some(notice) = self.blocking_notice(ctx, profile) {
            view.notice = Some(notice);
            return Ok(view);
        }

        let rows = self
            .store
            .query_top_by_metric(
                ctx.tenant_id(),
                ctx.server_id(),
                metric,
                limit.unwrap_or(self.default_limit),
            )
            .await?;
        view.entries = rows
            .iter()
            .filter(|p| ctx.verify_entity(*p) && metric.value(p) > 0.0)
            .enumerate()
            .map(|(idx, p)| entry(idx + 1, metric, p))
            .collect();
        if view.entries.is_empty() {
            view.notice = Some(Notice::NoDataYet);
        }
        Ok(view)
    }

    /// Kill counts per weapon across the scope's players.
    #[tracing::instrument(level = "debug", skip(self, ctx, profile), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn weapons(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        limit: Option<usize>,
    ) -> Result<WeaponBoard> {
        ctx.ensure_entity(profile)?;
        let mut board = WeaponBoard {
            tenant_id: ctx.tenant_id(),
            server_id: ctx.server_id().clone(),
            weapons: Vec::new(),
            notice: None,
        };
        if let Some(notice) = self.blocking_notice(ctx, profile) {
            board.notice = Some(notice);
            return Ok(board);
        }

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

        let mut tally: BTreeMap<String, u64> = BTreeMap::new();
        for p in players.iter().filter(|p| ctx.verify_entity(*p)) {
            for (weapon, kills) in &p.weapon_kills {
                *tally.entry(weapon.clone()).or_default() += kills;
            }
        }
        let mut weapons: Vec<WeaponEntry> = tally
            .into_iter()
            .map(|(weapon, kills)| WeaponEntry { weapon, kills })
            .collect();
        weapons.sort_by(|a, b| b.kills.cmp(&a.kills).then_with(|| a.weapon.cmp(&b.weapon)));
        weapons.truncate(limit.unwrap_or(self.default_limit));

        if weapons.is_empty() {
            board.notice = Some(Notice::NoDataYet);
        }
        board.weapons = weapons;
        Ok(board)
    }

    fn blocking_notice(&self, ctx: &IsolationContext, profile: &ServerProfile) -> Option<Notice> {
        if ctx.is_restricted() {
            tracing::info!(mode = %ctx.mode(), "leaderboard unavailable for restricted server");
            return Some(Notice::Restricted(
                ctx.mode().unavailability_reason().to_string(),
            ));
        }
        if !profile.has_usable_credentials() {
            return Some(Notice::ConfigurationMissing);
        }
        None
    }
}

fn entry(rank: usize, metric: Metric, p: &PlayerStats) -> LeaderboardEntry {
    LeaderboardEntry {
        rank,
        player_name: p.player_name.clone(),
        value: metric.value(p),
        kills: p.kills,
        deaths: p.deaths,
        weapon: match metric {
            Metric::KillDistance => p.longest_kill_weapon.clone(),
            _ => None,
        },
    }
}
