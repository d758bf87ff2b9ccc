use crate::models::{ServerId, TenantId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Pagination for directory listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Leaderboard ranking metric.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Kills,
    Deaths,
    KillDeathRatio,
    KillDistance,
    BestStreak,
    Suicides,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Kills,
        Metric::Deaths,
        Metric::KillDeathRatio,
        Metric::KillDistance,
        Metric::BestStreak,
        Metric::Suicides,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kills => "kills",
            Self::Deaths => "deaths",
            Self::KillDeathRatio => "kill_death_ratio",
            Self::KillDistance => "kill_distance",
            Self::BestStreak => "best_streak",
            Self::Suicides => "suicides",
        }
    }

    pub fn value(&self, stats: &PlayerStats) -> f64 {
        match self {
            Self::Kills => stats.kills as f64,
            Self::Deaths => stats.deaths as f64,
            Self::KillDeathRatio => stats.kd_ratio(),
            Self::KillDistance => stats.longest_kill_distance,
            Self::BestStreak => stats.best_streak as f64,
            Self::Suicides => stats.suicides as f64,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kills" => Ok(Self::Kills),
            "deaths" => Ok(Self::Deaths),
            "kd" | "kdr" | "kill_death_ratio" => Ok(Self::KillDeathRatio),
            "distance" | "kill_distance" => Ok(Self::KillDistance),
            "streak" | "best_streak" => Ok(Self::BestStreak),
            "suicides" => Ok(Self::Suicides),
            other => Err(Error::InvalidInput(format!("unknown metric '{other}'"))),
        }
    }
}

/// What an event does to a player's kill streak.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreakChange {
    #[default]
    Keep,
    Extend,
    Reset,
}

/// Change to one player's aggregate produced by a single event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatDelta {
    pub player: String,
    pub kills: u64,
    pub deaths: u64,
    pub suicides: u64,
    /// Weapon credited with a kill.
    pub weapon: Option<String>,
    pub distance: Option<f64>,
    pub streak: StreakChange,
}

impl StatDelta {
    pub fn for_player(player: impl Into<String>) -> Self {
        Self {
            player: player.into(),
            ..Self::default()
        }
    }
}

/// All deltas of one event, applied atomically under a de-duplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCommit {
    pub dedupe_key: String,
    pub deltas: Vec<StatDelta>,
}

/// Sums of the counting stats across players.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateTotals {
    pub kills: u64,
    pub deaths: u64,
    pub suicides: u64,
}

impl AggregateTotals {
    pub fn add_delta(&mut self, delta: &StatDelta) {
        self.kills += delta.kills;
        self.deaths += delta.deaths;
        self.suicides += delta.suicides;
    }

    pub fn add_player(&mut self, stats: &PlayerStats) {
        self.kills += stats.kills;
        self.deaths += stats.deaths;
        self.suicides += stats.suicides;
    }

    pub fn combined(self, other: AggregateTotals) -> AggregateTotals {
        AggregateTotals {
            kills: self.kills + other.kills,
            deaths: self.deaths + other.deaths,
            suicides: self.suicides + other.suicides,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub applied: u64,
    pub duplicates: u64,
    pub players_created: u64,
    /// Totals contributed by the applied (non-duplicate) commits.
    pub totals: AggregateTotals,
}

impl CommitOutcome {
    pub fn merge(&mut self, other: CommitOutcome) {
        self.applied += other.applied;
        self.duplicates += other.duplicates;
        self.players_created += other.players_created;
        self.totals = self.totals.combined(other.totals);
    }
}

/// Serializable copy of a record store, including the applied event keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub scopes: Vec<ScopeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub tenant_id: TenantId,
    pub server_id: ServerId,
    pub players: Vec<PlayerStats>,
    #[serde(default)]
    pub applied_keys: Vec<String>,
}

/// Persisted per-player aggregate within one (tenant, server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub tenant_id: TenantId,
    pub server_id: ServerId,
    pub player_name: String,
    pub kills: u64,
    pub deaths: u64,
    pub suicides: u64,
    #[serde(default)]
    pub weapon_kills: BTreeMap<String, u64>,
    pub longest_kill_distance: f64,
    pub longest_kill_weapon: Option<String>,
    pub current_streak: u64,
    pub best_streak: u64,
    pub updated_at: DateTime<Utc>,
}

impl PlayerStats {
    pub fn new(
        tenant_id: TenantId,
        server_id: ServerId,
        player_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            server_id,
            player_name: player_name.into(),
            kills: 0,
            deaths: 0,
            suicides: 0,
            weapon_kills: BTreeMap::new(),
            longest_kill_distance: 0.0,
            longest_kill_weapon: None,
            current_streak: 0,
            best_streak: 0,
            updated_at: now,
        }
    }

    /// Kills divided by deaths; kills alone when the player never died.
    pub fn kd_ratio(&self) -> f64 {
        if self.deaths == 0 {
            self.kills as f64
        } else {
            self.kills as f64 / self.deaths as f64
        }
    }

    pub fn apply(&mut self, delta: &StatDelta, now: DateTime<Utc>) {
        self.kills += delta.kills;
        self.deaths += delta.deaths;
        self.suicides += delta.suicides;

        if delta.kills > 0 {
            if let Some(weapon) = delta.weapon.as_deref().filter(|w| !w.is_empty()) {
                *self.weapon_kills.entry(weapon.to_string()).or_default() += delta.kills;
            }
            if let Some(distance) = delta.distance {
                if distance > self.longest_kill_distance {
                    self.longest_kill_distance = distance;
                    self.longest_kill_weapon = delta.weapon.clone();
                }
            }
        }

        match delta.streak {
            StreakChange::Keep => {}
            StreakChange::Extend => {
                self.current_streak += 1;
                self.best_streak = self.best_streak.max(self.current_streak);
            }
            StreakChange::Reset => self.current_streak = 0,
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> PlayerStats {
        PlayerStats::new(TenantId(1), ServerId::from("s1"), "Player1", Utc::now())
    }

    #[test]
    fn kd_ratio_without_deaths_is_kills() {
        let mut s = stats();
        s.kills = 3;
        assert_eq!(s.kd_ratio(), 3.0);
        s.deaths = 2;
        assert_eq!(s.kd_ratio(), 1.5);
    }

    #[test]
    fn apply_tracks_longest_kill_and_streak() {
        let mut s = stats();
        let now = Utc::now();
        for (weapon, distance) in [("AK-47", 137.5), ("SVD", 242.1), ("AK-47", 12.0)] {
            s.apply(
                &StatDelta {
                    kills: 1,
                    weapon: Some(weapon.to_string()),
                    distance: Some(distance),
                    streak: StreakChange::Extend,
                    ..StatDelta::for_player("Player1")
                },
                now,
            );
        }
        s.apply(
            &StatDelta {
                deaths: 1,
                streak: StreakChange::Reset,
                ..StatDelta::for_player("Player1")
            },
            now,
        );

        assert_eq!(s.kills, 3);
        assert_eq!(s.weapon_kills.get("AK-47"), Some(&2));
        assert_eq!(s.longest_kill_distance, 242.1);
        assert_eq!(s.longest_kill_weapon.as_deref(), Some("SVD"));
        assert_eq!(s.current_streak, 0);
        assert_eq!(s.best_streak, 3);
    }

    #[test]
    fn metric_aliases_parse() {
        assert_eq!("KDR".parse::<Metric>().unwrap(), Metric::KillDeathRatio);
        assert!("headshots".parse::<Metric>().is_err());
    }
}
