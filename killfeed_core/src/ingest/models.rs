use crate::connector::RecoverableError;
use crate::models::{ServerId, TenantId, Watermark};
use crate::store::{AggregateTotals, StatDelta, StreakChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Kill,
    Death,
    Suicide,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kill => "kill",
            Self::Death => "death",
            Self::Suicide => "suicide",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kill-feed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub actor: String,
    pub target: String,
    /// Weapon, or the non-player cause for deaths.
    pub weapon: String,
    pub distance: f64,
}

impl ParsedEvent {
    /// Idempotency key for the event at `line` of `file`.
    pub fn dedupe_key(&self, file: &str, line: u64) -> String {
        format!(
            "{file}:{line}:{}:{}:{}",
            self.timestamp.to_rfc3339(),
            self.actor,
            self.target
        )
    }

    /// Per-player changes implied by the event.
    pub fn deltas(&self) -> Vec<StatDelta> {
        match self.kind {
            EventKind::Kill => vec![
                StatDelta {
                    kills: 1,
                    weapon: Some(self.weapon.clone()).filter(|w| !w.is_empty()),
                    distance: Some(self.distance),
                    streak: StreakChange::Extend,
                    ..StatDelta::for_player(self.actor.clone())
                },
                StatDelta {
                    deaths: 1,
                    streak: StreakChange::Reset,
                    ..StatDelta::for_player(self.target.clone())
                },
            ],
            EventKind::Death => vec![StatDelta {
                deaths: 1,
                streak: StreakChange::Reset,
                ..StatDelta::for_player(self.actor.clone())
            }],
            EventKind::Suicide => vec![StatDelta {
                suicides: 1,
                deaths: 1,
                streak: StreakChange::Reset,
                ..StatDelta::for_player(self.actor.clone())
            }],
        }
    }
}

/// Per-profile ingestion state. Runs move `Idle -> Scanning -> Parsing -> Committing -> Idle`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionState {
    #[default]
    Idle,
    Scanning,
    Parsing,
    Committing,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub tenant_id: Option<TenantId>,
    pub server_id: Option<ServerId>,
    pub restricted: bool,
    pub files_found: u64,
    pub files_processed: u64,
    pub lines_processed: u64,
    pub parse_errors: u64,
    pub file_errors: u64,
    pub events_applied: u64,
    pub duplicates_skipped: u64,
    pub players_created: u64,
    /// Store totals before this run.
    pub baseline_totals: AggregateTotals,
    /// Totals contributed by this run's applied events.
    pub applied_totals: AggregateTotals,
    pub log_file_exists: bool,
    pub log_events_processed: u64,
    pub rotation_detected: bool,
    pub cancelled: bool,
    pub connection_error: Option<RecoverableError>,
    /// Store commit failure that stopped the run.
    pub commit_error: Option<String>,
    pub watermark: Watermark,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionReport {
    pub fn expected_totals(&self) -> AggregateTotals {
        self.baseline_totals.combined(self.applied_totals)
    }
}
