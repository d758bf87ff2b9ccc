use crate::connector::RecoverableError;
use crate::models::{IsolationMode, ServerId, TenantId};
use crate::store::AggregateTotals;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recomputed store totals disagree with baseline plus what the run applied.
///
/// Advisory: recorded on the summary, never fails the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationMismatch {
    pub expected: AggregateTotals,
    pub actual: AggregateTotals,
}

/// Post-ingestion audit of one profile. Serializable, not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub tenant_id: TenantId,
    pub server_id: ServerId,
    pub mode: IsolationMode,
    pub files_found: u64,
    pub files_processed: u64,
    pub lines_processed: u64,
    pub events_applied: u64,
    pub parse_errors: u64,
    pub file_errors: u64,
    pub log_events_processed: u64,
    pub rotation_detected: bool,
    pub top_kills_entries: usize,
    pub top_deaths_entries: usize,
    pub top_kd_entries: usize,
    pub players_total: u64,
    pub mismatch: Option<ReconciliationMismatch>,
    pub connection_error: Option<RecoverableError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub successful: bool,
    pub error_message: Option<String>,
}

impl ValidationSummary {
    pub fn new(tenant_id: TenantId, server_id: ServerId, mode: IsolationMode) -> Self {
        let now = Utc::now();
        Self {
            tenant_id,
            server_id,
            mode,
            files_found: 0,
            files_processed: 0,
            lines_processed: 0,
            events_applied: 0,
            parse_errors: 0,
            file_errors: 0,
            log_events_processed: 0,
            rotation_detected: false,
            top_kills_entries: 0,
            top_deaths_entries: 0,
            top_kd_entries: 0,
            players_total: 0,
            mismatch: None,
            connection_error: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            successful: true,
            error_message: None,
        }
    }

    /// Summary for a profile that could not be run at all.
    pub fn rejected(tenant_id: TenantId, server_id: ServerId, message: impl Into<String>) -> Self {
        let mut summary = Self::new(tenant_id, server_id, IsolationMode::Standard);
        summary.fail(message);
        summary
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.successful = false;
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
    }
}
