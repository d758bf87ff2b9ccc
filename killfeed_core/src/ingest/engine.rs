use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;

use crate::connector::traits::join_remote;
use crate::connector::{RecoverableError, RecoverableKind, RemoteEntry, RemoteFileConnector};
use crate::ingest::models::{IngestionReport, IngestionState};
use crate::ingest::parser::parse_line;
use crate::isolation::IsolationContext;
use crate::models::{ServerId, ServerProfile, TenantId, Watermark};
use crate::store::{AggregateTotals, EventCommit, Metric, RecordStore, TenantDirectory};
use crate::{Error, Result};

pub const DEFAULT_PRIMARY_LOG_NAME: &str = "Deadside.log";

type ScopeKey = (TenantId, ServerId);

/// Incremental kill-feed ingestion for one profile at a time per scope.
pub struct IngestionEngine {
    connector: Arc<RemoteFileConnector>,
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn TenantDirectory>,
    primary_log_name: String,
    states: Arc<DashMap<ScopeKey, IngestionState>>,
}

impl IngestionEngine {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        connector: Arc<RemoteFileConnector>,
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn TenantDirectory>,
    ) -> Self {
        Self {
            connector,
            store,
            directory,
            primary_log_name: DEFAULT_PRIMARY_LOG_NAME.to_string(),
            states: Arc::new(DashMap::new()),
        }
    }

    pub fn with_primary_log_name(mut self, name: impl Into<String>) -> Self {
        self.primary_log_name = name.into();
        self
    }

    pub fn state(&self, tenant_id: TenantId, server_id: &ServerId) -> IngestionState {
        self.states
            .get(&(tenant_id, server_id.clone()))
            .map(|s| *s)
            .unwrap_or_default()
    }

    /// Ingest everything new for `profile`.
    ///
    /// Connectivity problems end the run early with `connection_error` set. Boundary
    /// violations, a concurrent run on the same scope, and failing baseline queries
    /// are errors.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(tenant_id = %ctx.tenant_id(), server_id = %ctx.server_id(), mode = %ctx.mode())
    )]
    pub async fn run(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        cancel: &CancellationToken,
    ) -> Result<IngestionReport> {
        ctx.ensure_entity(profile)?;

        let mut report = IngestionReport {
            tenant_id: Some(ctx.tenant_id()),
            server_id: Some(ctx.server_id().clone()),
            watermark: profile.watermark.clone(),
            started_at: Some(Utc::now()),
            ..IngestionReport::default()
        };

        if ctx.is_restricted() {
            tracing::info!("ingestion skipped for restricted server");
            report.restricted = true;
            report.finished_at = Some(Utc::now());
            return Ok(report);
        }

        let guard = self.begin((ctx.tenant_id(), ctx.server_id().clone()))?;
        report.baseline_totals = self.current_totals(ctx).await?;

        let files = match self.connector.find_event_files(ctx, profile).await {
            Ok(files) => files,
            Err(e) if e.is_connectivity() => {
                tracing::warn!(error = %e, "ingestion ended early: remote unreachable");
                report.connection_error = Some((&e).into());
                report.finished_at = Some(Utc::now());
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        report.files_found = files.len() as u64;

        let mut progress = Progress::new(profile.watermark.clone());
        if self
            .ingest_primary_log(ctx, profile, &mut progress.watermark, &mut report)
            .await
            && progress.watermark != profile.watermark
        {
            self.persist_watermark(ctx, &progress.watermark, &mut report)
                .await;
        }

        if report.connection_error.is_none() && report.commit_error.is_none() {
            let candidates = select_candidates(&files, &progress.watermark);
            tracing::debug!(candidates = candidates.len(), "event files selected");
            let mut skipped = None;
            for (idx, entry) in candidates.iter().enumerate() {
                if cancel.is_cancelled() {
                    tracing::info!("ingestion cancelled between files");
                    report.cancelled = true;
                    break;
                }
                progress.floor = earliest(skipped, earliest_modified(&candidates[idx + 1..]));
                match self
                    .ingest_event_file(ctx, profile, entry, &mut progress, &mut report, &guard)
                    .await
                {
                    FileOutcome::Committed => {}
                    FileOutcome::Skipped => skipped = earliest(skipped, entry.modified),
                    FileOutcome::Stop => break,
                }
            }
        }

        report.watermark = progress.watermark;
        report.finished_at = Some(Utc::now());
        tracing::info!(
            files_processed = report.files_processed,
            lines_processed = report.lines_processed,
            events_applied = report.events_applied,
            parse_errors = report.parse_errors,
            rotation = report.rotation_detected,
            "ingestion run finished"
        );
        Ok(report)
    }

    fn begin(&self, key: ScopeKey) -> Result<StateGuard> {
        match self.states.entry(key.clone()) {
            Entry::Occupied(mut e) => {
                if *e.get() != IngestionState::Idle {
                    return Err(Error::Conflict(format!(
                        "ingestion already running for {}/{} ({:?})",
                        key.0,
                        key.1,
                        e.get()
                    )));
                }
                e.insert(IngestionState::Scanning);
            }
            Entry::Vacant(v) => {
                v.insert(IngestionState::Scanning);
            }
        }
        Ok(StateGuard {
            states: self.states.clone(),
            key,
        })
    }

    async fn current_totals(&self, ctx: &IsolationContext) -> Result<AggregateTotals> {
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
        for p in players.iter().filter(|p| ctx.verify_entity(*p)) {
            totals.add_player(p);
        }
        Ok(totals)
    }

    /// Returns false when the run should stop.
    async fn ingest_primary_log(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        watermark: &mut Watermark,
        report: &mut IngestionReport,
    ) -> bool {
        let path = join_remote(&profile.log_directory, &self.primary_log_name);
        let Some(entry) = self.connector.stat(ctx, profile, &path).await else {
            tracing::debug!(path, "primary log not present");
            return true;
        };
        report.log_file_exists = true;

        if primary_log_rotated(&entry, watermark) {
            tracing::info!(path, size = entry.size, "primary log rotation detected");
            report.rotation_detected = true;
            watermark.last_log_line = 0;
            watermark.last_rotation_timestamp = Some(entry.modified.unwrap_or_else(Utc::now));
        }

        let read = self.connector.read_file(ctx, profile, &path).await;
        if let Some(err) = read.error {
            return self.absorb_read_error(&path, err, report);
        }

        let skip = usize::try_from(watermark.last_log_line).unwrap_or(usize::MAX);
        let mut total = 0u64;
        for (idx, line) in read.content.lines().enumerate() {
            total += 1;
            if idx >= skip && !line.trim().is_empty() {
                report.log_events_processed += 1;
            }
        }
        watermark.last_log_line = total.max(watermark.last_log_line);
        watermark.last_log_size = Some(entry.size);
        true
    }

    async fn ingest_event_file(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        entry: &RemoteEntry,
        progress: &mut Progress,
        report: &mut IngestionReport,
        guard: &StateGuard,
    ) -> FileOutcome {
        guard.set(IngestionState::Parsing);
        let abs_path = join_remote(&profile.event_log_directory, &entry.path);
        let read = self.connector.read_file(ctx, profile, &abs_path).await;
        if let Some(err) = read.error {
            return if self.absorb_read_error(&abs_path, err, report) {
                FileOutcome::Skipped
            } else {
                FileOutcome::Stop
            };
        }

        let watermark = &progress.watermark;

        let lines: Vec<&str> = read.content.lines().collect();
        let resuming = watermark.last_processed_file.as_deref() == Some(entry.path.as_str());
        let mut cursor = if resuming {
            watermark.last_processed_line
        } else {
            0
        };
        if resuming && (lines.len() as u64) < cursor {
            tracing::info!(
                file = %entry.path,
                lines = lines.len(),
                watermark = cursor,
                "event file rotation detected"
            );
            report.rotation_detected = true;
            cursor = 0;
        }

        let mut commits = Vec::new();
        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        for (idx, line) in lines.iter().enumerate().skip(start) {
            let line_no = idx as u64 + 1;
            match parse_line(line) {
                Ok(Some(event)) => {
                    report.lines_processed += 1;
                    commits.push(EventCommit {
                        dedupe_key: event.dedupe_key(&entry.path, line_no),
                        deltas: event.deltas(),
                    });
                    cursor = line_no;
                }
                Ok(None) => {}
                Err(e) => {
                    report.lines_processed += 1;
                    report.parse_errors += 1;
                    tracing::debug!(file = %entry.path, line = line_no, error = %e, "unparseable line");
                }
            }
        }

        guard.set(IngestionState::Committing);
        if !commits.is_empty() {
            match self
                .store
                .upsert_player_stats(ctx.tenant_id(), ctx.server_id(), &commits)
                .await
            {
                Ok(outcome) => {
                    report.events_applied += outcome.applied;
                    report.duplicates_skipped += outcome.duplicates;
                    report.players_created += outcome.players_created;
                    report.applied_totals = report.applied_totals.combined(outcome.totals);
                }
                Err(e) => {
                    tracing::warn!(file = %entry.path, error = %e, "store commit failed");
                    report.file_errors += 1;
                    report.commit_error = Some(e.to_string());
                    return FileOutcome::Stop;
                }
            }
        }

        progress.high_water = latest(progress.high_water, entry.modified);
        let watermark = &mut progress.watermark;
        watermark.last_processed_file = Some(entry.path.clone());
        watermark.last_processed_line = cursor;
        watermark.last_processed_timestamp = clip_before(progress.high_water, progress.floor);
        report.files_processed += 1;
        if self.persist_watermark(ctx, watermark, report).await {
            FileOutcome::Committed
        } else {
            FileOutcome::Stop
        }
    }

    fn absorb_read_error(
        &self,
        path: &str,
        err: RecoverableError,
        report: &mut IngestionReport,
    ) -> bool {
        match err.kind {
            RecoverableKind::NoCredentials
            | RecoverableKind::Connection
            | RecoverableKind::Timeout => {
                tracing::warn!(path, error = %err.message, "ingestion ended early: remote unreachable");
                report.connection_error = Some(err);
                false
            }
            RecoverableKind::NotFound | RecoverableKind::Backend => {
                tracing::warn!(path, error = %err.message, "skipping unreadable file");
                report.file_errors += 1;
                true
            }
        }
    }

    async fn persist_watermark(
        &self,
        ctx: &IsolationContext,
        watermark: &Watermark,
        report: &mut IngestionReport,
    ) -> bool {
        match self
            .directory
            .update_watermark(ctx.tenant_id(), ctx.server_id(), watermark)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "watermark update failed");
                report.commit_error = Some(format!("watermark update failed: {e}"));
                false
            }
        }
    }
}

/// Watermark being advanced by a run, plus the bounds on its discovery timestamp.
struct Progress {
    watermark: Watermark,
    /// Newest mtime among committed files.
    high_water: Option<DateTime<Utc>>,
    /// Oldest mtime among candidates not yet committed this run.
    floor: Option<DateTime<Utc>>,
}

impl Progress {
    fn new(watermark: Watermark) -> Self {
        Self {
            high_water: watermark.last_processed_timestamp,
            watermark,
            floor: None,
        }
    }
}

enum FileOutcome {
    Committed,
    /// Unreadable file; the batch continues and the file stays a candidate.
    Skipped,
    Stop,
}

/// Files to read this run, in path order.
fn select_candidates<'a>(files: &'a [RemoteEntry], watermark: &Watermark) -> Vec<&'a RemoteEntry> {
    files
        .iter()
        .filter(|f| {
            if watermark.last_processed_file.as_deref() == Some(f.path.as_str()) {
                return true;
            }
            match (watermark.last_processed_timestamp, f.modified) {
                (Some(seen), Some(modified)) => modified > seen,
                _ => true,
            }
        })
        .collect()
}

fn primary_log_rotated(entry: &RemoteEntry, watermark: &Watermark) -> bool {
    let shrank = watermark
        .last_log_size
        .is_some_and(|previous| entry.size < previous);
    let older = match (entry.modified, watermark.last_rotation_timestamp) {
        (Some(modified), Some(rotated)) => modified < rotated,
        _ => false,
    };
    shrank || older
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn earliest_modified(entries: &[&RemoteEntry]) -> Option<DateTime<Utc>> {
    entries.iter().filter_map(|e| e.modified).min()
}

/// Keeps the discovery timestamp strictly below `floor`, so every file not yet
/// committed is still newer than the watermark on the next run.
fn clip_before(
    seen: Option<DateTime<Utc>>,
    floor: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (seen, floor) {
        (Some(seen), Some(floor)) if seen >= floor => {
            Some(floor - chrono::Duration::nanoseconds(1))
        }
        (seen, _) => seen,
    }
}

/// Publishes the run's state and resets the scope to `Idle` when dropped.
struct StateGuard {
    states: Arc<DashMap<ScopeKey, IngestionState>>,
    key: ScopeKey,
}

impl StateGuard {
    fn set(&self, state: IngestionState) {
        if let Some(mut s) = self.states.get_mut(&self.key) {
            *s = state;
        }
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.states.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorSettings, MemoryTransport};
    use crate::models::{Credentials, IsolationMode};
    use crate::store::{MemoryRecordStore, MemoryTenantDirectory};
    use chrono::{Duration, TimeZone};

    const FIVE_LINES: &str = "\
2024-05-01T12:00:00Z,kill,Player1,Player2,AK-47,137.5
2024-05-01T12:01:00Z,kill,Player3,Player4,MP5,42.8
2024-05-01T12:02:00Z,kill,Player2,Player3,M4A1,88.2
2024-05-01T12:03:00Z,kill,Player1,Player4,SVD,242.1
2024-05-01T12:04:00Z,kill,Player4,Player1,Knife,5.3
";
    const FILE: &str = "2024.05.01-12.00.00.csv";

    struct Harness {
        transport: MemoryTransport,
        store: MemoryRecordStore,
        directory: MemoryTenantDirectory,
        engine: IngestionEngine,
    }

    impl Harness {
        async fn new(profile: &ServerProfile) -> Self {
            let transport = MemoryTransport::new();
            let store = MemoryRecordStore::new();
            let directory = MemoryTenantDirectory::with_profiles([profile.clone()]).await;
            let connector = Arc::new(RemoteFileConnector::new(
                Arc::new(transport.clone()),
                ConnectorSettings::default(),
            ));
            let engine = IngestionEngine::new(
                connector,
                Arc::new(store.clone()),
                Arc::new(directory.clone()),
            );
            Self {
                transport,
                store,
                directory,
                engine,
            }
        }

        async fn put_event_file(&self, name: &str, content: &str, minute: i64) {
            let at = t0() + Duration::minutes(minute);
            self.transport
                .put_file(&format!("data/deathlogs/{name}"), content, at)
                .await;
        }

        async fn run(&self, profile: &ServerProfile) -> IngestionReport {
            let stored = self
                .directory
                .get_profile(profile.tenant_id, &profile.server_id)
                .await
                .unwrap()
                .unwrap();
            let ctx = IsolationContext::for_profile(&stored).unwrap();
            self.engine
                .run(&ctx, &stored, &CancellationToken::new())
                .await
                .unwrap()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn profile(mode: IsolationMode) -> ServerProfile {
        ServerProfile::new(TenantId(77), "eu-1", "EU One", mode, None)
            .unwrap()
            .with_primary(Credentials::new("eu1.example.net", 22, "admin", "pw"))
    }

    #[tokio::test]
    async fn five_line_scenario_aggregates() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;

        let report = h.run(&p).await;
        assert_eq!(report.files_found, 1);
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.lines_processed, 5);
        assert_eq!(report.events_applied, 5);
        assert_eq!(report.players_created, 4);
        assert_eq!(report.applied_totals.kills, 5);
        assert_eq!(report.applied_totals.deaths, 5);
        assert_eq!(report.watermark.last_processed_line, 5);
        assert_eq!(report.watermark.last_processed_file.as_deref(), Some(FILE));

        let players = h.store.players(p.tenant_id, &p.server_id).await;
        let kills: Vec<_> = players.values().map(|s| (s.player_name.as_str(), s.kills)).collect();
        assert_eq!(
            kills,
            vec![("Player1", 2), ("Player2", 1), ("Player3", 1), ("Player4", 1)]
        );
        let deaths: Vec<_> = players.values().map(|s| s.deaths).collect();
        // Player4 is killed twice in the scenario.
        assert_eq!(deaths, vec![1, 1, 1, 2]);

        let top = h
            .store
            .query_top_by_metric(p.tenant_id, &p.server_id, Metric::KillDistance, 1)
            .await
            .unwrap();
        assert_eq!(top[0].player_name, "Player1");
        assert_eq!(top[0].longest_kill_distance, 242.1);
        assert_eq!(top[0].longest_kill_weapon.as_deref(), Some("SVD"));
    }

    #[tokio::test]
    async fn reparsing_does_not_double_count() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;
        h.run(&p).await;

        // Simulate a crash after commit but before the watermark was persisted.
        h.directory
            .update_watermark(p.tenant_id, &p.server_id, &Watermark::default())
            .await
            .unwrap();
        let report = h.run(&p).await;
        assert_eq!(report.events_applied, 0);
        assert_eq!(report.duplicates_skipped, 5);

        let players = h.store.players(p.tenant_id, &p.server_id).await;
        assert_eq!(players["Player1"].kills, 2);
    }

    #[tokio::test]
    async fn watermark_line_never_decreases_without_rotation() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;
        let first = h.run(&p).await;

        let second = h.run(&p).await;
        assert_eq!(second.events_applied, 0);
        assert_eq!(second.watermark.last_processed_line, 5);

        let grown = format!("{FIVE_LINES}2024-05-01T12:05:00Z,death,Player2,,Fall,\n");
        h.put_event_file(FILE, &grown, 6).await;
        let third = h.run(&p).await;
        assert_eq!(third.lines_processed, 1);
        assert_eq!(third.events_applied, 1);
        assert!(third.watermark.last_processed_line >= first.watermark.last_processed_line);
        assert_eq!(third.watermark.last_processed_line, 6);
    }

    #[tokio::test]
    async fn shrunken_event_file_restarts_from_zero() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;
        h.run(&p).await;

        let rotated = "2024-05-02T08:00:00Z,kill,Player5,Player6,AK-47,10\n";
        h.put_event_file(FILE, rotated, 60).await;
        let report = h.run(&p).await;
        assert!(report.rotation_detected);
        assert_eq!(report.events_applied, 1);
        assert_eq!(report.watermark.last_processed_line, 1);
    }

    #[tokio::test]
    async fn shrinking_primary_log_resets_to_line_zero() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.transport
            .put_file("logs/Deadside.log", "boot\nplayer joined\nplayer left\n", t0())
            .await;
        let first = h.run(&p).await;
        assert!(first.log_file_exists);
        assert_eq!(first.log_events_processed, 3);
        assert_eq!(first.watermark.last_log_line, 3);
        assert!(!first.rotation_detected);

        h.transport
            .put_file("logs/Deadside.log", "boot\n", t0() + Duration::hours(1))
            .await;
        let second = h.run(&p).await;
        assert!(second.rotation_detected);
        assert_eq!(second.log_events_processed, 1);
        assert_eq!(second.watermark.last_log_line, 1);
        assert_eq!(
            second.watermark.last_rotation_timestamp,
            Some(t0() + Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn primary_log_older_than_last_rotation_is_reread_from_zero() {
        let mut p = profile(IsolationMode::Standard);
        p.watermark = Watermark {
            last_rotation_timestamp: Some(t0() + Duration::hours(2)),
            last_log_line: 2,
            last_log_size: Some(5),
            ..Watermark::default()
        };
        let h = Harness::new(&p).await;
        h.transport
            .put_file(
                "logs/Deadside.log",
                "boot\nplayer joined\nplayer left\n",
                t0() + Duration::hours(1),
            )
            .await;

        let report = h.run(&p).await;
        assert!(report.rotation_detected);
        assert_eq!(report.log_events_processed, 3);
        assert_eq!(report.watermark.last_log_line, 3);
        assert_eq!(report.watermark.last_log_size, Some(31));
        assert_eq!(
            report.watermark.last_rotation_timestamp,
            Some(t0() + Duration::hours(1))
        );

        let again = h.run(&p).await;
        assert!(!again.rotation_detected);
        assert_eq!(again.log_events_processed, 0);
    }

    #[tokio::test]
    async fn restricted_profile_short_circuits() {
        let p = profile(IsolationMode::Sentinel);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;
        let report = h.run(&p).await;
        assert!(report.restricted);
        assert_eq!(report.files_found, 0);
        assert!(h.transport.connection_attempts().await.is_empty());
        assert_eq!(h.store.count_players(p.tenant_id, &p.server_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unreachable_host_ends_run_with_recoverable_error() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.transport.reject_host("eu1.example.net").await;
        let report = h.run(&p).await;
        assert_eq!(
            report.connection_error.map(|e| e.kind),
            Some(RecoverableKind::Connection)
        );
        assert_eq!(report.files_processed, 0);
        assert_eq!(h.engine.state(p.tenant_id, &p.server_id), IngestionState::Idle);
    }

    #[tokio::test]
    async fn malformed_lines_are_counted_and_skipped() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        let content = "\
timestamp,kind,actor,target,weapon,distance
2024-05-01T12:00:00Z,kill,Player1,Player2,AK-47,137.5

not,a,valid,line
2024-05-01T12:01:00Z,suicide,Player3,,Grenade,
";
        h.put_event_file(FILE, content, 5).await;
        let report = h.run(&p).await;
        assert_eq!(report.parse_errors, 1);
        assert_eq!(report.events_applied, 2);
        assert_eq!(report.watermark.last_processed_line, 5);
        let players = h.store.players(p.tenant_id, &p.server_id).await;
        assert_eq!(players["Player3"].suicides, 1);
        assert_eq!(players["Player3"].deaths, 1);
    }

    #[tokio::test]
    async fn files_older_than_watermark_are_skipped() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;
        h.run(&p).await;

        h.put_event_file(
            "2024.04.30-00.00.00.csv",
            "2024-04-30T00:00:00Z,kill,Old,Timer,AK-47,1\n",
            1,
        )
        .await;
        h.put_event_file(
            "2024.05.01-13.00.00.csv",
            "2024-05-01T13:00:00Z,kill,New,Comer,AK-47,1\n",
            65,
        )
        .await;
        let report = h.run(&p).await;
        assert_eq!(report.files_found, 3);
        assert_eq!(report.events_applied, 1);
        assert_eq!(
            report.watermark.last_processed_file.as_deref(),
            Some("2024.05.01-13.00.00.csv")
        );
    }

    #[tokio::test]
    async fn file_that_failed_to_read_is_ingested_next_run() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(
            "2024.05.01-00.00.00.csv",
            "2024-05-01T00:00:00Z,kill,A,B,AK-47,10\n",
            1,
        )
        .await;
        h.put_event_file(
            "2024.05.02-00.00.00.csv",
            "2024-05-02T00:00:00Z,kill,C,D,AK-47,10\n",
            2,
        )
        .await;
        h.transport
            .fail_next_read("data/deathlogs/2024.05.01-00.00.00.csv")
            .await;

        let first = h.run(&p).await;
        assert_eq!(first.file_errors, 1);
        assert_eq!(first.events_applied, 1);
        assert_eq!(
            first.watermark.last_processed_file.as_deref(),
            Some("2024.05.02-00.00.00.csv")
        );
        assert!(first.watermark.last_processed_timestamp < Some(t0() + Duration::minutes(1)));

        let second = h.run(&p).await;
        assert_eq!(second.file_errors, 0);
        assert_eq!(second.events_applied, 1);
        assert_eq!(
            second.watermark.last_processed_timestamp,
            Some(t0() + Duration::minutes(2))
        );
        let players = h.store.players(p.tenant_id, &p.server_id).await;
        let names: Vec<_> = players.values().map(|s| s.player_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C", "D"]);

        let third = h.run(&p).await;
        assert_eq!(third.events_applied, 0);
        assert_eq!(third.duplicates_skipped, 0);
    }

    #[tokio::test]
    async fn pending_files_stay_newer_than_committed_timestamp() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        // Path order differs from mtime order.
        h.put_event_file(
            "2024.05.01-00.00.00.csv",
            "2024-05-01T00:00:00Z,kill,A,B,AK-47,10\n",
            30,
        )
        .await;
        h.put_event_file(
            "2024.05.02-00.00.00.csv",
            "2024-05-02T00:00:00Z,kill,C,D,AK-47,10\n",
            10,
        )
        .await;
        h.transport
            .fail_next_read("data/deathlogs/2024.05.02-00.00.00.csv")
            .await;

        let first = h.run(&p).await;
        assert_eq!(first.file_errors, 1);
        assert_eq!(first.events_applied, 1);
        assert!(first.watermark.last_processed_timestamp < Some(t0() + Duration::minutes(10)));

        let second = h.run(&p).await;
        assert_eq!(second.events_applied, 1);
        assert_eq!(second.duplicates_skipped, 0);
        assert_eq!(
            second.watermark.last_processed_timestamp,
            Some(t0() + Duration::minutes(30))
        );
        assert_eq!(h.store.count_players(p.tenant_id, &p.server_id).await.unwrap(), 4);
    }

    #[test]
    fn discovery_timestamp_is_clipped_below_floor() {
        let seen = Some(t0() + Duration::minutes(30));
        assert_eq!(clip_before(seen, None), seen);
        assert_eq!(clip_before(seen, Some(t0() + Duration::hours(1))), seen);
        assert_eq!(
            clip_before(seen, Some(t0() + Duration::minutes(10))),
            Some(t0() + Duration::minutes(10) - Duration::nanoseconds(1))
        );
        assert_eq!(clip_before(None, Some(t0())), None);
    }

    #[tokio::test]
    async fn commit_failure_keeps_watermark() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;
        h.store.fail_next_commit();
        let report = h.run(&p).await;
        assert!(report.commit_error.is_some());
        assert_eq!(report.watermark.last_processed_line, 0);
        let stored = h
            .directory
            .get_profile(p.tenant_id, &p.server_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.watermark, Watermark::default());
    }

    #[tokio::test]
    async fn cancelled_run_processes_no_files() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        h.put_event_file(FILE, FIVE_LINES, 5).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = IsolationContext::for_profile(&p).unwrap();
        let report = h.engine.run(&ctx, &p, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.files_processed, 0);
        assert_eq!(h.engine.state(p.tenant_id, &p.server_id), IngestionState::Idle);
    }

    #[tokio::test]
    async fn concurrent_run_on_same_scope_conflicts() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        let _guard = h.engine.begin((p.tenant_id, p.server_id.clone())).unwrap();
        assert_eq!(h.engine.state(p.tenant_id, &p.server_id), IngestionState::Scanning);

        let ctx = IsolationContext::for_profile(&p).unwrap();
        let err = h
            .engine
            .run(&ctx, &p, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn foreign_profile_is_rejected() {
        let p = profile(IsolationMode::Standard);
        let h = Harness::new(&p).await;
        let ctx = IsolationContext::new(TenantId(78), "eu-1", IsolationMode::Standard).unwrap();
        let err = h
            .engine
            .run(&ctx, &p, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }
}
