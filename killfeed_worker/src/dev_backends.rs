//! Worker wiring: profiles file, in-memory stores and the configured transport.

use anyhow::Context;
use killfeed_core::connector::RemoteTransport;
use killfeed_core::leaderboard::LeaderboardService;
use killfeed_core::models::{Credentials, IsolationMode, ServerProfile, TenantId, Watermark};
use killfeed_core::store::{
    ListQuery, MemoryRecordStore, MemoryTenantDirectory, RecordSnapshot, TenantDirectory,
};
use killfeed_core::{
    IngestionEngine, IngestionPipeline, IsolationManager, KillfeedConfig, RemoteFileConnector,
    TransportKind, ValidationEngine,
};
use killfeed_integrations::LocalDirTransport;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// One entry of the profiles file. Also accepts profiles previously written by
/// `save_profiles`, so watermarks survive restarts.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSpec {
    pub tenant_id: i64,
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub mode: IsolationMode,
    #[serde(default)]
    pub primary: Option<Credentials>,
    #[serde(default)]
    pub transfer: Option<Credentials>,
    #[serde(default)]
    pub log_directory: Option<String>,
    #[serde(default)]
    pub event_log_directory: Option<String>,
    #[serde(default)]
    pub watermark: Option<Watermark>,
}

impl ProfileSpec {
    pub fn into_profile(self) -> killfeed_core::Result<ServerProfile> {
        let mut profile = ServerProfile::new(
            TenantId(self.tenant_id),
            self.server_id,
            self.name,
            self.mode,
            None,
        )?;
        profile.primary = self.primary;
        profile.transfer = self.transfer;
        if let Some(dir) = self.log_directory {
            profile.log_directory = dir;
        }
        if let Some(dir) = self.event_log_directory {
            profile.event_log_directory = dir;
        }
        if let Some(watermark) = self.watermark {
            profile.watermark = watermark;
        }
        Ok(profile)
    }
}

#[tracing::instrument(level = "info")]
pub async fn load_profiles(path: &Path) -> anyhow::Result<Vec<ServerProfile>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read profiles file {}", path.display()))?;
    let specs: Vec<ProfileSpec> = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse profiles file {}", path.display()))?;
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let label = format!("{}/{}", spec.tenant_id, spec.server_id);
        out.push(
            spec.into_profile()
                .with_context(|| format!("invalid profile {label}"))?,
        );
    }
    tracing::info!(profiles = out.len(), "loaded server profiles");
    Ok(out)
}

#[tracing::instrument(level = "info", skip(directory))]
pub async fn save_profiles(path: &Path, directory: &dyn TenantDirectory) -> anyhow::Result<()> {
    let mut all = Vec::new();
    let mut offset = 0usize;
    loop {
        let page = directory
            .list_profiles(ListQuery { limit: 200, offset })
            .await?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        all.extend(page);
    }
    let json = serde_json::to_vec_pretty(&all)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("write profiles file {}", path.display()))?;
    Ok(())
}

/// Load a records file into `store`. A missing file leaves the store empty.
#[tracing::instrument(level = "info", skip(store))]
pub async fn load_records(path: &Path, store: &MemoryRecordStore) -> anyhow::Result<()> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no records file yet");
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("read records file {}", path.display()));
        }
    };
    let snapshot: RecordSnapshot = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse records file {}", path.display()))?;
    store
        .import(snapshot)
        .await
        .with_context(|| format!("load records file {}", path.display()))?;
    Ok(())
}

#[tracing::instrument(level = "info", skip(store))]
pub async fn save_records(path: &Path, store: &MemoryRecordStore) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(&store.export().await)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("write records file {}", path.display()))?;
    Ok(())
}

pub fn build_transport(config: &KillfeedConfig) -> anyhow::Result<Arc<dyn RemoteTransport>> {
    match config.transport {
        TransportKind::Local => Ok(Arc::new(LocalDirTransport::new(config.local_root.clone()))),
        #[cfg(feature = "sftp")]
        TransportKind::Sftp => Ok(Arc::new(killfeed_integrations::SftpTransport::new(
            config.connect_timeout,
            config.read_timeout,
        ))),
        #[cfg(not(feature = "sftp"))]
        TransportKind::Sftp => {
            anyhow::bail!("KILLFEED_TRANSPORT=sftp requires building with the `sftp` feature")
        }
    }
}

/// Everything a worker command needs, wired over in-memory stores.
pub struct WorkerState {
    pub config: KillfeedConfig,
    pub directory: Arc<MemoryTenantDirectory>,
    pub store: Arc<MemoryRecordStore>,
    pub isolation: Arc<IsolationManager>,
    pub connector: Arc<RemoteFileConnector>,
    pub pipeline: Arc<IngestionPipeline>,
    pub leaderboard: LeaderboardService,
}

pub async fn build_state(
    config: KillfeedConfig,
    profiles: Vec<ServerProfile>,
) -> anyhow::Result<WorkerState> {
    let transport = build_transport(&config)?;
    Ok(build_state_with_transport(config, profiles, transport).await)
}

pub async fn build_state_with_transport(
    config: KillfeedConfig,
    profiles: Vec<ServerProfile>,
    transport: Arc<dyn RemoteTransport>,
) -> WorkerState {
    let directory = Arc::new(MemoryTenantDirectory::with_profiles(profiles).await);
    let store = Arc::new(MemoryRecordStore::new());
    let connector = Arc::new(RemoteFileConnector::new(
        transport,
        config.connector_settings(),
    ));
    let isolation = Arc::new(IsolationManager::new(directory.clone()));
    let ingestion = Arc::new(
        IngestionEngine::new(connector.clone(), store.clone(), directory.clone())
            .with_primary_log_name(config.primary_log_name.clone()),
    );
    let validation =
        Arc::new(ValidationEngine::new(store.clone()).with_limit(config.leaderboard_limit));
    let pipeline = Arc::new(
        IngestionPipeline::new(isolation.clone(), directory.clone(), ingestion, validation)
            .with_max_concurrency(config.max_concurrency),
    );
    let leaderboard = LeaderboardService::new(store.clone(), config.leaderboard_limit);

    WorkerState {
        config,
        directory,
        store,
        isolation,
        connector,
        pipeline,
        leaderboard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use killfeed_core::models::ServerId;
    use killfeed_core::store::Metric;
    use tokio_util::sync::CancellationToken;

    const PROFILES: &str = r#"[
        {
            "tenant_id": 7,
            "server_id": "eu-1",
            "name": "EU One",
            "primary": { "host": "game.example", "username": "admin", "password": "pw" }
        },
        { "tenant_id": 7, "server_id": "default", "name": "Default Server", "mode": "sentinel" }
    ]"#;

    #[tokio::test]
    async fn loads_profiles_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(&path, PROFILES).unwrap();

        let profiles = load_profiles(&path).await.unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].log_directory, "logs");
        assert_eq!(profiles[0].event_log_directory, "data/deathlogs");
        assert_eq!(profiles[0].primary.as_ref().unwrap().port, 0);
        assert_eq!(profiles[1].mode, IsolationMode::Sentinel);
    }

    #[tokio::test]
    async fn invalid_tenant_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(&path, r#"[{"tenant_id": 0, "server_id": "s", "name": "x"}]"#).unwrap();
        let err = load_profiles(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid scope"));
    }

    #[tokio::test]
    async fn local_batch_ingests_and_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let profiles_path = dir.path().join("profiles.json");
        std::fs::write(&profiles_path, PROFILES).unwrap();
        let remote = dir.path().join("remote");
        let deathlogs = remote.join("game.example/data/deathlogs");
        std::fs::create_dir_all(&deathlogs).unwrap();
        std::fs::write(
            deathlogs.join("2024.05.01-00.00.00.csv"),
            "2024-05-01T00:00:00Z,kill,Alice,Bob,AK-47,120\n2024-05-01T00:01:00Z,kill,Alice,Carl,M4,30\n",
        )
        .unwrap();

        let config = KillfeedConfig {
            local_root: remote,
            ..KillfeedConfig::default()
        };
        let profiles = load_profiles(&profiles_path).await.unwrap();
        let state = build_state(config, profiles).await.unwrap();

        let report = state
            .pipeline
            .run_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.profiles_total, 2);
        assert_eq!(report.events_applied, 2);
        assert!(report.successful);

        let scoped = state
            .isolation
            .enter(TenantId(7), ServerId::from("eu-1"))
            .await
            .unwrap();
        let profile = scoped.profile().cloned().unwrap();
        let view = state
            .leaderboard
            .leaderboard(&scoped, &profile, Metric::Kills, None)
            .await
            .unwrap();
        assert_eq!(view.entries.len(), 1);
        assert_eq!(view.entries[0].player_name, "Alice");
        assert_eq!(view.entries[0].kills, 2);
        scoped.exit();

        let saved = dir.path().join("state.json");
        save_profiles(&saved, state.directory.as_ref()).await.unwrap();
        let reloaded = load_profiles(&saved).await.unwrap();
        let eu = reloaded
            .iter()
            .find(|p| p.server_id == ServerId::from("eu-1"))
            .unwrap();
        assert_eq!(eu.watermark.last_processed_line, 2);
        assert_eq!(
            eu.watermark.last_processed_file.as_deref(),
            Some("2024.05.01-00.00.00.csv")
        );
    }

    #[tokio::test]
    async fn saved_records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let profiles_path = dir.path().join("profiles.json");
        std::fs::write(&profiles_path, PROFILES).unwrap();
        let remote = dir.path().join("remote");
        let deathlogs = remote.join("game.example/data/deathlogs");
        std::fs::create_dir_all(&deathlogs).unwrap();
        std::fs::write(
            deathlogs.join("2024.05.01-00.00.00.csv"),
            "2024-05-01T00:00:00Z,kill,Alice,Bob,AK-47,120\n2024-05-01T00:01:00Z,kill,Alice,Carl,M4,30\n",
        )
        .unwrap();
        let config = KillfeedConfig {
            local_root: remote,
            ..KillfeedConfig::default()
        };
        let state_path = dir.path().join("state.json");
        let records_path = dir.path().join("records.json");

        let first = build_state(config.clone(), load_profiles(&profiles_path).await.unwrap())
            .await
            .unwrap();
        load_records(&records_path, &first.store).await.unwrap();
        first.pipeline.run_all(&CancellationToken::new()).await.unwrap();
        save_profiles(&state_path, first.directory.as_ref()).await.unwrap();
        save_records(&records_path, &first.store).await.unwrap();

        let second = build_state(config, load_profiles(&state_path).await.unwrap())
            .await
            .unwrap();
        load_records(&records_path, &second.store).await.unwrap();
        let report = second
            .pipeline
            .run_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.events_applied, 0);
        assert!(report.successful);

        let scoped = second
            .isolation
            .enter(TenantId(7), ServerId::from("eu-1"))
            .await
            .unwrap();
        let profile = scoped.profile().cloned().unwrap();
        let view = second
            .leaderboard
            .leaderboard(&scoped, &profile, Metric::Kills, None)
            .await
            .unwrap();
        assert_eq!(view.entries[0].player_name, "Alice");
        assert_eq!(view.entries[0].kills, 2);
        scoped.exit();
    }

    #[tokio::test]
    async fn corrupt_records_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "not json").unwrap();
        let err = load_records(&path, &MemoryRecordStore::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("parse records file"));
    }

    #[test]
    fn sftp_needs_feature_or_builds() {
        let config = KillfeedConfig {
            transport: TransportKind::Sftp,
            ..KillfeedConfig::default()
        };
        assert_eq!(build_transport(&config).is_ok(), cfg!(feature = "sftp"));
    }
}
