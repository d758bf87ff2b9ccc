use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::connector::traits::{
    RemoteEntry, RemoteSession, RemoteTransport, join_remote, remote_basename, remote_parent,
};
use crate::isolation::IsolationContext;
use crate::models::{CredentialTier, Credentials, ServerProfile};
use crate::{Error, Result};

/// Timeouts and discovery settings for the connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Lowercase extensions (without dot) recognized as event logs.
    pub event_extensions: Vec<String>,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            event_extensions: vec!["csv".to_string()],
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverableKind {
    NoCredentials,
    Connection,
    Timeout,
    NotFound,
    Backend,
}

/// A connector failure absorbed into an empty result instead of being propagated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverableError {
    pub kind: RecoverableKind,
    pub message: String,
}

impl From<&Error> for RecoverableError {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::NoCredentials(_) => RecoverableKind::NoCredentials,
            Error::Connection(_) => RecoverableKind::Connection,
            Error::Timeout(_) => RecoverableKind::Timeout,
            Error::NotFound(_) => RecoverableKind::NotFound,
            _ => RecoverableKind::Backend,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRead {
    pub content: String,
    pub error: Option<RecoverableError>,
}

impl RemoteRead {
    fn failed(err: &Error) -> Self {
        Self {
            content: String::new(),
            error: Some(err.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub success: bool,
    pub skipped: bool,
    pub tier: Option<CredentialTier>,
    pub message: String,
}

/// Fetches files from a tenant's remote host under the context's access policy.
///
/// Restricted contexts never open a session. For standard contexts the dedicated
/// transfer credentials are tried first, then the primary set.
pub struct RemoteFileConnector {
    transport: Arc<dyn RemoteTransport>,
    settings: ConnectorSettings,
}

/// An open session plus the credential tier that produced it.
pub struct Connection {
    pub session: Box<dyn RemoteSession>,
    pub tier: CredentialTier,
}

impl RemoteFileConnector {
    pub fn new(transport: Arc<dyn RemoteTransport>, settings: ConnectorSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// Open a session for `profile`, falling back from transfer to primary credentials.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(tenant_id = %ctx.tenant_id(), server_id = %ctx.server_id(), transport = self.transport.name())
    )]
    pub async fn connect(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
    ) -> Result<Connection> {
        ctx.ensure_entity(profile)?;
        if ctx.is_restricted() {
            return Err(Error::Unauthorized(format!(
                "remote access is not permitted in {} mode",
                ctx.mode()
            )));
        }

        let mut candidates: Vec<(CredentialTier, Credentials)> = Vec::with_capacity(2);
        if let Some(transfer) = &profile.transfer {
            let merged = transfer.with_fallback(profile.primary.as_ref());
            if merged.is_usable() {
                candidates.push((CredentialTier::Transfer, merged));
            }
        }
        if let Some(primary) = &profile.primary {
            let primary = primary.with_fallback(None);
            if primary.is_usable() {
                candidates.push((CredentialTier::Primary, primary));
            }
        }
        if candidates.is_empty() {
            return Err(Error::NoCredentials(format!(
                "server '{}' has no usable credentials",
                profile.name
            )));
        }

        let mut last_err = None;
        for (tier, creds) in candidates {
            let attempt =
                tokio::time::timeout(self.settings.connect_timeout, self.transport.open(&creds))
                    .await;
            match attempt {
                Ok(Ok(session)) => {
                    tracing::debug!(?tier, endpoint = %creds.endpoint(), "remote session opened");
                    return Ok(Connection { session, tier });
                }
                Ok(Err(e)) => {
                    tracing::warn!(?tier, endpoint = %creds.endpoint(), error = %e, "remote connect failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    tracing::warn!(?tier, endpoint = %creds.endpoint(), "remote connect timed out");
                    last_err = Some(Error::Timeout(format!("connect to {}", creds.endpoint())));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Connection("no connection attempt made".to_string())))
    }

    /// Names of the non-directory entries in `directory`. A missing directory is created.
    #[tracing::instrument(level = "debug", skip(self, ctx, profile), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn list_files(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        directory: &str,
    ) -> Result<Vec<String>> {
        if ctx.is_restricted() {
            tracing::info!(mode = %ctx.mode(), "skipping remote listing for restricted server");
            return Ok(Vec::new());
        }
        let mut conn = self.connect(ctx, profile).await?;
        let result = self.list_or_create(conn.session.as_mut(), directory).await;
        self.release(conn).await;
        Ok(result?
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.name)
            .collect())
    }

    /// Read a file. Connectivity and I/O failures yield empty content plus the error.
    #[tracing::instrument(level = "debug", skip(self, ctx, profile), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn read_file(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        path: &str,
    ) -> RemoteRead {
        if ctx.is_restricted() {
            tracing::info!(mode = %ctx.mode(), "skipping remote read for restricted server");
            return RemoteRead::default();
        }
        let mut conn = match self.connect(ctx, profile).await {
            Ok(conn) => conn,
            Err(e) => return RemoteRead::failed(&e),
        };
        let result = self.read_with(conn.session.as_mut(), path).await;
        self.release(conn).await;
        match result {
            Ok(content) => RemoteRead {
                content,
                error: None,
            },
            Err(e) => {
                tracing::warn!(path, error = %e, "remote read failed");
                RemoteRead::failed(&e)
            }
        }
    }

    /// Write a file, creating parent directories. Returns false when skipped or failed.
    #[tracing::instrument(level = "debug", skip(self, ctx, profile, content), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn write_file(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        path: &str,
        content: &str,
    ) -> bool {
        if ctx.is_restricted() {
            tracing::info!(mode = %ctx.mode(), "skipping remote write for restricted server");
            return false;
        }
        let mut conn = match self.connect(ctx, profile).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(path, error = %e, "remote write skipped");
                return false;
            }
        };
        let session = conn.session.as_mut();
        let result = async {
            if let Some(parent) = remote_parent(path) {
                self.bounded(session.create_dir_all(parent), parent).await?;
            }
            self.bounded(session.write(path, content.as_bytes()), path)
                .await
        }
        .await;
        self.release(conn).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path, error = %e, "remote write failed");
                false
            }
        }
    }

    /// Metadata for `path`, or `None` when absent, restricted or unreachable.
    #[tracing::instrument(level = "debug", skip(self, ctx, profile), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn stat(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        path: &str,
    ) -> Option<RemoteEntry> {
        if ctx.is_restricted() {
            return None;
        }
        let mut conn = match self.connect(ctx, profile).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(path, error = %e, "stat skipped");
                return None;
            }
        };
        let result = self.bounded(conn.session.stat(path), path).await;
        self.release(conn).await;
        result.unwrap_or_else(|e| {
            tracing::debug!(path, error = %e, "stat failed");
            None
        })
    }

    #[tracing::instrument(level = "info", skip(self, ctx, profile), fields(tenant_id = %ctx.tenant_id(), server_id = %ctx.server_id()))]
    pub async fn test_connection(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
    ) -> ConnectionCheck {
        if ctx.is_restricted() {
            return ConnectionCheck {
                success: true,
                skipped: true,
                tier: None,
                message: format!(
                    "connection skipped for {} server: {}",
                    ctx.mode(),
                    ctx.mode().unavailability_reason()
                ),
            };
        }
        match self.connect(ctx, profile).await {
            Ok(conn) => {
                let tier = conn.tier;
                self.release(conn).await;
                ConnectionCheck {
                    success: true,
                    skipped: false,
                    tier: Some(tier),
                    message: format!("connected with {tier:?} credentials").to_lowercase(),
                }
            }
            Err(e) => ConnectionCheck {
                success: false,
                skipped: false,
                tier: None,
                message: e.to_string(),
            },
        }
    }

    /// Recursive scan of the event-log directory for recognized event files.
    ///
    /// Returned paths are relative to `profile.event_log_directory`, sorted.
    #[tracing::instrument(level = "debug", skip(self, ctx, profile), fields(tenant_id = %ctx.tenant_id()))]
    pub async fn find_event_files(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
    ) -> Result<Vec<RemoteEntry>> {
        if ctx.is_restricted() {
            tracing::info!(mode = %ctx.mode(), "skipping event discovery for restricted server");
            return Ok(Vec::new());
        }
        let mut conn = self.connect(ctx, profile).await?;
        let result = self
            .walk_event_files(conn.session.as_mut(), &profile.event_log_directory)
            .await;
        self.release(conn).await;
        result
    }

    pub async fn find_recent_event_files(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        n: i64,
    ) -> Result<Vec<RemoteEntry>> {
        self.find_recent_event_files_at(ctx, profile, n, Utc::now().date_naive())
            .await
    }

    /// `n >= 0` keeps the `n` last files by name; `n < 0` keeps files dated within
    /// `|n|` days of `today` (by the `yyyy.mm.dd` basename prefix).
    #[tracing::instrument(level = "debug", skip(self, ctx, profile))]
    pub async fn find_recent_event_files_at(
        &self,
        ctx: &IsolationContext,
        profile: &ServerProfile,
        n: i64,
        today: NaiveDate,
    ) -> Result<Vec<RemoteEntry>> {
        let files = self.find_event_files(ctx, profile).await?;
        Ok(select_recent(files, n, today))
    }

    async fn walk_event_files(
        &self,
        session: &mut dyn RemoteSession,
        base: &str,
    ) -> Result<Vec<RemoteEntry>> {
        let mut out = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(rel_dir) = pending.pop() {
            let abs_dir = join_remote(base, &rel_dir);
            let entries = if rel_dir.is_empty() {
                self.list_or_create(session, &abs_dir).await?
            } else {
                match self.bounded(session.list_dir(&abs_dir), &abs_dir).await {
                    Ok(entries) => entries,
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            };
            for entry in entries {
                let rel = join_remote(&rel_dir, &entry.name);
                if entry.is_dir {
                    pending.push(rel);
                } else if self.is_event_file(&entry.name) {
                    out.push(RemoteEntry { path: rel, ..entry });
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn is_event_file(&self, name: &str) -> bool {
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.settings.event_extensions.iter().any(|e| *e == ext)
    }

    async fn list_or_create(
        &self,
        session: &mut dyn RemoteSession,
        directory: &str,
    ) -> Result<Vec<RemoteEntry>> {
        match self.bounded(session.list_dir(directory), directory).await {
            Ok(entries) => Ok(entries),
            Err(Error::NotFound(_)) => {
                tracing::info!(directory, "remote directory missing, creating");
                self.bounded(session.create_dir_all(directory), directory)
                    .await?;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn read_with(&self, session: &mut dyn RemoteSession, path: &str) -> Result<String> {
        let bytes = self.bounded(session.read(path), path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>, what: &str) -> Result<T> {
        tokio::time::timeout(self.settings.read_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("remote operation on '{what}'")))?
    }

    async fn release(&self, mut conn: Connection) {
        if let Err(e) = self.bounded(conn.session.close(), "close").await {
            tracing::debug!(error = %e, "remote session close failed");
        }
    }
}

fn select_recent(mut files: Vec<RemoteEntry>, n: i64, today: NaiveDate) -> Vec<RemoteEntry> {
    if n >= 0 {
        let keep = usize::try_from(n).unwrap_or(usize::MAX);
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let skip = files.len().saturating_sub(keep);
        return files.split_off(skip);
    }
    let cutoff = today
        .checked_sub_days(Days::new(n.unsigned_abs()))
        .unwrap_or(NaiveDate::MIN);
    files
        .into_iter()
        .filter(|f| {
            remote_basename(&f.path)
                .get(..10)
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y.%m.%d").ok())
                .is_some_and(|date| date >= cutoff)
        })
        .collect()
}
