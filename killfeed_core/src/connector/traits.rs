use crate::Result;
use crate::models::Credentials;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file or directory on a remote host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Path as passed to the session, or relative to a scan root for discovery results.
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Opens sessions against a remote host.
///
/// Transport implementations live in `killfeed_integrations` (local directory, SFTP);
/// `MemoryTransport` is provided for tests.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Connect and authenticate. Rejected credentials or unreachable hosts map to
    /// `Error::Connection`.
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn RemoteSession>>;
}

/// An authenticated session. Dropping it must release the underlying connection.
#[async_trait]
pub trait RemoteSession: Send {
    /// Entries directly inside `path`. Missing directories map to `Error::NotFound`.
    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    async fn stat(&mut self, path: &str) -> Result<Option<RemoteEntry>>;

    async fn read(&mut self, path: &str) -> Result<Vec<u8>>;

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()>;

    async fn create_dir_all(&mut self, path: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Join remote path segments with `/`.
pub fn join_remote(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        return name.to_string();
    }
    if name.is_empty() {
        return base.to_string();
    }
    format!("{base}/{name}")
}

/// Parent directory of a remote path, if any.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .rfind('/')
        .map(|idx| &trimmed[..idx])
        .filter(|p| !p.is_empty())
}

pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
