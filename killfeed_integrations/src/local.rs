//! Local directory transport.
//!
//! Each remote host is mirrored as a subdirectory of `root` named after the host
//! (`{root}/{host}/logs/Deadside.log`). Useful for development and for hosts whose
//! files are already synced to local disk.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use killfeed_core::connector::traits::join_remote;
use killfeed_core::models::Credentials;
use killfeed_core::{Error, RemoteEntry, RemoteSession, RemoteTransport, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LocalDirTransport {
    root: PathBuf,
}

impl LocalDirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RemoteTransport for LocalDirTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(host = %credentials.host))]
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn RemoteSession>> {
        let host = credentials.host.trim();
        if host.is_empty() || host.contains(['/', '\\']) || host == "." || host == ".." {
            return Err(Error::Connection(format!("invalid host '{host}'")));
        }
        let host_root = self.root.join(host);
        match tokio::fs::metadata(&host_root).await {
            Ok(meta) if meta.is_dir() => Ok(Box::new(LocalDirSession { root: host_root })),
            _ => Err(Error::Connection(format!(
                "host {} is not reachable under {}",
                credentials.endpoint(),
                self.root.display()
            ))),
        }
    }
}

struct LocalDirSession {
    root: PathBuf,
}

impl LocalDirSession {
    /// Map a remote path onto the host directory. Leading `/` is ignored.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut out = self.root.clone();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(Error::Unauthorized(format!(
                        "path escapes host root: {path}"
                    )));
                }
                p => out.push(p),
            }
        }
        Ok(out)
    }
}

fn entry(path: String, name: String, meta: &std::fs::Metadata) -> RemoteEntry {
    RemoteEntry {
        path,
        name,
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    }
}

#[async_trait]
impl RemoteSession for LocalDirSession {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.resolve(path)?;
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::io(path, e))?;
        let mut out = Vec::new();
        while let Some(item) = rd.next_entry().await.map_err(|e| Error::io(path, e))? {
            let name = item.file_name().to_string_lossy().into_owned();
            let meta = item.metadata().await.map_err(|e| Error::io(path, e))?;
            out.push(entry(join_remote(path, &name), name, &meta));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn stat(&mut self, path: &str) -> Result<Option<RemoteEntry>> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) => {
                let name = full
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Some(entry(path.to_string(), name, &meta)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    async fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| Error::io(path, e))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| Error::io(path, e))
    }

    async fn create_dir_all(&mut self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| Error::io(path, e))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
