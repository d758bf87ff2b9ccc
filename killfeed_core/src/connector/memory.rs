use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::connector::traits::{
    RemoteEntry, RemoteSession, RemoteTransport, join_remote, remote_basename, remote_parent,
};
use crate::models::Credentials;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    files: Mutex<BTreeMap<String, MemoryFile>>,
    dirs: Mutex<BTreeSet<String>>,
    rejected_hosts: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<Credentials>>,
    connect_delay: Mutex<Option<Duration>>,
    failing_reads: Mutex<HashSet<String>>,
    open_sessions: AtomicUsize,
}

/// In-memory remote host for local development and unit tests.
///
/// Every host shares one file tree. Connection attempts are recorded so tests can
/// assert on credential fallback and on restricted profiles never connecting.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<State>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_file(&self, path: &str, content: &str, modified: DateTime<Utc>) {
        self.state.files.lock().await.insert(
            path.to_string(),
            MemoryFile {
                data: content.as_bytes().to_vec(),
                modified,
            },
        );
    }

    pub async fn file(&self, path: &str) -> Option<String> {
        self.state
            .files
            .lock()
            .await
            .get(path)
            .map(|f| String::from_utf8_lossy(&f.data).into_owned())
    }

    pub async fn dir_exists(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        self.state.dirs.lock().await.contains(path) || self.has_files_under(path).await
    }

    /// Refuse authentication for every credential set targeting `host`.
    pub async fn reject_host(&self, host: &str) {
        self.state
            .rejected_hosts
            .lock()
            .await
            .insert(host.to_string());
    }

    /// Make the next read of `path` fail with a backend error.
    pub async fn fail_next_read(&self, path: &str) {
        self.state
            .failing_reads
            .lock()
            .await
            .insert(path.to_string());
    }

    pub async fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().await = Some(delay);
    }

    pub async fn connection_attempts(&self) -> Vec<Credentials> {
        self.state.attempts.lock().await.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    async fn has_files_under(&self, dir: &str) -> bool {
        let prefix = format!("{dir}/");
        self.state
            .files
            .lock()
            .await
            .keys()
            .any(|k| k.starts_with(&prefix))
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn RemoteSession>> {
        self.state.attempts.lock().await.push(credentials.clone());
        let delay = *self.state.connect_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .state
            .rejected_hosts
            .lock()
            .await
            .contains(&credentials.host)
        {
            return Err(Error::Connection(format!(
                "authentication rejected by {}",
                credentials.endpoint()
            )));
        }
        self.state.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            transport: self.clone(),
            closed: false,
        }))
    }
}

struct MemorySession {
    transport: MemoryTransport,
    closed: bool,
}

impl MemorySession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport
                .state
                .open_sessions
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = path.trim_end_matches('/');
        if !self.transport.dir_exists(dir).await {
            return Err(Error::NotFound(dir.to_string()));
        }
        let prefix = format!("{dir}/");
        let mut out: BTreeMap<String, RemoteEntry> = BTreeMap::new();

        for (key, file) in self.transport.state.files.lock().await.iter() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    out.entry(child.to_string())
                        .or_insert_with(|| dir_entry(dir, child));
                }
                None => {
                    out.insert(
                        rest.to_string(),
                        RemoteEntry {
                            path: key.clone(),
                            name: rest.to_string(),
                            is_dir: false,
                            size: file.data.len() as u64,
                            modified: Some(file.modified),
                        },
                    );
                }
            }
        }
        for key in self.transport.state.dirs.lock().await.iter() {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let child = rest.split('/').next().unwrap_or(rest);
                if !child.is_empty() {
                    out.entry(child.to_string())
                        .or_insert_with(|| dir_entry(dir, child));
                }
            }
        }
        Ok(out.into_values().collect())
    }

    async fn stat(&mut self, path: &str) -> Result<Option<RemoteEntry>> {
        if let Some(file) = self.transport.state.files.lock().await.get(path) {
            return Ok(Some(RemoteEntry {
                path: path.to_string(),
                name: remote_basename(path).to_string(),
                is_dir: false,
                size: file.data.len() as u64,
                modified: Some(file.modified),
            }));
        }
        if self.transport.dir_exists(path).await {
            let name = remote_basename(path);
            let parent = remote_parent(path).unwrap_or("");
            return Ok(Some(dir_entry(parent, name)));
        }
        Ok(None)
    }

    async fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        if self.transport.state.failing_reads.lock().await.remove(path) {
            return Err(Error::BackendMessage(format!("injected read failure: {path}")));
        }
        self.transport
            .state
            .files
            .lock()
            .await
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if let Some(parent) = remote_parent(path) {
            if !self.transport.dir_exists(parent).await {
                return Err(Error::NotFound(parent.to_string()));
            }
        }
        self.transport.state.files.lock().await.insert(
            path.to_string(),
            MemoryFile {
                data: data.to_vec(),
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn create_dir_all(&mut self, path: &str) -> Result<()> {
        let mut dirs = self.transport.state.dirs.lock().await;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join_remote(&current, segment);
            dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

fn dir_entry(parent: &str, name: &str) -> RemoteEntry {
    RemoteEntry {
        path: join_remote(parent, name),
        name: name.to_string(),
        is_dir: true,
        size: 0,
        modified: None,
    }
}
