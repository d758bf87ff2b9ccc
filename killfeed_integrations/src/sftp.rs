//! SFTP transport on top of `ssh2`.
//!
//! libssh2 is blocking; every call runs on the blocking pool and the session is moved
//! in and out of the closure. A call abandoned by a caller timeout leaves the session
//! unusable, and later calls fail with `Error::Connection`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use killfeed_core::connector::traits::{join_remote, remote_basename};
use killfeed_core::models::Credentials;
use killfeed_core::{Error, RemoteEntry, RemoteSession, RemoteTransport, Result};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// libssh2 status for a missing file or directory.
const SFTP_NO_SUCH_FILE: i32 = 2;

#[derive(Debug, Clone)]
pub struct SftpTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SftpTransport {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

struct Inner {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
}

#[async_trait]
impl RemoteTransport for SftpTransport {
    fn name(&self) -> &'static str {
        "sftp"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(endpoint = %credentials.endpoint()))]
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn RemoteSession>> {
        let creds = credentials.clone();
        let connect_timeout = self.connect_timeout;
        let io_timeout = self.io_timeout;
        let inner = tokio::task::spawn_blocking(move || connect(&creds, connect_timeout, io_timeout))
            .await
            .map_err(|e| Error::backend("sftp connect task", e))??;
        Ok(Box::new(SftpSession { inner: Some(inner) }))
    }
}

fn connect(creds: &Credentials, connect_timeout: Duration, io_timeout: Duration) -> Result<Inner> {
    let endpoint = creds.endpoint();
    let addrs = (creds.host.as_str(), creds.port)
        .to_socket_addrs()
        .map_err(|e| Error::Connection(format!("resolve {endpoint}: {e}")))?;

    let mut last_err = None;
    let mut tcp = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| {
        Error::Connection(match last_err {
            Some(e) => format!("connect {endpoint}: {e}"),
            None => format!("connect {endpoint}: no addresses"),
        })
    })?;

    let mut session =
        ssh2::Session::new().map_err(|e| Error::Connection(format!("ssh session: {e}")))?;
    session.set_timeout(u32::try_from(io_timeout.as_millis()).unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| Error::Connection(format!("ssh handshake with {endpoint}: {e}")))?;
    session
        .userauth_password(&creds.username, &creds.password)
        .map_err(|e| Error::Connection(format!("authentication rejected by {endpoint}: {e}")))?;
    if !session.authenticated() {
        return Err(Error::Connection(format!(
            "authentication rejected by {endpoint}"
        )));
    }
    let sftp = session
        .sftp()
        .map_err(|e| Error::Connection(format!("sftp subsystem on {endpoint}: {e}")))?;
    Ok(Inner { session, sftp })
}

fn map_err(path: &str, e: ssh2::Error) -> Error {
    match e.code() {
        ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Error::NotFound(path.to_string()),
        _ => Error::backend(format!("sftp {path}"), e),
    }
}

fn entry(path: String, name: String, stat: &ssh2::FileStat) -> RemoteEntry {
    RemoteEntry {
        path,
        name,
        is_dir: stat.is_dir(),
        size: stat.size.unwrap_or(0),
        modified: stat
            .mtime
            .and_then(|t| i64::try_from(t).ok())
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
    }
}

struct SftpSession {
    inner: Option<Inner>,
}

impl SftpSession {
    async fn blocking<T, F>(&mut self, path: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Sftp, &Path, &str) -> Result<T> + Send + 'static,
    {
        let inner = self
            .inner
            .take()
            .ok_or_else(|| Error::Connection("sftp session is closed".to_string()))?;
        let remote = path.to_string();
        let (inner, res) = tokio::task::spawn_blocking(move || {
            let res = f(&inner.sftp, Path::new(&remote), &remote);
            (inner, res)
        })
        .await
        .map_err(|e| Error::backend("sftp task", e))?;
        self.inner = Some(inner);
        res
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let items = self
            .blocking(path, |sftp, p, r| sftp.readdir(p).map_err(|e| map_err(r, e)))
            .await?;
        let mut out: Vec<RemoteEntry> = items
            .into_iter()
            .filter_map(|(p, stat)| {
                let name = p.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(entry(join_remote(path, &name), name, &stat))
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn stat(&mut self, path: &str) -> Result<Option<RemoteEntry>> {
        match self
            .blocking(path, |sftp, p, r| sftp.stat(p).map_err(|e| map_err(r, e)))
            .await
        {
            Ok(stat) => {
                let name = remote_basename(path).to_string();
                Ok(Some(entry(path.to_string(), name, &stat)))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        self.blocking(path, |sftp, p, r| {
            let mut file = sftp.open(p).map_err(|e| map_err(r, e))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(|e| Error::io(r, e))?;
            Ok(buf)
        })
        .await
    }

    async fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.blocking(path, move |sftp, p, r| {
            let mut file = sftp.create(p).map_err(|e| map_err(r, e))?;
            file.write_all(&data).map_err(|e| Error::io(r, e))?;
            Ok(())
        })
        .await
    }

    async fn create_dir_all(&mut self, path: &str) -> Result<()> {
        self.blocking(path, |sftp, p, r| {
            let mut current = PathBuf::new();
            for component in p.components() {
                current.push(component);
                if sftp.stat(&current).is_err() {
                    sftp.mkdir(&current, 0o755).map_err(|e| map_err(r, e))?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(inner) = self.inner.take() {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = inner.session.disconnect(None, "closing", None) {
                    tracing::debug!(error = %e, "sftp disconnect failed");
                }
            })
            .await
            .map_err(|e| Error::backend("sftp close task", e))?;
        }
        Ok(())
    }
}
