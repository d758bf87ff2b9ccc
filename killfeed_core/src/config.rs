use crate::connector::ConnectorSettings;
use crate::ingest::DEFAULT_PRIMARY_LOG_NAME;
use crate::leaderboard::DEFAULT_LEADERBOARD_LIMIT;
use crate::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which remote transport the worker wires into the connector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Remote hosts mirrored under a local directory (one subdirectory per host).
    Local,
    Sftp,
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "sftp" | "ssh" => Ok(Self::Sftp),
            other => Err(Error::InvalidInput(format!(
                "KILLFEED_TRANSPORT must be 'local' or 'sftp', got '{other}'"
            ))),
        }
    }
}

/// Runtime configuration, read from `KILLFEED_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillfeedConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub primary_log_name: String,
    pub event_extensions: Vec<String>,
    pub leaderboard_limit: usize,
    pub poll_interval: Duration,
    pub max_concurrency: usize,
    pub transport: TransportKind,
    pub local_root: PathBuf,
}

impl Default for KillfeedConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(10_000),
            read_timeout: Duration::from_millis(30_000),
            primary_log_name: DEFAULT_PRIMARY_LOG_NAME.to_string(),
            event_extensions: vec!["csv".to_string()],
            leaderboard_limit: DEFAULT_LEADERBOARD_LIMIT,
            poll_interval: Duration::from_millis(60_000),
            max_concurrency: 4,
            transport: TransportKind::Local,
            local_root: PathBuf::from("./data/remote"),
        }
    }
}

impl KillfeedConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(default)
        };

        let transport = match lookup("KILLFEED_TRANSPORT") {
            Some(raw) => raw.parse()?,
            None => defaults.transport,
        };
        let event_extensions = lookup("KILLFEED_EVENT_EXTENSIONS")
            .map(|raw| {
                raw.split(',')
                    .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| defaults.event_extensions.clone());

        let cfg = Self {
            connect_timeout: millis("KILLFEED_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            read_timeout: millis("KILLFEED_READ_TIMEOUT_MS", defaults.read_timeout),
            primary_log_name: lookup("KILLFEED_PRIMARY_LOG_NAME")
                .unwrap_or_else(|| defaults.primary_log_name.clone()),
            event_extensions,
            leaderboard_limit: count("KILLFEED_LEADERBOARD_LIMIT", defaults.leaderboard_limit),
            poll_interval: millis("KILLFEED_POLL_INTERVAL_MS", defaults.poll_interval),
            max_concurrency: count("KILLFEED_MAX_CONCURRENCY", defaults.max_concurrency),
            transport,
            local_root: lookup("KILLFEED_LOCAL_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| defaults.local_root.clone()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidInput("connect_timeout must be > 0".to_string()));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::InvalidInput("read_timeout must be > 0".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        if self.leaderboard_limit == 0 {
            return Err(Error::InvalidInput(
                "leaderboard_limit must be > 0".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(Error::InvalidInput("max_concurrency must be > 0".to_string()));
        }
        if self.primary_log_name.trim().is_empty() || self.primary_log_name.contains('/') {
            return Err(Error::InvalidInput(
                "primary_log_name must be a bare file name".to_string(),
            ));
        }
        if self.event_extensions.is_empty() {
            return Err(Error::InvalidInput("event_extensions is empty".to_string()));
        }
        if self.transport == TransportKind::Local && self.local_root.as_os_str().is_empty() {
            return Err(Error::InvalidInput("local_root is empty".to_string()));
        }
        Ok(())
    }

    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            event_extensions: self.event_extensions.clone(),
        }
    }
}
