use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid tenant id: {0}")]
    InvalidTenantId(String),
    #[error("invalid isolation mode: {0}")]
    InvalidMode(String),
}

pub const DEFAULT_SFTP_PORT: u16 = 22;
pub const DEFAULT_LOG_DIRECTORY: &str = "logs";
pub const DEFAULT_EVENT_LOG_DIRECTORY: &str = "data/deathlogs";

/// Tenant identifier (numeric chat-community id). Valid ids are > 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl TenantId {
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for TenantId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for TenantId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<i64>()
            .map_err(|_| IdParseError::InvalidTenantId(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Game server identifier within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Access policy for a server profile.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Remote access and queries permitted.
    #[default]
    Standard,
    ReadOnly,
    Disabled,
    /// Placeholder profile for tenants without a real server. Never fetches, never errors.
    Sentinel,
}

impl IsolationMode {
    pub fn is_restricted(&self) -> bool {
        !matches!(self, Self::Standard)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::ReadOnly => "read-only",
            Self::Disabled => "disabled",
            Self::Sentinel => "sentinel",
        }
    }

    /// Neutral, user-facing explanation for why no statistics are shown.
    pub fn unavailability_reason(&self) -> &'static str {
        match self {
            Self::Standard => "No data available yet for this server.",
            Self::ReadOnly => "This server is in read-only mode and cannot display statistics.",
            Self::Disabled => "This server has isolation disabled and cannot display statistics.",
            Self::Sentinel => "This is a default placeholder server and cannot display player statistics.",
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationMode {
    type Err = IdParseError;

    /// Accepts the canonical names plus the legacy `default` / `Default Server` spellings.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "standard" => Ok(Self::Standard),
            "read-only" | "readonly" | "read_only" => Ok(Self::ReadOnly),
            "disabled" => Ok(Self::Disabled),
            "sentinel" | "default" | "default server" => Ok(Self::Sentinel),
            _ => Err(IdParseError::InvalidMode(s.to_string())),
        }
    }
}

/// Which credential set established a remote session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialTier {
    Transfer,
    Primary,
}

/// Remote-host credentials. `Debug` redacts the password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    /// Zero means the SFTP default.
    #[serde(default)]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Host and username are both present.
    pub fn is_usable(&self) -> bool {
        !self.host.trim().is_empty() && !self.username.trim().is_empty()
    }

    /// Fill blank username/password from `primary` and a zero port with the SFTP default.
    pub fn with_fallback(&self, primary: Option<&Credentials>) -> Credentials {
        let mut out = self.clone();
        if let Some(primary) = primary {
            if out.username.trim().is_empty() {
                out.username = primary.username.clone();
            }
            if out.password.is_empty() {
                out.password = primary.password.clone();
            }
        }
        if out.port == 0 {
            out.port = DEFAULT_SFTP_PORT;
        }
        out
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resumable ingestion progress for one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// Event-log file (relative to the event-log directory) last committed.
    pub last_processed_file: Option<String>,
    /// 1-based position of the last successfully parsed line in that file.
    pub last_processed_line: u64,
    pub last_processed_timestamp: Option<DateTime<Utc>>,
    pub last_rotation_timestamp: Option<DateTime<Utc>>,
    /// Primary server log cursor.
    #[serde(default)]
    pub last_log_line: u64,
    #[serde(default)]
    pub last_log_size: Option<u64>,
}

/// Configuration and ingestion state for one remote game server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub tenant_id: TenantId,
    pub server_id: ServerId,
    pub name: String,
    pub primary: Option<Credentials>,
    pub transfer: Option<Credentials>,
    pub log_directory: String,
    pub event_log_directory: String,
    #[serde(default)]
    pub mode: IsolationMode,
    #[serde(default)]
    pub watermark: Watermark,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerProfile {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        tenant_id: TenantId,
        server_id: impl Into<ServerId> + fmt::Debug,
        name: impl Into<String> + fmt::Debug,
        mode: IsolationMode,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        if !tenant_id.is_valid() {
            return Err(Error::InvalidScope(format!(
                "tenant id must be > 0, got {tenant_id}"
            )));
        }
        let server_id = server_id.into();
        if server_id.is_blank() {
            return Err(Error::InvalidScope("server id is empty".to_string()));
        }
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("profile name is empty".to_string()));
        }

        let now = now.unwrap_or_else(Utc::now);
        Ok(Self {
            tenant_id,
            server_id,
            name,
            primary: None,
            transfer: None,
            log_directory: DEFAULT_LOG_DIRECTORY.to_string(),
            event_log_directory: DEFAULT_EVENT_LOG_DIRECTORY.to_string(),
            mode,
            watermark: Watermark::default(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Placeholder profile used when a tenant has no real server configured.
    pub fn sentinel(tenant_id: TenantId, server_id: impl Into<ServerId> + fmt::Debug) -> Result<Self> {
        Self::new(
            tenant_id,
            server_id,
            "Default Server",
            IsolationMode::Sentinel,
            None,
        )
    }

    pub fn with_primary(mut self, credentials: Credentials) -> Self {
        self.primary = Some(credentials);
        self
    }

    pub fn with_transfer(mut self, credentials: Credentials) -> Self {
        self.transfer = Some(credentials);
        self
    }

    pub fn with_directories(
        mut self,
        log_directory: impl Into<String>,
        event_log_directory: impl Into<String>,
    ) -> Self {
        self.log_directory = log_directory.into();
        self.event_log_directory = event_log_directory.into();
        self
    }

    /// At least one credential set could be used to connect.
    pub fn has_usable_credentials(&self) -> bool {
        let primary = self.primary.as_ref().is_some_and(Credentials::is_usable);
        let transfer = self
            .transfer
            .as_ref()
            .map(|t| t.with_fallback(self.primary.as_ref()))
            .is_some_and(|t| t.is_usable());
        primary || transfer
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_modes() {
        assert!(!IsolationMode::Standard.is_restricted());
        assert!(IsolationMode::ReadOnly.is_restricted());
        assert!(IsolationMode::Disabled.is_restricted());
        assert!(IsolationMode::Sentinel.is_restricted());
    }

    #[test]
    fn legacy_mode_names_parse_to_sentinel() {
        assert_eq!(
            "Default Server".parse::<IsolationMode>().unwrap(),
            IsolationMode::Sentinel
        );
        assert_eq!("read-only".parse::<IsolationMode>().unwrap(), IsolationMode::ReadOnly);
        assert!("bogus".parse::<IsolationMode>().is_err());
    }

    #[test]
    fn mode_serializes_kebab_case() {
        let json = serde_json::to_string(&IsolationMode::ReadOnly).unwrap();
        assert_eq!(json, "\"read-only\"");
    }

    #[test]
    fn transfer_credentials_fill_from_primary() {
        let primary = Credentials::new("10.0.0.1", 2222, "admin", "secret");
        let transfer = Credentials::new("files.example.net", 0, "", "");
        let merged = transfer.with_fallback(Some(&primary));
        assert_eq!(merged.host, "files.example.net");
        assert_eq!(merged.port, DEFAULT_SFTP_PORT);
        assert_eq!(merged.username, "admin");
        assert_eq!(merged.password, "secret");
    }

    #[test]
    fn debug_redacts_password() {
        let creds = Credentials::new("h", 22, "u", "hunter2");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn profile_rejects_bad_scope() {
        assert!(matches!(
            ServerProfile::new(TenantId(0), "s1", "Main", IsolationMode::Standard, None),
            Err(Error::InvalidScope(_))
        ));
        assert!(matches!(
            ServerProfile::new(TenantId(7), "  ", "Main", IsolationMode::Standard, None),
            Err(Error::InvalidScope(_))
        ));
    }

    #[test]
    fn usable_credentials_require_host_and_user() {
        let profile = ServerProfile::new(TenantId(1), "s1", "Main", IsolationMode::Standard, None)
            .unwrap();
        assert!(!profile.has_usable_credentials());
        let profile = profile.with_transfer(Credentials::new("files", 22, "", ""));
        assert!(!profile.has_usable_credentials());
        let profile = profile.with_primary(Credentials::new("", 22, "admin", "pw"));
        // transfer borrows the primary username, so it becomes usable
        assert!(profile.has_usable_credentials());
    }
}
