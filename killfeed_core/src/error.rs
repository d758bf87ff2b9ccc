use std::error::Error as StdError;

/// Common error type for `killfeed_core`.
///
/// Transport and store implementations should preserve the underlying error
/// chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Missing or malformed tenant/server identifiers. Fatal to one operation only.
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// An operation tried to touch data outside the active tenant scope.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No usable remote-access credentials. Aborts the run for that profile only.
    #[error("no credentials: {0}")]
    NoCredentials(String),

    /// Host unreachable or authentication rejected. Retried on the next scheduled run.
    #[error("connection failure: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "killfeed.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap an I/O error with the path it concerns.
    pub fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path.to_string());
        }
        Self::Backend {
            context: format!("io {path}"),
            source: Box::new(source),
        }
    }

    /// True for errors that end a profile's run early without failing it.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::NoCredentials(_) | Self::Connection(_) | Self::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
