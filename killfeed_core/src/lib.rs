//! Killfeed core library: tenant isolation, remote log access, ingestion and validation.

pub mod config;
pub mod connector;
pub mod error;
pub mod ingest;
pub mod isolation;
pub mod leaderboard;
pub mod models;
pub mod o11y;
pub mod pipeline;
pub mod schedule;
pub mod store;
pub mod validate;

pub use config::{KillfeedConfig, TransportKind};
pub use connector::{
    ConnectorSettings, RemoteEntry, RemoteFileConnector, RemoteSession, RemoteTransport,
};
pub use error::{Error, Result};
pub use ingest::{IngestionEngine, IngestionReport};
pub use isolation::{IsolationContext, IsolationManager, ScopedContext};
pub use leaderboard::{LeaderboardService, LeaderboardView};
pub use models::{
    CredentialTier, Credentials, IsolationMode, ServerId, ServerProfile, TenantId, Watermark,
};
pub use pipeline::{BatchReport, IngestionPipeline};
pub use schedule::IngestionScheduler;
pub use store::{RecordStore, TenantDirectory};
pub use validate::{ValidationEngine, ValidationSummary};
