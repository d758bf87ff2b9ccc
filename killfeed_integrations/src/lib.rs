//! Remote transports implementing `killfeed_core::RemoteTransport`.

pub mod local;
#[cfg(feature = "sftp")]
pub mod sftp;

pub use local::LocalDirTransport;
#[cfg(feature = "sftp")]
pub use sftp::SftpTransport;
