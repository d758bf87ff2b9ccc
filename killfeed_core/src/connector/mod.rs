pub mod memory;
pub mod remote;
pub mod traits;

pub use memory::MemoryTransport;
pub use remote::{
    Connection, ConnectionCheck, ConnectorSettings, RecoverableError, RecoverableKind,
    RemoteFileConnector, RemoteRead,
};
pub use traits::{RemoteEntry, RemoteSession, RemoteTransport};
