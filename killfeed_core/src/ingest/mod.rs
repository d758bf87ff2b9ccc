pub mod engine;
pub mod models;
pub mod parser;

pub use engine::{DEFAULT_PRIMARY_LOG_NAME, IngestionEngine};
pub use models::{EventKind, IngestionReport, IngestionState, ParsedEvent};
pub use parser::{ParseError, parse_line, parse_timestamp};
