pub mod memory;
pub mod models;
pub mod traits;

pub use memory::{MemoryRecordStore, MemoryTenantDirectory};
pub use models::{
    AggregateTotals, CommitOutcome, EventCommit, ListQuery, Metric, PlayerStats, RecordSnapshot,
    ScopeSnapshot, StatDelta, StreakChange,
};
pub use traits::{RecordStore, TenantDirectory};
