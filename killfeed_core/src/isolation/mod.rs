pub mod context;
pub mod manager;

pub use context::{HasTenantScope, IsolationContext};
pub use manager::{IsolationManager, ScopedContext};
