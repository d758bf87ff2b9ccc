pub mod engine;
pub mod models;

pub use engine::ValidationEngine;
pub use models::{ReconciliationMismatch, ValidationSummary};
