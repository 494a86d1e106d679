//! HTTP request handlers.

pub mod health;

// Re-export common handler utilities
pub use health::{broker_health, health_check};
