//! # Audit Events Testing
//!
//! Testing utilities for audit event pipelines.
//!
//! This crate provides:
//! - [`RecordingSink`]: an in-memory broker that captures published events
//! - Fixtures for configuration and pipelines
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use audit_events_testing::fixtures;
//!
//! #[tokio::test]
//! async fn publishes_one_event() {
//!     let (pipeline, sink) = fixtures::recording_pipeline();
//!     // ... drive a request through the audit layer ...
//!     assert!(sink.wait_for(1, Duration::from_secs(1)).await);
//!     assert_eq!(sink.records()[0].event, "createUser");
//! }
//! ```

pub mod mocks;

/// Ready-made configuration and pipelines.
pub mod fixtures {
    use super::mocks::RecordingSink;
    use audit_events_core::config::{ChannelConfig, EventsConfig, KafkaSettings};
    use audit_events_core::dispatch::DispatchPipeline;
    use std::sync::Arc;

    /// Source module used by [`test_config`].
    pub const TEST_SOURCE_MODULE: &str = "test-service";

    /// Config with `audit` and `business` channels on a local broker.
    #[must_use]
    pub fn test_config() -> EventsConfig {
        EventsConfig {
            default_source_module: TEST_SOURCE_MODULE.to_string(),
            kafka: KafkaSettings {
                brokers: Some("localhost:9092".to_string()),
                ..KafkaSettings::defaults()
            },
            ..EventsConfig::default()
        }
        .with_channel("audit", ChannelConfig::new("audit-events"))
        .with_channel("business", ChannelConfig::new("business-events"))
    }

    /// Pipeline over a fresh [`RecordingSink`] with [`test_config`].
    #[must_use]
    pub fn recording_pipeline() -> (DispatchPipeline, RecordingSink) {
        recording_pipeline_with(test_config())
    }

    /// Pipeline over a fresh [`RecordingSink`] with the given config.
    #[must_use]
    pub fn recording_pipeline_with(config: EventsConfig) -> (DispatchPipeline, RecordingSink) {
        let sink = RecordingSink::new();
        (DispatchPipeline::new(Arc::new(sink.clone()), config), sink)
    }
}

/// Install a test-friendly tracing subscriber (idempotent).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use fixtures::{recording_pipeline, recording_pipeline_with, test_config};
pub use mocks::{RecordingSink, SentEvent};
