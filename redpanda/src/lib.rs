//! Kafka/Redpanda event sink for audit events.
//!
//! This crate provides the broker client behind a
//! [`DispatchPipeline`](audit_events_core::DispatchPipeline): an
//! [`EventSink`] holding one rdkafka [`FutureProducer`] per configured
//! channel. Any Kafka-compatible broker works (Redpanda, Apache Kafka, MSK).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ DispatchPipeline │  channel lookup, serialization, health
//! └────────┬─────────┘
//!          │ publish(event_type, bytes, event_id)
//!          ▼
//! ┌──────────────────┐
//! │ RedpandaEventSink│
//! └────────┬─────────┘
//!     ┌────┴─────┐
//!     ▼          ▼
//! ┌───────┐  ┌──────────┐
//! │ audit │  │ business │  one producer per channel
//! └───────┘  └──────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! Each event is keyed by its id, so retries of the same event land on the
//! same partition. The send future resolves once the broker acknowledged
//! the record (per `acks`) or the delivery timeout expired.
//!
//! # Configuration
//!
//! Producer settings come from [`KafkaSettings`], with per-channel values
//! falling back to the global ones:
//!
//! | Setting | librdkafka property |
//! |---|---|
//! | `brokers` | `bootstrap.servers` |
//! | `connection_timeout_ms` | `socket.connection.setup.timeout.ms` |
//! | `request_timeout_ms` | `request.timeout.ms` |
//! | `delivery_timeout_ms` | `message.timeout.ms` |
//! | `retry_backoff_ms` | `retry.backoff.ms` |
//! | `retries` | `message.send.max.retries` |
//! | `acks` | `acks` (default `1`) |
//! | `compression` | `compression.type` (default `none`) |
//! | `security_protocol`, `sasl_*` | `security.protocol`, `sasl.*` |
//!
//! `max_block_ms` bounds how long a send waits for room in a full producer
//! queue.
//!
//! # Example
//!
//! ```no_run
//! use audit_events_core::{DispatchPipeline, EventsConfig};
//! use audit_events_redpanda::RedpandaEventSink;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EventsConfig::from_env()?;
//! config.validate()?;
//! let sink = RedpandaEventSink::from_config(&config)?;
//! let pipeline = DispatchPipeline::new(Arc::new(sink), config);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use audit_events_core::config::{EventsConfig, KafkaSettings};
use audit_events_core::dispatch::{DispatchError, EventSink};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Used when neither the channel nor the global settings bound queue waits.
const DEFAULT_MAX_BLOCK: Duration = Duration::from_secs(60);

struct ChannelProducer {
    topic: String,
    producer: FutureProducer,
    max_block: Duration,
}

/// [`EventSink`] publishing to Kafka-compatible brokers.
pub struct RedpandaEventSink {
    channels: BTreeMap<String, ChannelProducer>,
}

impl fmt::Debug for RedpandaEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedpandaEventSink")
            .field(
                "channels",
                &self
                    .channels
                    .iter()
                    .map(|(name, channel)| (name.as_str(), channel.topic.as_str()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl RedpandaEventSink {
    /// Create one producer per channel of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Producer`] if a channel has no broker list or
    /// its producer cannot be created.
    pub fn from_config(config: &EventsConfig) -> Result<Self, DispatchError> {
        let mut channels = BTreeMap::new();
        for (name, channel) in &config.channels {
            let settings = channel.kafka.merged_over(&config.kafka);
            let producer: FutureProducer = client_config(name, &settings)?
                .create()
                .map_err(|e| {
                    DispatchError::Producer(format!(
                        "Failed to create producer for channel {name}: {e}"
                    ))
                })?;

            tracing::info!(
                channel = %name,
                topic = %channel.topic,
                brokers = settings.brokers.as_deref().unwrap_or_default(),
                serializer = ?channel.serializer,
                "Producer created"
            );

            channels.insert(
                name.clone(),
                ChannelProducer {
                    topic: channel.topic.clone(),
                    producer,
                    max_block: settings
                        .max_block_ms
                        .map_or(DEFAULT_MAX_BLOCK, Duration::from_millis),
                },
            );
        }
        Ok(Self { channels })
    }

    /// Topic of each configured channel.
    #[must_use]
    pub fn topics(&self) -> BTreeMap<&str, &str> {
        self.channels
            .iter()
            .map(|(name, channel)| (name.as_str(), channel.topic.as_str()))
            .collect()
    }
}

/// Producer configuration for one channel's effective settings.
///
/// # Errors
///
/// Returns [`DispatchError::Producer`] if no broker list is set.
pub fn client_config(channel: &str, settings: &KafkaSettings) -> Result<ClientConfig, DispatchError> {
    let brokers = settings
        .brokers
        .as_deref()
        .filter(|brokers| !brokers.trim().is_empty())
        .ok_or_else(|| {
            DispatchError::Producer(format!("No brokers configured for channel {channel}"))
        })?;

    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("acks", settings.acks.as_deref().unwrap_or("1"))
        .set(
            "compression.type",
            settings.compression.as_deref().unwrap_or("none"),
        );

    let numeric = [
        ("socket.connection.setup.timeout.ms", settings.connection_timeout_ms),
        ("request.timeout.ms", settings.request_timeout_ms),
        ("message.timeout.ms", settings.delivery_timeout_ms),
        ("retry.backoff.ms", settings.retry_backoff_ms),
        ("message.send.max.retries", settings.retries.map(u64::from)),
    ];
    for (key, value) in numeric {
        if let Some(value) = value {
            config.set(key, value.to_string());
        }
    }

    let text = [
        ("security.protocol", &settings.security_protocol),
        ("sasl.mechanism", &settings.sasl_mechanism),
        ("sasl.username", &settings.sasl_username),
        ("sasl.password", &settings.sasl_password),
    ];
    for (key, value) in text {
        if let Some(value) = value {
            config.set(key, value);
        }
    }

    Ok(config)
}

impl EventSink for RedpandaEventSink {
    fn publish<'a>(
        &'a self,
        event_type: &'a str,
        payload: &'a [u8],
        event_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let channel = self
                .channels
                .get(event_type)
                .ok_or_else(|| DispatchError::UnknownChannel(event_type.to_string()))?;

            let record = FutureRecord::to(&channel.topic)
                .payload(payload)
                .key(event_id);

            match channel
                .producer
                .send(record, Timeout::After(channel.max_block))
                .await
            {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %channel.topic,
                        partition = partition,
                        offset = offset,
                        event_id = %event_id,
                        "Event delivered"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => Err(DispatchError::Publish {
                    topic: channel.topic.clone(),
                    message: kafka_error.to_string(),
                }),
            }
        })
    }
}
