//! Event dispatch pipeline.
//!
//! The pipeline takes a finished [`TransportEvent`], maps it to an
//! [`EventRecord`] and hands the serialized record to an [`EventSink`] on a
//! background task. The originating request never waits for the send and
//! never sees its failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ AuditContext     │
//! │   publish()      │
//! └────────┬─────────┘
//!          │ TransportEvent + diagnostic snapshot
//!          ▼
//! ┌──────────────────┐
//! │ DispatchPipeline │  tokio::spawn, snapshot restored
//! └────────┬─────────┘
//!          │ channel lookup by event type, serialize
//!          ▼
//! ┌──────────────────┐
//! │ EventSink        │  broker client (Redpanda/Kafka, or in-memory)
//! └────────┬─────────┘
//!          │ ack / error
//!          ▼
//! ┌──────────────────┐
//! │ BrokerHealth     │
//! └──────────────────┘
//! ```
//!
//! # Failure policy
//!
//! - Unknown channel: logged at error level, the event is dropped, broker
//!   health is untouched.
//! - Serialization or publish failure: logged at error level with a base64
//!   copy of the payload, broker health goes down.
//!
//! Neither case is retried or propagated to the request.

use crate::config::{EventsConfig, SerializerKind};
use crate::diagnostic::{DiagnosticContext, TENANT_ID_KEY, TRACKING_ID_KEY};
use crate::event::{EventRecord, TransportEvent};
use crate::health::BrokerHealth;
use crate::mapper;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Errors raised while sending an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The events module is switched off.
    #[error("Events module is disabled")]
    Disabled,

    /// No channel is configured for the event type.
    #[error("No channel configured for event type '{0}'")]
    UnknownChannel(String),

    /// The record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The broker rejected or did not acknowledge the message.
    #[error("Failed to publish to '{topic}': {message}")]
    Publish {
        /// Destination topic.
        topic: String,
        /// Broker error message.
        message: String,
    },

    /// A producer could not be created.
    #[error("Producer error: {0}")]
    Producer(String),
}

/// Broker client that delivers serialized events.
///
/// Implementations resolve the destination topic from the event-type name and
/// use `event_id` as the message key.
pub trait EventSink: Send + Sync {
    /// Publish one serialized event.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if the channel is unknown or the broker does
    /// not acknowledge the message.
    fn publish<'a>(
        &'a self,
        event_type: &'a str,
        payload: &'a [u8],
        event_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}

/// Encode a record for a channel.
///
/// # Errors
///
/// Returns [`DispatchError::Serialization`] when encoding fails.
pub fn encode(record: &EventRecord, serializer: SerializerKind) -> Result<Vec<u8>, DispatchError> {
    match serializer {
        SerializerKind::Json => {
            serde_json::to_vec(record).map_err(|e| DispatchError::Serialization(e.to_string()))
        }
        SerializerKind::Bincode => {
            bincode::serialize(record).map_err(|e| DispatchError::Serialization(e.to_string()))
        }
    }
}

/// Decode a record encoded by [`encode`].
///
/// # Errors
///
/// Returns [`DispatchError::Serialization`] when decoding fails.
pub fn decode(bytes: &[u8], serializer: SerializerKind) -> Result<EventRecord, DispatchError> {
    match serializer {
        SerializerKind::Json => {
            serde_json::from_slice(bytes).map_err(|e| DispatchError::Serialization(e.to_string()))
        }
        SerializerKind::Bincode => {
            bincode::deserialize(bytes).map_err(|e| DispatchError::Serialization(e.to_string()))
        }
    }
}

/// Routes finished events to the broker without blocking the caller.
///
/// Cheap to clone; clones share the sink, configuration and health state.
#[derive(Clone)]
pub struct DispatchPipeline {
    sink: Arc<dyn EventSink>,
    config: Arc<EventsConfig>,
    health: Arc<BrokerHealth>,
}

impl fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("config", &self.config)
            .field("health", &self.health.status())
            .finish_non_exhaustive()
    }
}

impl DispatchPipeline {
    /// Create a pipeline over `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, config: EventsConfig) -> Self {
        Self {
            sink,
            config: Arc::new(config),
            health: Arc::new(BrokerHealth::new()),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EventsConfig {
        &self.config
    }

    /// Shared broker health indicator.
    #[must_use]
    pub fn health(&self) -> Arc<BrokerHealth> {
        Arc::clone(&self.health)
    }

    /// Send a finished request event in the background.
    ///
    /// Returns the handle of the send task, or `None` when nothing was
    /// scheduled (module disabled or no runtime available).
    pub fn dispatch(&self, event: TransportEvent) -> Option<JoinHandle<()>> {
        if self.config.disabled {
            tracing::warn!(
                operation_id = %event.operation_id,
                "Events module is disabled, audit event not sent"
            );
            return None;
        }
        tracing::debug!(event = %event, "Audit event");

        let pipeline = self.clone();
        self.spawn_in_context(async move {
            let record = mapper::to_event_record(&event);
            let _ = pipeline.send_record(&record).await;
        })
    }

    /// Send a pre-built record in the background.
    pub fn submit(&self, record: EventRecord) -> Option<JoinHandle<()>> {
        if self.config.disabled {
            tracing::warn!(event = %record.event, "Events module is disabled, event not sent");
            return None;
        }

        let pipeline = self.clone();
        self.spawn_in_context(async move {
            let _ = pipeline.send_record(&record).await;
        })
    }

    /// Resolve, encode and publish one record, updating health and metrics.
    ///
    /// Every failure is logged here; callers may ignore the result.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownChannel`] when no channel is configured
    /// for the record's event type, or the serialization/publish error.
    pub async fn send_record(&self, record: &EventRecord) -> Result<(), DispatchError> {
        let event_type = record.event_type.name();
        let event_id = record.id.to_string();
        tracing::Span::current().record("event_id", event_id.as_str());

        let Some(channel) = self.config.channel(event_type) else {
            tracing::error!(
                event_type,
                event_id = %event_id,
                "No channel configured for event type, event dropped"
            );
            metrics::counter!(
                "audit_events_failed_total",
                "event_type" => event_type,
                "reason" => "unknown_channel"
            )
            .increment(1);
            return Err(DispatchError::UnknownChannel(event_type.to_string()));
        };

        let payload = match encode(record, channel.serializer) {
            Ok(payload) => payload,
            Err(e) => {
                self.serialization_failed(record, &e);
                return Err(e);
            }
        };

        match self.sink.publish(event_type, &payload, &event_id).await {
            Ok(()) => {
                self.health.on_send_success();
                metrics::counter!("audit_events_dispatched_total", "event_type" => event_type)
                    .increment(1);
                tracing::info!(
                    event_type,
                    topic = %channel.topic,
                    event_id = %event_id,
                    "Event sent"
                );
                Ok(())
            }
            Err(e) => {
                self.health.on_send_failure(&e);
                metrics::counter!(
                    "audit_events_failed_total",
                    "event_type" => event_type,
                    "reason" => "publish"
                )
                .increment(1);
                tracing::error!(
                    event_type,
                    topic = %channel.topic,
                    event_id = %event_id,
                    payload = %BASE64.encode(&payload),
                    error = %e,
                    "Failed to send event"
                );
                Err(e)
            }
        }
    }

    fn serialization_failed(&self, record: &EventRecord, error: &DispatchError) {
        let event_type = record.event_type.name();
        tracing::error!(
            event_type,
            event_id = %record.id,
            record = ?record,
            error = %error,
            "Failed to serialize event"
        );
        self.health.on_send_failure(error);
        metrics::counter!(
            "audit_events_failed_total",
            "event_type" => event_type,
            "reason" => "serialization"
        )
        .increment(1);
    }

    /// Spawn `fut` on the current runtime with the caller's diagnostic context.
    fn spawn_in_context<F>(&self, fut: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            tracing::error!("No async runtime available, event dropped");
            return None;
        };

        let snapshot = DiagnosticContext::snapshot();
        let span = tracing::info_span!(
            "audit_dispatch",
            tracking_id = snapshot.value(TRACKING_ID_KEY).unwrap_or_default(),
            tenant_id = snapshot.value(TENANT_ID_KEY).unwrap_or_default(),
            event_id = tracing::field::Empty,
        );
        Some(runtime.spawn(snapshot.scope(fut.instrument(span))))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, KafkaSettings};
    use crate::event::{EventStatus, EventType};
    use crate::health::HealthStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        sent: Mutex<Vec<(String, Vec<u8>, String, Option<String>)>>,
        fail: bool,
    }

    impl EventSink for MemorySink {
        fn publish<'a>(
            &'a self,
            event_type: &'a str,
            payload: &'a [u8],
            event_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail {
                    return Err(DispatchError::Publish {
                        topic: event_type.to_string(),
                        message: "broker unavailable".to_string(),
                    });
                }
                self.sent.lock().unwrap().push((
                    event_type.to_string(),
                    payload.to_vec(),
                    event_id.to_string(),
                    DiagnosticContext::get(TRACKING_ID_KEY),
                ));
                Ok(())
            })
        }
    }

    fn config() -> EventsConfig {
        EventsConfig {
            kafka: KafkaSettings {
                brokers: Some("localhost:9092".to_string()),
                ..KafkaSettings::defaults()
            },
            ..EventsConfig::default()
        }
        .with_channel("audit", ChannelConfig::new("audit-events"))
        .with_channel(
            "business",
            ChannelConfig::new("business-events").with_serializer(SerializerKind::Bincode),
        )
    }

    fn record(event_type: EventType) -> EventRecord {
        EventRecord::builder()
            .event("createUser")
            .event_type(event_type)
            .event_status(EventStatus::Success)
            .source_module("users")
            .build()
    }

    #[tokio::test]
    async fn submit_publishes_with_restored_diagnostic_context() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = DispatchPipeline::new(sink.clone(), config());
        let original = record(EventType::Audit);

        let handle = DiagnosticContext::new()
            .scope(async {
                DiagnosticContext::put(TRACKING_ID_KEY, "abc123");
                pipeline.submit(original.clone())
            })
            .await
            .unwrap();
        handle.await.unwrap();

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (event_type, payload, key, tracking_id) = &sent[0];
        assert_eq!(event_type, "audit");
        assert_eq!(key, &original.id.to_string());
        assert_eq!(tracking_id.as_deref(), Some("abc123"));
        assert_eq!(decode(payload, SerializerKind::Json).unwrap(), original);
        assert_eq!(pipeline.health().status(), HealthStatus::Up);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn serialization_failure_logs_the_record() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let pipeline = DispatchPipeline::new(Arc::new(MemorySink::default()), config());
        let original = record(EventType::Audit);

        tracing::subscriber::with_default(subscriber, || {
            pipeline.serialization_failed(
                &original,
                &DispatchError::Serialization("unsupported value".to_string()),
            );
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Failed to serialize event"));
        assert!(output.contains(&original.id.to_string()));
        assert!(output.contains(r#"event: "createUser""#));
        assert!(output.contains(r#"source_module: "users""#));
        assert_eq!(pipeline.health().status(), HealthStatus::Down);
    }

    #[tokio::test]
    async fn bincode_channel_round_trips() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = DispatchPipeline::new(sink.clone(), config());
        let original = record(EventType::Business);

        pipeline.send_record(&original).await.unwrap();

        let sent = sink.sent.lock().unwrap();
        assert_eq!(decode(&sent[0].1, SerializerKind::Bincode).unwrap(), original);
    }

    #[tokio::test]
    async fn unknown_channel_is_reported_without_touching_health() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = DispatchPipeline::new(
            sink.clone(),
            EventsConfig::default().with_channel("business", ChannelConfig::new("b")),
        );

        let err = pipeline.send_record(&record(EventType::Audit)).await.unwrap_err();

        assert_eq!(err, DispatchError::UnknownChannel("audit".to_string()));
        assert_eq!(pipeline.health().status(), HealthStatus::Unknown);
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_marks_broker_down_and_stays_in_task() {
        let sink = Arc::new(MemorySink {
            fail: true,
            ..MemorySink::default()
        });
        let pipeline = DispatchPipeline::new(sink, config());

        let handle = pipeline.submit(record(EventType::Audit)).unwrap();
        handle.await.unwrap();

        let health = pipeline.health();
        assert_eq!(health.status(), HealthStatus::Down);
        assert_eq!(health.failure_count(), 1);
    }

    #[tokio::test]
    async fn disabled_module_schedules_nothing() {
        let sink = Arc::new(MemorySink::default());
        let pipeline = DispatchPipeline::new(
            sink.clone(),
            EventsConfig {
                disabled: true,
                ..config()
            },
        );

        assert!(pipeline.submit(record(EventType::Audit)).is_none());
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn no_runtime_drops_the_event() {
        let pipeline = DispatchPipeline::new(Arc::new(MemorySink::default()), config());
        assert!(pipeline.submit(record(EventType::Audit)).is_none());
    }
}
