//! Integration tests for [`RedpandaEventSink`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Records are delivered to the channel's topic, keyed by event id
//! - The dispatch pipeline marks the broker up after a delivery
//! - Delivery failures surface as publish errors
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p audit-events-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use audit_events_core::config::{ChannelConfig, EventsConfig, KafkaSettings, SerializerKind};
use audit_events_core::dispatch::{DispatchError, DispatchPipeline, EventSink, decode};
use audit_events_core::event::{EventRecord, EventStatus, EventType};
use audit_events_core::health::HealthStatus;
use audit_events_redpanda::RedpandaEventSink;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn config(brokers: &str) -> EventsConfig {
    EventsConfig {
        default_source_module: "integration".to_string(),
        kafka: KafkaSettings {
            brokers: Some(brokers.to_string()),
            delivery_timeout_ms: Some(30_000),
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

/// Publish until the topic exists and the broker accepts writes.
async fn wait_for_kafka_ready(sink: &RedpandaEventSink) {
    for attempt in 1..=60 {
        if sink.publish("audit", b"warmup", "warmup").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Kafka failed to become ready");
    }
}

fn consumer(brokers: &str, topic: &str) -> StreamConsumer {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", format!("audit-events-test-{topic}"))
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .create()
        .expect("Failed to create consumer");
    consumer.subscribe(&[topic]).expect("Failed to subscribe");
    consumer
}

/// Next record on the topic whose key is `event_id`.
async fn receive(consumer: &StreamConsumer, event_id: &str) -> Vec<u8> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = tokio::time::timeout(remaining, consumer.recv())
            .await
            .expect("Timed out waiting for record")
            .expect("Failed to receive record");
        if message.key() == Some(event_id.as_bytes()) {
            return message.payload().expect("Record has no payload").to_vec();
        }
    }
}

#[tokio::test]
#[ignore]
async fn test_pipeline_delivers_json_record() {
    let (_kafka, brokers) = start_kafka().await;
    let config = config(&brokers);
    let sink = RedpandaEventSink::from_config(&config).expect("Failed to create sink");
    wait_for_kafka_ready(&sink).await;

    let pipeline = DispatchPipeline::new(Arc::new(sink), config);
    let record = EventRecord::builder()
        .event("createUser")
        .event_type(EventType::Audit)
        .event_status(EventStatus::Success)
        .source_module("integration")
        .correlation_id("request.TrackingId", "abc123")
        .build();

    pipeline.send_record(&record).await.expect("Failed to send record");
    assert_eq!(pipeline.health().status(), HealthStatus::Up);

    let consumer = consumer(&brokers, "audit-events");
    let payload = receive(&consumer, &record.id.to_string()).await;
    let received = decode(&payload, SerializerKind::Json).expect("Failed to decode record");

    assert_eq!(received.id, record.id);
    assert_eq!(received.event, "createUser");
    assert_eq!(received.correlation_ids["request.TrackingId"], "abc123");
}

#[tokio::test]
#[ignore]
async fn test_channel_serializer_is_applied() {
    let (_kafka, brokers) = start_kafka().await;
    let config = config(&brokers);
    let sink = RedpandaEventSink::from_config(&config).expect("Failed to create sink");
    wait_for_kafka_ready(&sink).await;

    let pipeline = DispatchPipeline::new(Arc::new(sink), config);
    let record = EventRecord::builder()
        .event("orderPlaced")
        .event_type(EventType::Business)
        .payload(r#"{"orderId":1}"#)
        .build();

    pipeline.send_record(&record).await.expect("Failed to send record");

    let consumer = consumer(&brokers, "business-events");
    let payload = receive(&consumer, &record.id.to_string()).await;
    let received = decode(&payload, SerializerKind::Bincode).expect("Failed to decode record");

    assert_eq!(received.event, "orderPlaced");
    assert_eq!(received.payload.as_deref(), Some(r#"{"orderId":1}"#));
}

#[tokio::test]
#[ignore]
async fn test_unreachable_broker_fails_delivery() {
    let mut config = config("127.0.0.1:1");
    config.kafka.delivery_timeout_ms = Some(1_000);
    let sink = RedpandaEventSink::from_config(&config).expect("Failed to create sink");
    let pipeline = DispatchPipeline::new(Arc::new(sink), config);

    let record = EventRecord::builder().event("createUser").build();
    let err = pipeline.send_record(&record).await.unwrap_err();

    assert!(matches!(err, DispatchError::Publish { .. }));
    assert_eq!(pipeline.health().status(), HealthStatus::Down);
}
