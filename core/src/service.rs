//! Convenience API for events that do not come from an HTTP request.

use crate::diagnostic::{DiagnosticContext, TENANT_ID_KEY};
use crate::dispatch::DispatchPipeline;
use crate::event::{EventLogLevel, EventRecord, EventRecordBuilder, EventStatus, EventType};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Write as _;
use tokio::task::JoinHandle;

/// Correlation key linking an error event to the event it describes.
pub const ORIGINAL_EVENT_ID_KEY: &str = "originalEventId";

/// Sends audit-log and business events through a [`DispatchPipeline`].
///
/// Every send is fire-and-forget; the returned handle is only useful for
/// waiting in tests.
#[derive(Debug, Clone)]
pub struct EventService {
    pipeline: DispatchPipeline,
}

impl EventService {
    /// Service sending through `pipeline`.
    #[must_use]
    pub const fn new(pipeline: DispatchPipeline) -> Self {
        Self { pipeline }
    }

    /// Send an `INFO` audit-log event.
    pub fn send_audit_log(
        &self,
        source_module: &str,
        event: &str,
        status: EventStatus,
        correlation_ids: BTreeMap<String, String>,
    ) -> Option<JoinHandle<()>> {
        let record = Self::base_builder()
            .event(event)
            .event_type(EventType::Audit)
            .event_log_level(EventLogLevel::Info)
            .event_status(status)
            .source_module(source_module)
            .correlation_ids(correlation_ids)
            .build();
        self.pipeline.submit(record)
    }

    /// Build an event with `build` and send it.
    pub fn send_event(
        &self,
        build: impl FnOnce(EventRecordBuilder) -> EventRecordBuilder,
    ) -> Option<JoinHandle<()>> {
        self.pipeline.submit(build(Self::base_builder()).build())
    }

    /// Run `f` and send an audit event describing its outcome.
    ///
    /// `configure` sets up the event; `f` may adjust it further, including
    /// its status. If `f` leaves the status unset it becomes `success`.
    /// On error the event is sent as `failure` together with a second,
    /// `ERROR`-level event whose payload is the error chain and whose
    /// `originalEventId` points at the first event.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, unchanged.
    pub fn audited_event<T, E>(
        &self,
        configure: impl FnOnce(EventRecordBuilder) -> EventRecordBuilder,
        f: impl FnOnce(&mut EventRecordBuilder) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: Error + 'static,
    {
        let mut builder = configure(Self::base_builder().event_type(EventType::Audit));
        let result = f(&mut builder);

        match &result {
            Ok(_) => {
                if builder.status().is_none() {
                    builder.set_event_status(EventStatus::Success);
                }
                self.pipeline.submit(builder.build());
            }
            Err(error) => {
                builder.set_event_status(EventStatus::Failure);
                let record = builder.build();
                let error_event = Self::error_event(&record, error);
                self.pipeline.submit(record);
                self.pipeline.submit(error_event);
            }
        }
        result
    }

    fn base_builder() -> EventRecordBuilder {
        let builder = EventRecord::builder();
        match DiagnosticContext::get(TENANT_ID_KEY) {
            Some(tenant) => builder.tenant_id(tenant),
            None => builder,
        }
    }

    fn error_event(original: &EventRecord, error: &(dyn Error + 'static)) -> EventRecord {
        let mut correlation_ids = original.correlation_ids.clone();
        correlation_ids.insert(ORIGINAL_EVENT_ID_KEY.to_string(), original.id.to_string());

        let mut builder = EventRecord::builder()
            .event_log_level(EventLogLevel::Error)
            .event_status(EventStatus::Failure)
            .event_type(original.event_type)
            .source_module(original.source_module.clone())
            .event(original.event.clone())
            .payload(error_chain(error))
            .payload_format("text/plain")
            .payload_type("string")
            .correlation_ids(correlation_ids);
        if let Some(tenant) = &original.tenant_id {
            builder = builder.tenant_id(tenant.clone());
        }
        builder.build()
    }
}

/// Error message followed by each `source`, one per line.
#[must_use]
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(text, "\nCaused by: {cause}");
        source = cause.source();
    }
    text
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, EventsConfig, SerializerKind};
    use crate::dispatch::{DispatchError, EventSink, decode};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use thiserror::Error;

    #[derive(Default)]
    struct Captured(Mutex<Vec<Vec<u8>>>);

    impl EventSink for Captured {
        fn publish<'a>(
            &'a self,
            _event_type: &'a str,
            payload: &'a [u8],
            _event_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
            Box::pin(async move {
                self.0.lock().unwrap().push(payload.to_vec());
                Ok(())
            })
        }
    }

    impl Captured {
        fn records(&self) -> Vec<EventRecord> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| decode(bytes, SerializerKind::Json).unwrap())
                .collect()
        }
    }

    async fn wait_for(sink: &Captured, count: usize) -> Vec<EventRecord> {
        for _ in 0..100 {
            let records = sink.records();
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        sink.records()
    }

    #[derive(Debug, Error)]
    #[error("transfer rejected")]
    struct Rejected(#[source] std::io::Error);

    fn service() -> (EventService, Arc<Captured>) {
        let sink = Arc::new(Captured::default());
        let config = EventsConfig::default()
            .with_channel("audit", ChannelConfig::new("audit-events"))
            .with_channel("business", ChannelConfig::new("business-events"));
        (
            EventService::new(DispatchPipeline::new(sink.clone(), config)),
            sink,
        )
    }

    #[tokio::test]
    async fn audit_log_is_info_level() {
        let (service, sink) = service();
        service
            .send_audit_log("payments", "login", EventStatus::Success, BTreeMap::new())
            .unwrap()
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_log_level, EventLogLevel::Info);
        assert_eq!(records[0].event_type, EventType::Audit);
        assert_eq!(records[0].event, "login");
    }

    #[tokio::test]
    async fn send_event_uses_builder() {
        let (service, sink) = service();
        service
            .send_event(|b| {
                b.event("orderPlaced")
                    .event_type(EventType::Business)
                    .payload("{}")
            })
            .unwrap()
            .await
            .unwrap();

        assert_eq!(sink.records()[0].event_type, EventType::Business);
    }

    #[tokio::test]
    async fn audited_success_defaults_status() {
        let (service, sink) = service();
        let value = service
            .audited_event(|b| b.event("transfer"), |_| Ok::<_, Rejected>(5))
            .unwrap();
        assert_eq!(value, 5);

        let records = wait_for(&sink, 1).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_status, EventStatus::Success);
    }

    #[tokio::test]
    async fn audited_failure_sends_error_event() {
        let (service, sink) = service();
        let err = service
            .audited_event(
                |b| b.event("transfer").correlation_id("account", "42"),
                |_| -> Result<(), Rejected> {
                    Err(Rejected(std::io::Error::other("insufficient funds")))
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "transfer rejected");

        let records = wait_for(&sink, 2).await;
        assert_eq!(records.len(), 2);

        let original = records
            .iter()
            .find(|r| r.event_log_level == EventLogLevel::Info)
            .unwrap();
        let error = records
            .iter()
            .find(|r| r.event_log_level == EventLogLevel::Error)
            .unwrap();
        assert_eq!(original.event_status, EventStatus::Failure);
        assert_eq!(error.correlation_ids[ORIGINAL_EVENT_ID_KEY], original.id.to_string());
        assert_eq!(error.correlation_ids["account"], "42");
        assert_eq!(error.payload_format.as_deref(), Some("text/plain"));
        assert!(error.payload.as_deref().unwrap().contains("Caused by: insufficient funds"));
    }

    #[tokio::test]
    async fn status_set_inside_closure_is_kept() {
        let (service, sink) = service();
        service
            .audited_event(
                |b| b.event("review"),
                |b| {
                    b.set_event_status(EventStatus::Unknown);
                    Ok::<_, Rejected>(())
                },
            )
            .unwrap();

        let records = wait_for(&sink, 1).await;
        assert_eq!(records[0].event_status, EventStatus::Unknown);
    }
}
