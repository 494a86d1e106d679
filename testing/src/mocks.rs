//! In-memory broker double.
//!
//! [`RecordingSink`] implements [`EventSink`] by storing every payload it
//! receives. It can be switched into a failing mode to simulate an
//! unavailable broker, and tests can wait for a number of events to arrive
//! since dispatch happens on background tasks.

#![allow(clippy::expect_used)] // Test infrastructure decodes with expect for simplicity
#![allow(clippy::missing_panics_doc)]

use audit_events_core::config::SerializerKind;
use audit_events_core::dispatch::{DispatchError, EventSink, decode};
use audit_events_core::event::EventRecord;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// One captured publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEvent {
    /// Event-type name the pipeline routed by.
    pub event_type: String,
    /// Serialized record.
    pub payload: Vec<u8>,
    /// Message key.
    pub event_id: String,
}

impl SentEvent {
    /// Decode the payload with `serializer`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Serialization`] when the payload does not decode.
    pub fn record(&self, serializer: SerializerKind) -> Result<EventRecord, DispatchError> {
        decode(&self.payload, serializer)
    }
}

#[derive(Debug)]
struct Inner {
    sent: RwLock<Vec<SentEvent>>,
    count: watch::Sender<usize>,
    failing: AtomicBool,
}

/// Broker double that records every published event.
///
/// Clones share the same recording.
///
/// # Example
///
/// ```
/// use audit_events_testing::RecordingSink;
///
/// let sink = RecordingSink::new();
/// assert!(sink.is_empty());
/// sink.set_failing(true);
/// ```
#[derive(Debug, Clone)]
pub struct RecordingSink {
    inner: Arc<Inner>,
}

impl RecordingSink {
    /// Create an empty sink that accepts every event.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sent: RwLock::new(Vec::new()),
                count,
                failing: AtomicBool::new(false),
            }),
        }
    }

    /// Create a sink that rejects every event.
    #[must_use]
    pub fn failing() -> Self {
        let sink = Self::new();
        sink.set_failing(true);
        sink
    }

    /// Switch broker failure simulation on or off.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// All captured publish calls, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<SentEvent> {
        self.inner
            .sent
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Captured records decoded as JSON.
    #[must_use]
    pub fn records(&self) -> Vec<EventRecord> {
        self.events()
            .iter()
            .map(|event| {
                event
                    .record(SerializerKind::Json)
                    .expect("captured payload should be a JSON event record")
            })
            .collect()
    }

    /// Number of captured events.
    #[must_use]
    pub fn len(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything captured so far.
    pub fn clear(&self) {
        self.inner
            .sent
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.inner.count.send_replace(0);
    }

    /// Wait until at least `count` events were captured.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut receiver = self.inner.count.subscribe();
        tokio::time::timeout(timeout, receiver.wait_for(|captured| *captured >= count))
            .await
            .is_ok_and(|changed| changed.is_ok())
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for RecordingSink {
    fn publish<'a>(
        &'a self,
        event_type: &'a str,
        payload: &'a [u8],
        event_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            if self.inner.failing.load(Ordering::SeqCst) {
                return Err(DispatchError::Publish {
                    topic: event_type.to_string(),
                    message: "simulated broker failure".to_string(),
                });
            }
            let len = {
                let mut sent = self
                    .inner
                    .sent
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                sent.push(SentEvent {
                    event_type: event_type.to_string(),
                    payload: payload.to_vec(),
                    event_id: event_id.to_string(),
                });
                sent.len()
            };
            self.inner.count.send_replace(len);
            Ok(())
        })
    }
}
