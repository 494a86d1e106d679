//! Event types shipped to the broker.
//!
//! Two shapes exist for every audited request:
//!
//! - [`TransportEvent`]: the in-process view of the finished request, including
//!   HTTP details (method, URI, content type, elapsed time).
//! - [`EventRecord`]: the audit-log projection that is serialized and published.
//!   Records can also be built directly through [`EventRecord::builder`] for
//!   events that do not originate from an HTTP request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing one of the categorical event tags fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown {kind}: {value}")]
pub struct ParseTagError {
    kind: &'static str,
    value: String,
}

/// Categorical event type. Selects the channel an event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Security and compliance audit trail.
    Audit,
    /// Business-level domain events.
    Business,
}

impl EventType {
    /// Channel name used for routing.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Audit => "audit",
            Self::Business => "business",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventType {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audit" => Ok(Self::Audit),
            "business" => Ok(Self::Business),
            _ => Err(ParseTagError {
                kind: "event type",
                value: s.to_string(),
            }),
        }
    }
}

/// Log level attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLogLevel {
    /// Finest-grained diagnostics.
    Trace,
    /// Debugging detail.
    Debug,
    /// Normal operation.
    Info,
    /// Unexpected but recoverable.
    Warn,
    /// Operation failed.
    Error,
}

impl fmt::Display for EventLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

impl FromStr for EventLogLevel {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            _ => Err(ParseTagError {
                kind: "event log level",
                value: s.to_string(),
            }),
        }
    }
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Operation completed normally.
    Success,
    /// Operation failed or returned a problem.
    Failure,
    /// Not yet determined.
    Unknown,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        })
    }
}

impl FromStr for EventStatus {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseTagError {
                kind: "event status",
                value: s.to_string(),
            }),
        }
    }
}

/// Finished audit event for one inbound call.
///
/// Produced by [`mapper::to_transport_event`](crate::mapper::to_transport_event)
/// once the request has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEvent {
    /// Tenant the request belongs to.
    pub tenant_id: String,
    /// Operation that was invoked.
    pub operation_id: String,
    /// Domain tag(s) of the operation.
    pub domains: String,
    /// Routing category.
    pub event_type: EventType,
    /// Module that emitted the event.
    pub source_module: String,
    /// Severity.
    pub event_log_level: EventLogLevel,
    /// Final HTTP status.
    pub status_code: u16,
    /// Success or failure.
    pub event_status: EventStatus,
    /// Flattened correlation identifiers (`,`-joined value sets).
    pub correlation_ids: BTreeMap<String, String>,
    /// Serialized response body, when the handler exposes one.
    pub payload: Option<String>,
    /// Type of `payload`.
    pub payload_type: Option<String>,
    /// HTTP method.
    pub request_method: Option<String>,
    /// Request path.
    #[serde(rename = "requestURI")]
    pub request_uri: Option<String>,
    /// Response content type.
    pub produces: Option<String>,
    /// Time from pre-dispatch to completion.
    pub elapsed_nanos: u64,
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransportEvent[requestMethod='{}', requestURI='{}', tenantId='{}', operationId='{}', \
             domains='{}', eventType={}, sourceModule='{}', eventLogLevel={}, statusCode={}, \
             eventStatus={}, correlationIds={:?}, produces='{}', payloadType='{}', took={}ms]",
            self.request_method.as_deref().unwrap_or_default(),
            self.request_uri.as_deref().unwrap_or_default(),
            self.tenant_id,
            self.operation_id,
            self.domains,
            self.event_type,
            self.source_module,
            self.event_log_level,
            self.status_code,
            self.event_status,
            self.correlation_ids,
            self.produces.as_deref().unwrap_or_default(),
            self.payload_type.as_deref().unwrap_or_default(),
            self.elapsed_nanos / 1_000_000,
        )
    }
}

/// Wire record published to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Unique event id, also used as the broker message key.
    pub id: Uuid,
    /// Creation time.
    pub event_timestamp: DateTime<Utc>,
    /// Tenant the event belongs to.
    pub tenant_id: Option<String>,
    /// Event name (the operation id for request events).
    pub event: String,
    /// Routing category.
    pub event_type: EventType,
    /// Severity.
    pub event_log_level: EventLogLevel,
    /// Outcome.
    pub event_status: EventStatus,
    /// Emitting module.
    pub source_module: String,
    /// Correlation identifiers.
    pub correlation_ids: BTreeMap<String, String>,
    /// Free-form payload.
    pub payload: Option<String>,
    /// Format of `payload` (e.g. `application/json`).
    pub payload_format: Option<String>,
    /// Type of `payload`.
    pub payload_type: Option<String>,
}

impl EventRecord {
    /// Start building a record with a fresh id and the current timestamp.
    #[must_use]
    pub fn builder() -> EventRecordBuilder {
        EventRecordBuilder::new()
    }
}

/// Builder for [`EventRecord`].
#[derive(Debug, Clone)]
pub struct EventRecordBuilder {
    id: Uuid,
    event_timestamp: DateTime<Utc>,
    tenant_id: Option<String>,
    event: String,
    event_type: EventType,
    event_log_level: EventLogLevel,
    event_status: Option<EventStatus>,
    source_module: String,
    correlation_ids: BTreeMap<String, String>,
    payload: Option<String>,
    payload_format: Option<String>,
    payload_type: Option<String>,
}

impl Default for EventRecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRecordBuilder {
    /// Builder with id, timestamp, `audit` type and `INFO` level preset.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            event_timestamp: Utc::now(),
            tenant_id: None,
            event: String::new(),
            event_type: EventType::Audit,
            event_log_level: EventLogLevel::Info,
            event_status: None,
            source_module: String::new(),
            correlation_ids: BTreeMap::new(),
            payload: None,
            payload_format: None,
            payload_type: None,
        }
    }

    /// Id the record will carry.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Status set so far, if any.
    #[must_use]
    pub const fn status(&self) -> Option<EventStatus> {
        self.event_status
    }

    /// Event type set so far.
    #[must_use]
    pub const fn kind(&self) -> EventType {
        self.event_type
    }

    /// Correlation ids set so far.
    #[must_use]
    pub const fn correlation(&self) -> &BTreeMap<String, String> {
        &self.correlation_ids
    }

    /// Set `event`.
    #[must_use]
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    /// Set `tenant_id`.
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set `event_type`.
    #[must_use]
    pub const fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }

    /// Set `event_log_level`.
    #[must_use]
    pub const fn event_log_level(mut self, level: EventLogLevel) -> Self {
        self.event_log_level = level;
        self
    }

    /// Set `event_status`.
    #[must_use]
    pub const fn event_status(mut self, status: EventStatus) -> Self {
        self.event_status = Some(status);
        self
    }

    /// Set the status in place (used while an audited closure runs).
    pub const fn set_event_status(&mut self, status: EventStatus) {
        self.event_status = Some(status);
    }

    /// Set `source_module`.
    #[must_use]
    pub fn source_module(mut self, source_module: impl Into<String>) -> Self {
        self.source_module = source_module.into();
        self
    }

    /// Replace all correlation ids.
    #[must_use]
    pub fn correlation_ids(mut self, ids: BTreeMap<String, String>) -> Self {
        self.correlation_ids = ids;
        self
    }

    /// Add a single correlation id.
    #[must_use]
    pub fn correlation_id(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlation_ids.insert(key.into(), value.into());
        self
    }

    /// Set `payload`.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Set `payload_format`.
    #[must_use]
    pub fn payload_format(mut self, format: impl Into<String>) -> Self {
        self.payload_format = Some(format.into());
        self
    }

    /// Set `payload_type`.
    #[must_use]
    pub fn payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    /// Finish the record. A missing status becomes [`EventStatus::Unknown`].
    #[must_use]
    pub fn build(self) -> EventRecord {
        EventRecord {
            id: self.id,
            event_timestamp: self.event_timestamp,
            tenant_id: self.tenant_id,
            event: self.event,
            event_type: self.event_type,
            event_log_level: self.event_log_level,
            event_status: self.event_status.unwrap_or(EventStatus::Unknown),
            source_module: self.source_module,
            correlation_ids: self.correlation_ids,
            payload: self.payload,
            payload_format: self.payload_format,
            payload_type: self.payload_type,
        }
    }
}
