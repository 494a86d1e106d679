//! Conversion of a finished [`AuditContext`] into wire shapes.

use crate::context::AuditContext;
use crate::event::{EventLogLevel, EventRecord, EventStatus, EventType, TransportEvent};
use std::collections::{BTreeMap, BTreeSet};

/// Placeholder for blank string fields.
pub const UNKNOWN: &str = "unknown";

/// Separator used when flattening a param value set.
pub const PARAM_DELIMITER: &str = ",";

/// `value` trimmed, or `"unknown"` when absent or blank.
#[must_use]
pub fn or_unknown(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

/// Pick the operation id: declared, then documentation, then `"unknown"`.
#[must_use]
pub fn resolve_operation_id(declared: Option<&str>, doc: Option<&str>) -> String {
    let resolved = [declared, doc]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|id| !id.is_empty());
    if let Some(id) = resolved {
        return id.to_string();
    }
    tracing::warn!("No operation id declared, using 'unknown'");
    UNKNOWN.to_string()
}

/// Join every value set with `,`.
#[must_use]
pub fn flatten_params(params: &BTreeMap<String, BTreeSet<String>>) -> BTreeMap<String, String> {
    params
        .iter()
        .map(|(key, values)| {
            let joined = values
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(PARAM_DELIMITER);
            (key.clone(), joined)
        })
        .collect()
}

/// Build the transport event for a finished request.
///
/// An unset status code becomes `200` for successful requests and `500`
/// otherwise.
#[must_use]
pub fn to_transport_event(ctx: &AuditContext) -> TransportEvent {
    let status_code = match ctx.status_code() {
        0 if ctx.is_success() => 200,
        0 => 500,
        code => code,
    };
    let operation_id = match ctx.operation_id() {
        Some(id) => or_unknown(Some(id)),
        None => resolve_operation_id(None, None),
    };

    TransportEvent {
        tenant_id: or_unknown(ctx.tenant()),
        operation_id,
        domains: or_unknown(ctx.domains()),
        event_type: ctx.event_type().unwrap_or(EventType::Audit),
        source_module: or_unknown(ctx.source_module()),
        event_log_level: ctx.event_log_level().unwrap_or(EventLogLevel::Warn),
        status_code,
        event_status: if ctx.is_success() {
            EventStatus::Success
        } else {
            EventStatus::Failure
        },
        correlation_ids: flatten_params(ctx.params()),
        payload: ctx.payload().map(str::to_string),
        payload_type: ctx.payload_type().map(str::to_string),
        request_method: ctx.request_method().map(str::to_string),
        request_uri: ctx.request_uri().map(str::to_string),
        produces: ctx.produces().map(str::to_string),
        elapsed_nanos: u64::try_from(ctx.elapsed().as_nanos()).unwrap_or(u64::MAX),
    }
}

/// Audit-log projection of a transport event, as published to the broker.
#[must_use]
pub fn to_event_record(event: &TransportEvent) -> EventRecord {
    let mut builder = EventRecord::builder()
        .tenant_id(event.tenant_id.clone())
        .event(event.operation_id.clone())
        .event_type(event.event_type)
        .event_log_level(event.event_log_level)
        .event_status(event.event_status)
        .source_module(event.source_module.clone())
        .correlation_ids(event.correlation_ids.clone());
    if let Some(payload) = &event.payload {
        builder = builder
            .payload(payload.clone())
            .payload_format(event.produces.as_deref().unwrap_or("application/json"));
    }
    if let Some(payload_type) = &event.payload_type {
        builder = builder.payload_type(payload_type.clone());
    }
    builder.build()
}
