//! Response envelope carrying an explicit status.

use audit_events_core::outcome::{AuditedResult, CorrelationDataProvider};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// JSON body paired with the status it should be sent with.
///
/// The status is what the audit event records as the handler's result;
/// correlation data and the payload come from the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    status: StatusCode,
    body: T,
}

impl<T> Envelope<T> {
    /// Envelope with an explicit status.
    #[must_use]
    pub const fn new(status: StatusCode, body: T) -> Self {
        Self { status, body }
    }

    /// `200 OK`.
    #[must_use]
    pub const fn ok(body: T) -> Self {
        Self::new(StatusCode::OK, body)
    }

    /// `201 Created`.
    #[must_use]
    pub const fn created(body: T) -> Self {
        Self::new(StatusCode::CREATED, body)
    }

    /// Status to respond with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The wrapped body.
    #[must_use]
    pub const fn body(&self) -> &T {
        &self.body
    }

    /// Unwrap the body.
    #[must_use]
    pub fn into_body(self) -> T {
        self.body
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl<T: AuditedResult + Serialize> AuditedResult for Envelope<T> {
    fn envelope_status(&self) -> Option<u16> {
        Some(self.status.as_u16())
    }

    fn correlation_data(&self) -> Option<&dyn CorrelationDataProvider> {
        self.body.correlation_data()
    }

    fn payload(&self) -> Option<String> {
        match serde_json::to_string(&self.body) {
            Ok(json) => Some(json),
            Err(error) => {
                tracing::warn!(error = %error, "Could not serialize audit payload");
                self.body.payload()
            }
        }
    }

    fn payload_type(&self) -> Option<String> {
        self.body.payload_type()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct User {
        id: u64,
    }

    impl CorrelationDataProvider for User {
        fn correlation_params(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("userId".to_string(), self.id.to_string())])
        }
    }

    impl AuditedResult for User {
        fn correlation_data(&self) -> Option<&dyn CorrelationDataProvider> {
            Some(self)
        }
    }

    #[test]
    fn envelope_delegates_to_body() {
        let envelope = Envelope::created(User { id: 5 });

        assert_eq!(envelope.envelope_status(), Some(201));
        assert_eq!(envelope.payload().as_deref(), Some(r#"{"id":5}"#));
        assert_eq!(envelope.payload_type().as_deref(), Some("User"));
        let params = envelope.correlation_data().unwrap().correlation_params();
        assert_eq!(params["userId"], "5");
    }

    #[test]
    fn envelope_response_uses_status() {
        let response = Envelope::new(StatusCode::ACCEPTED, User { id: 1 }).into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
