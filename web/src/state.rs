//! Shared state for audited services.

use audit_events_core::dispatch::DispatchPipeline;
use audit_events_core::health::BrokerHealth;
use audit_events_core::service::EventService;
use axum::extract::FromRef;
use std::sync::Arc;

/// State shared across audited handlers.
///
/// Applications with their own state can embed this and forward
/// [`FromRef`] to it.
///
/// # Examples
///
/// ```ignore
/// use audit_events_web::{AuditState, handlers::health::broker_health};
///
/// let state = AuditState::new(pipeline);
/// let app = Router::new()
///     .route("/health/broker", get(broker_health))
///     .with_state(state);
/// ```
#[derive(Clone, Debug)]
pub struct AuditState {
    /// Pipeline the audit layer publishes through.
    pub pipeline: DispatchPipeline,
    /// Service for events sent from handler code.
    pub events: EventService,
}

impl AuditState {
    /// State over `pipeline`.
    #[must_use]
    pub fn new(pipeline: DispatchPipeline) -> Self {
        Self {
            events: EventService::new(pipeline.clone()),
            pipeline,
        }
    }
}

impl FromRef<AuditState> for Arc<BrokerHealth> {
    fn from_ref(state: &AuditState) -> Self {
        state.pipeline.health()
    }
}

impl FromRef<AuditState> for EventService {
    fn from_ref(state: &AuditState) -> Self {
        state.events.clone()
    }
}
