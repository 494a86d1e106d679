//! Per-request audit state.
//!
//! An [`AuditContext`] is created when a request arrives and collects facts
//! from each lifecycle hook until the request completes. It is then turned
//! into exactly one [`TransportEvent`](crate::event::TransportEvent) and
//! handed to the [`DispatchPipeline`].
//!
//! # Lifecycle
//!
//! ```text
//! begin_if_not_started ──► populate_from_declared_metadata
//!          │                         │
//!          │               populate_from_method_arguments
//!          │                         │
//!          │               finalize_from_result / set_from_problem_detail
//!          │                         │
//!          └────────────► after_completion ──► publish
//! ```
//!
//! Every transition is guarded: repeating a phase is a no-op, and scalar
//! overwrites are applied but logged.

use crate::config::HeaderSettings;
use crate::diagnostic::{DiagnosticContext, SESSION_ID_KEY, TENANT_ID_KEY, TRACKING_ID_KEY};
use crate::dispatch::DispatchPipeline;
use crate::event::{EventLogLevel, EventType};
use crate::mapper;
use crate::metadata::{AuditMetadata, AuditParam};
use crate::problem::ProblemDetail;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Display;
use std::hash::BuildHasher;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Tenant recorded when the request carries no tenant header.
pub const DEFAULT_TENANT: &str = "default";

/// Read access to request headers.
pub trait HeaderSource {
    /// First value of the named header, if it is valid UTF-8.
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderSource for http::HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| value.to_str().ok())
    }
}

impl<S: BuildHasher> HeaderSource for HashMap<String, String, S> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Mutable audit state of one in-flight request.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pre_handled: bool,
    post_handled: bool,
    completed: bool,
    published: bool,
    tenant: Option<String>,
    operation_id: Option<String>,
    domains: Option<String>,
    source_module: Option<String>,
    event_type: Option<EventType>,
    event_log_level: Option<EventLogLevel>,
    status_code: u16,
    is_success: bool,
    params: BTreeMap<String, BTreeSet<String>>,
    problem_detail: Option<ProblemDetail>,
    payload: Option<String>,
    payload_type: Option<String>,
    request_method: Option<String>,
    request_uri: Option<String>,
    produces: Option<String>,
    started_at: Instant,
    elapsed: Option<Duration>,
}

impl Default for AuditContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditContext {
    /// Fresh context; the clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pre_handled: false,
            post_handled: false,
            completed: false,
            published: false,
            tenant: None,
            operation_id: None,
            domains: None,
            source_module: None,
            event_type: None,
            event_log_level: None,
            status_code: 0,
            is_success: false,
            params: BTreeMap::new(),
            problem_detail: None,
            payload: None,
            payload_type: None,
            request_method: None,
            request_uri: None,
            produces: None,
            started_at: Instant::now(),
            elapsed: None,
        }
    }

    /// Fresh context reporting `source_module` unless metadata overrides it.
    #[must_use]
    pub fn for_module(source_module: impl Into<String>) -> Self {
        let source_module = source_module.into();
        Self {
            source_module: (!source_module.trim().is_empty()).then_some(source_module),
            ..Self::new()
        }
    }

    /// Pre-dispatch hook: record tracking, session and tenant ids.
    ///
    /// The tracking id is the first non-blank header in
    /// `settings.tracking_id_headers`, or a random UUID. The tenant defaults
    /// to `"default"`. All three go into the diagnostic context and the
    /// correlation params.
    ///
    /// Returns `false` without doing anything if already called.
    pub fn begin_if_not_started(
        &mut self,
        headers: &impl HeaderSource,
        settings: &HeaderSettings,
    ) -> bool {
        if self.pre_handled {
            tracing::trace!("Audit context already pre-handled");
            return false;
        }

        let tracking_id = settings
            .tracking_id_headers
            .iter()
            .find_map(|name| non_blank(headers.header(name)))
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        DiagnosticContext::put(TRACKING_ID_KEY, tracking_id.clone());
        self.append_param(TRACKING_ID_KEY, Some(tracking_id));

        if let Some(session_id) = settings
            .session_header
            .as_deref()
            .and_then(|name| non_blank(headers.header(name)))
        {
            DiagnosticContext::put(SESSION_ID_KEY, session_id);
            self.append_param(SESSION_ID_KEY, Some(session_id));
        }

        let tenant = non_blank(headers.header(&settings.tenant_header))
            .unwrap_or(DEFAULT_TENANT)
            .to_string();
        DiagnosticContext::put(TENANT_ID_KEY, tenant.clone());
        self.append_param(TENANT_ID_KEY, Some(tenant.clone()));
        self.tenant = Some(tenant);

        self.pre_handled = true;
        true
    }

    /// Record the HTTP method and path of the request.
    pub fn record_request(&mut self, method: impl Into<String>, uri: impl Into<String>) {
        self.request_method = Some(method.into());
        self.request_uri = Some(uri.into());
    }

    /// Apply the endpoint's declared metadata.
    ///
    /// Applied once; later calls are ignored.
    pub fn populate_from_declared_metadata(&mut self, metadata: &AuditMetadata) {
        if self.domains.is_some() {
            tracing::trace!("Audit metadata already applied");
            return;
        }
        self.operation_id = Some(mapper::resolve_operation_id(
            metadata.operation_id(),
            metadata.doc_operation_id(),
        ));
        self.domains = Some(metadata.domains().to_string());
        if let Some(module) = non_blank(metadata.source_module()) {
            self.source_module = Some(module.to_string());
        }
        self.event_type = Some(metadata.event_type());
        self.event_log_level = Some(metadata.event_log_level());
        if let Some(payload_type) = non_blank(metadata.payload_type()) {
            self.payload_type = Some(payload_type.to_string());
        }
    }

    /// Record auditable handler arguments.
    ///
    /// `params[i]` describes `args[i]`. Values of parameters flagged with
    /// `add_to_diagnostic` are also written to the diagnostic context.
    pub fn populate_from_method_arguments(
        &mut self,
        params: &[AuditParam],
        args: &[&(dyn Display + Sync)],
    ) {
        if params.len() != args.len() {
            tracing::warn!(
                declared = params.len(),
                received = args.len(),
                "Audit parameter count does not match handler arguments"
            );
        }
        for (param, arg) in params.iter().zip(args) {
            let key = param.audit_key();
            let value = arg.to_string();
            if param.add_to_diagnostic {
                DiagnosticContext::put(key, value.clone());
            }
            self.append_param(key, Some(value));
        }
    }

    /// Add `value` to the set under `key`. Absent values are ignored.
    pub fn append_param<V: Into<String>>(&mut self, key: &str, value: Option<V>) {
        let Some(value) = value else {
            return;
        };
        self.params
            .entry(key.to_string())
            .or_default()
            .insert(value.into());
    }

    /// Record a header value under its own name, if present.
    pub fn record_header_if_present(&mut self, name: &str, value: Option<&str>) {
        self.append_param(name, value);
    }

    /// Set the status code. Replacing a different non-zero code is logged.
    pub fn set_status_code(&mut self, code: u16) {
        if self.status_code != 0 && self.status_code != code {
            tracing::warn!(
                previous = self.status_code,
                current = code,
                operation_id = self.operation_id.as_deref().unwrap_or_default(),
                "Overwriting audit status code"
            );
        }
        self.status_code = code;
    }

    /// Finalize from a structured problem: failure with the problem's status.
    pub fn set_from_problem_detail(&mut self, problem: &ProblemDetail) {
        self.set_status_code(problem.status);
        self.is_success = false;
        self.post_handled = true;
        self.problem_detail = Some(problem.clone());
    }

    /// Response-body hook: remember a problem body without finalizing.
    pub fn record_problem_body(&mut self, problem: ProblemDetail) {
        self.problem_detail = Some(problem);
    }

    /// Record the response content type.
    pub fn record_produces(&mut self, content_type: impl Into<String>) {
        self.produces = Some(content_type.into());
    }

    pub(crate) fn record_payload(&mut self, payload: Option<String>, payload_type: Option<String>) {
        if payload.is_none() {
            return;
        }
        self.payload = payload;
        if self.payload_type.is_none() {
            self.payload_type = payload_type;
        }
    }

    pub(crate) const fn mark_post_handled(&mut self) {
        self.post_handled = true;
    }

    /// Completion hook. Runs once; later calls are logged and ignored.
    ///
    /// On the normal path (`post_handled`) the request succeeded unless a
    /// problem was recorded. Otherwise a `terminal` problem (or one captured
    /// from the response body) finalizes as failure, and with no problem at
    /// all the operation id falls back to the request URI and the request is
    /// a failure.
    pub fn after_completion(
        &mut self,
        observed_status: u16,
        terminal: Option<&ProblemDetail>,
        error: Option<&dyn Display>,
    ) {
        if self.completed {
            tracing::warn!("Audit context already completed");
            return;
        }
        self.completed = true;
        self.elapsed = Some(self.started_at.elapsed());

        if observed_status != 0 {
            self.set_status_code(observed_status);
        }

        if self.post_handled {
            self.is_success = self.problem_detail.is_none();
            return;
        }

        tracing::warn!(
            uri = self.request_uri.as_deref().unwrap_or_default(),
            "Completing audit event outside the normal path, not post-handled yet"
        );

        let problem = terminal.cloned().or_else(|| self.problem_detail.take());
        if let Some(problem) = problem {
            self.set_from_problem_detail(&problem);
            return;
        }

        if self.operation_id.is_none() {
            self.operation_id.clone_from(&self.request_uri);
        }
        self.is_success = false;
        if let Some(error) = error {
            tracing::warn!(error = %error, "Request failed before the handler returned");
        }
    }

    /// Map the finished context and hand it to the pipeline.
    ///
    /// Refuses (with an error log) before [`after_completion`](Self::after_completion)
    /// and does nothing on a second call.
    pub fn publish(&mut self, pipeline: &DispatchPipeline) -> Option<JoinHandle<()>> {
        if !self.completed {
            tracing::error!("Refusing to publish an audit event before completion");
            return None;
        }
        if self.published {
            tracing::warn!("Audit event already published");
            return None;
        }
        self.published = true;
        pipeline.dispatch(mapper::to_transport_event(self))
    }

    /// [`after_completion`](Self::after_completion) followed by [`publish`](Self::publish).
    pub fn complete(
        &mut self,
        observed_status: u16,
        terminal: Option<&ProblemDetail>,
        error: Option<&dyn Display>,
        pipeline: &DispatchPipeline,
    ) -> Option<JoinHandle<()>> {
        self.after_completion(observed_status, terminal, error);
        self.publish(pipeline)
    }

    /// Whether the pre-dispatch hook ran.
    #[must_use]
    pub const fn is_pre_handled(&self) -> bool {
        self.pre_handled
    }

    /// Whether the normal finalization path ran.
    #[must_use]
    pub const fn is_post_handled(&self) -> bool {
        self.post_handled
    }

    /// Whether the completion hook ran.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether the event was handed to the pipeline.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        self.published
    }

    /// Outcome.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.is_success
    }

    /// Status code; `0` when unset.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Tenant id.
    #[must_use]
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Resolved operation id.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    /// Domain tag(s).
    #[must_use]
    pub fn domains(&self) -> Option<&str> {
        self.domains.as_deref()
    }

    /// Source module.
    #[must_use]
    pub fn source_module(&self) -> Option<&str> {
        self.source_module.as_deref()
    }

    /// Declared event type.
    #[must_use]
    pub const fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    /// Declared log level.
    #[must_use]
    pub const fn event_log_level(&self) -> Option<EventLogLevel> {
        self.event_log_level
    }

    /// Correlation params collected so far.
    #[must_use]
    pub const fn params(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.params
    }

    /// Recorded problem detail.
    #[must_use]
    pub const fn problem_detail(&self) -> Option<&ProblemDetail> {
        self.problem_detail.as_ref()
    }

    /// Response payload.
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Payload type.
    #[must_use]
    pub fn payload_type(&self) -> Option<&str> {
        self.payload_type.as_deref()
    }

    /// HTTP method.
    #[must_use]
    pub fn request_method(&self) -> Option<&str> {
        self.request_method.as_deref()
    }

    /// Request path.
    #[must_use]
    pub fn request_uri(&self) -> Option<&str> {
        self.request_uri.as_deref()
    }

    /// Response content type.
    #[must_use]
    pub fn produces(&self) -> Option<&str> {
        self.produces.as_deref()
    }

    /// Time from creation to completion, or to now while in flight.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.started_at.elapsed())
    }
}
