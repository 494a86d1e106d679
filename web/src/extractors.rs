//! Custom Axum extractors for audited handlers.
//!
//! - `AuditHandle`: the request's audit context, used to intercept the
//!   handler call (argument capture and result extraction)
//! - `TrackingId`: the tracking id resolved by the audit layer
//!
//! # Examples
//!
//! ```ignore
//! use audit_events_web::{ApiError, AuditHandle, Envelope};
//!
//! async fn create_user(
//!     audit: AuditHandle,
//!     Json(request): Json<CreateUser>,
//! ) -> Result<Envelope<User>, ApiError> {
//!     let email = request.email.clone();
//!     audit
//!         .run(&[&email], async move { users.create(request).await })
//!         .await
//! }
//! ```

use crate::error::ApiError;
use audit_events_core::context::AuditContext;
use audit_events_core::diagnostic::TRACKING_ID_KEY;
use audit_events_core::metadata::AuditMetadata;
use audit_events_core::outcome::{AuditedResult, HandlerReturn, ProblemSource, TaskFailure};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Shared handle on the audit context of the current request.
///
/// Inserted into the request extensions by the audit layer; the route
/// layer attaches the endpoint's declared metadata.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    context: Arc<Mutex<AuditContext>>,
    metadata: Option<Arc<AuditMetadata>>,
}

impl AuditHandle {
    /// Handle over a fresh context.
    #[must_use]
    pub fn new(context: AuditContext) -> Self {
        Self {
            context: Arc::new(Mutex::new(context)),
            metadata: None,
        }
    }

    /// Metadata declared for the matched route, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&AuditMetadata> {
        self.metadata.as_deref()
    }

    pub(crate) fn attach_metadata(&mut self, metadata: Arc<AuditMetadata>) {
        self.metadata = Some(metadata);
    }

    /// Run `f` with the context locked.
    ///
    /// A poisoned lock is recovered; the context only holds plain data.
    pub fn with<R>(&self, f: impl FnOnce(&mut AuditContext) -> R) -> R {
        let mut guard = self.context.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Intercept a handler call.
    ///
    /// Applies the declared metadata, records `args` against the declared
    /// parameters (in order), waits for the handler's return value and
    /// records its outcome.
    ///
    /// # Errors
    ///
    /// Returns exactly the error the handler produced. A spawned handler
    /// that panicked or was cancelled yields `E::from(TaskFailure)`.
    pub async fn invoke<'a, T, E>(
        &self,
        args: &[&(dyn Display + Sync)],
        ret: impl Into<HandlerReturn<'a, T, E>>,
    ) -> Result<T, E>
    where
        T: AuditedResult,
        E: ProblemSource + Display + From<TaskFailure>,
    {
        self.with(|ctx| match &self.metadata {
            Some(metadata) => {
                ctx.populate_from_declared_metadata(metadata);
                ctx.populate_from_method_arguments(metadata.params(), args);
            }
            None => tracing::debug!("No audit metadata declared for this route"),
        });

        let result = ret.into().resolve().await;
        self.with(|ctx| ctx.finalize_from_result(&result));
        result
    }

    /// [`invoke`](Self::invoke) for a handler body given as a future.
    ///
    /// # Errors
    ///
    /// Returns exactly the error `future` resolves to.
    pub async fn run<'a, T, E, F>(&self, args: &[&(dyn Display + Sync)], future: F) -> Result<T, E>
    where
        T: AuditedResult,
        E: ProblemSource + Display + From<TaskFailure>,
        F: Future<Output = Result<T, E>> + Send + 'a,
    {
        self.invoke(args, HandlerReturn::deferred(future)).await
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuditHandle
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(|| ApiError::internal("Audit layer not installed"))
    }
}

/// Tracking id of the current request.
///
/// # Example
///
/// ```ignore
/// async fn handler(tracking_id: TrackingId) -> String {
///     format!("Request: {}", tracking_id.0)
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for TrackingId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let handle = AuditHandle::from_request_parts(parts, state).await?;
        handle
            .with(|ctx| {
                ctx.params()
                    .get(TRACKING_ID_KEY)
                    .and_then(|ids| ids.first().cloned())
            })
            .map(Self)
            .ok_or_else(|| ApiError::internal("Tracking id not resolved"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use audit_events_core::problem::ProblemDetail;
    use axum::http::Request;

    fn handle_with(metadata: AuditMetadata) -> AuditHandle {
        let mut handle = AuditHandle::new(AuditContext::for_module("users"));
        handle.attach_metadata(Arc::new(metadata));
        handle
    }

    #[tokio::test]
    async fn invoke_records_arguments_and_result() {
        let metadata = AuditMetadata::builder("users")
            .operation_id("getUser")
            .param(audit_events_core::AuditParam::named("id").path_variable("userId"))
            .build()
            .unwrap();
        let handle = handle_with(metadata);

        let id = 42_u64;
        let result = handle
            .invoke(&[&id], Ok::<_, ApiError>("found".to_string()))
            .await;

        assert_eq!(result.unwrap(), "found");
        handle.with(|ctx| {
            assert_eq!(ctx.operation_id(), Some("getUser"));
            assert!(ctx.params()["userId"].contains("42"));
            assert!(ctx.is_post_handled());
            assert_eq!(ctx.payload(), Some("found"));
        });
    }

    #[tokio::test]
    async fn invoke_returns_problem_error_unchanged() {
        let handle = handle_with(AuditMetadata::builder("users").build().unwrap());

        let err = handle
            .run(&[], async { Err::<(), _>(ApiError::not_found("User", 7)) })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "[NOT_FOUND] User with id 7 not found");
        handle.with(|ctx| {
            assert_eq!(ctx.status_code(), 404);
            assert_eq!(ctx.problem_detail().map(|p: &ProblemDetail| p.status), Some(404));
        });
    }

    #[tokio::test]
    async fn missing_layer_is_rejected() {
        let (mut parts, ()) = Request::new(()).into_parts();
        let rejection = AuditHandle::from_request_parts(&mut parts, &())
            .await
            .unwrap_err();
        assert_eq!(rejection.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
