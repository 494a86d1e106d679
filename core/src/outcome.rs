//! Handler result extraction.
//!
//! After the handler returns, its result decides the audited outcome:
//!
//! - `Ok(value)`: an envelope status (if any) becomes the status code, the
//!   value's correlation data is merged into the params, and the request is
//!   marked post-handled.
//! - `Err(error)`: a problem detail exposed by the error finalizes the
//!   context as a failure. The error itself is always returned unchanged.
//!
//! Handlers that hand back a spawned task are awaited here; a failed join
//! is converted into the handler's own error type through [`TaskFailure`],
//! so callers see the handler's error rather than tokio's `JoinError`.

use crate::context::AuditContext;
use crate::problem::ProblemDetail;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};

/// Extra correlation pairs a response type can contribute.
pub trait CorrelationDataProvider {
    /// Key/value pairs to merge into the audit params.
    fn correlation_params(&self) -> BTreeMap<String, String>;
}

/// What the extractor can learn from a successful handler result.
///
/// Every method has a default, so plain types only need an empty impl.
pub trait AuditedResult {
    /// Status code carried by an envelope type.
    fn envelope_status(&self) -> Option<u16> {
        None
    }

    /// Correlation data of the effective result.
    fn correlation_data(&self) -> Option<&dyn CorrelationDataProvider> {
        None
    }

    /// Serialized payload of the effective result.
    fn payload(&self) -> Option<String> {
        None
    }

    /// Type name of the payload.
    fn payload_type(&self) -> Option<String> {
        Some(short_type_name(std::any::type_name::<Self>()))
    }
}

/// Errors that can describe themselves as a problem detail.
pub trait ProblemSource {
    /// Problem detail for this error, if it has one.
    fn problem_detail(&self) -> Option<ProblemDetail>;
}

/// Last path segment of a type name, generics stripped.
#[must_use]
pub fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

impl AuditedResult for () {
    fn payload_type(&self) -> Option<String> {
        None
    }
}

impl AuditedResult for String {
    fn payload(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl AuditedResult for &'static str {
    fn payload(&self) -> Option<String> {
        Some((*self).to_string())
    }

    fn payload_type(&self) -> Option<String> {
        Some("String".to_string())
    }
}

impl AuditedResult for serde_json::Value {
    fn payload(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl ProblemSource for ProblemDetail {
    fn problem_detail(&self) -> Option<ProblemDetail> {
        Some(self.clone())
    }
}

impl ProblemSource for Infallible {
    fn problem_detail(&self) -> Option<ProblemDetail> {
        match *self {}
    }
}

/// Failure of the task wrapping a handler, as opposed to the handler itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The handler task panicked.
    #[error("Handler task panicked: {0}")]
    Panicked(String),

    /// The handler task was cancelled before finishing.
    #[error("Handler task was cancelled")]
    Cancelled,
}

impl From<JoinError> for TaskFailure {
    fn from(error: JoinError) -> Self {
        if !error.is_panic() {
            return Self::Cancelled;
        }
        let panic = error.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panicked(message)
    }
}

impl ProblemSource for TaskFailure {
    fn problem_detail(&self) -> Option<ProblemDetail> {
        Some(ProblemDetail::for_status_and_detail(500, self.to_string()))
    }
}

/// A handler's return value, possibly still in flight.
pub enum HandlerReturn<'a, T, E> {
    /// Already computed.
    Ready(Result<T, E>),
    /// Future that has not been awaited yet.
    Deferred(BoxFuture<'a, Result<T, E>>),
    /// Handler running on its own task.
    Spawned(JoinHandle<Result<T, E>>),
}

impl<T, E> std::fmt::Debug for HandlerReturn<'_, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("HandlerReturn::Ready"),
            Self::Deferred(_) => f.write_str("HandlerReturn::Deferred"),
            Self::Spawned(_) => f.write_str("HandlerReturn::Spawned"),
        }
    }
}

impl<'a, T, E> HandlerReturn<'a, T, E> {
    /// Wrap a future without awaiting it.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'a,
    {
        Self::Deferred(Box::pin(future))
    }

    /// Wait for the result, flattening task failures into `E`.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or `E::from(TaskFailure)` when the
    /// spawned task panicked or was cancelled.
    pub async fn resolve(self) -> Result<T, E>
    where
        E: From<TaskFailure>,
    {
        match self {
            Self::Ready(result) => result,
            Self::Deferred(future) => future.await,
            Self::Spawned(handle) => match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    let failure = TaskFailure::from(join_error);
                    tracing::warn!(error = %failure, "Handler task did not complete");
                    Err(E::from(failure))
                }
            },
        }
    }
}

impl<T, E> From<Result<T, E>> for HandlerReturn<'_, T, E> {
    fn from(result: Result<T, E>) -> Self {
        Self::Ready(result)
    }
}

impl<T, E> From<JoinHandle<Result<T, E>>> for HandlerReturn<'_, T, E> {
    fn from(handle: JoinHandle<Result<T, E>>) -> Self {
        Self::Spawned(handle)
    }
}

impl AuditContext {
    /// Record the outcome of a resolved handler result.
    ///
    /// Errors without a problem detail leave the context for the completion
    /// hook to finalize.
    pub fn finalize_from_result<T, E>(&mut self, result: &Result<T, E>)
    where
        T: AuditedResult,
        E: ProblemSource + Display,
    {
        match result {
            Ok(value) => {
                if let Some(status) = value.envelope_status() {
                    self.set_status_code(status);
                }
                if let Some(provider) = value.correlation_data() {
                    for (key, id) in provider.correlation_params() {
                        self.append_param(&key, Some(id));
                    }
                }
                self.record_payload(value.payload(), value.payload_type());
                self.mark_post_handled();
            }
            Err(error) => match error.problem_detail() {
                Some(problem) => {
                    tracing::debug!(status = problem.status, error = %error, "Handler returned a problem");
                    self.set_from_problem_detail(&problem);
                }
                None => {
                    tracing::debug!(error = %error, "Handler failed without problem detail");
                }
            },
        }
    }

    /// Await a handler's return value, record its outcome, and hand it back.
    ///
    /// # Errors
    ///
    /// Returns exactly the error the handler produced (see
    /// [`HandlerReturn::resolve`]).
    pub async fn finalize_from_handler<T, E>(&mut self, ret: HandlerReturn<'_, T, E>) -> Result<T, E>
    where
        T: AuditedResult,
        E: ProblemSource + Display + From<TaskFailure>,
    {
        let result = ret.resolve().await;
        self.finalize_from_result(&result);
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    enum HandlerError {
        #[error("user {0} not found")]
        NotFound(u64),
        #[error("storage offline")]
        Storage,
        #[error(transparent)]
        Task(#[from] TaskFailure),
    }

    impl ProblemSource for HandlerError {
        fn problem_detail(&self) -> Option<ProblemDetail> {
            match self {
                Self::NotFound(_) => Some(ProblemDetail::for_status_and_detail(404, self.to_string())),
                Self::Storage => None,
                Self::Task(failure) => failure.problem_detail(),
            }
        }
    }

    struct Created {
        id: u64,
    }

    impl CorrelationDataProvider for Created {
        fn correlation_params(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("userId".to_string(), self.id.to_string())])
        }
    }

    impl AuditedResult for Created {
        fn envelope_status(&self) -> Option<u16> {
            Some(201)
        }

        fn correlation_data(&self) -> Option<&dyn CorrelationDataProvider> {
            Some(self)
        }
    }

    #[tokio::test]
    async fn ok_result_records_status_and_correlation() {
        let mut ctx = AuditContext::new();
        let result: Result<Created, HandlerError> = ctx
            .finalize_from_handler(HandlerReturn::deferred(async { Ok(Created { id: 7 }) }))
            .await;

        assert!(result.is_ok());
        assert!(ctx.is_post_handled());
        assert_eq!(ctx.status_code(), 201);
        assert!(ctx.params()["userId"].contains("7"));
        assert_eq!(ctx.payload_type(), None);
    }

    #[tokio::test]
    async fn problem_error_is_recorded_and_returned() {
        let mut ctx = AuditContext::new();
        let result: Result<(), HandlerError> = ctx
            .finalize_from_handler(Err(HandlerError::NotFound(7)).into())
            .await;

        assert_eq!(result.unwrap_err(), HandlerError::NotFound(7));
        assert_eq!(ctx.status_code(), 404);
        assert!(!ctx.is_success());
        assert_eq!(ctx.problem_detail().unwrap().status, 404);
    }

    #[tokio::test]
    async fn plain_error_leaves_context_for_completion() {
        let mut ctx = AuditContext::new();
        let result: Result<(), HandlerError> = ctx
            .finalize_from_handler(Err(HandlerError::Storage).into())
            .await;

        assert_eq!(result.unwrap_err(), HandlerError::Storage);
        assert!(!ctx.is_post_handled());
        assert_eq!(ctx.status_code(), 0);
    }

    #[tokio::test]
    async fn spawned_failure_unwraps_to_the_inner_cause() {
        let mut ctx = AuditContext::new();
        let handle = tokio::spawn(async { Err::<(), _>(HandlerError::NotFound(9)) });
        let result = ctx.finalize_from_handler(handle.into()).await;

        assert_eq!(result.unwrap_err(), HandlerError::NotFound(9));
        assert_eq!(ctx.status_code(), 404);
    }

    #[tokio::test]
    async fn panicked_task_becomes_task_failure() {
        let mut ctx = AuditContext::new();
        let handle = tokio::spawn(async {
            if true {
                panic!("handler exploded");
            }
            Ok::<(), HandlerError>(())
        });
        let result = ctx.finalize_from_handler(handle.into()).await;

        assert_eq!(
            result.unwrap_err(),
            HandlerError::Task(TaskFailure::Panicked("handler exploded".to_string()))
        );
        assert_eq!(ctx.status_code(), 500);
    }

    #[test]
    fn string_results_carry_payload() {
        let mut ctx = AuditContext::new();
        ctx.finalize_from_result::<_, Infallible>(&Ok("created".to_string()));

        assert_eq!(ctx.payload(), Some("created"));
        assert_eq!(ctx.payload_type(), Some("String"));
    }

    #[test]
    fn short_type_name_strips_path_and_generics() {
        assert_eq!(short_type_name("alloc::string::String"), "String");
        assert_eq!(short_type_name("app::Envelope<app::User>"), "Envelope");
    }
}
