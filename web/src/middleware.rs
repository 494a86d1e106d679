//! Tower middleware driving the audit lifecycle.
//!
//! - [`audit_layer`]: one audit event per request. Opens a fresh diagnostic
//!   scope, runs the pre-dispatch hook, and completes and publishes the
//!   context once the response (or error) is known.
//! - [`audit_route`]: per-route declared metadata. Applies the endpoint's
//!   [`AuditMetadata`] and captures its declared headers before the handler
//!   runs.
//!
//! # Example
//!
//! ```ignore
//! use audit_events_web::middleware::{audit_layer, audit_route};
//!
//! let create_user = AuditMetadata::builder("users")
//!     .operation_id("createUser")
//!     .build()?;
//!
//! let app = Router::new()
//!     .route("/users", post(create).layer(audit_route(create_user)))
//!     .layer(audit_layer(pipeline));
//! ```
//!
//! # Flow
//!
//! 1. **Scope** a new [`DiagnosticContext`] around the whole request
//! 2. **Begin**: tracking, session and tenant ids from the headers
//! 3. **Attach** an [`AuditHandle`] to the request extensions
//! 4. **Route**: declared metadata and headers (if the route has any)
//! 5. **Handler**: arguments and result through [`AuditHandle::invoke`]
//! 6. **Complete** with the observed status and any problem body, then publish
//! 7. **Inject** the tracking id into the `X-Tracking-Id` response header

use crate::extractors::AuditHandle;
use audit_events_core::context::{AuditContext, HeaderSource};
use audit_events_core::diagnostic::{DiagnosticContext, TRACKING_ID_KEY};
use audit_events_core::dispatch::DispatchPipeline;
use audit_events_core::metadata::AuditMetadata;
use audit_events_core::problem::ProblemDetail;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue, header},
    response::Response,
};
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// Status recorded when the client goes away before a response exists.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Response header echoing the request's tracking id.
pub const TRACKING_ID_RESPONSE_HEADER: HeaderName = HeaderName::from_static("x-tracking-id");

/// Create a layer that audits every request passing through it.
#[must_use]
pub fn audit_layer(pipeline: DispatchPipeline) -> AuditLayer {
    AuditLayer { pipeline }
}

/// Layer for request auditing.
#[derive(Clone, Debug)]
pub struct AuditLayer {
    pipeline: DispatchPipeline,
}

impl<S> Layer<S> for AuditLayer {
    type Service = AuditMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditMiddleware {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Middleware service for request auditing.
#[derive(Clone, Debug)]
pub struct AuditMiddleware<S> {
    inner: S,
    pipeline: DispatchPipeline,
}

impl<S> Service<Request> for AuditMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display + Send,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // The ready service is the one that must handle this request.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let pipeline = self.pipeline.clone();

        Box::pin(DiagnosticContext::new().scope(audited_call(inner, pipeline, req)))
    }
}

async fn audited_call<S>(
    mut inner: S,
    pipeline: DispatchPipeline,
    mut req: Request,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
    S::Error: Display,
{
    let config = pipeline.config();
    let mut context = AuditContext::for_module(config.default_source_module.clone());
    context.begin_if_not_started(req.headers(), &config.header_settings());
    context.record_request(req.method().as_str(), req.uri().path());

    let tracking_id = DiagnosticContext::get(TRACKING_ID_KEY).unwrap_or_default();
    let span = tracing::info_span!(
        "audit_request",
        method = %req.method(),
        uri = %req.uri().path(),
        tracking_id = %tracking_id,
    );

    let handle = AuditHandle::new(context);
    req.extensions_mut().insert(handle.clone());

    let guard = CompletionGuard::new(handle.clone(), pipeline.clone());
    let result = inner.call(req).instrument(span.clone()).await;
    guard.disarm();

    span.in_scope(|| match result {
        Ok(mut response) => {
            complete_from_response(&handle, &pipeline, &response);
            if !response.headers().contains_key(&TRACKING_ID_RESPONSE_HEADER) {
                if let Ok(value) = HeaderValue::from_str(&tracking_id) {
                    response
                        .headers_mut()
                        .insert(TRACKING_ID_RESPONSE_HEADER, value);
                }
            }
            Ok(response)
        }
        Err(error) => {
            handle.with(|ctx| ctx.complete(500, None, Some(&error), &pipeline));
            Err(error)
        }
    })
}

fn complete_from_response(handle: &AuditHandle, pipeline: &DispatchPipeline, response: &Response) {
    let status = response.status().as_u16();
    let problem = response.extensions().get::<ProblemDetail>().cloned();
    let produces = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    handle.with(|ctx| {
        if let Some(content_type) = produces {
            ctx.record_produces(content_type);
        }
        match &problem {
            Some(problem) => ctx.record_problem_body(problem.clone()),
            // Handlers that never touched the AuditHandle still finish normally.
            None if !ctx.is_post_handled() && status < 400 => {
                ctx.finalize_from_result::<(), Infallible>(&Ok(()));
            }
            None => {}
        }
        ctx.complete(status, problem.as_ref(), None, pipeline);
    });
}

/// Completes the audit context if the request future is dropped early.
struct CompletionGuard {
    handle: Option<AuditHandle>,
    pipeline: DispatchPipeline,
}

impl CompletionGuard {
    fn new(handle: AuditHandle, pipeline: DispatchPipeline) -> Self {
        Self {
            handle: Some(handle),
            pipeline,
        }
    }

    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::warn!("Request dropped before completion, publishing audit event");
            handle.with(|ctx| {
                ctx.complete(
                    CLIENT_CLOSED_REQUEST,
                    None,
                    Some(&"request cancelled"),
                    &self.pipeline,
                )
            });
        }
    }
}

/// Create a route layer applying `metadata` to every request of the route.
///
/// Must sit inside an [`audit_layer`]; without one the metadata is ignored
/// with a warning.
#[must_use]
pub fn audit_route(metadata: AuditMetadata) -> AuditRouteLayer {
    AuditRouteLayer {
        metadata: Arc::new(metadata),
    }
}

/// Layer attaching declared audit metadata to a route.
#[derive(Clone, Debug)]
pub struct AuditRouteLayer {
    metadata: Arc<AuditMetadata>,
}

impl<S> Layer<S> for AuditRouteLayer {
    type Service = AuditRoute<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuditRoute {
            inner,
            metadata: Arc::clone(&self.metadata),
        }
    }
}

/// Middleware service for declared audit metadata.
#[derive(Clone, Debug)]
pub struct AuditRoute<S> {
    inner: S,
    metadata: Arc<AuditMetadata>,
}

impl<S> Service<Request> for AuditRoute<S>
where
    S: Service<Request, Response = Response>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        match req.extensions().get::<AuditHandle>().cloned() {
            Some(mut handle) => {
                handle.with(|ctx| {
                    ctx.populate_from_declared_metadata(&self.metadata);
                    for name in self.metadata.header_names() {
                        ctx.record_header_if_present(name, req.headers().header(name));
                    }
                });
                handle.attach_metadata(Arc::clone(&self.metadata));
                req.extensions_mut().insert(handle);
            }
            None => tracing::warn!(
                operation_id = self.metadata.operation_id().unwrap_or_default(),
                "Audit route layer used without audit layer"
            ),
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use audit_events_core::config::TRACKING_ID_HEADER;
    use audit_events_testing::recording_pipeline;
    use axum::http::Request as HttpRequest;
    use axum::{Router, body::Body, routing::get};
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_tracking_id_generated_if_missing() {
        let (pipeline, sink) = recording_pipeline();
        let app = Router::new()
            .route("/test", get(|| async { "ok" }))
            .layer(audit_layer(pipeline));

        let request = HttpRequest::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        let tracking_id = response
            .headers()
            .get(TRACKING_ID_HEADER)
            .expect("Tracking id header should be present")
            .to_str()
            .unwrap()
            .to_string();
        assert!(uuid_like(&tracking_id));

        assert!(sink.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(sink.records()[0].correlation_ids[TRACKING_ID_KEY], tracking_id);
    }

    #[tokio::test]
    async fn test_tracking_id_preserved_from_request() {
        let (pipeline, _sink) = recording_pipeline();
        let app = Router::new()
            .route("/test", get(|| async { "ok" }))
            .layer(audit_layer(pipeline));

        let request = HttpRequest::builder()
            .uri("/test")
            .header(TRACKING_ID_HEADER, "abc123")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.headers()[TRACKING_ID_HEADER], "abc123");
    }

    #[tokio::test]
    async fn test_route_layer_without_audit_layer_passes_through() {
        let metadata = AuditMetadata::builder("users").build().unwrap();
        let app = Router::new().route(
            "/test",
            get(|| async { "ok" }).layer(audit_route(metadata)),
        );

        let request = HttpRequest::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), 200);
        assert!(response.headers().get(TRACKING_ID_HEADER).is_none());
    }

    fn uuid_like(value: &str) -> bool {
        value.len() == 36 && value.chars().filter(|c| *c == '-').count() == 4
    }
}
