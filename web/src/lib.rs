//! Axum integration for per-request audit events.
//!
//! Every request passing through the [`audit_layer`] produces exactly one
//! audit event. The layer, the per-route [`audit_route`] metadata layer and
//! the [`AuditHandle`] extractor drive the lifecycle of the request's
//! [`AuditContext`](audit_events_core::AuditContext):
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ audit_layer                             │  ← diagnostic scope, tracking ids
//! │  ┌───────────────────────────────────┐  │
//! │  │ audit_route(metadata)             │  │  ← operation id, domains, headers
//! │  │  ┌─────────────────────────────┐  │  │
//! │  │  │ handler + AuditHandle       │  │  │  ← arguments, result, problem
//! │  │  └─────────────────────────────┘  │  │
//! │  └───────────────────────────────────┘  │
//! │ complete + publish                      │  → DispatchPipeline → broker
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Request Flow
//!
//! 1. **Begin**: tracking, session and tenant ids from the headers
//! 2. **Declare**: the route's metadata and declared headers
//! 3. **Intercept**: handler arguments and the handler's result
//! 4. **Complete**: status, problem body and content type of the response
//! 5. **Publish**: map and hand off to the dispatch pipeline, off the request path
//!
//! Auditing never changes the response: a failed publish only shows up in
//! the logs and the broker health endpoint.
//!
//! # Example
//!
//! ```ignore
//! use audit_events_web::{ApiError, AuditHandle, Envelope, audit_layer, audit_route};
//! use axum::{Router, routing::post, Json};
//!
//! async fn create_user(
//!     audit: AuditHandle,
//!     Json(request): Json<CreateUser>,
//! ) -> Result<Envelope<User>, ApiError> {
//!     let email = request.email.clone();
//!     audit.run(&[&email], async move { store.create(request).await }).await
//! }
//!
//! let metadata = AuditMetadata::builder("users")
//!     .operation_id("createUser")
//!     .param(AuditParam::named("email"))
//!     .build()?;
//!
//! let app = Router::new()
//!     .route("/users", post(create_user).layer(audit_route(metadata)))
//!     .layer(audit_layer(pipeline));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod state;

// Re-export key types for convenience
pub use error::ApiError;
pub use extractors::{AuditHandle, TrackingId};
pub use middleware::{AuditLayer, AuditRouteLayer, audit_layer, audit_route};
pub use response::Envelope;
pub use state::AuditState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, ApiError>;
