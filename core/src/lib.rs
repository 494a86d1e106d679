//! # Audit Events Core
//!
//! Per-request audit context aggregation and event dispatch.
//!
//! Every inbound call produces one consolidated audit event. Lifecycle hooks
//! supplied by the host framework feed facts into an [`AuditContext`]; when the
//! request completes the context is mapped to a [`TransportEvent`] and handed
//! to the [`DispatchPipeline`], which publishes it off the request path.
//!
//! ## Components
//!
//! - **Diagnostic context** ([`diagnostic`]): task-local correlation ids for logging
//! - **Audit context** ([`context`]): the per-request state machine
//! - **Result extraction** ([`outcome`]): status, problem and correlation data from handler results
//! - **Mapping** ([`mapper`]): context to transport event to wire record
//! - **Dispatch** ([`dispatch`]): channel routing, serialization, broker health
//!
//! ## Guarantees
//!
//! - One event per request, published exactly once
//! - Correlation params only ever accumulate
//! - Broker failures never reach the request
//!
//! ## Example
//!
//! ```ignore
//! use audit_events_core::*;
//!
//! let pipeline = DispatchPipeline::new(sink, EventsConfig::from_env()?);
//!
//! let mut ctx = AuditContext::for_module("user-service");
//! ctx.begin_if_not_started(&headers, &pipeline.config().header_settings());
//! ctx.populate_from_declared_metadata(&metadata);
//! let result = ctx.finalize_from_handler(handler().into()).await;
//! ctx.complete(201, None, None, &pipeline);
//! ```

pub mod config;
pub mod context;
pub mod diagnostic;
pub mod dispatch;
pub mod event;
pub mod health;
pub mod mapper;
pub mod metadata;
pub mod outcome;
pub mod problem;
pub mod service;

pub use config::{ChannelConfig, ConfigError, EventsConfig, HeaderSettings, KafkaSettings, SerializerKind};
pub use context::{AuditContext, HeaderSource};
pub use diagnostic::DiagnosticContext;
pub use dispatch::{DispatchError, DispatchPipeline, EventSink};
pub use event::{EventLogLevel, EventRecord, EventRecordBuilder, EventStatus, EventType, TransportEvent};
pub use health::{BrokerHealth, HealthCheck, HealthStatus};
pub use metadata::{AuditMetadata, AuditParam, MetadataError};
pub use outcome::{AuditedResult, CorrelationDataProvider, HandlerReturn, ProblemSource, TaskFailure};
pub use problem::ProblemDetail;
pub use service::EventService;
