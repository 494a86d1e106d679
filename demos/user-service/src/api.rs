//! Routes, handlers and the in-memory user store.

use audit_events_core::event::EventType;
use audit_events_core::metadata::{AuditMetadata, AuditParam, MetadataError};
use audit_events_core::outcome::{AuditedResult, CorrelationDataProvider};
use audit_events_core::{DispatchPipeline, EventService};
use audit_events_web::handlers::{broker_health, health_check};
use audit_events_web::{ApiError, AuditHandle, AuditState, Envelope, audit_layer, audit_route};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tower_http::trace::TraceLayer;

/// Request body of `POST /users`.
#[derive(Debug, Deserialize)]
pub struct CreateUser {
    email: String,
    name: String,
}

/// A stored user.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    id: u64,
    email: String,
    name: String,
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

#[derive(Debug, Default, Clone)]
struct UserStore {
    next_id: Arc<AtomicU64>,
    users: Arc<RwLock<HashMap<u64, User>>>,
}

impl UserStore {
    fn insert(&self, request: CreateUser) -> Result<User, ApiError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.values().any(|user| user.email == request.email) {
            return Err(ApiError::conflict(format!(
                "User with email {} already exists",
                request.email
            )));
        }
        let user = User {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            email: request.email,
            name: request.name,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    fn get(&self, id: u64) -> Result<User, ApiError> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("User", id))
    }
}

async fn create_user(
    audit: AuditHandle,
    State(events): State<EventService>,
    Extension(store): Extension<UserStore>,
    Json(request): Json<CreateUser>,
) -> Result<Envelope<User>, ApiError> {
    let email = request.email.clone();
    audit
        .run(&[&email], async move {
            let user = store.insert(request)?;
            events.send_event(|builder| {
                builder
                    .event("userCreated")
                    .event_type(EventType::Business)
                    .source_module("user-service")
                    .correlation_id("userId", user.id.to_string())
            });
            Ok::<_, ApiError>(Envelope::created(user))
        })
        .await
}

async fn get_user(
    audit: AuditHandle,
    Extension(store): Extension<UserStore>,
    Path(id): Path<u64>,
) -> Result<Envelope<User>, ApiError> {
    audit
        .invoke(&[&id], store.get(id).map(Envelope::ok))
        .await
}

/// Build the service router.
///
/// # Errors
///
/// Returns an error if a route's audit metadata is invalid.
pub fn router(pipeline: DispatchPipeline) -> Result<Router, MetadataError> {
    let create = AuditMetadata::builder("users")
        .operation_id("createUser")
        .header("X-Request-Source")
        .param(AuditParam::named("email"))
        .build()?;
    let get_one = AuditMetadata::builder("users")
        .operation_id("getUser")
        .param(AuditParam::named("id").path_variable("userId").add_to_diagnostic())
        .build()?;

    let state = AuditState::new(pipeline.clone());
    let audited = Router::new()
        .route("/users", post(create_user).layer(audit_route(create)))
        .route("/users/:id", get(get_user).layer(audit_route(get_one)))
        .layer(Extension(UserStore::default()))
        .layer(audit_layer(pipeline));

    Ok(Router::new()
        .route("/health", get(health_check))
        .route("/health/broker", get(broker_health))
        .merge(audited)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}
