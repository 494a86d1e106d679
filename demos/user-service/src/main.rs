//! User service HTTP server with audited endpoints.
//!
//! Configuration comes from the environment (see `EventsConfig::from_env`);
//! `HOST` and `PORT` select the listen address.

mod api;

use audit_events_core::{DispatchPipeline, EventsConfig};
use audit_events_redpanda::RedpandaEventSink;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "user_service_demo=info,audit_events_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EventsConfig::from_env()?;
    config.validate()?;
    info!(
        source_module = %config.default_source_module,
        channels = ?config.channels.keys().collect::<Vec<_>>(),
        disabled = config.disabled,
        "Audit configuration loaded"
    );

    let sink = RedpandaEventSink::from_config(&config)?;
    let pipeline = DispatchPipeline::new(Arc::new(sink), config);
    let app = api::router(pipeline)?;

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
