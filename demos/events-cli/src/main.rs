//! Command-line sender for single events.
//!
//! ```text
//! events send-event -m payments -e refundIssued -t business -s success -p '{"id":42}'
//! ```
//!
//! Broker and channel settings come from the same environment variables the
//! services use (see `EventsConfig::from_env`).

use anyhow::{Context, bail};
use audit_events_core::{
    DispatchPipeline, EventLogLevel, EventRecordBuilder, EventService, EventStatus, EventType,
    EventsConfig,
};
use audit_events_redpanda::RedpandaEventSink;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "events", version, about = "Events CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one event through the configured channels.
    #[command(alias = "SendEvent")]
    SendEvent(SendEvent),
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
struct SendEvent {
    /// Source module; defaults to the configured one.
    #[arg(short = 'm', long, alias = "sourceModule")]
    source_module: Option<String>,

    /// Event name.
    #[arg(short, long)]
    event: String,

    /// Event type, which also selects the channel.
    #[arg(short = 't', long, alias = "eventType", default_value = "audit")]
    event_type: EventType,

    /// Event log level.
    #[arg(short = 'l', long, alias = "eventLogLevel", default_value = "INFO")]
    event_log_level: EventLogLevel,

    /// Event status.
    #[arg(short = 's', long, alias = "eventStatus", default_value = "success")]
    event_status: EventStatus,

    /// Payload, sent as-is.
    #[arg(short, long)]
    payload: Option<String>,

    /// Payload type.
    #[arg(long, alias = "payloadType")]
    payload_type: Option<String>,
}

impl SendEvent {
    fn apply(self, default_module: &str, builder: EventRecordBuilder) -> EventRecordBuilder {
        let mut builder = builder
            .source_module(self.source_module.unwrap_or_else(|| default_module.to_string()))
            .event(self.event)
            .event_type(self.event_type)
            .event_log_level(self.event_log_level)
            .event_status(self.event_status);
        if let Some(payload) = self.payload {
            builder = builder.payload(payload);
        }
        if let Some(payload_type) = self.payload_type {
            builder = builder.payload_type(payload_type);
        }
        builder
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "events_cli=info,audit_events_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = EventsConfig::from_env().context("Failed to load events configuration")?;
    config.validate().context("Invalid events configuration")?;
    let sink = RedpandaEventSink::from_config(&config).context("Failed to create producers")?;
    let pipeline = DispatchPipeline::new(Arc::new(sink), config);

    match cli.command {
        Command::SendEvent(args) => send_event(&pipeline, args).await,
    }
}

/// Send one event and wait for the broker's answer.
async fn send_event(pipeline: &DispatchPipeline, args: SendEvent) -> anyhow::Result<()> {
    let event = args.event.clone();
    if pipeline.config().channel(args.event_type.name()).is_none() {
        bail!("No channel configured for event type {}", args.event_type);
    }

    let default_module = pipeline.config().default_source_module.clone();
    let service = EventService::new(pipeline.clone());
    let Some(handle) = service.send_event(|builder| args.apply(&default_module, builder)) else {
        bail!("Event {event} was not sent, events module is disabled");
    };
    handle.await.context("Send task failed")?;

    let health = pipeline.health();
    if health.status().is_down() {
        bail!(
            "Event {event} was not delivered: {}",
            health.last_error().unwrap_or_default()
        );
    }
    tracing::info!(event = %event, "Event sent");
    Ok(())
}
