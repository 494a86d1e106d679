//! Broker availability as seen by the dispatch pipeline.
//!
//! The state is written only by send completions and read by the health
//! endpoint. It starts as `unknown` until the first send finishes.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

const UNKNOWN: u8 = 0;
const UP: u8 = 1;
const DOWN: u8 = 2;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No send has completed yet.
    Unknown,
    /// Last send succeeded.
    Up,
    /// Last send failed.
    Down,
}

impl HealthStatus {
    /// Whether the component is known to be available.
    #[must_use]
    pub const fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }

    /// Whether the component is known to be unavailable.
    #[must_use]
    pub const fn is_down(self) -> bool {
        matches!(self, Self::Down)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Optional metadata (e.g., error counts)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Shared broker health flag.
#[derive(Debug, Default)]
pub struct BrokerHealth {
    state: AtomicU8,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl BrokerHealth {
    /// Component name reported by [`check`](Self::check).
    pub const COMPONENT: &'static str = "kafka";

    /// New indicator in the `unknown` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNKNOWN),
            failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Record a successful send.
    pub fn on_send_success(&self) {
        self.set_last_error(None);
        if self.transition(UP) {
            tracing::info!(component = Self::COMPONENT, "Broker is up");
        }
    }

    /// Record a failed send.
    pub fn on_send_failure(&self, error: &dyn std::fmt::Display) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(Some(error.to_string()));
        if self.transition(DOWN) {
            tracing::warn!(component = Self::COMPONENT, error = %error, "Broker is down");
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        match self.state.load(Ordering::Acquire) {
            UP => HealthStatus::Up,
            DOWN => HealthStatus::Down,
            _ => HealthStatus::Unknown,
        }
    }

    /// Total failed sends since startup.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Error of the most recent send, cleared by the next success.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot for the health endpoint.
    #[must_use]
    pub fn check(&self) -> HealthCheck {
        let status = self.status();
        let message = match status {
            HealthStatus::Unknown => Some("No events sent yet".to_string()),
            HealthStatus::Up => None,
            HealthStatus::Down => Some(match self.last_error() {
                Some(error) => format!("Last send failed: {error}"),
                None => "Last send failed".to_string(),
            }),
        };
        HealthCheck {
            component: Self::COMPONENT.to_string(),
            status,
            message,
            metadata: Vec::new(),
        }
        .with_metadata("failures", self.failure_count().to_string())
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Move to `target`; true when the state actually changed.
    fn transition(&self, target: u8) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        while current != target {
            match self.state.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown_and_tracks_last_send() {
        let health = BrokerHealth::new();
        assert_eq!(health.status(), HealthStatus::Unknown);

        health.on_send_success();
        assert!(health.status().is_up());

        health.on_send_failure(&"timeout");
        assert!(health.status().is_down());
        assert_eq!(health.failure_count(), 1);

        health.on_send_success();
        assert!(health.status().is_up());
        assert_eq!(health.failure_count(), 1);
        assert_eq!(health.last_error(), None);
    }

    #[test]
    fn check_reports_status_and_failures() {
        let health = BrokerHealth::new();
        health.on_send_failure(&"refused");
        let check = health.check();

        assert_eq!(check.component, "kafka");
        assert_eq!(check.status, HealthStatus::Down);
        assert_eq!(check.message.as_deref(), Some("Last send failed: refused"));
        assert_eq!(
            check.metadata,
            vec![("failures".to_string(), "1".to_string())]
        );
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "down");
    }
}
