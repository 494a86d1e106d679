//! Task-scoped diagnostic context for request correlation data.
//!
//! The diagnostic context is a small string map that travels with the task
//! handling a request. Lifecycle hooks write correlation identifiers into it
//! (tracking id, session id, tenant id) and anything logged while the request
//! is in flight can read them back.
//!
//! # Scoping
//!
//! Entries live in a [`tokio::task_local!`] slot, so every request gets its own
//! store by running inside [`DiagnosticContext::scope`]. Nothing carries over
//! between requests that happen to share a worker thread.
//!
//! ```text
//! request task                         dispatch task
//! ┌──────────────────────────┐         ┌──────────────────────────┐
//! │ scope(DiagnosticContext) │         │ scope(snapshot)          │
//! │   put("tenantId", "t1")  │ ──────► │   get("tenantId") == t1  │
//! │   snapshot()             │ spawn   │                          │
//! └──────────────────────────┘         └──────────────────────────┘
//! ```
//!
//! Task-locals do not follow `tokio::spawn`, so moving the entries to another
//! task is always an explicit [`DiagnosticContext::snapshot`] followed by
//! [`DiagnosticContext::scope`] on the receiving side.

use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

/// Diagnostic key for the request tracking identifier.
pub const TRACKING_ID_KEY: &str = "request.TrackingId";

/// Diagnostic key for the request session identifier.
pub const SESSION_ID_KEY: &str = "request.sessionId";

/// Diagnostic key for the tenant identifier.
pub const TENANT_ID_KEY: &str = "tenantId";

tokio::task_local! {
    static CURRENT: RefCell<DiagnosticContext>;
}

/// Key-value store of correlation data for the current task.
///
/// Values are plain strings. The map is ordered so that log output and
/// snapshots are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticContext {
    entries: BTreeMap<String, String>,
}

impl DiagnosticContext {
    /// Create an empty context.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Run `fut` with `self` installed as the task's diagnostic context.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(RefCell::new(self), fut).await
    }

    /// Synchronous variant of [`scope`](Self::scope).
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(RefCell::new(self), f)
    }

    /// Whether the calling task currently has a diagnostic scope.
    #[must_use]
    pub fn is_active() -> bool {
        CURRENT.try_with(|_| ()).is_ok()
    }

    /// Store `value` under `key` in the current task's context.
    ///
    /// Returns `false` (and stores nothing) when called outside a scope.
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        let stored = CURRENT
            .try_with(|cell| {
                cell.borrow_mut().entries.insert(key.clone(), value);
            })
            .is_ok();
        if !stored {
            tracing::trace!(key = %key, "No diagnostic scope active, entry dropped");
        }
        stored
    }

    /// Read the value stored under `key` in the current task's context.
    #[must_use]
    pub fn get(key: &str) -> Option<String> {
        CURRENT
            .try_with(|cell| cell.borrow().entries.get(key).cloned())
            .ok()
            .flatten()
    }

    /// Remove `key` from the current task's context, returning the old value.
    pub fn remove(key: &str) -> Option<String> {
        CURRENT
            .try_with(|cell| cell.borrow_mut().entries.remove(key))
            .ok()
            .flatten()
    }

    /// Remove every entry from the current task's context.
    pub fn clear() {
        let _ = CURRENT.try_with(|cell| cell.borrow_mut().entries.clear());
    }

    /// Copy the current task's context.
    ///
    /// Returns an empty context when called outside a scope.
    #[must_use]
    pub fn snapshot() -> Self {
        CURRENT
            .try_with(|cell| cell.borrow().clone())
            .unwrap_or_default()
    }

    /// Value stored under `key` in this (detached) context.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Insert into this (detached) context.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Iterate over the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for DiagnosticContext
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn put_outside_scope_is_a_noop() {
        assert!(!DiagnosticContext::is_active());
        assert!(!DiagnosticContext::put(TENANT_ID_KEY, "t1"));
        assert_eq!(DiagnosticContext::get(TENANT_ID_KEY), None);
        assert!(DiagnosticContext::snapshot().is_empty());
    }

    #[test]
    fn sync_scope_stores_and_reads_entries() {
        DiagnosticContext::new().sync_scope(|| {
            assert!(DiagnosticContext::put(TRACKING_ID_KEY, "abc"));
            assert_eq!(DiagnosticContext::get(TRACKING_ID_KEY).as_deref(), Some("abc"));
            assert_eq!(DiagnosticContext::remove(TRACKING_ID_KEY).as_deref(), Some("abc"));
            assert_eq!(DiagnosticContext::get(TRACKING_ID_KEY), None);
        });
    }

    #[tokio::test]
    async fn scopes_do_not_leak_between_requests() {
        DiagnosticContext::new()
            .scope(async {
                DiagnosticContext::put(TENANT_ID_KEY, "first");
            })
            .await;

        DiagnosticContext::new()
            .scope(async {
                assert_eq!(DiagnosticContext::get(TENANT_ID_KEY), None);
            })
            .await;
    }

    #[tokio::test]
    async fn snapshot_restores_on_spawned_task() {
        let snapshot = DiagnosticContext::new()
            .scope(async {
                DiagnosticContext::put(TENANT_ID_KEY, "acme");
                DiagnosticContext::put(TRACKING_ID_KEY, "trk-1");
                DiagnosticContext::snapshot()
            })
            .await;

        let restored = tokio::spawn(snapshot.scope(async {
            (
                DiagnosticContext::get(TENANT_ID_KEY),
                DiagnosticContext::get(TRACKING_ID_KEY),
            )
        }))
        .await
        .unwrap();

        assert_eq!(restored.0.as_deref(), Some("acme"));
        assert_eq!(restored.1.as_deref(), Some("trk-1"));
    }

    #[test]
    fn clear_empties_the_scope() {
        let ctx: DiagnosticContext = [("a", "1"), ("b", "2")].into_iter().collect();
        ctx.sync_scope(|| {
            assert_eq!(DiagnosticContext::snapshot().len(), 2);
            DiagnosticContext::clear();
            assert!(DiagnosticContext::snapshot().is_empty());
        });
    }
}
