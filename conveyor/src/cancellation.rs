use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::TrackingId;

/// Process-wide map from a job's tracking identifier to its live
/// cancellation token.
///
/// Entries are inserted just before handler dispatch and removed on cancel,
/// completion or handler error; duplicate removals are no-ops. The registry
/// is in-memory only: cancellation signals are not persisted.
///
/// Thread-safe via `tokio::sync::Mutex`; clones share the same map.
#[derive(Clone, Default, Debug)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<HashMap<TrackingId, CancellationToken>>>,
}

impl CancellationRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the token for an execution about to be dispatched.
    ///
    /// A leftover entry for the same tracking id is replaced; that only
    /// happens when a record is re-dispatched after a lost completion mark.
    pub async fn insert(&self, tracking_id: TrackingId, token: CancellationToken) {
        let mut guard = self.inner.lock().await;
        if guard.insert(tracking_id, token).is_some() {
            warn!(%tracking_id, "replaced stale cancellation entry");
        }
    }

    /// Remove the entry for a finished execution. Returns whether an entry
    /// was present; removing an absent entry is a no-op.
    pub async fn remove(&self, tracking_id: TrackingId) -> bool {
        let mut guard = self.inner.lock().await;
        guard.remove(&tracking_id).is_some()
    }

    /// Signal cancellation on the tracked execution, removing the entry.
    ///
    /// Best-effort: returns `false` when nothing is tracked under the id,
    /// which is the normal case for jobs that are not currently running.
    pub async fn signal(&self, tracking_id: TrackingId) -> bool {
        let token = {
            let mut guard = self.inner.lock().await;
            guard.remove(&tracking_id)
        };
        match token {
            Some(token) => {
                token.cancel();
                debug!(%tracking_id, "signalled in-flight execution");
                true
            }
            None => false,
        }
    }

    /// Whether an execution is currently tracked under the id.
    pub async fn contains(&self, tracking_id: TrackingId) -> bool {
        let guard = self.inner.lock().await;
        guard.contains_key(&tracking_id)
    }

    /// Number of tracked executions.
    pub async fn len(&self) -> usize {
        let guard = self.inner.lock().await;
        guard.len()
    }

    /// Whether no executions are tracked.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_signal() {
        let registry = CancellationRegistry::new();
        let tracking_id = TrackingId::new();
        let token = CancellationToken::new();

        registry.insert(tracking_id, token.clone()).await;
        assert!(registry.contains(tracking_id).await);

        assert!(registry.signal(tracking_id).await);
        assert!(token.is_cancelled());
        assert!(!registry.contains(tracking_id).await);
    }

    #[tokio::test]
    async fn test_signal_absent_is_best_effort() {
        let registry = CancellationRegistry::new();
        assert!(!registry.signal(TrackingId::new()).await);
    }

    #[tokio::test]
    async fn test_duplicate_remove_is_noop() {
        let registry = CancellationRegistry::new();
        let tracking_id = TrackingId::new();

        registry
            .insert(tracking_id, CancellationToken::new())
            .await;
        assert!(registry.remove(tracking_id).await);
        assert!(!registry.remove(tracking_id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = CancellationRegistry::new();
        let clone = registry.clone();
        let tracking_id = TrackingId::new();

        registry
            .insert(tracking_id, CancellationToken::new())
            .await;
        assert!(clone.contains(tracking_id).await);
        assert_eq!(clone.len().await, 1);
    }
}
