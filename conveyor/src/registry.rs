use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::{Command, TrackingId};
use crate::queue::{CommandQueue, ErasedQueue};

/// Error returned by the façade when a command type was never registered.
///
/// Carried inside `anyhow::Error`; callers that need to distinguish the
/// configuration error from storage failures can downcast to it.
#[derive(Debug, thiserror::Error)]
#[error("no queue registered for command type {command_type}")]
pub struct NoQueueRegistered {
    /// Name of the command type that has no queue.
    pub command_type: &'static str,
}

/// Process-wide directory from command type to the queue instance serving
/// it.
///
/// Populated once per type at runtime construction and read on every
/// enqueue or cancel; entries are never removed during the process
/// lifetime. The registry is a cloneable handle, passed explicitly rather
/// than kept as a true global.
#[derive(Clone, Default)]
pub struct QueueRegistry {
    inner: Arc<RwLock<HashMap<TypeId, Arc<dyn ErasedQueue>>>>,
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue_count = self
            .inner
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("QueueRegistry")
            .field("queue_count", &queue_count)
            .finish()
    }
}

impl QueueRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the queue serving command type `C`.
    ///
    /// Exactly one registration per type is allowed.
    pub async fn register<C: Command>(
        &self,
        queue: Arc<CommandQueue<C>>,
    ) -> anyhow::Result<()> {
        let mut guard = self.inner.write().await;
        match guard.entry(TypeId::of::<C>()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                anyhow::bail!("queue already registered for command type {}", C::name())
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                debug!(command = C::name(), queue_id = %queue.queue_id(), "queue registered");
                slot.insert(queue);
                Ok(())
            }
        }
    }

    /// Enqueue a command on the queue registered for its type.
    ///
    /// Fails with [`NoQueueRegistered`] when the type has no queue;
    /// otherwise delegates to the instance and returns the tracking id.
    pub async fn enqueue<C: Command>(
        &self,
        command: &C,
        execute_after: Option<DateTime<Utc>>,
        expire_on: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<TrackingId> {
        let queue = self.lookup::<C>().await?;
        let queue = queue
            .as_any()
            .downcast_ref::<CommandQueue<C>>()
            .ok_or_else(|| {
                anyhow::anyhow!("registered queue has unexpected type for {}", C::name())
            })?;
        queue
            .store_job(command, execute_after, expire_on, cancel)
            .await
    }

    /// Cancel a job on the queue registered for command type `C`.
    pub async fn cancel<C: Command>(
        &self,
        tracking_id: TrackingId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.lookup::<C>()
            .await?
            .cancel_job(tracking_id, cancel)
            .await
    }

    /// Number of registered queues.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no queues are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn lookup<C: Command>(&self) -> anyhow::Result<Arc<dyn ErasedQueue>> {
        let guard = self.inner.read().await;
        guard
            .get(&TypeId::of::<C>())
            .cloned()
            .ok_or_else(|| {
                NoQueueRegistered {
                    command_type: C::name(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationRegistry;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use crate::record::{BatchQuery, JobRecord};
    use crate::storage::JobStore;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Orphan;

    #[async_trait]
    impl Command for Orphan {
        async fn execute(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NullStore;

    #[async_trait]
    impl JobStore for NullStore {
        async fn store_job(
            &self,
            _record: &JobRecord,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn next_batch(
            &self,
            _query: BatchQuery,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Vec<JobRecord>> {
            Ok(Vec::new())
        }

        async fn mark_complete(
            &self,
            _record: &JobRecord,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn cancel_job(
            &self,
            _tracking_id: TrackingId,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn record_failure(
            &self,
            _record: &JobRecord,
            _error: &anyhow::Error,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn build_queue() -> Arc<CommandQueue<Orphan>> {
        Arc::new(CommandQueue::new(
            Arc::new(NullStore),
            CancellationRegistry::new(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_enqueue_without_registration_fails() {
        let registry = QueueRegistry::new();
        let err = registry
            .enqueue(&Orphan, None, None, CancellationToken::new())
            .await
            .unwrap_err();

        let not_registered = err.downcast_ref::<NoQueueRegistered>();
        assert!(not_registered.is_some());
        assert!(not_registered.unwrap().command_type.contains("Orphan"));
    }

    #[tokio::test]
    async fn test_cancel_without_registration_fails() {
        let registry = QueueRegistry::new();
        let err = registry
            .cancel::<Orphan>(TrackingId::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<NoQueueRegistered>().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = QueueRegistry::new();
        registry.register(build_queue()).await.unwrap();
        assert!(registry.register(build_queue()).await.is_err());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_enqueue_delegates_to_registered_queue() {
        let registry = QueueRegistry::new();
        registry.register(build_queue()).await.unwrap();

        let tracking_id = registry
            .enqueue(&Orphan, None, None, CancellationToken::new())
            .await
            .unwrap();
        // A fresh id per enqueue.
        let second = registry
            .enqueue(&Orphan, None, None, CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(tracking_id, second);
    }
}
