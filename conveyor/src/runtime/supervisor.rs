use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::cancellation::CancellationRegistry;
use crate::command::{Command, QueueId, TrackingId};
use crate::config::{QueueLimits, SubscriberConfig};
use crate::queue::CommandQueue;
use crate::registry::QueueRegistry;
use crate::storage::{EventStore, JobStore};
use crate::subscriber::{EventHandler, EventSource, EventSubscription, SubscriberId};
use crate::telemetry;

/// Hosts the queue and subscriber background tasks of one process.
///
/// Owns the queue registry, the cancellation registry, the app-stop token
/// and the handles of every spawned task. Queues are registered through
/// [`QueueRuntime::register_command`], which also starts their drain tasks;
/// subscriptions through [`QueueRuntime::subscribe`]. [`QueueRuntime::shutdown`]
/// stops everything and joins the tasks.
pub struct QueueRuntime {
    host_identity: String,
    registry: QueueRegistry,
    cancellations: CancellationRegistry,
    shutdown: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let task_count = self
            .task_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("QueueRuntime")
            .field("host_identity", &self.host_identity)
            .field("registry", &self.registry)
            .field("task_count", &task_count)
            .field("shutdown_requested", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl QueueRuntime {
    /// Create a runtime with the given host identity and app-stop token.
    pub fn new(host_identity: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            host_identity: host_identity.into(),
            registry: QueueRegistry::new(),
            cancellations: CancellationRegistry::new(),
            shutdown,
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// The host identity used in subscriber identifiers.
    pub fn host_identity(&self) -> &str {
        &self.host_identity
    }

    /// A clone of the queue registry handle.
    pub fn registry(&self) -> QueueRegistry {
        self.registry.clone()
    }

    /// A clone of the cancellation registry handle.
    pub fn cancellations(&self) -> CancellationRegistry {
        self.cancellations.clone()
    }

    /// A clone of the app-stop token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Construct the queue for command type `C`, register it, and start its
    /// drain task with the given limits.
    pub async fn register_command<C: Command>(
        &self,
        store: Arc<dyn JobStore>,
        limits: QueueLimits,
    ) -> anyhow::Result<()> {
        let queue = Arc::new(CommandQueue::<C>::new(
            store,
            self.cancellations.clone(),
            self.shutdown.clone(),
        ));
        self.registry.register(Arc::clone(&queue)).await?;
        let handle = queue.set_limits(limits)?;
        self.task_handles.lock().await.push(handle);
        Ok(())
    }

    /// Start a producer/consumer pair for handler type `H` on `channel`.
    ///
    /// The subscriber identifier is derived from the runtime's host
    /// identity, the handler type name and the channel target, so the same
    /// triple resumes the same stream after a restart.
    pub async fn subscribe<H, F>(
        &self,
        source: Arc<dyn EventSource<H::Event>>,
        store: Arc<dyn EventStore>,
        handler_factory: F,
        channel: &str,
        config: SubscriberConfig,
    ) -> SubscriberId
    where
        H: EventHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let subscriber_id = SubscriberId::derive(&self.host_identity, H::name(), channel);
        let subscription = Arc::new(EventSubscription::<H>::new(
            subscriber_id,
            source,
            store,
            Arc::new(handler_factory),
            config,
            self.shutdown.clone(),
        ));
        let (producer, consumer) = subscription.spawn();
        self.task_handles.lock().await.extend([producer, consumer]);
        subscriber_id
    }

    /// Enqueue a command on the queue registered for its type.
    ///
    /// Fails with [`crate::NoQueueRegistered`] when the type has no queue.
    pub async fn enqueue<C: Command>(
        &self,
        command: &C,
        execute_after: Option<DateTime<Utc>>,
        expire_on: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<TrackingId> {
        self.registry
            .enqueue(command, execute_after, expire_on, cancel)
            .instrument(telemetry::command_enqueue_span(
                C::name(),
                QueueId::for_command::<C>(),
            ))
            .await
    }

    /// Cancel a job on the queue registered for command type `C`.
    pub async fn cancel<C: Command>(
        &self,
        tracking_id: TrackingId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.registry.cancel::<C>(tracking_id, cancel).await
    }

    /// Gracefully shut down the runtime and all background tasks.
    ///
    /// Cancels the app-stop token, then joins every spawned task with a
    /// 30-second per-task timeout. In-flight command executions keep their
    /// own deadline; only the outer loops and retry loops stop.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("initiating graceful shutdown of queue runtime");

        self.shutdown.cancel();

        let handles = {
            let mut guard = self.task_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(tokio::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("runtime task failed: {:?}", e),
                Err(_) => warn!("runtime task timed out during shutdown"),
            }
        }

        info!("queue runtime shutdown complete");
        Ok(())
    }
}
