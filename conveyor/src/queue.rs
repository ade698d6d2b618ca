use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::cancellation::CancellationRegistry;
use crate::command::{Command, QueueId, TrackingId};
use crate::config::QueueLimits;
use crate::record::{BatchQuery, JobRecord};
use crate::storage::{retry_until_accepted, sleep_or_shutdown, JobStore};
use crate::telemetry;

/// Persistent queue for a single command type.
///
/// One instance exists per command type within a process. It owns a handle
/// to the storage provider, a readiness semaphore released on every
/// enqueue, and a background drain task that fetches due records and
/// executes them with bounded concurrency. Construction does not start the
/// drain; [`CommandQueue::set_limits`] does.
pub struct CommandQueue<C: Command> {
    store: Arc<dyn JobStore>,
    queue_id: QueueId,
    cancellations: CancellationRegistry,
    shutdown: CancellationToken,
    ready: Semaphore,
    is_in_use: AtomicBool,
    limits: OnceLock<QueueLimits>,
    _command: PhantomData<fn() -> C>,
}

impl<C: Command> std::fmt::Debug for CommandQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("command", &C::name())
            .field("queue_id", &self.queue_id)
            .field("is_in_use", &self.is_in_use.load(Ordering::Acquire))
            .field("limits", &self.limits.get())
            .finish()
    }
}

impl<C: Command> CommandQueue<C> {
    /// Create a queue for `C` backed by the given store.
    ///
    /// `shutdown` is the app-stop token: it ends the drain loop and every
    /// storage retry loop, but is deliberately not linked into per-execution
    /// tokens so in-flight commands may finish within their own deadline.
    pub fn new(
        store: Arc<dyn JobStore>,
        cancellations: CancellationRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue_id: QueueId::for_command::<C>(),
            cancellations,
            shutdown,
            ready: Semaphore::new(0),
            is_in_use: AtomicBool::new(false),
            limits: OnceLock::new(),
            _command: PhantomData,
        }
    }

    /// The queue's stable identifier.
    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// Set the queue limits and start the drain task.
    ///
    /// Must be called exactly once, before any work is expected to run; a
    /// second call is rejected. The returned handle is never awaited during
    /// normal operation, only joined at shutdown.
    pub fn set_limits(
        self: Arc<Self>,
        limits: QueueLimits,
    ) -> anyhow::Result<JoinHandle<()>> {
        if self.limits.set(limits).is_err() {
            anyhow::bail!("limits already set for queue {}", self.queue_id);
        }
        Ok(tokio::spawn(self.drain()))
    }

    /// Persist a command for execution and return its tracking id.
    ///
    /// `execute_after` defaults to now and `expire_on` to now plus four
    /// hours. Storage failures propagate to the caller; nothing is retried
    /// here. On success one readiness permit is released so an idle drain
    /// task wakes immediately.
    pub async fn store_job(
        &self,
        command: &C,
        execute_after: Option<DateTime<Utc>>,
        expire_on: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<TrackingId> {
        // Sticky: once any job has been enqueued the drain task switches to
        // bounded idle waits to catch rescheduled records.
        self.is_in_use.store(true, Ordering::Release);

        let record = JobRecord::new(command, execute_after, expire_on)?;
        self.store.store_job(&record, cancel).await?;
        self.ready.add_permits(1);

        debug!(
            tracking_id = %record.tracking_id,
            queue_id = %self.queue_id,
            execute_after = %record.execute_after,
            "job stored"
        );
        Ok(record.tracking_id)
    }

    /// Cancel a job by tracking id.
    ///
    /// The provider is asked to drop the record first; whether or not that
    /// succeeds, any in-flight execution is signalled through the
    /// cancellation registry. A provider failure is re-raised after the
    /// in-memory signal so a crashed store never leaves a running handler
    /// unsignalled.
    pub async fn cancel_job(
        &self,
        tracking_id: TrackingId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let store_result = self.store.cancel_job(tracking_id, cancel).await;
        if self.cancellations.signal(tracking_id).await {
            debug!(%tracking_id, queue_id = %self.queue_id, "in-flight execution signalled");
        }
        store_result
    }

    /// Long-running drain loop: fetch due records, execute them with
    /// bounded concurrency, wait when idle.
    async fn drain(self: Arc<Self>) {
        let Some(limits) = self.limits.get().cloned() else {
            error!(queue_id = %self.queue_id, "drain started without limits");
            return;
        };
        let batch_size = limits.concurrency * 2;
        info!(
            queue_id = %self.queue_id,
            command = C::name(),
            concurrency = limits.concurrency,
            "drain task started"
        );

        while !self.shutdown.is_cancelled() {
            let query = BatchQuery {
                queue_id: self.queue_id,
                limit: batch_size,
            };
            let records = match self.store.next_batch(query, self.shutdown.clone()).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(queue_id = %self.queue_id, error = %err, "batch fetch failed");
                    if sleep_or_shutdown(&self.shutdown, limits.storage_retry_delay).await {
                        break;
                    }
                    continue;
                }
            };

            if records.is_empty() {
                if !self.wait_for_work(&limits).await {
                    break;
                }
                continue;
            }

            // The whole batch completes before the next fetch; slots free
            // up for remaining batched records as executions finish.
            stream::iter(records)
                .for_each_concurrent(limits.concurrency, |record| {
                    self.execute_one(record, &limits)
                })
                .await;
        }

        info!(queue_id = %self.queue_id, "drain task stopped");
    }

    /// Idle wait after an empty batch.
    ///
    /// Until the first enqueue there is nothing to rescan for, so the wait
    /// is unbounded. Afterwards the wait is capped at `sem_wait_limit` to
    /// pick up records whose `execute_after` has become current and records
    /// rescheduled behind our back. A timer win must not consume a permit.
    /// Returns `false` on shutdown.
    async fn wait_for_work(&self, limits: &QueueLimits) -> bool {
        if self.is_in_use.load(Ordering::Acquire) {
            tokio::select! {
                _ = self.shutdown.cancelled() => false,
                acquired = tokio::time::timeout(limits.sem_wait_limit, self.ready.acquire()) => {
                    if let Ok(Ok(permit)) = acquired {
                        permit.forget();
                    }
                    true
                }
            }
        } else {
            tokio::select! {
                _ = self.shutdown.cancelled() => false,
                acquired = self.ready.acquire() => {
                    if let Ok(permit) = acquired {
                        permit.forget();
                    }
                    true
                }
            }
        }
    }

    /// Execute a single fetched record through its full lifecycle.
    async fn execute_one(&self, record: JobRecord, limits: &QueueLimits) {
        let tracking_id = record.tracking_id;
        let token = CancellationToken::new();
        self.cancellations.insert(tracking_id, token.clone()).await;

        // Deadline timer; fires the token and drops the registry entry when
        // the limit elapses. The `cancelled` arm reclaims the task as soon
        // as the execution settles.
        let deadline = limits.execution_time_limit.map(|limit| {
            let token = token.clone();
            let cancellations = self.cancellations.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        token.cancel();
                        cancellations.remove(tracking_id).await;
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let outcome = match record.command::<C>() {
            Ok(command) => {
                command
                    .execute(token.clone())
                    .instrument(telemetry::command_dispatch_span(tracking_id, self.queue_id))
                    .await
            }
            Err(err) => Err(err),
        };

        token.cancel();
        if let Some(handle) = deadline {
            let _ = handle.await;
        }
        self.cancellations.remove(tracking_id).await;

        match outcome {
            Ok(()) => {
                retry_until_accepted(
                    &self.shutdown,
                    limits.storage_retry_delay,
                    "mark job complete",
                    || self.store.mark_complete(&record, self.shutdown.clone()),
                )
                .await;
            }
            Err(err) => {
                error!(
                    %tracking_id,
                    queue_id = %self.queue_id,
                    error = ?err,
                    "command execution failed"
                );
                retry_until_accepted(
                    &self.shutdown,
                    limits.storage_retry_delay,
                    "record job failure",
                    || self.store.record_failure(&record, &err, self.shutdown.clone()),
                )
                .await;
            }
        }
    }
}

/// Type-erased queue surface held by the registry.
///
/// Lets the registry keep a uniform value per command type; the typed
/// enqueue façade downcasts back through [`ErasedQueue::as_any`].
#[async_trait]
pub trait ErasedQueue: Send + Sync + 'static {
    /// The queue's stable identifier.
    fn queue_id(&self) -> QueueId;

    /// Downcast support for the typed enqueue façade.
    fn as_any(&self) -> &dyn Any;

    /// Cancel a stored or in-flight job by tracking id.
    async fn cancel_job(
        &self,
        tracking_id: TrackingId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<C: Command> ErasedQueue for CommandQueue<C> {
    fn queue_id(&self) -> QueueId {
        CommandQueue::queue_id(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn cancel_job(
        &self,
        tracking_id: TrackingId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        CommandQueue::cancel_job(self, tracking_id, cancel).await
    }
}
