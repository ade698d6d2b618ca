use std::future::Future;

use async_trait::async_trait;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::command::TrackingId;
use crate::record::{BatchQuery, EventRecord, JobRecord};
use crate::subscriber::SubscriberId;

/// Storage provider contract for job records.
///
/// Implementors provide durable persistence; the core supplies retry policy.
/// Every operation may fail with an arbitrary error; write failures inside
/// the drain path are retried with a backoff until they succeed or the
/// process stops.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly-minted record; must be durable before returning.
    async fn store_job(&self, record: &JobRecord, cancel: CancellationToken)
        -> anyhow::Result<()>;

    /// Return up to `query.limit` records for the queue that satisfy
    /// [`JobRecord::is_dispatchable`] now. Order is backend-defined.
    async fn next_batch(
        &self,
        query: BatchQuery,
        cancel: CancellationToken,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Durably set `is_complete` on the record.
    async fn mark_complete(
        &self,
        record: &JobRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Mark the record so it is never again returned by [`Self::next_batch`].
    async fn cancel_job(
        &self,
        tracking_id: TrackingId,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Record a handler execution failure. Policy (reschedule, dead-letter,
    /// drop) is the provider's choice; the core only reports.
    async fn record_failure(
        &self,
        record: &JobRecord,
        error: &anyhow::Error,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Storage provider contract for event records.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a received event; must be durable before returning.
    async fn store_event(
        &self,
        record: &EventRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Return the next incomplete, unexpired record for the subscriber, or
    /// `None` when there is no work.
    async fn next_event(
        &self,
        subscriber_id: SubscriberId,
        cancel: CancellationToken,
    ) -> anyhow::Result<Option<EventRecord>>;

    /// Durably set `is_complete` on the record.
    async fn mark_complete(
        &self,
        record: &EventRecord,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Retry a storage write until it is accepted or the process stops.
///
/// The storage is the source of truth and must be kept consistent, so there
/// is no retry cap. Returns `false` when shutdown interrupted the loop
/// before the write was accepted.
pub(crate) async fn retry_until_accepted<F, Fut>(
    shutdown: &CancellationToken,
    delay: Duration,
    operation: &str,
    mut attempt: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    loop {
        if shutdown.is_cancelled() {
            return false;
        }
        match attempt().await {
            Ok(()) => return true,
            Err(err) => {
                warn!(operation, error = %err, "storage write failed; retrying");
                if sleep_or_shutdown(shutdown, delay).await {
                    return false;
                }
            }
        }
    }
}

/// Sleep for `delay`, returning `true` if shutdown fired first.
pub(crate) async fn sleep_or_shutdown(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
