use async_trait::async_trait;
use chrono::Utc;
use conveyor::{
    BatchQuery, EventRecord, EventStore, JobRecord, JobStore, SubscriberId, TrackingId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// In-memory job store honoring the dispatchability predicate, with a call
/// log and scriptable failure injection for exercising the retry paths.
///
/// Failure policy on [`JobStore::record_failure`] is dead-letter: the
/// record is retired so tests observe exactly one execution per failing
/// job.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<JobStoreState>>,
}

#[derive(Default)]
struct JobStoreState {
    records: HashMap<TrackingId, JobRecord>,
    mark_complete_calls: Vec<TrackingId>,
    cancel_calls: Vec<TrackingId>,
    failure_calls: Vec<(TrackingId, String)>,
    batch_calls: usize,
    batch_failures_seen: usize,
    fail_batches: usize,
    fail_stores: usize,
    fail_mark_completes: usize,
    fail_failure_reports: usize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch fetches fail.
    pub fn fail_next_batches(&self, n: usize) {
        self.inner.lock().fail_batches = n;
    }

    /// Make the next `n` store calls fail.
    pub fn fail_next_stores(&self, n: usize) {
        self.inner.lock().fail_stores = n;
    }

    /// Make the next `n` completion marks fail.
    pub fn fail_next_mark_completes(&self, n: usize) {
        self.inner.lock().fail_mark_completes = n;
    }

    /// Make the next `n` failure reports fail.
    pub fn fail_next_failure_reports(&self, n: usize) {
        self.inner.lock().fail_failure_reports = n;
    }

    /// Stored record for a tracking id, if any.
    pub fn record(&self, tracking_id: TrackingId) -> Option<JobRecord> {
        self.inner.lock().records.get(&tracking_id).cloned()
    }

    /// Whether the record exists and is complete (or cancelled).
    pub fn is_complete(&self, tracking_id: TrackingId) -> bool {
        self.inner
            .lock()
            .records
            .get(&tracking_id)
            .map(|record| record.is_complete)
            .unwrap_or(false)
    }

    /// Accepted completion marks, in order.
    pub fn mark_complete_calls(&self) -> Vec<TrackingId> {
        self.inner.lock().mark_complete_calls.clone()
    }

    /// Accepted cancel calls, in order.
    pub fn cancel_calls(&self) -> Vec<TrackingId> {
        self.inner.lock().cancel_calls.clone()
    }

    /// Accepted failure reports as (tracking id, error message).
    pub fn failure_calls(&self) -> Vec<(TrackingId, String)> {
        self.inner.lock().failure_calls.clone()
    }

    /// Total batch fetches attempted, including injected failures.
    pub fn batch_calls(&self) -> usize {
        self.inner.lock().batch_calls
    }

    /// Batch fetches that failed through injection.
    pub fn batch_failures_seen(&self) -> usize {
        self.inner.lock().batch_failures_seen
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn store_job(
        &self,
        record: &JobRecord,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock();
        if state.fail_stores > 0 {
            state.fail_stores -= 1;
            anyhow::bail!("injected store_job failure");
        }
        state.records.insert(record.tracking_id, record.clone());
        Ok(())
    }

    async fn next_batch(
        &self,
        query: BatchQuery,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let mut state = self.inner.lock();
        state.batch_calls += 1;
        if state.fail_batches > 0 {
            state.fail_batches -= 1;
            state.batch_failures_seen += 1;
            anyhow::bail!("injected next_batch failure");
        }

        let now = Utc::now();
        let mut due: Vec<JobRecord> = state
            .records
            .values()
            .filter(|record| record.queue_id == query.queue_id && record.is_dispatchable(now))
            .cloned()
            .collect();
        due.sort_by_key(|record| record.execute_after);
        due.truncate(query.limit);
        Ok(due)
    }

    async fn mark_complete(
        &self,
        record: &JobRecord,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock();
        if state.fail_mark_completes > 0 {
            state.fail_mark_completes -= 1;
            anyhow::bail!("injected mark_complete failure");
        }
        let Some(stored) = state.records.get_mut(&record.tracking_id) else {
            anyhow::bail!("unknown job: {}", record.tracking_id);
        };
        stored.is_complete = true;
        state.mark_complete_calls.push(record.tracking_id);
        Ok(())
    }

    async fn cancel_job(
        &self,
        tracking_id: TrackingId,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock();
        let Some(stored) = state.records.get_mut(&tracking_id) else {
            anyhow::bail!("unknown job: {tracking_id}");
        };
        stored.is_complete = true;
        state.cancel_calls.push(tracking_id);
        Ok(())
    }

    async fn record_failure(
        &self,
        record: &JobRecord,
        error: &anyhow::Error,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock();
        if state.fail_failure_reports > 0 {
            state.fail_failure_reports -= 1;
            anyhow::bail!("injected record_failure failure");
        }
        if let Some(stored) = state.records.get_mut(&record.tracking_id) {
            stored.is_complete = true;
        }
        tracing::warn!("job {} dead-lettered: {error}", record.tracking_id);
        state
            .failure_calls
            .push((record.tracking_id, error.to_string()));
        Ok(())
    }
}

/// In-memory event store: an append-only list per subscriber with the same
/// failure injection as [`InMemoryJobStore`].
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<EventStoreState>>,
}

#[derive(Default)]
struct EventStoreState {
    records: Vec<EventRecord>,
    store_calls: usize,
    fail_stores: usize,
    fail_fetches: usize,
    fail_mark_completes: usize,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail.
    pub fn fail_next_stores(&self, n: usize) {
        self.inner.lock().fail_stores = n;
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.inner.lock().fail_fetches = n;
    }

    /// Make the next `n` completion marks fail.
    pub fn fail_next_mark_completes(&self, n: usize) {
        self.inner.lock().fail_mark_completes = n;
    }

    /// All records, in arrival order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.inner.lock().records.clone()
    }

    /// Number of completed records for the subscriber.
    pub fn completed_count(&self, subscriber_id: SubscriberId) -> usize {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|record| record.subscriber_id == subscriber_id && record.is_complete)
            .count()
    }

    /// Total store calls attempted, including injected failures.
    pub fn store_calls(&self) -> usize {
        self.inner.lock().store_calls
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        record: &EventRecord,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock();
        state.store_calls += 1;
        if state.fail_stores > 0 {
            state.fail_stores -= 1;
            anyhow::bail!("injected store_event failure");
        }
        state.records.push(record.clone());
        Ok(())
    }

    async fn next_event(
        &self,
        subscriber_id: SubscriberId,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Option<EventRecord>> {
        let mut state = self.inner.lock();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            anyhow::bail!("injected next_event failure");
        }
        let now = Utc::now();
        Ok(state
            .records
            .iter()
            .find(|record| record.subscriber_id == subscriber_id && record.is_deliverable(now))
            .cloned())
    }

    async fn mark_complete(
        &self,
        record: &EventRecord,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.lock();
        if state.fail_mark_completes > 0 {
            state.fail_mark_completes -= 1;
            anyhow::bail!("injected mark_complete failure");
        }
        let Some(stored) = state.records.iter_mut().find(|stored| {
            !stored.is_complete
                && stored.subscriber_id == record.subscriber_id
                && stored.event_type == record.event_type
                && stored.event == record.event
        }) else {
            anyhow::bail!("unknown event record for subscriber {}", record.subscriber_id);
        };
        stored.is_complete = true;
        Ok(())
    }
}
