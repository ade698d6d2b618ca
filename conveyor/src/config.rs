use tokio::time::Duration;

/// Lifetime of a freshly stored job or event record: four hours.
pub fn default_record_ttl() -> chrono::Duration {
    chrono::Duration::hours(4)
}

/// Limits governing a single command queue.
///
/// Set once after construction, before the first drain; setting them starts
/// the drain task.
#[derive(Clone, Debug)]
pub struct QueueLimits {
    /// Maximum number of in-flight executions within the queue.
    pub concurrency: usize,
    /// Per-execution deadline; `None` means no deadline.
    pub execution_time_limit: Option<Duration>,
    /// Maximum idle wait before a forced rescan once the queue has ever
    /// been used.
    pub sem_wait_limit: Duration,
    /// Backoff between storage retries (fetch errors and write retry
    /// loops).
    pub storage_retry_delay: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            concurrency: 1,
            execution_time_limit: None,
            sem_wait_limit: Duration::from_secs(60),
            storage_retry_delay: Duration::from_secs(5),
        }
    }
}

impl QueueLimits {
    /// Create limits with the given concurrency and defaults elsewhere.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Self::default()
        }
    }

    /// Set the per-execution deadline.
    pub fn with_execution_time_limit(mut self, limit: Duration) -> Self {
        self.execution_time_limit = Some(limit);
        self
    }

    /// Set the maximum idle wait before a forced rescan.
    pub fn with_sem_wait_limit(mut self, limit: Duration) -> Self {
        self.sem_wait_limit = limit;
        self
    }

    /// Set the storage retry backoff.
    pub fn with_storage_retry_delay(mut self, delay: Duration) -> Self {
        self.storage_retry_delay = delay;
        self
    }
}

/// Timing configuration for an event subscriber pair.
#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    /// Sleep between polls when the store has no work.
    pub idle_poll_interval: Duration,
    /// Backoff after provider errors, handler errors and stream reopens.
    pub retry_delay: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_millis(300),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl SubscriberConfig {
    /// Set the idle poll interval.
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Set the retry backoff.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_limit_defaults() {
        let limits = QueueLimits::default();
        assert_eq!(limits.concurrency, 1);
        assert!(limits.execution_time_limit.is_none());
        assert_eq!(limits.sem_wait_limit, Duration::from_secs(60));
        assert_eq!(limits.storage_retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_concurrency_floor() {
        assert_eq!(QueueLimits::new(0).concurrency, 1);
    }

    #[test]
    fn test_subscriber_defaults() {
        let config = SubscriberConfig::default();
        assert_eq!(config.idle_poll_interval, Duration::from_millis(300));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }
}
