//! End-to-end tests for the command queue runtime against the in-memory
//! store: dispatch lifecycle, deferred execution, cancellation, failure
//! reporting, storage flaps, concurrency ceiling and idle rescans.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor::{NoQueueRegistered, QueueLimits, QueueRuntime, QueueRuntimeBuilder};
use conveyor_testkit::{probe, wait_until, InMemoryJobStore, ProbeCommand};
use tokio_util::sync::CancellationToken;

fn fast_limits(concurrency: usize) -> QueueLimits {
    QueueLimits::new(concurrency)
        .with_sem_wait_limit(Duration::from_millis(100))
        .with_storage_retry_delay(Duration::from_millis(50))
}

async fn runtime_with_queue(limits: QueueLimits) -> (QueueRuntime, InMemoryJobStore) {
    let store = InMemoryJobStore::new();
    let runtime = QueueRuntimeBuilder::new()
        .with_host_identity("queue-tests")
        .build();
    runtime
        .register_command::<ProbeCommand>(Arc::new(store.clone()), limits)
        .await
        .expect("register queue");
    (runtime, store)
}

#[tokio::test]
async fn test_happy_path_marks_complete_exactly_once() {
    let (runtime, store) = runtime_with_queue(fast_limits(2)).await;
    let command = ProbeCommand::new("happy-path", "job-1");

    let tracking_id = runtime
        .enqueue(&command, None, None, CancellationToken::new())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || store.is_complete(tracking_id)).await,
        "job never completed"
    );
    assert_eq!(store.mark_complete_calls(), vec![tracking_id]);
    assert_eq!(probe("happy-path").completed(), vec!["job-1"]);
    assert!(runtime.cancellations().is_empty().await);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deferred_execution_waits_for_window() {
    let (runtime, store) = runtime_with_queue(fast_limits(1)).await;
    let command = ProbeCommand::new("deferred", "late-job");
    let enqueued_at = tokio::time::Instant::now();

    let tracking_id = runtime
        .enqueue(
            &command,
            Some(Utc::now() + chrono::Duration::milliseconds(300)),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        probe("deferred").started().is_empty(),
        "job ran before its execute_after"
    );

    assert!(wait_until(Duration::from_secs(3), || store.is_complete(tracking_id)).await);
    assert!(
        enqueued_at.elapsed() >= Duration::from_millis(300),
        "job completed before its window opened"
    );
}

#[tokio::test]
async fn test_cancel_before_run_removes_record() {
    let (runtime, store) = runtime_with_queue(fast_limits(1)).await;
    let command = ProbeCommand::new("cancel-early", "never-runs");

    let tracking_id = runtime
        .enqueue(
            &command,
            Some(Utc::now() + chrono::Duration::seconds(10)),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    runtime
        .cancel::<ProbeCommand>(tracking_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.cancel_calls(), vec![tracking_id]);
    assert!(store.is_complete(tracking_id));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(probe("cancel-early").started().is_empty());
    assert!(store.mark_complete_calls().is_empty());
}

#[tokio::test]
async fn test_cancel_during_run_signals_handler() {
    let (runtime, store) = runtime_with_queue(fast_limits(1)).await;
    let command = ProbeCommand::new("cancel-inflight", "slow-job").with_work(10_000);

    let tracking_id = runtime
        .enqueue(&command, None, None, CancellationToken::new())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            !probe("cancel-inflight").started().is_empty()
        })
        .await,
        "job never started"
    );

    runtime
        .cancel::<ProbeCommand>(tracking_id, CancellationToken::new())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            probe("cancel-inflight").cancelled() == vec!["slow-job"]
        })
        .await,
        "handler never observed cancellation"
    );
    assert!(store.mark_complete_calls().is_empty());

    let cancellations = runtime.cancellations();
    let mut registry_drained = false;
    for _ in 0..100 {
        if cancellations.is_empty().await {
            registry_drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry_drained, "cancellation entry never removed");
}

#[tokio::test]
async fn test_handler_failure_reported_with_retry() {
    let (runtime, store) = runtime_with_queue(fast_limits(1)).await;
    // First failure report is rejected by the store, forcing a retry.
    store.fail_next_failure_reports(1);
    let command = ProbeCommand::new("handler-failure", "doomed").failing();

    let tracking_id = runtime
        .enqueue(&command, None, None, CancellationToken::new())
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || store.failure_calls().len() == 1).await,
        "failure report never accepted"
    );
    let (failed_id, message) = store.failure_calls().remove(0);
    assert_eq!(failed_id, tracking_id);
    assert!(message.contains("probe failure"));
    assert!(store.mark_complete_calls().is_empty());
}

#[tokio::test]
async fn test_storage_fetch_flaps_then_recovers() {
    let store = InMemoryJobStore::new();
    store.fail_next_batches(3);
    let runtime = QueueRuntimeBuilder::new().build();
    runtime
        .register_command::<ProbeCommand>(Arc::new(store.clone()), fast_limits(1))
        .await
        .unwrap();

    let tracking_id = runtime
        .enqueue(
            &ProbeCommand::new("fetch-flaps", "survivor"),
            None,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || store.is_complete(tracking_id)).await,
        "drain never recovered from fetch failures"
    );
    assert_eq!(store.batch_failures_seen(), 3);
    assert_eq!(probe("fetch-flaps").completed(), vec!["survivor"]);
}

#[tokio::test]
async fn test_concurrency_stays_within_limit() {
    let (runtime, store) = runtime_with_queue(fast_limits(2)).await;

    for i in 0..6 {
        runtime
            .enqueue(
                &ProbeCommand::new("ceiling", format!("job-{i}")).with_work(150),
                None,
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(5), || {
            store.mark_complete_calls().len() == 6
        })
        .await,
        "not all jobs completed"
    );
    assert_eq!(probe("ceiling").max_in_flight(), 2);
}

#[tokio::test]
async fn test_idle_rescan_wakes_without_enqueue() {
    let (runtime, store) = runtime_with_queue(fast_limits(1)).await;

    // The single enqueue releases one permit; picking the deferred record
    // up afterwards relies entirely on the bounded idle rescan.
    let tracking_id = runtime
        .enqueue(
            &ProbeCommand::new("idle-rescan", "sleeper"),
            Some(Utc::now() + chrono::Duration::milliseconds(350)),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || store.is_complete(tracking_id)).await,
        "idle rescan never picked the record up"
    );
    assert!(
        store.batch_calls() >= 3,
        "expected repeated rescans, saw {}",
        store.batch_calls()
    );
}

#[tokio::test]
async fn test_execution_deadline_cancels_handler() {
    let limits = fast_limits(1).with_execution_time_limit(Duration::from_millis(100));
    let (runtime, store) = runtime_with_queue(limits).await;

    let tracking_id = runtime
        .enqueue(
            &ProbeCommand::new("deadline", "overrunner").with_work(10_000),
            None,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            probe("deadline").cancelled() == vec!["overrunner"]
        })
        .await,
        "deadline never fired"
    );
    assert!(store.mark_complete_calls().is_empty());
    assert!(
        wait_until(Duration::from_secs(3), || {
            store
                .failure_calls()
                .iter()
                .any(|(id, _)| *id == tracking_id)
        })
        .await
    );
}

#[tokio::test]
async fn test_expired_window_never_dispatched() {
    let (runtime, store) = runtime_with_queue(fast_limits(1)).await;
    let past = Utc::now() - chrono::Duration::milliseconds(10);

    let tracking_id = runtime
        .enqueue(
            &ProbeCommand::new("expired", "ghost"),
            Some(past - chrono::Duration::milliseconds(10)),
            Some(past),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(probe("expired").started().is_empty());
    assert!(!store.is_complete(tracking_id));
}

#[tokio::test]
async fn test_shutdown_stops_drain() {
    let (runtime, store) = runtime_with_queue(fast_limits(1)).await;

    let tracking_id = runtime
        .enqueue(
            &ProbeCommand::new("shutdown", "last-job"),
            None,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(3), || store.is_complete(tracking_id)).await);

    tokio::time::timeout(Duration::from_secs(5), runtime.shutdown())
        .await
        .expect("shutdown timed out")
        .unwrap();

    let fetches_at_shutdown = store.batch_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.batch_calls(), fetches_at_shutdown);
}

#[tokio::test]
async fn test_enqueue_without_queue_is_configuration_error() {
    let runtime = QueueRuntimeBuilder::new().build();

    let err = runtime
        .enqueue(
            &ProbeCommand::new("unregistered", "nope"),
            None,
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(err.downcast_ref::<NoQueueRegistered>().is_some());
}
