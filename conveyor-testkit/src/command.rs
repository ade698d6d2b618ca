use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use conveyor::Command;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

static PROBES: OnceLock<Mutex<HashMap<String, Arc<ProbeGroup>>>> = OnceLock::new();

/// Look up (or create) the probe group with the given name.
///
/// Probe groups are process-global so that commands, which round-trip
/// through the store as plain data, can report their executions back to the
/// test that enqueued them. Use one group per test to keep assertions
/// isolated under parallel test execution.
pub fn probe(group: &str) -> Arc<ProbeGroup> {
    let groups = PROBES.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = groups.lock();
    Arc::clone(guard.entry(group.to_string()).or_default())
}

/// Observation point for [`ProbeCommand`] executions.
#[derive(Default)]
pub struct ProbeGroup {
    state: Mutex<ProbeState>,
}

#[derive(Default)]
struct ProbeState {
    in_flight: usize,
    max_in_flight: usize,
    started: Vec<String>,
    completed: Vec<String>,
    cancelled: Vec<String>,
}

impl ProbeGroup {
    fn begin(&self, label: &str) {
        let mut state = self.state.lock();
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        state.started.push(label.to_string());
    }

    fn end(&self, label: &str, was_cancelled: bool) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if was_cancelled {
            state.cancelled.push(label.to_string());
        } else {
            state.completed.push(label.to_string());
        }
    }

    /// Labels whose execution has started, in start order.
    pub fn started(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    /// Labels that ran to the end of their work.
    pub fn completed(&self) -> Vec<String> {
        self.state.lock().completed.clone()
    }

    /// Labels whose execution observed cancellation.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    /// Current number of in-flight executions.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// High-water mark of concurrent executions.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

/// A command whose execution is observable through a [`ProbeGroup`].
///
/// Sleeps cooperatively for `work_ms`, bailing out as soon as the
/// cancellation token fires, then succeeds or fails per `fail`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeCommand {
    /// Probe group the execution reports to.
    pub group: String,
    /// Label identifying this command within the group.
    pub label: String,
    /// Simulated work duration in milliseconds.
    pub work_ms: u64,
    /// Whether the execution fails after its work completes.
    pub fail: bool,
}

impl ProbeCommand {
    pub fn new(group: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            label: label.into(),
            work_ms: 0,
            fail: false,
        }
    }

    pub fn with_work(mut self, work_ms: u64) -> Self {
        self.work_ms = work_ms;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl Command for ProbeCommand {
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let group = probe(&self.group);
        group.begin(&self.label);

        let was_cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(Duration::from_millis(self.work_ms)) => false,
        };

        group.end(&self.label, was_cancelled);

        if was_cancelled {
            anyhow::bail!("execution cancelled: {}", self.label);
        }
        if self.fail {
            anyhow::bail!("probe failure: {}", self.label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_records_success() {
        let command = ProbeCommand::new("testkit-success", "a");
        command.execute(CancellationToken::new()).await.unwrap();

        let group = probe("testkit-success");
        assert_eq!(group.started(), vec!["a"]);
        assert_eq!(group.completed(), vec!["a"]);
        assert!(group.cancelled().is_empty());
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_probe_records_cancellation() {
        let command = ProbeCommand::new("testkit-cancel", "b").with_work(5_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = command.execute(cancel).await;
        assert!(result.is_err());

        let group = probe("testkit-cancel");
        assert_eq!(group.cancelled(), vec!["b"]);
        assert!(group.completed().is_empty());
    }

    #[tokio::test]
    async fn test_probe_failure_after_work() {
        let command = ProbeCommand::new("testkit-fail", "c").failing();
        let result = command.execute(CancellationToken::new()).await;
        assert!(result.is_err());

        let group = probe("testkit-fail");
        assert_eq!(group.completed(), vec!["c"]);
    }
}
