//! Test fixtures for the conveyor runtime.
//!
//! Provides in-memory storage providers honoring the dispatch predicates,
//! a scripted event transport, and probe commands whose executions are
//! observable from tests. Everything here exists to exercise the runtime's
//! retry, cancellation and concurrency behavior without a real backend.

mod command;
mod source;
mod store;

pub use command::{probe, ProbeCommand, ProbeGroup};
pub use source::{Connection, ScriptedEventSource};
pub use store::{InMemoryEventStore, InMemoryJobStore};

use tokio::time::{Duration, Instant};

/// Poll `condition` every 10 ms until it holds or `timeout` elapses.
/// Returns the final observation.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
