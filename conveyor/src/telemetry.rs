//! Tracing instrumentation helpers.
//!
//! Span constructors for the hot paths of the runtime: enqueue, dispatch
//! and event handling. Callers attach them with `Instrument::instrument`.

use tracing::{info_span, Span};

use crate::command::{QueueId, TrackingId};
use crate::subscriber::SubscriberId;

/// Span for an enqueue operation.
#[must_use]
pub fn command_enqueue_span(command: &str, queue_id: QueueId) -> Span {
    info_span!(
        "conveyor.enqueue",
        command,
        queue_id = %queue_id,
    )
}

/// Span covering one command execution.
#[must_use]
pub fn command_dispatch_span(tracking_id: TrackingId, queue_id: QueueId) -> Span {
    info_span!(
        "conveyor.dispatch",
        tracking_id = %tracking_id,
        queue_id = %queue_id,
    )
}

/// Span covering one event delivery to its handler.
#[must_use]
pub fn event_handle_span(subscriber_id: SubscriberId, event_type: &str) -> Span {
    info_span!(
        "conveyor.handle_event",
        subscriber_id = %subscriber_id,
        event_type,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Construction must be cheap and safe with no subscriber installed.
    #[test]
    fn test_spans_construct_without_subscriber() {
        let queue_id = QueueId::from_name("telemetry-test");
        let _ = command_enqueue_span("cmd", queue_id);
        let _ = command_dispatch_span(TrackingId::new(), queue_id);
        let _ = event_handle_span(SubscriberId::derive("h", "t", "c"), "event");
    }
}
