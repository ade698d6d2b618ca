use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::{Command, QueueId, TrackingId};
use crate::config::default_record_ttl;
use crate::subscriber::SubscriberId;

/// Durable record for a single enqueued job.
///
/// Owned logically by the core, physically by the storage provider. The
/// command payload is kept as JSON so the backend can persist it without
/// knowing the concrete type; the queue deserializes it back before
/// dispatch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Globally unique identifier, assigned at enqueue.
    pub tracking_id: TrackingId,
    /// Stable hash of the command type name; partitions records by queue.
    pub queue_id: QueueId,
    /// Serialized command payload.
    pub command: serde_json::Value,
    /// Earliest instant at which the job is eligible to run.
    pub execute_after: DateTime<Utc>,
    /// Instant past which the job must not run.
    pub expire_on: DateTime<Utc>,
    /// Transitions false to true exactly once, on completion or cancel.
    pub is_complete: bool,
}

impl JobRecord {
    /// Build a fresh record for a command.
    ///
    /// `execute_after` defaults to now, `expire_on` to now plus four hours.
    /// An inverted eligibility window is rejected.
    pub fn new<C: Command>(
        command: &C,
        execute_after: Option<DateTime<Utc>>,
        expire_on: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Self> {
        let now = Utc::now();
        let execute_after = execute_after.unwrap_or(now);
        let expire_on = expire_on.unwrap_or(now + default_record_ttl());
        if execute_after > expire_on {
            anyhow::bail!(
                "invalid eligibility window: execute_after {} is past expire_on {}",
                execute_after,
                expire_on
            );
        }

        Ok(Self {
            tracking_id: TrackingId::new(),
            queue_id: QueueId::for_command::<C>(),
            command: serde_json::to_value(command)
                .with_context(|| format!("serializing command {}", C::name()))?,
            execute_after,
            expire_on,
            is_complete: false,
        })
    }

    /// Deserialize the payload back to the expected command type.
    pub fn command<C: Command>(&self) -> anyhow::Result<C> {
        serde_json::from_value(self.command.clone())
            .with_context(|| format!("deserializing command {}", C::name()))
    }

    /// Replace the payload with a new command value.
    pub fn set_command<C: Command>(&mut self, command: &C) -> anyhow::Result<()> {
        self.command = serde_json::to_value(command)
            .with_context(|| format!("serializing command {}", C::name()))?;
        Ok(())
    }

    /// The batch-fetch predicate: incomplete and inside the eligibility
    /// window at `now`. Providers may honor it natively or filter in memory.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete && self.execute_after <= now && now <= self.expire_on
    }
}

/// Parameters for a job batch fetch.
#[derive(Clone, Copy, Debug)]
pub struct BatchQuery {
    /// Queue whose records to fetch.
    pub queue_id: QueueId,
    /// Maximum number of records to return.
    pub limit: usize,
}

/// Durable record for a single received event.
///
/// Mirrors [`JobRecord`] for the subscriber pipeline: the producer task
/// writes one per received event, the consumer task drains them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Stable subscriber hash; partitions records by subscriber.
    pub subscriber_id: SubscriberId,
    /// Fully qualified event type name.
    pub event_type: String,
    /// Serialized event payload.
    pub event: serde_json::Value,
    /// Instant past which the event must not be delivered.
    pub expire_on: DateTime<Utc>,
    /// Transitions false to true on successful handler completion.
    pub is_complete: bool,
}

impl EventRecord {
    /// Build a fresh record for a received event; expires four hours out.
    pub fn new<E: Serialize>(subscriber_id: SubscriberId, event: &E) -> anyhow::Result<Self> {
        let event_type = std::any::type_name::<E>().to_string();
        Ok(Self {
            subscriber_id,
            event: serde_json::to_value(event)
                .with_context(|| format!("serializing event {event_type}"))?,
            event_type,
            expire_on: Utc::now() + default_record_ttl(),
            is_complete: false,
        })
    }

    /// Deserialize the payload back to the expected event type.
    pub fn event<E: DeserializeOwned>(&self) -> anyhow::Result<E> {
        serde_json::from_value(self.event.clone())
            .with_context(|| format!("deserializing event {}", self.event_type))
    }

    /// Delivery predicate: incomplete and not yet expired at `now`.
    pub fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete && now <= self.expire_on
    }
}
