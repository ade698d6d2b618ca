use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::command::ID_NAMESPACE;
use crate::config::SubscriberConfig;
use crate::record::EventRecord;
use crate::storage::{retry_until_accepted, sleep_or_shutdown, EventStore};
use crate::telemetry;

/// Stable identifier of an event subscriber.
///
/// A deterministic 128-bit hash of host identity, handler type name and
/// channel target. It is sent to the transport to resume the stream across
/// reconnects and partitions event records in the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    /// Derive the subscriber id for a (host, handler, channel) triple.
    pub fn derive(host_identity: &str, handler_name: &str, channel: &str) -> Self {
        let source = format!("{host_identity}\n{handler_name}\n{channel}");
        Self(Uuid::new_v5(&ID_NAMESPACE, source.as_bytes()))
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The remote stream of events for one subscriber.
pub type EventStream<E> = BoxStream<'static, anyhow::Result<E>>;

/// Transport producing events for a subscriber.
///
/// Consumed as an opaque async sequence: the implementation owns the wire
/// protocol. Close of the stream signals stream end, not subscriber
/// removal, and the transport must tolerate reopening by the same
/// identifier.
#[async_trait]
pub trait EventSource<E>: Send + Sync {
    /// Open the event stream for the subscriber.
    async fn subscribe(
        &self,
        subscriber_id: SubscriberId,
        cancel: CancellationToken,
    ) -> anyhow::Result<EventStream<E>>;
}

/// Handler invoked once per delivered event.
///
/// A fresh instance is obtained from the factory for every delivery, so
/// handlers may hold per-delivery state.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// The event type this handler consumes.
    type Event: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable name of this handler type, part of the subscriber identity.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handle one event. An error leaves the record incomplete so it is
    /// delivered again.
    async fn handle(&self, event: Self::Event) -> anyhow::Result<()>;
}

/// Paired producer and consumer tasks for one (event type, handler) pair.
///
/// The producer drains the remote stream into the store; the consumer
/// drains the store into the handler. The two are decoupled by the store,
/// so the producer can outrun the consumer without loss.
pub struct EventSubscription<H: EventHandler> {
    subscriber_id: SubscriberId,
    source: Arc<dyn EventSource<H::Event>>,
    store: Arc<dyn EventStore>,
    handler_factory: Arc<dyn Fn() -> H + Send + Sync>,
    config: SubscriberConfig,
    shutdown: CancellationToken,
}

impl<H: EventHandler> std::fmt::Debug for EventSubscription<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("subscriber_id", &self.subscriber_id)
            .field("handler", &H::name())
            .field("config", &self.config)
            .finish()
    }
}

impl<H: EventHandler> EventSubscription<H> {
    /// Create a subscription; nothing runs until [`Self::spawn`].
    pub fn new(
        subscriber_id: SubscriberId,
        source: Arc<dyn EventSource<H::Event>>,
        store: Arc<dyn EventStore>,
        handler_factory: Arc<dyn Fn() -> H + Send + Sync>,
        config: SubscriberConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            subscriber_id,
            source,
            store,
            handler_factory,
            config,
            shutdown,
        }
    }

    /// The subscription's stable identifier.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Spawn the producer and consumer tasks. Returns their handles for
    /// joining at shutdown.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let producer = tokio::spawn(Arc::clone(&self).produce());
        let consumer = tokio::spawn(self.consume());
        (producer, consumer)
    }

    /// Producer: remote stream to store. Exits only on shutdown; a failed
    /// or closed stream is reopened after the retry delay.
    async fn produce(self: Arc<Self>) {
        info!(subscriber_id = %self.subscriber_id, handler = H::name(), "event producer started");

        while !self.shutdown.is_cancelled() {
            let stream = match self
                .source
                .subscribe(self.subscriber_id, self.shutdown.clone())
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(
                        subscriber_id = %self.subscriber_id,
                        error = %err,
                        "event stream open failed"
                    );
                    if sleep_or_shutdown(&self.shutdown, self.config.retry_delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.pump_stream(stream).await;

            if sleep_or_shutdown(&self.shutdown, self.config.retry_delay).await {
                break;
            }
        }

        info!(subscriber_id = %self.subscriber_id, "event producer stopped");
    }

    /// Forward events from one open stream into the store until the stream
    /// ends, fails, or shutdown is requested.
    async fn pump_stream(&self, mut stream: EventStream<H::Event>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                None => {
                    debug!(subscriber_id = %self.subscriber_id, "event stream closed");
                    return;
                }
                Some(Err(err)) => {
                    warn!(
                        subscriber_id = %self.subscriber_id,
                        error = %err,
                        "event stream failed"
                    );
                    return;
                }
                Some(Ok(event)) => {
                    let record = match EventRecord::new(self.subscriber_id, &event) {
                        Ok(record) => record,
                        Err(err) => {
                            error!(
                                subscriber_id = %self.subscriber_id,
                                error = ?err,
                                "event not serializable; dropped"
                            );
                            continue;
                        }
                    };
                    retry_until_accepted(
                        &self.shutdown,
                        self.config.retry_delay,
                        "store event",
                        || self.store.store_event(&record, self.shutdown.clone()),
                    )
                    .await;
                }
            }
        }
    }

    /// Consumer: store to handler. A handler error leaves the record
    /// incomplete so the next poll delivers it again.
    async fn consume(self: Arc<Self>) {
        info!(subscriber_id = %self.subscriber_id, handler = H::name(), "event consumer started");

        while !self.shutdown.is_cancelled() {
            let record = match self
                .store
                .next_event(self.subscriber_id, self.shutdown.clone())
                .await
            {
                Err(err) => {
                    warn!(
                        subscriber_id = %self.subscriber_id,
                        error = %err,
                        "event fetch failed"
                    );
                    if sleep_or_shutdown(&self.shutdown, self.config.retry_delay).await {
                        break;
                    }
                    continue;
                }
                Ok(None) => {
                    if sleep_or_shutdown(&self.shutdown, self.config.idle_poll_interval).await {
                        break;
                    }
                    continue;
                }
                Ok(Some(record)) => record,
            };

            let outcome = match record.event::<H::Event>() {
                Ok(event) => {
                    let handler = (self.handler_factory)();
                    handler
                        .handle(event)
                        .instrument(telemetry::event_handle_span(
                            self.subscriber_id,
                            &record.event_type,
                        ))
                        .await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    retry_until_accepted(
                        &self.shutdown,
                        self.config.retry_delay,
                        "mark event complete",
                        || self.store.mark_complete(&record, self.shutdown.clone()),
                    )
                    .await;
                }
                Err(err) => {
                    error!(
                        subscriber_id = %self.subscriber_id,
                        event_type = %record.event_type,
                        error = ?err,
                        "event handler failed"
                    );
                    if sleep_or_shutdown(&self.shutdown, self.config.retry_delay).await {
                        break;
                    }
                }
            }
        }

        info!(subscriber_id = %self.subscriber_id, "event consumer stopped");
    }
}
