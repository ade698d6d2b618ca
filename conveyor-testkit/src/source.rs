use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use conveyor::{EventSource, EventStream, SubscriberId};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// One scripted transport connection.
pub enum Connection<E> {
    /// Yield these items, then end the stream.
    Yield(Vec<anyhow::Result<E>>),
    /// Fail the subscribe call itself.
    Fail(String),
    /// Open a stream that never yields and never ends.
    Pending,
}

/// Scripted event transport for subscriber tests.
///
/// Each `subscribe` call consumes the next scripted [`Connection`]; once
/// the script is exhausted, further calls get a pending stream so the
/// producer parks instead of spinning.
pub struct ScriptedEventSource<E> {
    inner: Arc<Mutex<SourceState<E>>>,
}

struct SourceState<E> {
    connections: VecDeque<Connection<E>>,
    subscribe_count: usize,
    subscribers: Vec<SubscriberId>,
}

impl<E> Default for ScriptedEventSource<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceState {
                connections: VecDeque::new(),
                subscribe_count: 0,
                subscribers: Vec::new(),
            })),
        }
    }
}

impl<E> Clone for ScriptedEventSource<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> ScriptedEventSource<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a connection to the script.
    pub fn push_connection(&self, connection: Connection<E>) {
        self.inner.lock().connections.push_back(connection);
    }

    /// Number of subscribe calls observed.
    pub fn subscribe_count(&self) -> usize {
        self.inner.lock().subscribe_count
    }

    /// Subscriber ids observed, in call order.
    pub fn subscribers(&self) -> Vec<SubscriberId> {
        self.inner.lock().subscribers.clone()
    }
}

#[async_trait]
impl<E> EventSource<E> for ScriptedEventSource<E>
where
    E: Send + Sync + 'static,
{
    async fn subscribe(
        &self,
        subscriber_id: SubscriberId,
        _cancel: CancellationToken,
    ) -> anyhow::Result<EventStream<E>> {
        let connection = {
            let mut state = self.inner.lock();
            state.subscribe_count += 1;
            state.subscribers.push(subscriber_id);
            state.connections.pop_front()
        };

        match connection {
            Some(Connection::Yield(items)) => Ok(stream::iter(items).boxed()),
            Some(Connection::Fail(message)) => anyhow::bail!(message),
            Some(Connection::Pending) | None => Ok(stream::pending().boxed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_is_consumed_in_order() {
        let source: ScriptedEventSource<u32> = ScriptedEventSource::new();
        source.push_connection(Connection::Yield(vec![Ok(1), Ok(2)]));
        source.push_connection(Connection::Fail("down".into()));

        let id = SubscriberId::derive("host", "handler", "channel");

        let mut stream = source
            .subscribe(id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert!(stream.next().await.is_none());

        assert!(source
            .subscribe(id, CancellationToken::new())
            .await
            .is_err());

        assert_eq!(source.subscribe_count(), 2);
        assert_eq!(source.subscribers(), vec![id, id]);
    }
}
