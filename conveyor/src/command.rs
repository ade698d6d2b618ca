use std::fmt::Display;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Namespace for the deterministic v5 identifiers derived from type and
/// subscriber names. Changing it would re-partition every existing store.
pub(crate) const ID_NAMESPACE: Uuid = Uuid::from_u128(0x9f2c_41d6_7b83_4e1a_a0d4_5c6e_8f10_23b7);

/// Core trait for commands that can be enqueued and executed.
///
/// Commands are the fundamental unit of work. Implementors define their own
/// payload types; the runtime serializes them into the storage record on
/// enqueue and deserializes them back before dispatch, so the bounds mirror
/// what the storage layer round-trips.
#[async_trait]
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name of this command type.
    ///
    /// The queue identifier is a hash of this name, so it partitions the
    /// storage backend. The default uses the fully qualified Rust type name;
    /// override it when records must survive a type rename.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Execute the command.
    ///
    /// The token is cancelled when the execution time limit elapses or the
    /// job is cancelled by tracking id. Cancellation is cooperative: a
    /// command that ignores the token is not force-terminated.
    async fn execute(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Per-job opaque identifier returned from enqueue.
///
/// Uses UUID v7 for time-ordered uniqueness. This is the key callers use to
/// cancel a stored or in-flight job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TrackingId(pub Uuid);

impl Default for TrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingId {
    /// Create a new tracking ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for TrackingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a command-type queue.
///
/// A deterministic 128-bit hash (UUID v5) of the command type's name; it
/// partitions job records in the storage backend and never changes for a
/// given type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub Uuid);

impl QueueId {
    /// Derive the queue ID for a command type.
    pub fn for_command<C: Command>() -> Self {
        Self::from_name(C::name())
    }

    /// Derive a queue ID from an explicit type name.
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&ID_NAMESPACE, name.as_bytes()))
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct FirstCommand;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct SecondCommand;

    #[async_trait]
    impl Command for FirstCommand {
        async fn execute(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Command for SecondCommand {
        fn name() -> &'static str {
            "custom.second"
        }

        async fn execute(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_queue_id_is_deterministic() {
        assert_eq!(
            QueueId::for_command::<FirstCommand>(),
            QueueId::for_command::<FirstCommand>()
        );
        assert_eq!(
            QueueId::for_command::<SecondCommand>(),
            QueueId::from_name("custom.second")
        );
    }

    #[test]
    fn test_queue_ids_differ_per_type() {
        assert_ne!(
            QueueId::for_command::<FirstCommand>(),
            QueueId::for_command::<SecondCommand>()
        );
    }

    #[test]
    fn test_tracking_ids_are_unique() {
        let a = TrackingId::new();
        let b = TrackingId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_default_name_is_fully_qualified() {
        assert!(FirstCommand::name().contains("FirstCommand"));
    }
}
