//! Conveyor - persistent per-command-type job queues with a durable event
//! subscriber pipeline.
//!
//! Producers hand a typed command to the runtime; the runtime persists it
//! through a pluggable storage provider, and a background drain task per
//! command type executes due work with bounded concurrency, per-item
//! deadlines, cooperative cancellation, and infinite-retry failure
//! accounting against the store. A companion pipeline turns a long-lived
//! remote event stream into durable records and drains them into handlers.
//!
//! # Core Concepts
//!
//! - **Command**: the fundamental unit of work. User-defined types
//!   implement the [`Command`] trait so they can be enqueued, persisted and
//!   executed.
//!
//! - **Storage**: the [`JobStore`] and [`EventStore`] traits abstract the
//!   persistence backend; the core dictates only the logical record shape
//!   ([`JobRecord`], [`EventRecord`]) and supplies the retry policy.
//!
//! - **Queue**: one [`CommandQueue`] per command type, with a readiness
//!   semaphore, a concurrency limit and an execution time limit
//!   ([`QueueLimits`]).
//!
//! - **Registry**: the [`QueueRegistry`] maps command types to their queue
//!   so callers enqueue by value, not by queue handle; the
//!   [`CancellationRegistry`] maps tracking ids to live cancellation
//!   tokens.
//!
//! - **Subscriber**: an [`EventSubscription`] pairs a producer task (remote
//!   stream into the store) with a consumer task (store into an
//!   [`EventHandler`]), decoupled by the store.
//!
//! - **Runtime**: the [`QueueRuntime`] ties the pieces together and owns
//!   shutdown.
//!
//! # Quick Start
//!
//! ```ignore
//! use conveyor::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = QueueRuntimeBuilder::new().build();
//!
//!     // Register a queue for your command type (see conveyor-testkit for
//!     // an in-memory store).
//!     // runtime.register_command::<MyCommand>(store, QueueLimits::new(4)).await?;
//!     // let tracking_id = runtime.enqueue(&MyCommand { .. }, None, None, cancel).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery semantics
//!
//! At-least-once: a record may be dispatched again if its completion mark
//! is lost, so handlers must be idempotent or accept duplicates. Completion
//! marking and failure reporting retry against the store without a cap,
//! because the store is the source of truth and must be kept consistent.
//! Cancellation is cooperative and in-memory; only the store flag survives
//! a restart.

/// Command trait and stable identifiers.
///
/// The `command` module defines the [`Command`] trait together with
/// [`TrackingId`] (per-job, returned from enqueue) and [`QueueId`] (stable
/// hash of the command type name).
pub mod command;

/// Durable record shapes shared with storage providers.
///
/// The `record` module defines [`JobRecord`], [`EventRecord`] and the
/// [`BatchQuery`] parameters, along with the dispatchability predicate.
pub mod record;

/// Storage provider contracts.
///
/// The `storage` module defines the [`JobStore`] and [`EventStore`] traits
/// consumed by the queues and subscribers.
pub mod storage;

/// In-memory cancellation tracking.
///
/// The `cancellation` module provides the [`CancellationRegistry`] mapping
/// tracking ids to the cancellation token of their in-flight execution.
pub mod cancellation;

/// Queue and subscriber configuration.
///
/// The `config` module defines [`QueueLimits`] and [`SubscriberConfig`].
pub mod config;

/// Per-command-type queues and their drain tasks.
///
/// The `queue` module provides [`CommandQueue`] and the type-erased
/// [`ErasedQueue`] surface held by the registry.
pub mod queue;

/// Queue directory and typed enqueue façade.
///
/// The `registry` module provides [`QueueRegistry`] and the
/// [`NoQueueRegistered`] error.
pub mod registry;

/// Durable event subscriber pipeline.
///
/// The `subscriber` module provides [`EventSubscription`], the
/// [`EventSource`] transport contract, the [`EventHandler`] trait and
/// [`SubscriberId`].
pub mod subscriber;

/// Runtime assembly and shutdown.
///
/// The `runtime` module provides [`QueueRuntime`] and
/// [`QueueRuntimeBuilder`].
pub mod runtime;

/// Tracing span helpers for the enqueue, dispatch and event paths.
pub mod telemetry;

pub use cancellation::*;
pub use command::*;
pub use config::*;
pub use queue::*;
pub use record::*;
pub use registry::*;
pub use runtime::*;
pub use storage::*;
pub use subscriber::*;
