//! # Event Sourcing Engine
//!
//! `eventide` persists event-sourced aggregates and delivers their events to
//! projections. It covers both halves of the model:
//!
//! - the **write path**: an [`AggregateRepository`] loads an aggregate from
//!   its stream (optionally starting from a snapshot), runs commands against
//!   it and appends the resulting events under an optimistic-concurrency
//!   check;
//! - the **read path**: an [`AcknowledgingPublisher`] consumes a durable
//!   subscription with retry, park/skip and resubscribe semantics, and an
//!   [`EventDispatcher`] fans each event out to the registered projections
//!   under a global deadline.
//!
//! ## Core Concepts
//!
//! - **[`Event`]**: an immutable fact with a logical name.
//! - **[`AggregateRegistration`]**: how one aggregate state type is built,
//!   keyed, commanded and folded.
//! - **[`StreamStore`]** / **[`SnapshotStore`]**: the storage ports backend
//!   adapters implement.
//! - **[`EventCodec`]**: turns typed values into raw payloads and back.
//! - **[`SubscriptionClient`]**: the durable-subscription port the publisher
//!   drives.
//! - **[`ProjectionRegistry`]** / **[`ProjectionContext`]**: routing tables
//!   from event types to projection handlers and their lifecycle hooks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use eventide::{
//!     AggregateRegistration, AggregateRegistry, AggregateRepository, Event,
//!     codec::JsonCodec,
//!     store::{in_memory::InMemoryStreamStore, in_memory_snapshot::InMemorySnapshotStore},
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Credited {
//!     amount: u64,
//! }
//!
//! impl Event for Credited {
//!     const EVENT_NAME: &'static str = "Credited";
//! }
//!
//! struct Credit(u64);
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Account {
//!     balance: u64,
//! }
//!
//! async fn bank_account_example() -> eventide::Result<()> {
//!     let registry = AggregateRegistry::builder()
//!         .register(
//!             AggregateRegistration::<Account, JsonCodec>::new(Account::default)
//!                 .persistence_key(|id| format!("account-{id}"))
//!                 .snapshot_key(|id| format!("accountSnapshot-{id}"))
//!                 .command::<Credit, _>(|_, cmd| Ok(vec![Credited { amount: cmd.0 }.into()]))
//!                 .event::<Credited, _>(|account, e| Account {
//!                     balance: account.balance + e.amount,
//!                 }),
//!         )
//!         .build()?;
//!
//!     let repository = AggregateRepository::new(
//!         Arc::new(InMemoryStreamStore::default()),
//!         Some(Arc::new(InMemorySnapshotStore::default())),
//!         Arc::new(registry),
//!         JsonCodec,
//!     )
//!     .with_snapshot_frequency(Some(100));
//!
//!     let mut account = repository.load::<Account>("42").await?;
//!     repository.dispatch_command(&mut account, Credit(10))?;
//!     let version = repository.save(&mut account).await?;
//!     assert_eq!(version, 0);
//!     Ok(())
//! }
//! ```

use std::{fmt::Debug, time::Duration};

pub use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod projection;
pub mod publisher;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod subscription;
pub mod version;

pub use aggregate::{AggregateRegistration, AggregateRegistry, DomainEvent, LoadedAggregate};
pub use codec::EventCodec;
pub use dispatcher::EventDispatcher;
pub use projection::{ProjectionContext, ProjectionRegistry};
pub use publisher::{AcknowledgingPublisher, EventNotification, EventPublisher, RetrySettings};
pub use repository::AggregateRepository;
pub use snapshot::SnapshotStore;
pub use store::StreamStore;
pub use subscription::SubscriptionClient;
pub use version::ExpectedVersion;

/// Boxed error returned by user-supplied projection and context code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required input was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The stream was not at the version the writer expected.
    #[error("concurrency conflict on stream {stream}: expected {expected}, actual {actual}")]
    Conflict {
        /// Stream the append targeted.
        stream: String,
        /// Version the writer expected.
        expected: ExpectedVersion,
        /// Version the stream was actually at.
        actual: i64,
    },
    /// A payload could not be decoded.
    #[error("unable to decode event {event_name}: {reason}")]
    Decode {
        /// Logical name the payload was recorded under.
        event_name: String,
        /// Codec error message.
        reason: String,
    },
    /// A payload was recorded under a name the target does not know.
    #[error("cannot convert event {event_name} to {expected}")]
    InvalidEventType {
        /// Logical name the payload was recorded under.
        event_name: String,
        /// Type the caller asked for.
        expected: &'static str,
    },
    /// A value could not be encoded.
    #[error("unable to encode value: {0}")]
    Encode(String),
    /// No handler is registered for a command type.
    #[error("no command handler registered for {0}")]
    UnregisteredCommand(&'static str),
    /// No applier or name mapping is registered for an event type.
    #[error("no event applier registered for {0}")]
    UnregisteredEvent(&'static str),
    /// No registration exists for an aggregate state type.
    #[error("aggregate {0} is not registered")]
    UnregisteredAggregate(&'static str),
    /// Projections did not finish handling an event in time.
    #[error("timed out after {timeout:?} waiting for projections to handle event {event_id}")]
    TimeoutExceeded {
        /// Event being dispatched.
        event_id: Uuid,
        /// Configured projection handler timeout.
        timeout: Duration,
    },
    /// Dispatching an event to projections failed and the dispatcher stopped.
    #[error("unhandled error dispatching event {event_id}, event publisher stopped")]
    ProjectionDispatchFailed {
        /// Event being dispatched.
        event_id: Uuid,
        /// The failure raised while dispatching.
        #[source]
        source: Box<Error>,
    },
    /// A context's caught-up hook failed and the dispatcher stopped.
    #[error("unhandled error handling caught up notification, event publisher stopped")]
    CaughtUpDispatchFailed {
        /// The failure raised by the hook.
        #[source]
        source: Box<Error>,
    },
    /// A projection handler or context hook failed.
    #[error("projection failed: {0}")]
    Projection(#[source] BoxError),
    /// The subscription could not acknowledge an event and was stopped.
    #[error("subscription stopped: {0}")]
    SubscriptionFatal(String),
    /// Wraps an error from the underlying backend.
    #[error("event store error: {0}")]
    Store(String),
    /// Occurs when a command fails a validation rule.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Returns `true` for optimistic-concurrency conflicts, which callers
    /// resolve by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` when a payload could not become the requested type.
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::InvalidEventType { .. })
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An immutable fact recorded against an aggregate.
///
/// Events must be serializable and carry a stable logical name; the name is
/// what gets stored next to the payload and is used to pick the concrete type
/// when decoding. The `Event` derive macro implements this trait.
pub trait Event: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Logical name the event is stored under.
    const EVENT_NAME: &'static str;
}
