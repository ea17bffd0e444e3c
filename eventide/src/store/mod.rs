//! The store module contains the stream store port and its implementations,
//! together with the in-memory snapshot store and persistent subscription.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, version::ExpectedVersion};

// The in-memory implementations are compiled when the `in-memory` feature is
// enabled (this is the default).
#[cfg(feature = "in-memory")]
/// An in-memory stream store.
pub mod in_memory;

#[cfg(feature = "in-memory")]
/// An in-memory snapshot store.
pub mod in_memory_snapshot;

#[cfg(feature = "in-memory")]
pub mod in_memory_subscription;

// The persistent `sled` implementations are compiled when the `sled-storage`
// feature is enabled.
#[cfg(feature = "sled-storage")]
/// A persistent stream store using `sled`.
pub mod sled;

#[cfg(feature = "sled-storage")]
/// A persistent snapshot store using `sled`.
pub mod sled_snapshot;

/// An event about to be appended to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData<R> {
    /// Unique identifier of the event.
    pub event_id: Uuid,
    /// Logical event name used to pick the concrete type when decoding.
    pub event_name: String,
    /// Encoded payload.
    pub payload: R,
}

impl<R> EventData<R> {
    /// Creates event data with a fresh event id.
    pub fn new(event_name: impl Into<String>, payload: R) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_name: event_name.into(),
            payload,
        }
    }
}

/// An event read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent<R> {
    /// Name of the stream the event belongs to.
    pub stream: String,
    /// Zero-based position of the event within its stream.
    pub position: i64,
    /// Unique identifier of the event.
    pub event_id: Uuid,
    /// Logical event name.
    pub event_name: String,
    /// Encoded payload.
    pub payload: R,
}

impl<R> RecordedEvent<R> {
    /// Records `data` at `position` of `stream`.
    pub fn new(stream: impl Into<String>, position: i64, data: EventData<R>) -> Self {
        Self {
            stream: stream.into(),
            position,
            event_id: data.event_id,
            event_name: data.event_name,
            payload: data.payload,
        }
    }
}

/// An append-only store of named event streams.
///
/// Implementations own the persisted layout. They must honour the
/// [`ExpectedVersion`] check atomically with the write.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Raw payload representation stored by this backend.
    type Raw: Clone + Send + Sync + 'static;

    /// Appends `events` to `stream` and returns the position of the last
    /// event written.
    ///
    /// Fails with [`Error::Conflict`](crate::Error::Conflict) when the stream's
    /// actual version does not satisfy `expected`. An empty batch writes
    /// nothing and returns the unchanged version.
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData<Self::Raw>>,
    ) -> Result<i64>;

    /// Reads `stream` forwards from position `start` (inclusive).
    ///
    /// A stream that does not exist reads as empty.
    async fn read(&self, stream: &str, start: i64) -> Result<Vec<RecordedEvent<Self::Raw>>>;
}

/// Version reported for an empty batch: the expectation when it names a
/// position, otherwise the stream's actual version.
pub(crate) fn unchanged_version(expected: ExpectedVersion, actual: Option<i64>) -> i64 {
    match expected {
        ExpectedVersion::Exact(v) => v,
        _ => actual.unwrap_or(crate::version::NEW_STREAM),
    }
}
