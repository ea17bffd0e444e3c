//! An in-memory stream store, useful for testing and development.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::{
    Error, Result,
    store::{EventData, RecordedEvent, StreamStore, unchanged_version},
    version::ExpectedVersion,
};

// Type aliases to keep complex generic types readable and satisfy clippy::type-complexity.
type EventStream<R> = Vec<RecordedEvent<R>>;

/// Thread-safe map keyed by stream name
type StoreMap<R> = DashMap<String, EventStream<R>>;

/// An in-memory, thread-safe stream store.
///
/// This is useful for testing or for applications that do not require a
/// persistent event store. Cloning the store shares the underlying streams.
#[derive(Debug)]
pub struct InMemoryStreamStore<R> {
    streams: Arc<StoreMap<R>>,
}

impl<R> Default for InMemoryStreamStore<R> {
    fn default() -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
        }
    }
}

impl<R> Clone for InMemoryStreamStore<R> {
    fn clone(&self) -> Self {
        Self {
            streams: Arc::clone(&self.streams),
        }
    }
}

impl<R: Clone> InMemoryStreamStore<R> {
    /// Overwrites the payload of the event at `position` in `stream`.
    ///
    /// Returns `false` if no such event exists. Handy for simulating corrupt
    /// records in tests.
    pub fn replace_payload(&self, stream: &str, position: i64, payload: R) -> bool {
        let Some(mut events) = self.streams.get_mut(stream) else {
            return false;
        };
        match events.iter_mut().find(|e| e.position == position) {
            Some(event) => {
                event.payload = payload;
                true
            }
            None => false,
        }
    }

    /// Number of events currently held in `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams.get(stream).map_or(0, |s| s.len())
    }
}

#[async_trait]
impl<R> StreamStore for InMemoryStreamStore<R>
where
    R: Clone + Send + Sync + 'static,
{
    type Raw = R;

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData<R>>,
    ) -> Result<i64> {
        // The entry guard holds the shard lock, so the check and the write
        // below are atomic with respect to other appends on this stream.
        let mut entry = self.streams.entry(stream.to_string()).or_default();

        let actual = entry.last().map(|e| e.position);
        if !expected.matches(actual) {
            return Err(Error::Conflict {
                stream: stream.to_string(),
                expected,
                actual: actual.unwrap_or(crate::version::NEW_STREAM),
            });
        }

        if events.is_empty() {
            warn!("No events in batch. Exiting");
            return Ok(unchanged_version(expected, actual));
        }

        let mut position = actual.unwrap_or(crate::version::NEW_STREAM);
        for data in events {
            position += 1;
            entry.push(RecordedEvent::new(stream, position, data));
        }

        debug!(version = position, "Written events to stream");
        Ok(position)
    }

    #[instrument(skip(self))]
    async fn read(&self, stream: &str, start: i64) -> Result<Vec<RecordedEvent<R>>> {
        match self.streams.get(stream) {
            Some(events) => Ok(events
                .iter()
                .filter(|e| e.position >= start)
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }
}
