//! A persistent stream store using `sled`.
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::{
    Error, Result,
    store::{EventData, RecordedEvent, StreamStore, unchanged_version},
    version::{ExpectedVersion, NEW_STREAM},
};

/// A persistent, thread-safe stream store using `sled`.
///
/// Every stream lives in its own `sled::Tree`, keyed by the big-endian
/// encoding of the event position so that key order is stream order. Records
/// are stored as JSON.
#[derive(Clone)]
pub struct SledStreamStore {
    db: sled::Db,
    // Serializes the version check with the write across appends.
    append_lock: Arc<Mutex<()>>,
}

impl SledStreamStore {
    /// Creates a new `SledStreamStore`.
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    fn tree(&self, stream: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(stream.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))
    }
}

fn position_key(position: i64) -> [u8; 8] {
    // Positions are never negative once written.
    (position as u64).to_be_bytes()
}

fn decode_record(value: &[u8]) -> Result<RecordedEvent<Vec<u8>>> {
    serde_json::from_slice(value).map_err(|e| Error::Store(e.to_string()))
}

#[async_trait]
impl StreamStore for SledStreamStore {
    type Raw = Vec<u8>;

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        stream: &str,
        expected: ExpectedVersion,
        events: Vec<EventData<Vec<u8>>>,
    ) -> Result<i64> {
        let tree = self.tree(stream)?;
        let _guard = self.append_lock.lock();

        let actual = match tree.last().map_err(|e| Error::Store(e.to_string()))? {
            Some((_, value)) => Some(decode_record(&value)?.position),
            None => None,
        };
        if !expected.matches(actual) {
            return Err(Error::Conflict {
                stream: stream.to_string(),
                expected,
                actual: actual.unwrap_or(NEW_STREAM),
            });
        }

        if events.is_empty() {
            warn!("No events in batch. Exiting");
            return Ok(unchanged_version(expected, actual));
        }

        let mut position = actual.unwrap_or(NEW_STREAM);
        let mut records = Vec::with_capacity(events.len());
        for data in events {
            position += 1;
            let record = RecordedEvent::new(stream, position, data);
            let value = serde_json::to_vec(&record).map_err(|e| Error::Store(e.to_string()))?;
            records.push((position_key(position), value));
        }

        tree.transaction(|tx| {
            for (key, value) in &records {
                tx.insert(key.as_slice(), value.as_slice())?;
            }
            Ok(())
        })
        .map_err(|e: sled::transaction::TransactionError| Error::Store(e.to_string()))?;

        debug!(version = position, "Written events to stream");
        Ok(position)
    }

    #[instrument(skip(self))]
    async fn read(&self, stream: &str, start: i64) -> Result<Vec<RecordedEvent<Vec<u8>>>> {
        let tree = self.tree(stream)?;
        let start = position_key(start.max(0));

        tree.range(start..)
            .map(|res| {
                let (_, value) = res.map_err(|e| Error::Store(e.to_string()))?;
                decode_record(&value)
            })
            .collect()
    }
}
