//! The snapshot module contains the port for storing aggregate snapshots and
//! the policy deciding when the repository writes one.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A cached fold result at a known stream version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot<R> {
    /// The stream position the state reflects.
    version: i64,
    /// The encoded aggregate state.
    payload: R,
}

impl<R> Snapshot<R> {
    /// Creates a new snapshot.
    pub fn new(version: i64, payload: R) -> Self {
        Self { version, payload }
    }

    /// Returns the stream position the state reflects.
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns the encoded state.
    pub fn payload(&self) -> &R {
        &self.payload
    }

    /// Consumes the snapshot and returns the encoded state.
    pub fn into_payload(self) -> R {
        self.payload
    }
}

/// A snapshot store is responsible for persisting and loading snapshots.
///
/// Snapshots are an optimization to reduce the time it takes to hydrate an
/// aggregate. Instead of replaying all events from the beginning of time, an
/// aggregate can be restored from a recent snapshot and then only replay the
/// events that occurred after it.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Raw payload representation stored by this backend.
    type Raw: Clone + Send + Sync + 'static;

    /// Saves a snapshot under `key`.
    ///
    /// This should overwrite any existing snapshot for the same key.
    async fn save(&self, key: &str, version: i64, payload: Self::Raw) -> Result<()>;

    /// Loads the snapshot stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<Snapshot<Self::Raw>>>;
}

/// Decides whether a save should be followed by a snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotPolicy {
    /// Never write snapshots.
    #[default]
    Never,
    /// Write a snapshot every time the number of events in the stream crosses
    /// a multiple of the frequency.
    EveryNEvents(u64),
}

impl SnapshotPolicy {
    /// Returns `true` when moving the stream from `version_before` to
    /// `version_after` should produce a snapshot.
    pub fn should_snapshot(&self, version_before: i64, version_after: i64) -> bool {
        match *self {
            Self::Never => false,
            Self::EveryNEvents(0) => false,
            Self::EveryNEvents(frequency) => {
                let frequency = frequency as i64;
                // Positions are zero-based, so the event count is version + 1.
                (version_after + 1) / frequency > (version_before + 1) / frequency
            }
        }
    }
}

impl From<Option<u64>> for SnapshotPolicy {
    fn from(frequency: Option<u64>) -> Self {
        frequency.map_or(Self::Never, Self::EveryNEvents)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::first_event_with_frequency_one(SnapshotPolicy::EveryNEvents(1), -1, 0, true)]
    #[case::below_threshold(SnapshotPolicy::EveryNEvents(3), -1, 1, false)]
    #[case::reaching_threshold(SnapshotPolicy::EveryNEvents(3), 1, 2, true)]
    #[case::crossing_threshold_in_one_batch(SnapshotPolicy::EveryNEvents(3), 0, 4, true)]
    #[case::already_past_threshold(SnapshotPolicy::EveryNEvents(3), 2, 3, false)]
    #[case::zero_frequency(SnapshotPolicy::EveryNEvents(0), -1, 10, false)]
    #[case::never(SnapshotPolicy::Never, -1, 100, false)]
    fn snapshot_threshold(
        #[case] policy: SnapshotPolicy,
        #[case] before: i64,
        #[case] after: i64,
        #[case] expected: bool,
    ) {
        assert_eq!(policy.should_snapshot(before, after), expected);
    }
}
