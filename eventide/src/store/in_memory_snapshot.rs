//! An in-memory snapshot store.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::{
    Result,
    snapshot::{Snapshot, SnapshotStore},
};

use dashmap::DashMap;

/// An in-memory, thread-safe snapshot store.
///
/// This is useful for testing or for applications that do not require a
/// persistent snapshot store.
#[derive(Debug)]
pub struct InMemorySnapshotStore<R> {
    snapshots: Arc<DashMap<String, Snapshot<R>>>,
}

impl<R> Default for InMemorySnapshotStore<R> {
    fn default() -> Self {
        Self {
            snapshots: Arc::new(DashMap::new()),
        }
    }
}

impl<R> Clone for InMemorySnapshotStore<R> {
    fn clone(&self) -> Self {
        Self {
            snapshots: Arc::clone(&self.snapshots),
        }
    }
}

#[async_trait]
impl<R> SnapshotStore for InMemorySnapshotStore<R>
where
    R: Clone + Send + Sync + 'static,
{
    type Raw = R;

    #[instrument(skip(self, payload))]
    async fn save(&self, key: &str, version: i64, payload: R) -> Result<()> {
        self.snapshots
            .insert(key.to_string(), Snapshot::new(version, payload));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(&self, key: &str) -> Result<Option<Snapshot<R>>> {
        Ok(self.snapshots.get(key).map(|r| r.clone()))
    }
}
