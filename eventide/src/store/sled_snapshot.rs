use async_trait::async_trait;
use sled::Tree;
use tracing::instrument;

use crate::{
    Error, Result,
    snapshot::{Snapshot, SnapshotStore},
};

/// A persistent, thread-safe snapshot store using `sled`.
///
/// Each snapshot is stored as JSON under its snapshot key, replacing any
/// previous one.
#[derive(Debug, Clone)]
pub struct SledSnapshotStore {
    tree: Tree,
}

impl SledSnapshotStore {
    /// Creates a new `SledSnapshotStore`.
    ///
    /// It is recommended to open a dedicated `sled::Tree` for snapshots,
    /// separate from the ones used for streams.
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl SnapshotStore for SledSnapshotStore {
    type Raw = Vec<u8>;

    #[instrument(skip(self, payload))]
    async fn save(&self, key: &str, version: i64, payload: Vec<u8>) -> Result<()> {
        let value = serde_json::to_vec(&Snapshot::new(version, payload))
            .map_err(|e| Error::Store(e.to_string()))?;
        self.tree
            .insert(key.as_bytes(), value)
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load(&self, key: &str) -> Result<Option<Snapshot<Vec<u8>>>> {
        let value = self
            .tree
            .get(key.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))?;

        value
            .map(|value| serde_json::from_slice(&value).map_err(|e| Error::Store(e.to_string())))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        let store = SledSnapshotStore::new(db.open_tree("snapshots").expect("tree"));

        assert!(store.load("cart-1").await.expect("load").is_none());
        store.save("cart-1", 4, b"old".to_vec()).await.expect("save");
        store.save("cart-1", 9, b"new".to_vec()).await.expect("save");

        let snapshot = store.load("cart-1").await.expect("load").expect("snapshot");
        assert_eq!(snapshot.version(), 9);
        assert_eq!(snapshot.payload(), &b"new".to_vec());
    }
}
