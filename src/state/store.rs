//! Snapshot persistence seam
//!
//! Every coordinator mutation writes through a [`SnapshotStore`]. Stores
//! publish a [`SnapshotEvent`] per write so other views of the same data can
//! follow along without polling.

use super::attempt::{Asset, RefillAttempt};
use crate::error::RefillResult;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Change notification emitted after a save or clear
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    /// Store instance that performed the write
    pub origin: Uuid,
    pub asset: Asset,
    /// `None` after a clear
    pub snapshot: Option<RefillAttempt>,
}

/// Durable per-asset snapshot store
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Identifier stamped on events written by this instance
    fn origin(&self) -> Uuid;

    async fn save(&self, asset: Asset, attempt: &RefillAttempt) -> RefillResult<()>;

    async fn load(&self, asset: Asset) -> RefillResult<Option<RefillAttempt>>;

    async fn clear(&self, asset: Asset) -> RefillResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent>;
}

/// In-process store; used in tests and when no database is configured
pub struct MemorySnapshotStore {
    origin: Uuid,
    snapshots: RwLock<HashMap<Asset, RefillAttempt>>,
    events: broadcast::Sender<SnapshotEvent>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            origin: Uuid::new_v4(),
            snapshots: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    fn origin(&self) -> Uuid {
        self.origin
    }

    async fn save(&self, asset: Asset, attempt: &RefillAttempt) -> RefillResult<()> {
        self.snapshots.write().await.insert(asset, attempt.clone());
        let _ = self.events.send(SnapshotEvent {
            origin: self.origin,
            asset,
            snapshot: Some(attempt.clone()),
        });
        Ok(())
    }

    async fn load(&self, asset: Asset) -> RefillResult<Option<RefillAttempt>> {
        Ok(self.snapshots.read().await.get(&asset).cloned())
    }

    async fn clear(&self, asset: Asset) -> RefillResult<()> {
        self.snapshots.write().await.remove(&asset);
        let _ = self.events.send(SnapshotEvent {
            origin: self.origin,
            asset,
            snapshot: None,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RefillStatus;

    #[tokio::test]
    async fn test_save_load_clear() {
        let store = MemorySnapshotStore::new();
        let mut events = store.subscribe();

        let mut attempt = RefillAttempt::idle(Asset::Link);
        attempt.begin();
        store.save(Asset::Link, &attempt).await.unwrap();

        let loaded = store.load(Asset::Link).await.unwrap().unwrap();
        assert_eq!(loaded.status, RefillStatus::WalletPending);
        assert!(store.load(Asset::Mon).await.unwrap().is_none());

        store.clear(Asset::Link).await.unwrap();
        assert!(store.load(Asset::Link).await.unwrap().is_none());

        let saved = events.recv().await.unwrap();
        assert_eq!(saved.origin, store.origin());
        assert!(saved.snapshot.is_some());
        let cleared = events.recv().await.unwrap();
        assert_eq!(cleared.asset, Asset::Link);
        assert!(cleared.snapshot.is_none());
    }
}
