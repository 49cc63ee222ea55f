//! Aggregated view over every asset's refill attempt
//!
//! The board is the process-wide owner of attempt state. Coordinators and the
//! reconciler write through it; presentation reads merged views from it and
//! subscribes to its change feed.

use super::attempt::{Asset, MessageIdRecord, RefillAttempt, RefillStatus};
use super::store::{SnapshotEvent, SnapshotStore};

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

/// Tank, drip and vault amounts for one asset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TankStatus {
    pub tank: U256,
    pub drip_rate: U256,
    pub vault: U256,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetOverview {
    pub tanks: BTreeMap<Asset, TankStatus>,
    pub volatility_multiplier_bps: Option<U256>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Attempt plus presentation links
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    #[serde(flatten)]
    pub attempt: RefillAttempt,
    pub outbound_explorer_url: Option<String>,
    pub inbound_explorer_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefillView {
    /// Every asset in priority order
    pub attempts: Vec<AttemptView>,
    pub any_active: bool,
    /// First non-idle attempt, for single-slot indicators
    pub current: Option<AttemptView>,
    pub overview: FaucetOverview,
}

/// Process-scoped refill state
pub struct RefillBoard {
    attempts: RwLock<HashMap<Asset, RefillAttempt>>,
    /// Last genuine outbound id seen per asset, kept across resets
    last_message_ids: RwLock<HashMap<Asset, MessageIdRecord>>,
    overview: RwLock<FaucetOverview>,
    changes: broadcast::Sender<Asset>,
    explorer_base: Option<String>,
}

impl RefillBoard {
    pub fn new(explorer_base: Option<String>) -> Self {
        let (changes, _) = broadcast::channel(256);
        let attempts = Asset::ALL
            .into_iter()
            .map(|asset| (asset, RefillAttempt::idle(asset)))
            .collect();

        Self {
            attempts: RwLock::new(attempts),
            last_message_ids: RwLock::new(HashMap::new()),
            overview: RwLock::new(FaucetOverview::default()),
            changes,
            explorer_base: explorer_base.map(|b| b.trim_end_matches('/').to_string()),
        }
    }

    /// Seed the board from persisted snapshots
    pub async fn hydrate(&self, store: &dyn SnapshotStore) {
        for asset in Asset::ALL {
            match store.load(asset).await {
                Ok(Some(snapshot)) => self.set(asset, snapshot).await,
                Ok(None) => {}
                Err(e) => warn!("Failed to load snapshot for {}: {}", asset, e),
            }
        }
    }

    pub async fn get(&self, asset: Asset) -> RefillAttempt {
        self.attempts
            .read()
            .await
            .get(&asset)
            .cloned()
            .unwrap_or_else(|| RefillAttempt::idle(asset))
    }

    pub async fn set(&self, asset: Asset, attempt: RefillAttempt) {
        self.track_message_id(asset, &attempt).await;
        self.attempts.write().await.insert(asset, attempt);
        let _ = self.changes.send(asset);
    }

    /// Mutate one attempt in place and return the result
    pub async fn update<F>(&self, asset: Asset, f: F) -> RefillAttempt
    where
        F: FnOnce(&mut RefillAttempt),
    {
        let updated = {
            let mut attempts = self.attempts.write().await;
            let attempt = attempts
                .entry(asset)
                .or_insert_with(|| RefillAttempt::idle(asset));
            f(attempt);
            attempt.clone()
        };

        self.track_message_id(asset, &updated).await;
        let _ = self.changes.send(asset);
        updated
    }

    /// Atomically move an idle attempt into `wallet_pending`
    pub async fn try_claim(&self, asset: Asset) -> Option<RefillAttempt> {
        let claimed = {
            let mut attempts = self.attempts.write().await;
            let attempt = attempts
                .entry(asset)
                .or_insert_with(|| RefillAttempt::idle(asset));
            if !attempt.is_idle() {
                return None;
            }
            attempt.begin();
            attempt.clone()
        };

        let _ = self.changes.send(asset);
        Some(claimed)
    }

    pub async fn last_message_id(&self, asset: Asset) -> Option<MessageIdRecord> {
        self.last_message_ids.read().await.get(&asset).copied()
    }

    /// Remember the attempt's outbound id; a successful refill retires it
    async fn track_message_id(&self, asset: Asset, attempt: &RefillAttempt) {
        let mut ids = self.last_message_ids.write().await;
        if attempt.status == RefillStatus::Success {
            ids.remove(&asset);
            return;
        }

        let Some(record) = attempt.outbound_message_id else {
            return;
        };
        match ids.get(&asset) {
            Some(existing) if existing.id == record.id && existing.source >= record.source => {}
            _ => {
                ids.insert(asset, record);
            }
        }
    }

    /// Another asset already accounts for an in-flight refill
    pub async fn other_active(&self, asset: Asset) -> Option<Asset> {
        self.attempts
            .read()
            .await
            .values()
            .find(|a| a.asset != asset && a.status.is_active())
            .map(|a| a.asset)
    }

    pub async fn set_tank(&self, asset: Asset, status: TankStatus) {
        let mut overview = self.overview.write().await;
        overview.tanks.insert(asset, status);
        overview.updated_at = Some(Utc::now());
    }

    pub async fn set_volatility_multiplier(&self, bps: U256) {
        let mut overview = self.overview.write().await;
        overview.volatility_multiplier_bps = Some(bps);
        overview.updated_at = Some(Utc::now());
    }

    pub async fn overview(&self) -> FaucetOverview {
        self.overview.read().await.clone()
    }

    pub async fn view(&self) -> RefillView {
        let attempts = self.attempts.read().await;
        let ordered: Vec<AttemptView> = Asset::ALL
            .into_iter()
            .map(|asset| {
                let attempt = attempts
                    .get(&asset)
                    .cloned()
                    .unwrap_or_else(|| RefillAttempt::idle(asset));
                self.attempt_view(attempt)
            })
            .collect();
        drop(attempts);

        let current = ordered.iter().find(|v| !v.attempt.is_idle()).cloned();

        RefillView {
            any_active: current.is_some(),
            current,
            attempts: ordered,
            overview: self.overview().await,
        }
    }

    pub fn attempt_view(&self, attempt: RefillAttempt) -> AttemptView {
        AttemptView {
            outbound_explorer_url: attempt.outbound_id().and_then(|id| self.explorer_link(id)),
            inbound_explorer_url: attempt.inbound_id().and_then(|id| self.explorer_link(id)),
            attempt,
        }
    }

    fn explorer_link(&self, id: H256) -> Option<String> {
        self.explorer_base
            .as_ref()
            .map(|base| format!("{}/msg/0x{}", base, hex::encode(id.as_bytes())))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Asset> {
        self.changes.subscribe()
    }

    /// Apply a snapshot written elsewhere
    pub async fn apply_external(&self, asset: Asset, snapshot: Option<RefillAttempt>) -> bool {
        let current = self.get(asset).await;
        match snapshot {
            Some(snapshot) if snapshot.last_updated > current.last_updated => {
                debug!("Adopting newer snapshot for {}", asset);
                self.set(asset, snapshot).await;
                true
            }
            Some(_) => false,
            None if !current.is_idle() => {
                debug!("Snapshot for {} cleared elsewhere", asset);
                self.set(asset, RefillAttempt::idle(asset)).await;
                true
            }
            None => false,
        }
    }

    /// Follow store change events, with a coarse reload as fallback
    pub async fn follow(self: Arc<Self>, store: Arc<dyn SnapshotStore>, fallback: Duration) {
        let mut events = store.subscribe();
        let mut reload = tokio::time::interval(fallback);
        reload.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SnapshotEvent { origin, asset, snapshot }) => {
                        if origin != store.origin() {
                            self.apply_external(asset, snapshot).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Snapshot feed lagged by {} events, reloading", skipped);
                        self.reload(store.as_ref()).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = reload.tick() => self.reload(store.as_ref()).await,
            }
        }
    }

    async fn reload(&self, store: &dyn SnapshotStore) {
        for asset in Asset::ALL {
            match store.load(asset).await {
                Ok(Some(snapshot)) => {
                    self.apply_external(asset, Some(snapshot)).await;
                }
                Ok(None) => {
                    self.apply_external(asset, None).await;
                }
                Err(e) => warn!("Fallback reload failed for {}: {}", asset, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::MemorySnapshotStore;
    use crate::state::{IdSource, RefillOutcome, RefillPhase, RefillStatus};

    #[tokio::test]
    async fn test_view_prefers_first_active_asset() {
        let board = RefillBoard::new(Some("https://ccip.chain.link/".to_string()));

        let view = board.view().await;
        assert!(!view.any_active);
        assert!(view.current.is_none());
        assert_eq!(view.attempts.len(), 2);

        board
            .update(Asset::Link, |a| {
                a.begin();
                a.set_outbound(H256::repeat_byte(0x11), IdSource::Extracted);
            })
            .await;

        let view = board.view().await;
        assert!(view.any_active);
        let current = view.current.unwrap();
        assert_eq!(current.attempt.asset, Asset::Link);
        assert_eq!(
            current.outbound_explorer_url.unwrap(),
            format!("https://ccip.chain.link/msg/0x{}", "11".repeat(32))
        );

        board.update(Asset::Mon, |a| a.begin()).await;
        assert_eq!(board.view().await.current.unwrap().attempt.asset, Asset::Mon);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let board = RefillBoard::new(None);
        assert!(board.try_claim(Asset::Mon).await.is_some());
        assert!(board.try_claim(Asset::Mon).await.is_none());
        assert!(board.try_claim(Asset::Link).await.is_some());
        assert_eq!(board.get(Asset::Mon).await.status, RefillStatus::WalletPending);
    }

    #[tokio::test]
    async fn test_message_id_outlives_reset() {
        let board = RefillBoard::new(None);
        let id = H256::repeat_byte(0x42);
        board
            .update(Asset::Mon, |a| {
                a.begin();
                a.set_outbound(id, IdSource::Extracted);
            })
            .await;
        board.set(Asset::Mon, RefillAttempt::idle(Asset::Mon)).await;

        assert!(board.get(Asset::Mon).await.outbound_id().is_none());
        assert_eq!(board.last_message_id(Asset::Mon).await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_apply_external_only_takes_newer() {
        let board = RefillBoard::new(None);

        let mut older = RefillAttempt::idle(Asset::Mon);
        older.begin();
        older.last_updated = Utc::now() - chrono::Duration::hours(1);
        assert!(!board.apply_external(Asset::Mon, Some(older)).await);

        let mut newer = RefillAttempt::idle(Asset::Mon);
        newer.begin();
        newer.advance_to(RefillPhase::MonadConfirm, 5);
        assert!(board.apply_external(Asset::Mon, Some(newer)).await);
        assert_eq!(board.get(Asset::Mon).await.status, RefillStatus::TxPending);

        assert!(board.apply_external(Asset::Mon, None).await);
        assert!(board.get(Asset::Mon).await.is_idle());
    }

    #[tokio::test]
    async fn test_follow_ignores_own_writes() {
        let board = Arc::new(RefillBoard::new(None));
        let store: Arc<dyn SnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let mut changes = board.subscribe();

        let follower = tokio::spawn(board.clone().follow(store.clone(), Duration::from_secs(30)));
        tokio::task::yield_now().await;

        let mut attempt = RefillAttempt::idle(Asset::Link);
        attempt.begin();
        store.save(Asset::Link, &attempt).await.unwrap();
        tokio::task::yield_now().await;

        assert!(changes.try_recv().is_err());
        assert!(board.get(Asset::Link).await.is_idle());
        follower.abort();
    }

    #[tokio::test]
    async fn test_success_retires_message_id() {
        let board = RefillBoard::new(None);
        board
            .update(Asset::Link, |a| {
                a.begin();
                a.set_outbound(H256::repeat_byte(0x42), IdSource::Extracted);
            })
            .await;
        assert!(board.last_message_id(Asset::Link).await.is_some());

        board
            .update(Asset::Link, |a| {
                a.succeed(RefillOutcome {
                    refill_amount: U256::from(100u64),
                    new_drip_amount: U256::from(5u64),
                    volatility_score: None,
                    volatility_trend: None,
                })
            })
            .await;
        board.set(Asset::Link, RefillAttempt::idle(Asset::Link)).await;

        assert!(board.last_message_id(Asset::Link).await.is_none());
    }

    #[tokio::test]
    async fn test_reload_applies_clears_from_elsewhere() {
        let board = RefillBoard::new(None);
        let store = MemorySnapshotStore::new();

        let mut active = RefillAttempt::idle(Asset::Mon);
        active.begin();
        active.advance_to(RefillPhase::AvalancheConfirm, 15);
        board.set(Asset::Mon, active).await;

        // Nothing persisted for Mon: the writer that owned it has cleared it
        board.reload(&store).await;

        assert!(board.get(Asset::Mon).await.is_idle());
        assert!(board.get(Asset::Link).await.is_idle());
    }
}
