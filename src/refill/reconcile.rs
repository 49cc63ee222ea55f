//! Reconciliation against the faucet's "refill in progress" flag
//!
//! The flag is the ground truth. Cached attempts that contradict it are
//! cleared, and a flag with no local explanation is restored from the
//! snapshot store or synthesized from whatever identifiers can be recovered.

use super::coordinator::RefillCoordinator;
use crate::chain::scan_logs;
use crate::error::RefillResult;
use crate::events::{indexed_param, RefillEvent};
use crate::metrics;
use crate::state::{
    Asset, IdSource, MessageIdRecord, RefillAttempt, RefillPhase, RefillStatus,
};

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress shown for an attempt discovered only through the flag
pub const SYNTHESIZED_PROGRESS: u8 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ReconcileAction {
    Unchanged,
    ClearedStale,
    Restored,
    Synthesized { outbound: Option<MessageIdRecord> },
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Unchanged => "unchanged",
            ReconcileAction::ClearedStale => "cleared_stale",
            ReconcileAction::Restored => "restored",
            ReconcileAction::Synthesized { .. } => "synthesized",
        }
    }
}

pub struct Reconciler {
    coordinator: Arc<RefillCoordinator>,
}

impl Reconciler {
    pub fn new(coordinator: Arc<RefillCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Reconcile immediately, then on every interval tick
    pub async fn run(self: Arc<Self>) {
        let period = self.coordinator.config().reconcile_interval();
        let mut ticker = tokio::time::interval(period);
        info!("Reconciler running every {:?}", period);

        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_all().await {
                warn!("Reconciliation skipped: {}", e);
            }
        }
    }

    /// One flag read applied to every asset in priority order
    pub async fn reconcile_all(&self) -> RefillResult<Vec<(Asset, ReconcileAction)>> {
        let flag = self.coordinator.chains().faucet.refill_in_progress().await?;

        let mut actions = Vec::with_capacity(Asset::ALL.len());
        for asset in Asset::ALL {
            actions.push((asset, self.apply(asset, flag).await));
        }
        Ok(actions)
    }

    pub async fn reconcile(&self, asset: Asset) -> RefillResult<ReconcileAction> {
        let flag = self.coordinator.chains().faucet.refill_in_progress().await?;
        Ok(self.apply(asset, flag).await)
    }

    async fn apply(&self, asset: Asset, flag: bool) -> ReconcileAction {
        let action = if flag {
            self.explain_flag(asset).await
        } else {
            self.clear_if_stale(asset).await
        };

        if action != ReconcileAction::Unchanged {
            info!("Reconciled {}: {}", asset, action.as_str());
        }
        metrics::record_reconcile(asset.as_str(), action.as_str());
        action
    }

    /// Flag is down: drop cached attempts that can no longer be in flight
    async fn clear_if_stale(&self, asset: Asset) -> ReconcileAction {
        let board = self.coordinator.board();
        let cached = board.get(asset).await;

        let stale = match cached.status {
            RefillStatus::TxPending => {
                Utc::now() - cached.last_updated >= self.coordinator.config().stale_after()
            }
            // The coordinator resolves this itself at its next check
            RefillStatus::CcipProcessing => {
                !(cached.phase == Some(RefillPhase::MonadRefill)
                    && self.coordinator.monitors().is_monitoring(asset))
            }
            RefillStatus::Stuck => true,
            RefillStatus::Idle
            | RefillStatus::WalletPending
            | RefillStatus::Success
            | RefillStatus::Failed => false,
        };
        if !stale {
            return ReconcileAction::Unchanged;
        }

        debug!(
            "Cached {} attempt ({}, {}%) contradicts the faucet flag",
            asset,
            cached.status.as_str(),
            cached.progress
        );
        match self.coordinator.reset(asset).await {
            Ok(_) => ReconcileAction::ClearedStale,
            Err(e) => {
                warn!("Failed to clear stale {} attempt: {}", asset, e);
                ReconcileAction::Unchanged
            }
        }
    }

    /// Flag is up: make sure some attempt accounts for it
    async fn explain_flag(&self, asset: Asset) -> ReconcileAction {
        let board = self.coordinator.board();
        if !board.get(asset).await.is_idle() {
            return ReconcileAction::Unchanged;
        }
        if let Some(other) = board.other_active(asset).await {
            debug!("Faucet flag already explained by {}", other);
            return ReconcileAction::Unchanged;
        }

        let snapshot = self.load_snapshot(asset).await;
        if let Some(snapshot) = snapshot.as_ref().filter(|s| restorable(s)) {
            return self.restore(asset, snapshot.clone()).await;
        }

        // A restorable snapshot elsewhere takes precedence
        for other in Asset::ALL.into_iter().filter(|a| *a != asset) {
            if self.load_snapshot(other).await.map_or(false, |s| restorable(&s)) {
                return ReconcileAction::Unchanged;
            }
        }

        self.synthesize(asset, snapshot.as_ref()).await
    }

    async fn load_snapshot(&self, asset: Asset) -> Option<RefillAttempt> {
        match self.coordinator.store().load(asset).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Snapshot load for {} failed: {}", asset, e);
                None
            }
        }
    }

    async fn restore(&self, asset: Asset, snapshot: RefillAttempt) -> ReconcileAction {
        info!(
            "Restoring {} attempt at {} from snapshot",
            asset,
            snapshot.phase.map_or("stuck", |p| p.as_str())
        );
        self.coordinator.board().set(asset, snapshot.clone()).await;

        if snapshot.status.is_active() {
            self.coordinator.resume_attempt(&snapshot).await;
        }
        ReconcileAction::Restored
    }

    async fn synthesize(&self, asset: Asset, snapshot: Option<&RefillAttempt>) -> ReconcileAction {
        let outbound = self.recover_outbound_id(asset, snapshot).await;
        if outbound.is_none() {
            info!("No outbound message id recoverable for {}", asset);
        }

        let attempt = self
            .coordinator
            .board()
            .update(asset, |a| {
                a.begin();
                a.advance_to(RefillPhase::CcipResponse, SYNTHESIZED_PROGRESS);
                if let Some(record) = outbound {
                    a.set_outbound(record.id, record.source);
                }
            })
            .await;
        if let Err(e) = self.coordinator.store().save(asset, &attempt).await {
            warn!("Failed to persist synthesized {} attempt: {}", asset, e);
        }

        self.coordinator.resume_attempt(&attempt).await;
        ReconcileAction::Synthesized { outbound }
    }

    /// A recent trigger log wins over the remembered or snapshot id.
    /// Reused ids are only ever `Recovered`.
    async fn recover_outbound_id(
        &self,
        asset: Asset,
        snapshot: Option<&RefillAttempt>,
    ) -> Option<MessageIdRecord> {
        let remembered = match self.coordinator.board().last_message_id(asset).await {
            Some(record) => Some(record),
            None => snapshot
                .filter(|s| s.status != RefillStatus::Success)
                .and_then(|s| s.outbound_message_id),
        };

        let scanned = match self.scan_recent_trigger().await {
            Ok(found) => found,
            Err(e) => {
                warn!("Trigger log scan for {} failed: {}", asset, e);
                None
            }
        };
        if let (Some(old), Some(fresh)) = (remembered, scanned) {
            if old.id != fresh {
                debug!("Recent trigger {:?} supersedes remembered id {:?}", fresh, old.id);
            }
        }

        scanned.or(remembered.map(|r| r.id)).map(|id| MessageIdRecord {
            id,
            source: IdSource::Recovered,
        })
    }

    async fn scan_recent_trigger(&self) -> RefillResult<Option<ethers::types::H256>> {
        let chains = self.coordinator.chains();
        let config = self.coordinator.config();
        let local = chains.local.as_ref();

        let head = local.block_number().await?;
        let from = head.saturating_sub(config.recovery_window_blocks);
        let faucet = chains.faucet.address();

        let logs = scan_logs(
            local,
            faucet,
            RefillEvent::RefillTriggered.topic(),
            from,
            head,
            config.max_log_range,
        )
        .await?;

        Ok(logs
            .iter()
            .filter(|log| log.address == faucet)
            .max_by_key(|log| (log.block_number, log.log_index))
            .and_then(|log| indexed_param(log, 1)))
    }
}

fn restorable(snapshot: &RefillAttempt) -> bool {
    snapshot.status.is_active() || snapshot.status == RefillStatus::Stuck
}
