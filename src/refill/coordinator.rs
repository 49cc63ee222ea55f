//! Refill coordinator: one phase-driven state machine per asset
//!
//! `start` claims the asset, submits the trigger transaction and spawns a
//! loop that walks the phase catalog. Every transition goes through
//! [`RefillCoordinator::commit`], which writes the board and the snapshot
//! store and refuses to touch an attempt that is no longer active.

use super::catalog::{PhaseCatalog, PhaseSpec};
use super::monitor::{MonitorHandle, MonitorRegistry};
use crate::chain::{scan_logs, BlockWatcher, FaucetClient, LogSource};
use crate::config::MonitorConfig;
use crate::error::{RefillError, RefillResult};
use crate::events::{self, RefillEvent};
use crate::metrics;
use crate::state::{
    Asset, FaucetOverview, IdSource, RefillAttempt, RefillBoard, RefillOutcome, RefillPhase,
    RefillStatus, SnapshotStore,
};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256, U64};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Chain-facing collaborators of the coordinator
#[derive(Clone)]
pub struct ChainSet {
    pub faucet: Arc<dyn FaucetClient>,
    /// Chain hosting the faucet
    pub local: Arc<dyn LogSource>,
    /// Chain hosting the volatility helper
    pub remote: Arc<dyn LogSource>,
    pub helper: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    /// This asset already has a non-idle attempt
    AlreadyActive,
    /// The faucet reports a refill in flight
    RefillInFlight,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub force_clear_tx: Option<H256>,
    pub attempt: RefillAttempt,
}

enum PhaseCheck {
    Pending,
    Complete,
    Failed(String),
}

enum PhaseExit {
    Advanced,
    Cancelled,
    Stuck(String),
    Failed(String),
}

pub struct RefillCoordinator {
    chains: ChainSet,
    board: Arc<RefillBoard>,
    store: Arc<dyn SnapshotStore>,
    monitors: Arc<MonitorRegistry>,
    catalog: PhaseCatalog,
    config: MonitorConfig,
}

impl RefillCoordinator {
    pub fn new(
        chains: ChainSet,
        board: Arc<RefillBoard>,
        store: Arc<dyn SnapshotStore>,
        catalog: PhaseCatalog,
        config: MonitorConfig,
    ) -> Self {
        let watcher = BlockWatcher::new(chains.local.clone(), config.block_poll_interval());

        Self {
            chains,
            board,
            store,
            monitors: Arc::new(MonitorRegistry::new(Arc::new(watcher))),
            catalog,
            config,
        }
    }

    pub fn board(&self) -> &Arc<RefillBoard> {
        &self.board
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    /// Begin a refill for `asset` unless one is already under way
    pub async fn start(self: &Arc<Self>, asset: Asset) -> RefillResult<StartOutcome> {
        if !self.board.get(asset).await.is_idle() {
            debug!("Refill for {} already active", asset);
            return Ok(StartOutcome::AlreadyActive);
        }

        if self.chains.faucet.refill_in_progress().await? {
            info!("Faucet reports a refill in flight; not starting {}", asset);
            return Ok(StartOutcome::RefillInFlight);
        }
        if let Some(other) = self.board.other_active(asset).await {
            info!("Refill for {} in progress; not starting {}", other, asset);
            return Ok(StartOutcome::RefillInFlight);
        }

        let claimed = match self.board.try_claim(asset).await {
            Some(attempt) => attempt,
            None => return Ok(StartOutcome::AlreadyActive),
        };
        self.persist(&claimed).await;

        metrics::record_refill_started(asset.as_str());
        metrics::record_phase(asset.as_str(), RefillPhase::WalletConfirm.as_str());
        info!("Starting refill for {}", asset);

        self.spawn_drive(asset, RefillPhase::WalletConfirm);
        Ok(StartOutcome::Started)
    }

    /// Return `asset` to idle and drop its snapshot
    pub async fn reset(&self, asset: Asset) -> RefillResult<RefillAttempt> {
        self.monitors.deactivate(asset);

        let idle = RefillAttempt::idle(asset);
        self.board.set(asset, idle.clone()).await;
        metrics::record_progress(asset.as_str(), 0);
        self.store.clear(asset).await?;

        info!("Refill state for {} reset", asset);
        Ok(idle)
    }

    /// Owner-only: force-clear the faucet's in-flight marker, then reset
    pub async fn escalate(&self, asset: Asset) -> RefillResult<Escalation> {
        if !self.chains.faucet.is_admin().await? {
            warn!("Escalation for {} refused: signer is not the owner", asset);
            return Err(RefillError::Unauthorized);
        }

        let attempt = self.board.get(asset).await;
        let force_clear_tx = match attempt.outbound_id() {
            Some(message_id) => {
                let tx = self.chains.faucet.force_clear(message_id).await?;
                info!("Force-cleared {} refill {:?} in {:?}", asset, message_id, tx);
                Some(tx)
            }
            None => {
                warn!("No outbound message id for {}; resetting locally only", asset);
                None
            }
        };

        let attempt = self.reset(asset).await?;
        Ok(Escalation {
            force_clear_tx,
            attempt,
        })
    }

    /// Pick up whatever the board was hydrated with
    pub async fn restore_all(self: &Arc<Self>) {
        for asset in Asset::ALL {
            let attempt = self.board.get(asset).await;
            match attempt.status {
                status if status.is_active() => self.resume_attempt(&attempt).await,
                RefillStatus::Success => {
                    self.schedule_reset(asset, self.config.success_grace(), attempt.last_updated)
                }
                RefillStatus::Failed => {
                    self.schedule_reset(asset, self.config.failure_grace(), attempt.last_updated)
                }
                _ => {}
            }
        }
    }

    /// Resume monitoring a restored or synthesized attempt
    pub async fn resume_attempt(self: &Arc<Self>, attempt: &RefillAttempt) {
        let asset = attempt.asset;
        let phase = match (attempt.phase, attempt.local_tx_hash) {
            (Some(RefillPhase::WalletConfirm), Some(_)) => RefillPhase::MonadConfirm,
            (Some(RefillPhase::WalletConfirm), None) => {
                // The submission result did not survive the restart
                warn!("Wallet confirmation for {} was interrupted", asset);
                let stuck = self
                    .board
                    .update(asset, |a| {
                        a.mark_stuck(Some("wallet confirmation interrupted".to_string()))
                    })
                    .await;
                self.persist(&stuck).await;
                metrics::record_outcome(asset.as_str(), "stuck");
                return;
            }
            (Some(phase), _) => phase,
            (None, _) => RefillPhase::CcipResponse,
        };

        if attempt.phase != Some(phase) {
            let moved = self
                .board
                .update(asset, |a| {
                    let progress = a.progress;
                    a.advance_to(phase, progress);
                })
                .await;
            self.persist(&moved).await;
        }

        info!("Resuming {} refill monitoring at {}", asset, phase);
        self.spawn_drive(asset, phase);
    }

    /// Re-read tanks and the multiplier into the board
    pub async fn refresh_overview(&self) -> RefillResult<FaucetOverview> {
        let faucet = &self.chains.faucet;
        let (tanks, bps) = futures::try_join!(
            try_join_all(Asset::ALL.into_iter().map(|asset| faucet.tank_status(asset))),
            faucet.volatility_multiplier(),
        )?;

        for (asset, status) in Asset::ALL.into_iter().zip(tanks) {
            self.board.set_tank(asset, status).await;
        }
        self.board.set_volatility_multiplier(bps).await;

        Ok(self.board.overview().await)
    }

    fn spawn_drive(self: &Arc<Self>, asset: Asset, from: RefillPhase) {
        let handle = self.monitors.begin(asset);
        tokio::spawn(self.clone().drive(asset, handle, from));
    }

    async fn drive(self: Arc<Self>, asset: Asset, handle: MonitorHandle, from: RefillPhase) {
        let started = Instant::now();
        let mut phase = from;

        loop {
            let spec = *self.catalog.spec(phase);
            let exit = match phase {
                RefillPhase::WalletConfirm => self.submit(asset, &spec, &handle).await,
                _ => self.poll_phase(asset, &spec, &handle).await,
            };

            match exit {
                PhaseExit::Advanced => match phase.next() {
                    Some(next) => {
                        let progress = self.catalog.entry_progress(next);
                        if self
                            .commit(asset, &handle, |a| a.advance_to(next, progress))
                            .await
                            .is_none()
                        {
                            return;
                        }
                        metrics::record_phase(asset.as_str(), next.as_str());
                        info!("Refill for {} entered {}", asset, next);
                        phase = next;
                    }
                    None => {
                        self.complete(asset, &handle).await;
                        if from == RefillPhase::WalletConfirm {
                            metrics::record_refill_duration(
                                asset.as_str(),
                                started.elapsed().as_secs_f64(),
                            );
                        }
                        return;
                    }
                },
                PhaseExit::Cancelled => {
                    debug!("Monitoring of {} cancelled in {}", asset, phase);
                    return;
                }
                PhaseExit::Stuck(message) => {
                    warn!("Refill for {} stuck in {}: {}", asset, phase, message);
                    if self
                        .commit(asset, &handle, |a| a.mark_stuck(Some(message)))
                        .await
                        .is_some()
                    {
                        metrics::record_outcome(asset.as_str(), "stuck");
                    }
                    return;
                }
                PhaseExit::Failed(message) => {
                    error!("Refill for {} failed in {}: {}", asset, phase, message);
                    if let Some(failed) = self.commit(asset, &handle, |a| a.fail(message)).await {
                        metrics::record_outcome(asset.as_str(), "failed");
                        self.schedule_reset(asset, self.config.failure_grace(), failed.last_updated);
                    }
                    return;
                }
            }
        }
    }

    /// `wallet_confirm`: sample the tank, then wait for the trigger to be sent
    async fn submit(&self, asset: Asset, spec: &PhaseSpec, handle: &MonitorHandle) -> PhaseExit {
        let tank_before = match self.chains.faucet.tank_status(asset).await {
            Ok(status) => Some(status.tank),
            Err(e) => {
                debug!("Could not sample {} tank before refill: {}", asset, e);
                None
            }
        };
        if self
            .commit(asset, handle, |a| a.tank_before = tank_before)
            .await
            .is_none()
        {
            return PhaseExit::Cancelled;
        }

        let budget = spec.budget();
        match tokio::time::timeout(budget, self.chains.faucet.trigger_refill(asset)).await {
            Err(_) => PhaseExit::Stuck(format!(
                "no wallet confirmation within {}s",
                budget.as_secs()
            )),
            Ok(Err(e)) => PhaseExit::Failed(e.to_string()),
            Ok(Ok(tx_hash)) => {
                info!("Refill trigger for {} submitted: {:?}", asset, tx_hash);
                let recorded = self
                    .commit(asset, handle, |a| {
                        a.local_tx_hash = Some(tx_hash);
                        a.touch();
                    })
                    .await;
                match recorded {
                    Some(_) => PhaseExit::Advanced,
                    None => PhaseExit::Cancelled,
                }
            }
        }
    }

    async fn poll_phase(&self, asset: Asset, spec: &PhaseSpec, handle: &MonitorHandle) -> PhaseExit {
        let phase = spec.phase;
        let mut attempts = 0u32;
        let mut delay = spec.initial_delay;

        loop {
            if !self.still_tracking(asset, handle).await {
                return PhaseExit::Cancelled;
            }
            handle.schedule(delay);
            tokio::time::sleep(delay).await;
            if !self.still_tracking(asset, handle).await {
                return PhaseExit::Cancelled;
            }

            match self.check(asset, phase, handle).await {
                Ok(PhaseCheck::Complete) => {
                    handle.record_success();
                    return PhaseExit::Advanced;
                }
                Ok(PhaseCheck::Failed(message)) => return PhaseExit::Failed(message),
                Ok(PhaseCheck::Pending) => {
                    handle.record_success();
                    attempts += 1;
                    if attempts >= spec.max_attempts {
                        return PhaseExit::Stuck(format!(
                            "no progress after {} checks",
                            attempts
                        ));
                    }

                    let progress = spec.progress_after(attempts);
                    if progress > self.board.get(asset).await.progress
                        && self
                            .commit(asset, handle, |a| a.raise_progress(progress))
                            .await
                            .is_none()
                    {
                        return PhaseExit::Cancelled;
                    }
                    delay = spec.interval;
                }
                Err(e) if e.is_retryable() => {
                    let failures = handle.record_failure();
                    metrics::record_poll_error(asset.as_str(), phase.as_str());
                    warn!(
                        "Check {} for {} failed ({} in a row): {}",
                        phase, asset, failures, e
                    );
                    if failures > self.config.max_failures {
                        return PhaseExit::Stuck(format!(
                            "{} consecutive remote errors, last: {}",
                            failures, e
                        ));
                    }
                    delay = backoff(spec.interval, failures, self.config.max_backoff());
                }
                Err(e) => return PhaseExit::Failed(e.to_string()),
            }
        }
    }

    async fn still_tracking(&self, asset: Asset, handle: &MonitorHandle) -> bool {
        handle.is_active() && self.board.get(asset).await.status.is_active()
    }

    async fn check(
        &self,
        asset: Asset,
        phase: RefillPhase,
        handle: &MonitorHandle,
    ) -> RefillResult<PhaseCheck> {
        match phase {
            RefillPhase::WalletConfirm => Ok(match self.board.get(asset).await.local_tx_hash {
                Some(_) => PhaseCheck::Complete,
                None => PhaseCheck::Pending,
            }),
            RefillPhase::MonadConfirm => self.check_receipt(asset, handle).await,
            RefillPhase::AvalancheConfirm => self.check_response(asset, handle).await,
            RefillPhase::CcipResponse => self.check_arrival(asset, handle).await,
            RefillPhase::MonadRefill => Ok(if self.chains.faucet.refill_in_progress().await? {
                PhaseCheck::Pending
            } else {
                PhaseCheck::Complete
            }),
        }
    }

    /// `monad_confirm`: the trigger transaction is mined
    async fn check_receipt(&self, asset: Asset, handle: &MonitorHandle) -> RefillResult<PhaseCheck> {
        let tx_hash = match self.board.get(asset).await.local_tx_hash {
            Some(tx_hash) => tx_hash,
            None => return Ok(PhaseCheck::Failed("refill transaction hash missing".to_string())),
        };

        let receipt = match self.chains.local.transaction_receipt(tx_hash).await? {
            Some(receipt) => receipt,
            None => return Ok(PhaseCheck::Pending),
        };
        if receipt.status == Some(U64::zero()) {
            return Ok(PhaseCheck::Failed("refill transaction reverted".to_string()));
        }

        let block = receipt.block_number.map(|b| b.as_u64());
        let faucet = self.chains.faucet.address();
        let outbound = match events::extract_outbound(self.chains.local.as_ref(), &receipt, faucet).await
        {
            Ok(id) => id,
            Err(e) => {
                debug!("Outbound extraction for {} failed: {}", asset, e);
                None
            }
        };
        if outbound.is_none() {
            debug!("Outbound message id for {} not visible yet", asset);
        }

        let remote_head = self.chains.remote.block_number().await?;

        self.commit(asset, handle, |a| {
            a.local_block = block;
            a.remote_from_block = Some(remote_head);
            if let Some(id) = outbound {
                a.set_outbound(id, IdSource::Extracted);
            }
        })
        .await;

        Ok(PhaseCheck::Complete)
    }

    /// `avalanche_confirm`: the helper has sent its response
    async fn check_response(&self, asset: Asset, handle: &MonitorHandle) -> RefillResult<PhaseCheck> {
        let attempt = self.board.get(asset).await;
        if attempt.outbound_message_id.is_none() {
            self.retry_outbound(asset, attempt.local_tx_hash, handle).await;
        }
        let attempt = self.board.get(asset).await;

        let remote = self.chains.remote.as_ref();
        let head = remote.block_number().await?;
        let from = handle
            .last_remote_block()
            .map(|b| b + 1)
            .or(attempt.remote_from_block)
            .unwrap_or_else(|| head.saturating_sub(self.config.recovery_window_blocks));
        if from > head {
            return Ok(PhaseCheck::Pending);
        }

        let logs = scan_logs(
            remote,
            self.chains.helper,
            RefillEvent::VolatilityResponseSent.topic(),
            from,
            head,
            self.config.max_log_range,
        )
        .await?;
        handle.set_last_remote_block(head);

        match events::extract_response(&logs, self.chains.helper, attempt.outbound_id()) {
            Some(response) => {
                info!("Response {:?} for {} sent from helper", response, asset);
                self.commit(asset, handle, |a| {
                    a.set_inbound(response, IdSource::Extracted);
                })
                .await;
                Ok(PhaseCheck::Complete)
            }
            None => Ok(PhaseCheck::Pending),
        }
    }

    async fn retry_outbound(&self, asset: Asset, tx_hash: Option<H256>, handle: &MonitorHandle) {
        let tx_hash = match tx_hash {
            Some(tx_hash) => tx_hash,
            None => return,
        };
        if handle.record_extraction() > self.config.extraction_attempts {
            return;
        }

        let receipt = match self.chains.local.transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => receipt,
            _ => return,
        };
        let faucet = self.chains.faucet.address();
        match events::extract_outbound(self.chains.local.as_ref(), &receipt, faucet).await {
            Ok(Some(id)) => {
                info!("Recovered outbound message id {:?} for {}", id, asset);
                self.commit(asset, handle, |a| {
                    a.set_outbound(id, IdSource::Extracted);
                })
                .await;
            }
            Ok(None) => debug!("Outbound message id for {} still missing", asset),
            Err(e) => debug!("Outbound re-extraction for {} failed: {}", asset, e),
        }
    }

    /// `ccip_response`: the response landed on the faucet
    async fn check_arrival(&self, asset: Asset, handle: &MonitorHandle) -> RefillResult<PhaseCheck> {
        let attempt = self.board.get(asset).await;
        let local = self.chains.local.as_ref();

        let head = match handle.head() {
            0 => local.block_number().await?,
            head => head,
        };
        let from = handle
            .last_block()
            .map(|b| b + 1)
            .or(attempt.local_block)
            .unwrap_or_else(|| head.saturating_sub(self.config.recovery_window_blocks));
        if from > head {
            return Ok(PhaseCheck::Pending);
        }

        let faucet = self.chains.faucet.address();
        let logs = scan_logs(
            local,
            faucet,
            RefillEvent::VolatilityResponseReceived.topic(),
            from,
            head,
            self.config.max_log_range,
        )
        .await?;
        handle.set_last_block(head);

        match events::extract_arrival(&logs, faucet, attempt.inbound_id()) {
            Some(report) => {
                info!("Response {:?} for {} arrived", report.message_id, asset);
                let message_id = report.message_id;
                self.commit(asset, handle, |a| {
                    a.set_inbound(message_id, IdSource::Extracted);
                })
                .await;
                handle.set_report(report);
                Ok(PhaseCheck::Complete)
            }
            None => Ok(PhaseCheck::Pending),
        }
    }

    /// Resolve to success and run the completion callback
    async fn complete(self: &Arc<Self>, asset: Asset, handle: &MonitorHandle) {
        let attempt = self.board.get(asset).await;
        let tank = match self.chains.faucet.tank_status(asset).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Could not read {} tank after refill: {}", asset, e);
                None
            }
        };
        let report = handle.report();

        let outcome = RefillOutcome {
            refill_amount: match (attempt.tank_before, &tank) {
                (Some(before), Some(after)) => after.tank.saturating_sub(before),
                _ => U256::zero(),
            },
            new_drip_amount: tank.as_ref().map(|t| t.drip_rate).unwrap_or_default(),
            volatility_score: report.as_ref().and_then(|r| r.volatility_score),
            volatility_trend: report.as_ref().and_then(|r| r.volatility_trend),
        };

        let done = match self.commit(asset, handle, |a| a.succeed(outcome)).await {
            Some(done) => done,
            None => return,
        };
        metrics::record_outcome(asset.as_str(), "success");
        info!("Refill for {} complete", asset);

        if let Some(status) = tank {
            self.board.set_tank(asset, status).await;
        }
        if let Err(e) = self.refresh_overview().await {
            warn!("Faucet overview refresh failed: {}", e);
            if let Some(report) = report {
                self.board
                    .set_volatility_multiplier(report.drip_multiplier_bps)
                    .await;
            }
        }

        self.schedule_reset(asset, self.config.success_grace(), done.last_updated);
    }

    /// Reset after `grace` unless the attempt changed in the meantime
    fn schedule_reset(self: &Arc<Self>, asset: Asset, grace: Duration, stamp: DateTime<Utc>) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let current = this.board.get(asset).await;
            let settled = matches!(current.status, RefillStatus::Success | RefillStatus::Failed);
            if settled && current.last_updated == stamp {
                debug!("Grace period for {} elapsed", asset);
                if let Err(e) = this.reset(asset).await {
                    warn!("Automatic reset of {} failed: {}", asset, e);
                }
            }
        });
    }

    /// Apply `f` to the attempt if this session still owns it, then persist
    async fn commit<F>(&self, asset: Asset, handle: &MonitorHandle, f: F) -> Option<RefillAttempt>
    where
        F: FnOnce(&mut RefillAttempt) + Send,
    {
        if !handle.is_active() {
            return None;
        }

        let mut applied = false;
        let updated = self
            .board
            .update(asset, |a| {
                if a.status.is_active() {
                    f(a);
                    applied = true;
                }
            })
            .await;
        if !applied {
            return None;
        }

        self.persist(&updated).await;
        Some(updated)
    }

    async fn persist(&self, attempt: &RefillAttempt) {
        metrics::record_progress(attempt.asset.as_str(), attempt.progress);
        if let Err(e) = self.store.save(attempt.asset, attempt).await {
            error!("Failed to persist {} snapshot: {}", attempt.asset, e);
        }
    }
}

/// `interval * 2^failures`, capped
fn backoff(interval: Duration, failures: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(cap)
}
