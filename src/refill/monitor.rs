//! Ephemeral monitoring sessions
//!
//! Each asset being tracked owns one [`MonitoringState`]. A session is
//! identified by a uuid so that a reset followed by a new start cannot be
//! confused with the loop it replaced. Sessions hold a [`BlockLease`], which
//! keeps the shared head watcher running while anything is monitored.

use crate::chain::{BlockLease, BlockWatcher};
use crate::events::VolatilityReport;
use crate::state::Asset;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Polling bookkeeping for one active attempt; never persisted
#[derive(Debug, Clone)]
pub struct MonitoringState {
    pub session: Uuid,
    pub is_active: bool,
    /// Consecutive transient failures
    pub failure_count: u32,
    pub last_block_checked: Option<u64>,
    pub last_remote_block_checked: Option<u64>,
    pub next_check_time: Option<DateTime<Utc>>,
    pub extraction_attempts: u32,
    /// Arrival payload held until the refill lands
    pub report: Option<VolatilityReport>,
}

impl MonitoringState {
    fn new() -> Self {
        Self {
            session: Uuid::new_v4(),
            is_active: true,
            failure_count: 0,
            last_block_checked: None,
            last_remote_block_checked: None,
            next_check_time: None,
            extraction_attempts: 0,
            report: None,
        }
    }
}

/// Monitoring sessions keyed by asset
pub struct MonitorRegistry {
    sessions: DashMap<Asset, MonitoringState>,
    watcher: Arc<BlockWatcher>,
}

impl MonitorRegistry {
    pub fn new(watcher: Arc<BlockWatcher>) -> Self {
        Self {
            sessions: DashMap::new(),
            watcher,
        }
    }

    /// Open a session for `asset`, replacing any previous one
    pub fn begin(self: &Arc<Self>, asset: Asset) -> MonitorHandle {
        let state = MonitoringState::new();
        let session = state.session;

        if let Some(previous) = self.sessions.insert(asset, state) {
            debug!("Replaced monitoring session {} for {}", previous.session, asset);
        }

        MonitorHandle {
            asset,
            session,
            registry: self.clone(),
            lease: self.watcher.acquire(),
        }
    }

    /// Ask the current session to stop at its next check
    pub fn deactivate(&self, asset: Asset) {
        if let Some(mut state) = self.sessions.get_mut(&asset) {
            state.is_active = false;
        }
    }

    pub fn state(&self, asset: Asset) -> Option<MonitoringState> {
        self.sessions.get(&asset).map(|s| s.clone())
    }

    pub fn is_monitoring(&self, asset: Asset) -> bool {
        self.sessions.get(&asset).map_or(false, |s| s.is_active)
    }

    pub fn watcher(&self) -> &Arc<BlockWatcher> {
        &self.watcher
    }

    fn with_session<R>(
        &self,
        asset: Asset,
        session: Uuid,
        f: impl FnOnce(&mut MonitoringState) -> R,
    ) -> Option<R> {
        self.sessions
            .get_mut(&asset)
            .filter(|s| s.session == session)
            .map(|mut s| f(s.value_mut()))
    }
}

/// Owned by the loop driving one attempt; dropping it ends the session
pub struct MonitorHandle {
    asset: Asset,
    session: Uuid,
    registry: Arc<MonitorRegistry>,
    lease: BlockLease,
}

impl MonitorHandle {
    pub fn asset(&self) -> Asset {
        self.asset
    }

    /// Still the current session and not cancelled
    pub fn is_active(&self) -> bool {
        self.registry
            .with_session(self.asset, self.session, |s| s.is_active)
            .unwrap_or(false)
    }

    /// Count a transient failure, returning the consecutive total
    pub fn record_failure(&self) -> u32 {
        self.registry
            .with_session(self.asset, self.session, |s| {
                s.failure_count += 1;
                s.failure_count
            })
            .unwrap_or(0)
    }

    pub fn record_success(&self) {
        self.registry
            .with_session(self.asset, self.session, |s| s.failure_count = 0);
    }

    pub fn schedule(&self, delay: Duration) {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let at = Utc::now() + delay;
        self.registry
            .with_session(self.asset, self.session, |s| s.next_check_time = Some(at));
    }

    pub fn last_block(&self) -> Option<u64> {
        self.registry
            .with_session(self.asset, self.session, |s| s.last_block_checked)
            .flatten()
    }

    pub fn set_last_block(&self, block: u64) {
        self.registry
            .with_session(self.asset, self.session, |s| s.last_block_checked = Some(block));
    }

    pub fn last_remote_block(&self) -> Option<u64> {
        self.registry
            .with_session(self.asset, self.session, |s| s.last_remote_block_checked)
            .flatten()
    }

    pub fn set_last_remote_block(&self, block: u64) {
        self.registry.with_session(self.asset, self.session, |s| {
            s.last_remote_block_checked = Some(block)
        });
    }

    /// Count an extraction retry, returning the total so far
    pub fn record_extraction(&self) -> u32 {
        self.registry
            .with_session(self.asset, self.session, |s| {
                s.extraction_attempts += 1;
                s.extraction_attempts
            })
            .unwrap_or(u32::MAX)
    }

    pub fn set_report(&self, report: VolatilityReport) {
        self.registry
            .with_session(self.asset, self.session, |s| s.report = Some(report));
    }

    pub fn report(&self) -> Option<VolatilityReport> {
        self.registry
            .with_session(self.asset, self.session, |s| s.report.clone())
            .flatten()
    }

    /// Local head from the shared watcher, 0 before its first poll
    pub fn head(&self) -> u64 {
        self.lease.head()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let session = self.session;
        self.registry
            .sessions
            .remove_if(&self.asset, |_, s| s.session == session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockLogSource;

    fn registry() -> Arc<MonitorRegistry> {
        let mut source = MockLogSource::new();
        source.expect_chain_id().return_const(10143u64);
        source.expect_block_number().returning(|| Ok(500));
        let watcher = BlockWatcher::new(Arc::new(source), Duration::from_secs(2));
        Arc::new(MonitorRegistry::new(Arc::new(watcher)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_replaces_old() {
        let registry = registry();

        let first = registry.begin(Asset::Mon);
        assert!(first.is_active());
        assert_eq!(first.record_failure(), 1);

        let second = registry.begin(Asset::Mon);
        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(registry.state(Asset::Mon).unwrap().failure_count, 0);

        // The stale handle must not tear down its successor
        drop(first);
        assert!(second.is_active());
        assert!(registry.is_monitoring(Asset::Mon));

        drop(second);
        assert!(registry.state(Asset::Mon).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_and_watcher_lifetime() {
        let registry = registry();

        let mon = registry.begin(Asset::Mon);
        let link = registry.begin(Asset::Link);
        assert!(registry.watcher().is_running());

        registry.deactivate(Asset::Mon);
        assert!(!mon.is_active());
        assert!(link.is_active());

        drop(mon);
        assert!(registry.watcher().is_running());
        drop(link);
        assert!(!registry.watcher().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_count_is_consecutive() {
        let registry = registry();
        let handle = registry.begin(Asset::Link);

        handle.record_failure();
        handle.record_failure();
        handle.record_success();
        assert_eq!(handle.record_failure(), 1);

        handle.set_last_block(77);
        handle.set_last_remote_block(9_001);
        assert_eq!(handle.last_block(), Some(77));
        assert_eq!(handle.last_remote_block(), Some(9_001));
        assert_eq!(handle.record_extraction(), 1);
    }
}
