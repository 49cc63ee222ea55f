//! Shared block-head listener
//!
//! One polling task tracks the local chain head for every asset being
//! monitored. It runs only while at least one [`BlockLease`] is alive: the
//! first lease starts it, dropping the last one stops it.

use super::LogSource;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct WatcherState {
    leases: usize,
    task: Option<JoinHandle<()>>,
}

/// Reference-counted head poller
pub struct BlockWatcher {
    source: Arc<dyn LogSource>,
    poll_interval: Duration,
    state: Mutex<WatcherState>,
    head_tx: watch::Sender<u64>,
}

impl BlockWatcher {
    pub fn new(source: Arc<dyn LogSource>, poll_interval: Duration) -> Self {
        let (head_tx, _) = watch::channel(0);
        Self {
            source,
            poll_interval,
            state: Mutex::new(WatcherState {
                leases: 0,
                task: None,
            }),
            head_tx,
        }
    }

    /// Take a lease, starting the poller if this is the first one
    pub fn acquire(self: &Arc<Self>) -> BlockLease {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.leases += 1;

        if state.task.is_none() {
            info!("Starting block watcher for chain {}", self.source.chain_id());
            state.task = Some(self.spawn_poller());
        }

        BlockLease {
            watcher: self.clone(),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.leases = state.leases.saturating_sub(1);

        if state.leases == 0 {
            if let Some(task) = state.task.take() {
                task.abort();
                info!("Stopped block watcher for chain {}", self.source.chain_id());
            }
        }
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let source = self.source.clone();
        let head_tx = self.head_tx.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            loop {
                match source.block_number().await {
                    Ok(block) => {
                        head_tx.send_if_modified(|head| {
                            if block > *head {
                                *head = block;
                                true
                            } else {
                                false
                            }
                        });
                        debug!("Chain {} head at {}", source.chain_id(), block);
                    }
                    Err(e) => warn!("Block watcher poll failed: {}", e),
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }

    /// Latest head seen, 0 before the first poll
    pub fn head(&self) -> u64 {
        *self.head_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.task.is_some())
            .unwrap_or(false)
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().map(|s| s.leases).unwrap_or(0)
    }
}

/// Keeps the watcher alive while held
pub struct BlockLease {
    watcher: Arc<BlockWatcher>,
}

impl BlockLease {
    pub fn head(&self) -> u64 {
        self.watcher.head()
    }
}

impl Drop for BlockLease {
    fn drop(&mut self) {
        self.watcher.release();
    }
}
