//! Scripted chain and faucet fakes for driving full refill runs

use super::catalog::PhaseCatalog;
use super::coordinator::{ChainSet, RefillCoordinator};
use crate::chain::{FaucetClient, LogSource};
use crate::config::MonitorConfig;
use crate::error::{RefillError, RefillResult};
use crate::state::{Asset, MemorySnapshotStore, RefillAttempt, RefillBoard, TankStatus};

use async_trait::async_trait;
use ethers::types::{
    Address, BlockNumber, Filter, FilterBlockOption, Log, TransactionReceipt, H256, U256, U64,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn faucet_address() -> Address {
    Address::repeat_byte(0xfa)
}

pub fn helper_address() -> Address {
    Address::repeat_byte(0xa7)
}

pub fn trigger_hash() -> H256 {
    H256::repeat_byte(0x01)
}

pub struct FakeFaucet {
    pub flag: AtomicBool,
    /// Upcoming flag reads that fail with a timeout
    pub flag_errors: AtomicU32,
    pub admin: AtomicBool,
    pub submit_error: Mutex<Option<String>>,
    /// Submission never returns
    pub submit_hangs: AtomicBool,
    pub submissions: AtomicU32,
    pub force_cleared: Mutex<Vec<H256>>,
    pub tanks: Mutex<HashMap<Asset, TankStatus>>,
    pub multiplier: Mutex<U256>,
}

impl FakeFaucet {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            flag_errors: AtomicU32::new(0),
            admin: AtomicBool::new(false),
            submit_error: Mutex::new(None),
            submit_hangs: AtomicBool::new(false),
            submissions: AtomicU32::new(0),
            force_cleared: Mutex::new(Vec::new()),
            tanks: Mutex::new(HashMap::new()),
            multiplier: Mutex::new(U256::from(10_000u64)),
        }
    }

    pub fn set_flag(&self, value: bool) {
        self.flag.store(value, Ordering::SeqCst);
    }

    pub fn set_tank(&self, asset: Asset, tank: u64, drip: u64) {
        self.tanks.lock().unwrap().insert(
            asset,
            TankStatus {
                tank: U256::from(tank),
                drip_rate: U256::from(drip),
                vault: U256::from(1_000_000u64),
            },
        );
    }
}

#[async_trait]
impl FaucetClient for FakeFaucet {
    fn address(&self) -> Address {
        faucet_address()
    }

    async fn refill_in_progress(&self) -> RefillResult<bool> {
        let pending = self.flag_errors.load(Ordering::SeqCst);
        if pending > 0 {
            self.flag_errors.store(pending - 1, Ordering::SeqCst);
            return Err(RefillError::Timeout {
                operation: "faucet read".to_string(),
            });
        }
        Ok(self.flag.load(Ordering::SeqCst))
    }

    async fn trigger_refill(&self, _asset: Asset) -> RefillResult<H256> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.submit_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let error = self.submit_error.lock().unwrap().clone();
        if let Some(message) = error {
            return Err(RefillError::SubmissionRejected(message));
        }
        self.set_flag(true);
        Ok(trigger_hash())
    }

    async fn force_clear(&self, message_id: H256) -> RefillResult<H256> {
        self.force_cleared.lock().unwrap().push(message_id);
        self.set_flag(false);
        Ok(H256::repeat_byte(0xcc))
    }

    async fn is_admin(&self) -> RefillResult<bool> {
        Ok(self.admin.load(Ordering::SeqCst))
    }

    async fn tank_status(&self, asset: Asset) -> RefillResult<TankStatus> {
        Ok(self
            .tanks
            .lock()
            .unwrap()
            .get(&asset)
            .cloned()
            .unwrap_or_default())
    }

    async fn volatility_multiplier(&self) -> RefillResult<U256> {
        Ok(*self.multiplier.lock().unwrap())
    }

    async fn cooldown(&self) -> RefillResult<u64> {
        Ok(3_600)
    }

    async fn last_claim(&self, _user: Address, asset: Asset) -> RefillResult<u64> {
        Ok(match asset {
            Asset::Mon => 1_700_000_000,
            Asset::Link => 0,
        })
    }
}

/// In-memory chain: fixed head, scripted receipts, block-tagged logs
pub struct FakeChain {
    chain_id: u64,
    pub head: AtomicU64,
    /// Receipt plus the number of lookups that still miss
    receipts: Mutex<HashMap<H256, (u32, TransactionReceipt)>>,
    logs: Mutex<Vec<Log>>,
    pub failing: AtomicBool,
    pub receipt_queries: AtomicU32,
}

impl FakeChain {
    pub fn new(chain_id: u64, head: u64) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(head),
            receipts: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            receipt_queries: AtomicU32::new(0),
        }
    }

    pub fn add_receipt(&self, receipt: TransactionReceipt, misses: u32) {
        self.receipts
            .lock()
            .unwrap()
            .insert(receipt.transaction_hash, (misses, receipt));
    }

    pub fn add_log(&self, log: Log, block: u64) {
        let mut log = log;
        log.block_number = Some(U64::from(block));
        self.logs.lock().unwrap().push(log);
    }

    fn check_failing(&self) -> RefillResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RefillError::ChainConnection {
                chain_id: self.chain_id,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

pub fn receipt(tx_hash: H256, block: u64, status: u64, logs: Vec<Log>) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        block_number: Some(U64::from(block)),
        status: Some(U64::from(status)),
        logs,
        ..Default::default()
    }
}

#[async_trait]
impl LogSource for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> RefillResult<u64> {
        self.check_failing()?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> RefillResult<Option<TransactionReceipt>> {
        self.check_failing()?;
        self.receipt_queries.fetch_add(1, Ordering::SeqCst);

        let mut receipts = self.receipts.lock().unwrap();
        Ok(match receipts.get_mut(&tx_hash) {
            Some((misses, _)) if *misses > 0 => {
                *misses -= 1;
                None
            }
            Some((_, receipt)) => Some(receipt.clone()),
            None => None,
        })
    }

    async fn logs(&self, filter: &Filter) -> RefillResult<Vec<Log>> {
        self.check_failing()?;

        let (from, to) = match &filter.block_option {
            FilterBlockOption::Range {
                from_block: Some(BlockNumber::Number(from)),
                to_block: Some(BlockNumber::Number(to)),
            } => (from.as_u64(), to.as_u64()),
            _ => (0, u64::MAX),
        };

        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.block_number
                    .map_or(true, |b| b.as_u64() >= from && b.as_u64() <= to)
            })
            .cloned()
            .collect())
    }
}

pub struct Harness {
    pub faucet: Arc<FakeFaucet>,
    pub local: Arc<FakeChain>,
    pub remote: Arc<FakeChain>,
    pub board: Arc<RefillBoard>,
    pub store: Arc<MemorySnapshotStore>,
    pub coordinator: Arc<RefillCoordinator>,
}

pub fn harness(config: MonitorConfig, catalog: PhaseCatalog) -> Harness {
    let faucet = Arc::new(FakeFaucet::new());
    let local = Arc::new(FakeChain::new(10143, 100));
    let remote = Arc::new(FakeChain::new(43113, 2_000));
    let board = Arc::new(RefillBoard::new(None));
    let store = Arc::new(MemorySnapshotStore::new());

    let chains = ChainSet {
        faucet: faucet.clone(),
        local: local.clone(),
        remote: remote.clone(),
        helper: helper_address(),
    };
    let coordinator = Arc::new(RefillCoordinator::new(
        chains,
        board.clone(),
        store.clone(),
        catalog,
        config,
    ));

    Harness {
        faucet,
        local,
        remote,
        board,
        store,
        coordinator,
    }
}

/// Poll the board (in virtual time) until `pred` holds
pub async fn wait_for<F>(board: &RefillBoard, asset: Asset, pred: F) -> RefillAttempt
where
    F: Fn(&RefillAttempt) -> bool,
{
    for _ in 0..10_000 {
        let attempt = board.get(asset).await;
        if pred(&attempt) {
            return attempt;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("condition never reached for {}", asset);
}
