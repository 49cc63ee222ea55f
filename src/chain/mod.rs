//! Chain module - connections to the faucet chain and the remote helper chain
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - The `LogSource` seam used for receipts, heads and log scans
//! - The faucet contract binding
//! - A reference-counted block-head listener shared by all assets

pub mod faucet;
pub mod listener;
pub mod provider;

pub use faucet::{FaucetClient, FaucetContract};
pub use listener::{BlockLease, BlockWatcher};
pub use provider::ChainProvider;

#[cfg(test)]
pub use faucet::MockFaucetClient;

use crate::error::RefillResult;

use async_trait::async_trait;
use ethers::types::{Address, Filter, Log, TransactionReceipt, H256};
use tracing::debug;

/// Read access to one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogSource: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> RefillResult<u64>;

    async fn transaction_receipt(&self, tx_hash: H256) -> RefillResult<Option<TransactionReceipt>>;

    async fn logs(&self, filter: &Filter) -> RefillResult<Vec<Log>>;
}

/// Fetch `topic` logs from `address` over `[from, to]`, `max_range` blocks per query
pub async fn scan_logs(
    source: &dyn LogSource,
    address: Address,
    topic: H256,
    from: u64,
    to: u64,
    max_range: u64,
) -> RefillResult<Vec<Log>> {
    let mut logs = Vec::new();
    let mut start = from;

    while start <= to {
        let end = std::cmp::min(to, start.saturating_add(max_range.max(1) - 1));

        debug!(
            "Chain {}: scanning {:?} blocks {} to {}",
            source.chain_id(),
            address,
            start,
            end
        );

        let filter = Filter::new()
            .address(address)
            .topic0(topic)
            .from_block(start)
            .to_block(end);
        logs.extend(source.logs(&filter).await?);

        start = end + 1;
    }

    Ok(logs)
}
