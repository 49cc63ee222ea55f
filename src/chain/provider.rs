//! Chain provider with multi-RPC support and automatic failover

use super::LogSource;
use crate::config::ChainConfig;
use crate::error::{RefillError, RefillResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> RefillResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(500));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RefillError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        crate::metrics::record_rpc_failure(self.config.chain_id);
        warn!(
            "Chain {} failover to provider {}",
            self.config.chain_id, next
        );
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    pub async fn last_block(&self) -> u64 {
        *self.last_block.read().await
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn connection_error(&self, message: impl Into<String>) -> RefillError {
        RefillError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }
}

#[async_trait]
impl LogSource for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Get current block number with failover
    async fn block_number(&self) -> RefillResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    crate::metrics::record_block_height(self.config.chain_id, block_num);
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Get transaction receipt
    async fn transaction_receipt(&self, tx_hash: H256) -> RefillResult<Option<TransactionReceipt>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!(
                        "Failed to get receipt {:?} from chain {}: {}",
                        tx_hash, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get receipt"))
    }

    /// Get logs for a filter
    async fn logs(&self, filter: &Filter) -> RefillResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!(
                        "Failed to get logs from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(urls: Vec<&str>) -> ChainConfig {
        ChainConfig {
            chain_id: 43113,
            name: "avalanche-fuji".to_string(),
            rpc_urls: urls.into_iter().map(String::from).collect(),
            contract_address: "0x00000000000000000000000000000000000000a2".to_string(),
        }
    }

    #[test]
    fn test_requires_a_valid_rpc_url() {
        let err = ChainProvider::new(config(vec!["not a url"])).err().unwrap();
        assert!(matches!(err, RefillError::ChainConnection { chain_id: 43113, .. }));
    }

    #[test]
    fn test_failover_rotates_providers() {
        let provider = ChainProvider::new(config(vec![
            "http://127.0.0.1:8545",
            "http://127.0.0.1:8546",
        ]))
        .unwrap();

        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 1);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        assert_eq!(provider.chain_id(), 43113);
    }
}
