//! Dual-asset faucet contract binding

use crate::error::{RefillError, RefillResult};
use crate::state::{Asset, TankStatus};

use async_trait::async_trait;
use ethers::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

abigen!(
    DualAssetFaucet,
    r#"[
        function refillInProgress() external view returns (bool)
        function triggerRefillCheck() external returns (bytes32)
        function emergencyResetRefillState(bytes32 messageId) external
        function owner() external view returns (address)
        function getReservoirStatus() external view returns (uint256 monTank, uint256 monDrip, uint256 linkTank, uint256 linkDrip)
        function getTreasuryStatus() external view returns (uint256 monVault, uint256 linkVault)
        function cooldownPeriod() external view returns (uint256)
        function lastClaimMon(address user) external view returns (uint256)
        function lastClaimLink(address user) external view returns (uint256)
        function volatilityMultiplierBps() external view returns (uint256)
        event RefillTriggered(bytes32 indexed outboundMessageId)
        event VolatilityResponseReceived(bytes32 indexed messageId, uint256 volatilityScore, int256 volatilityTrend, uint256 dripMultiplierBps)
    ]"#
);

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Faucet reads and writes used by the refill core
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FaucetClient: Send + Sync {
    /// Faucet contract address on the local chain
    fn address(&self) -> Address;

    /// The authoritative "refill in flight" flag
    async fn refill_in_progress(&self) -> RefillResult<bool>;

    /// Submit the refill-trigger transaction, returning its hash once broadcast
    async fn trigger_refill(&self, asset: Asset) -> RefillResult<H256>;

    /// Admin force-clear of the in-flight marker for `message_id`
    async fn force_clear(&self, message_id: H256) -> RefillResult<H256>;

    /// Whether the configured signer owns the faucet
    async fn is_admin(&self) -> RefillResult<bool>;

    async fn tank_status(&self, asset: Asset) -> RefillResult<TankStatus>;

    async fn volatility_multiplier(&self) -> RefillResult<U256>;

    async fn cooldown(&self) -> RefillResult<u64>;

    async fn last_claim(&self, user: Address, asset: Asset) -> RefillResult<u64>;
}

/// Contract-backed [`FaucetClient`]
pub struct FaucetContract {
    address: Address,
    reader: DualAssetFaucet<Provider<Http>>,
    signer: Option<DualAssetFaucet<SignerClient>>,
    signer_address: Option<Address>,
}

impl FaucetContract {
    /// Bind the faucet; without a wallet the client is read-only
    pub fn new(
        address: Address,
        provider: Provider<Http>,
        wallet: Option<LocalWallet>,
    ) -> Self {
        let reader = DualAssetFaucet::new(address, Arc::new(provider.clone()));
        let signer_address = wallet.as_ref().map(|w| w.address());
        let signer = wallet.map(|wallet| {
            info!("Faucet writes signed by {:?}", wallet.address());
            let client = SignerMiddleware::new(provider, wallet);
            DualAssetFaucet::new(address, Arc::new(client))
        });

        Self {
            address,
            reader,
            signer,
            signer_address,
        }
    }

    /// Load the operator wallet from the named environment variable
    pub fn load_wallet(env_var: &str, chain_id: u64) -> RefillResult<Option<LocalWallet>> {
        match std::env::var(env_var) {
            Ok(key) => key
                .parse::<LocalWallet>()
                .map(|w| Some(w.with_chain_id(chain_id)))
                .map_err(|e| RefillError::Wallet(format!("Invalid private key: {}", e))),
            Err(_) => {
                warn!("{} not set; running read-only", env_var);
                Ok(None)
            }
        }
    }

    fn signer(&self) -> RefillResult<&DualAssetFaucet<SignerClient>> {
        self.signer.as_ref().ok_or_else(|| {
            RefillError::Wallet("No wallet configured for faucet writes".to_string())
        })
    }
}

/// Classify a send failure the way the refill state machine needs it
fn submission_error(message: String) -> RefillError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") {
        RefillError::InsufficientFunds(message)
    } else if lower.contains("revert") {
        RefillError::SubmissionReverted(message)
    } else if lower.contains("timed out") || lower.contains("connection") {
        RefillError::Timeout {
            operation: format!("submit transaction: {}", message),
        }
    } else {
        RefillError::SubmissionRejected(message)
    }
}

fn read_error<E: std::fmt::Display>(e: E) -> RefillError {
    let message = e.to_string();
    if message.to_lowercase().contains("revert") {
        RefillError::Contract(message)
    } else {
        RefillError::Timeout {
            operation: format!("faucet read: {}", message),
        }
    }
}

#[async_trait]
impl FaucetClient for FaucetContract {
    fn address(&self) -> Address {
        self.address
    }

    async fn refill_in_progress(&self) -> RefillResult<bool> {
        self.reader.refill_in_progress().call().await.map_err(read_error)
    }

    async fn trigger_refill(&self, asset: Asset) -> RefillResult<H256> {
        let call = self.signer()?.trigger_refill_check();
        let pending = call
            .send()
            .await
            .map_err(|e| submission_error(e.to_string()))?;
        let tx_hash = pending.tx_hash();

        info!("Refill trigger for {} sent: {:?}", asset, tx_hash);
        Ok(tx_hash)
    }

    async fn force_clear(&self, message_id: H256) -> RefillResult<H256> {
        let call = self
            .signer()?
            .emergency_reset_refill_state(message_id.to_fixed_bytes());
        let pending = call
            .send()
            .await
            .map_err(|e| submission_error(e.to_string()))?;
        let tx_hash = pending.tx_hash();

        info!("Force-clear for message {:?} sent: {:?}", message_id, tx_hash);
        Ok(tx_hash)
    }

    async fn is_admin(&self) -> RefillResult<bool> {
        let signer = match self.signer_address {
            Some(signer) => signer,
            None => return Ok(false),
        };
        let owner = self.reader.owner().call().await.map_err(read_error)?;
        Ok(owner == signer)
    }

    async fn tank_status(&self, asset: Asset) -> RefillResult<TankStatus> {
        let (mon_tank, mon_drip, link_tank, link_drip) = self
            .reader
            .get_reservoir_status()
            .call()
            .await
            .map_err(read_error)?;
        let (mon_vault, link_vault) = self
            .reader
            .get_treasury_status()
            .call()
            .await
            .map_err(read_error)?;

        Ok(match asset {
            Asset::Mon => TankStatus {
                tank: mon_tank,
                drip_rate: mon_drip,
                vault: mon_vault,
            },
            Asset::Link => TankStatus {
                tank: link_tank,
                drip_rate: link_drip,
                vault: link_vault,
            },
        })
    }

    async fn volatility_multiplier(&self) -> RefillResult<U256> {
        self.reader
            .volatility_multiplier_bps()
            .call()
            .await
            .map_err(read_error)
    }

    async fn cooldown(&self) -> RefillResult<u64> {
        let cooldown = self
            .reader
            .cooldown_period()
            .call()
            .await
            .map_err(read_error)?;
        Ok(cooldown.low_u64())
    }

    async fn last_claim(&self, user: Address, asset: Asset) -> RefillResult<u64> {
        let timestamp = match asset {
            Asset::Mon => self.reader.last_claim_mon(user).call().await,
            Asset::Link => self.reader.last_claim_link(user).call().await,
        }
        .map_err(read_error)?;
        Ok(timestamp.low_u64())
    }
}
