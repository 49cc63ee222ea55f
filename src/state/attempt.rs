//! Refill attempt data model

use crate::error::RefillError;

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Faucet asset with its own tank and vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Mon,
    Link,
}

impl Asset {
    /// All assets in presentation priority order
    pub const ALL: [Asset; 2] = [Asset::Mon, Asset::Link];

    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Mon => "mon",
            Asset::Link => "link",
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = RefillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mon" => Ok(Asset::Mon),
            "link" => Ok(Asset::Link),
            other => Err(RefillError::UnknownAsset(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefillStatus {
    Idle,
    WalletPending,
    TxPending,
    CcipProcessing,
    Success,
    Failed,
    Stuck,
}

impl RefillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefillStatus::Idle => "idle",
            RefillStatus::WalletPending => "wallet_pending",
            RefillStatus::TxPending => "tx_pending",
            RefillStatus::CcipProcessing => "ccip_processing",
            RefillStatus::Success => "success",
            RefillStatus::Failed => "failed",
            RefillStatus::Stuck => "stuck",
        }
    }

    /// Still moving through phases
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RefillStatus::WalletPending | RefillStatus::TxPending | RefillStatus::CcipProcessing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefillStatus::Success | RefillStatus::Failed | RefillStatus::Stuck
        )
    }
}

/// Ordered phases of one refill round trip
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RefillPhase {
    WalletConfirm,
    MonadConfirm,
    AvalancheConfirm,
    CcipResponse,
    MonadRefill,
}

impl RefillPhase {
    pub const ALL: [RefillPhase; 5] = [
        RefillPhase::WalletConfirm,
        RefillPhase::MonadConfirm,
        RefillPhase::AvalancheConfirm,
        RefillPhase::CcipResponse,
        RefillPhase::MonadRefill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RefillPhase::WalletConfirm => "wallet_confirm",
            RefillPhase::MonadConfirm => "monad_confirm",
            RefillPhase::AvalancheConfirm => "avalanche_confirm",
            RefillPhase::CcipResponse => "ccip_response",
            RefillPhase::MonadRefill => "monad_refill",
        }
    }

    pub fn next(&self) -> Option<RefillPhase> {
        match self {
            RefillPhase::WalletConfirm => Some(RefillPhase::MonadConfirm),
            RefillPhase::MonadConfirm => Some(RefillPhase::AvalancheConfirm),
            RefillPhase::AvalancheConfirm => Some(RefillPhase::CcipResponse),
            RefillPhase::CcipResponse => Some(RefillPhase::MonadRefill),
            RefillPhase::MonadRefill => None,
        }
    }

    /// Status reported while sitting in this phase
    pub fn status(&self) -> RefillStatus {
        match self {
            RefillPhase::WalletConfirm => RefillStatus::WalletPending,
            RefillPhase::MonadConfirm => RefillStatus::TxPending,
            RefillPhase::AvalancheConfirm | RefillPhase::CcipResponse | RefillPhase::MonadRefill => {
                RefillStatus::CcipProcessing
            }
        }
    }
}

impl fmt::Display for RefillPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefillPhase {
    type Err = RefillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RefillPhase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| RefillError::Config(format!("unknown phase {}", s)))
    }
}

/// How an identifier was obtained, lowest confidence first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    /// Found by scanning a recent block window after the fact
    Recovered,
    /// Read from the initiating transaction or the matching response event
    Extracted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageIdRecord {
    pub id: H256,
    pub source: IdSource,
}

/// Populated only on success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefillOutcome {
    pub refill_amount: U256,
    pub new_drip_amount: U256,
    pub volatility_score: Option<u64>,
    pub volatility_trend: Option<i64>,
}

/// Last known state of one asset's refill attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefillAttempt {
    pub asset: Asset,
    pub status: RefillStatus,
    pub phase: Option<RefillPhase>,
    pub progress: u8,
    pub outbound_message_id: Option<MessageIdRecord>,
    pub inbound_message_id: Option<MessageIdRecord>,
    pub local_tx_hash: Option<H256>,
    pub result: Option<RefillOutcome>,
    pub error_message: Option<String>,
    pub stuck_phase: Option<RefillPhase>,
    /// Local block that included the trigger transaction
    #[serde(default)]
    pub local_block: Option<u64>,
    /// Remote head sampled once the trigger was confirmed
    #[serde(default)]
    pub remote_from_block: Option<u64>,
    /// Tank balance sampled before submission
    #[serde(default)]
    pub tank_before: Option<U256>,
    pub last_updated: DateTime<Utc>,
}

impl RefillAttempt {
    /// The idle template every attempt starts from and returns to
    pub fn idle(asset: Asset) -> Self {
        Self {
            asset,
            status: RefillStatus::Idle,
            phase: None,
            progress: 0,
            outbound_message_id: None,
            inbound_message_id: None,
            local_tx_hash: None,
            result: None,
            error_message: None,
            stuck_phase: None,
            local_block: None,
            remote_from_block: None,
            tank_before: None,
            last_updated: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == RefillStatus::Idle
    }

    pub fn outbound_id(&self) -> Option<H256> {
        self.outbound_message_id.map(|r| r.id)
    }

    pub fn inbound_id(&self) -> Option<H256> {
        self.inbound_message_id.map(|r| r.id)
    }

    /// Enter `wallet_pending` for a fresh attempt
    pub fn begin(&mut self) {
        *self = RefillAttempt::idle(self.asset);
        self.status = RefillStatus::WalletPending;
        self.phase = Some(RefillPhase::WalletConfirm);
    }

    /// Move to `phase`, never backwards, never lowering progress
    pub fn advance_to(&mut self, phase: RefillPhase, progress: u8) {
        if let Some(current) = self.phase {
            if phase < current {
                return;
            }
        }
        self.phase = Some(phase);
        self.status = phase.status();
        self.raise_progress(progress);
    }

    pub fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
        self.touch();
    }

    /// Keep the first id unless the new one comes from a more trusted source
    pub fn set_outbound(&mut self, id: H256, source: IdSource) -> bool {
        if Self::replace_id(&mut self.outbound_message_id, id, source) {
            self.touch();
            return true;
        }
        false
    }

    pub fn set_inbound(&mut self, id: H256, source: IdSource) -> bool {
        if Self::replace_id(&mut self.inbound_message_id, id, source) {
            self.touch();
            return true;
        }
        false
    }

    fn replace_id(slot: &mut Option<MessageIdRecord>, id: H256, source: IdSource) -> bool {
        match slot {
            Some(existing) if existing.source >= source => false,
            _ => {
                *slot = Some(MessageIdRecord { id, source });
                true
            }
        }
    }

    pub fn succeed(&mut self, outcome: RefillOutcome) {
        self.status = RefillStatus::Success;
        self.phase = None;
        self.progress = 100;
        self.result = Some(outcome);
        self.error_message = None;
        self.stuck_phase = None;
        self.touch();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = RefillStatus::Failed;
        self.phase = None;
        self.result = None;
        self.error_message = Some(message.into());
        self.touch();
    }

    /// Record the phase that stopped making progress
    pub fn mark_stuck(&mut self, message: Option<String>) {
        self.stuck_phase = self.phase;
        self.status = RefillStatus::Stuck;
        self.phase = None;
        self.error_message = message;
        self.touch();
    }

    pub fn reset(&mut self) {
        *self = RefillAttempt::idle(self.asset);
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_status() {
        let mut phase = RefillPhase::WalletConfirm;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, RefillPhase::ALL.to_vec());
        assert_eq!(RefillPhase::MonadConfirm.status(), RefillStatus::TxPending);
        assert_eq!(RefillPhase::MonadRefill.status(), RefillStatus::CcipProcessing);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("LINK".parse::<Asset>().unwrap(), Asset::Link);
        assert!("btc".parse::<Asset>().is_err());
        assert_eq!(
            "avalanche_confirm".parse::<RefillPhase>().unwrap(),
            RefillPhase::AvalancheConfirm
        );
    }

    #[test]
    fn test_advance_never_regresses() {
        let mut attempt = RefillAttempt::idle(Asset::Mon);
        attempt.begin();
        attempt.advance_to(RefillPhase::AvalancheConfirm, 15);
        attempt.raise_progress(40);

        attempt.advance_to(RefillPhase::MonadConfirm, 5);
        assert_eq!(attempt.phase, Some(RefillPhase::AvalancheConfirm));
        assert_eq!(attempt.progress, 40);

        attempt.advance_to(RefillPhase::CcipResponse, 30);
        assert_eq!(attempt.phase, Some(RefillPhase::CcipResponse));
        assert_eq!(attempt.progress, 40);
    }

    #[test]
    fn test_recovered_id_never_replaces_extracted() {
        let extracted = H256::repeat_byte(0xaa);
        let recovered = H256::repeat_byte(0xbb);

        let mut attempt = RefillAttempt::idle(Asset::Link);
        assert!(attempt.set_outbound(extracted, IdSource::Extracted));
        assert!(!attempt.set_outbound(recovered, IdSource::Recovered));
        assert!(!attempt.set_outbound(recovered, IdSource::Extracted));
        assert_eq!(attempt.outbound_id(), Some(extracted));

        let mut attempt = RefillAttempt::idle(Asset::Link);
        attempt.set_outbound(recovered, IdSource::Recovered);
        assert!(attempt.set_outbound(extracted, IdSource::Extracted));
        assert_eq!(attempt.outbound_id(), Some(extracted));
    }

    #[test]
    fn test_stuck_records_phase() {
        let mut attempt = RefillAttempt::idle(Asset::Mon);
        attempt.begin();
        attempt.advance_to(RefillPhase::CcipResponse, 70);
        attempt.mark_stuck(None);
        assert_eq!(attempt.status, RefillStatus::Stuck);
        assert_eq!(attempt.stuck_phase, Some(RefillPhase::CcipResponse));
        assert_eq!(attempt.progress, 70);
    }

    #[test]
    fn test_snapshot_preserves_ids() {
        let mut attempt = RefillAttempt::idle(Asset::Mon);
        attempt.begin();
        attempt.local_tx_hash = Some(H256::repeat_byte(0x01));
        attempt.set_outbound(H256::repeat_byte(0x42), IdSource::Extracted);
        attempt.advance_to(RefillPhase::AvalancheConfirm, 15);

        let json = serde_json::to_string(&attempt).unwrap();
        assert!(json.contains("\"status\":\"ccip_processing\""));
        assert!(json.contains("\"phase\":\"avalanche_confirm\""));

        let restored: RefillAttempt = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, attempt);
        assert_eq!(restored.outbound_id(), Some(H256::repeat_byte(0x42)));
    }
}
