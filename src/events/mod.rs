//! Contract events and cross-chain message id extraction
//!
//! Defines the events emitted by the faucet and the remote volatility helper,
//! the precomputed topic table, and the extractor that pulls message ids out
//! of receipts and log ranges.

use crate::chain::LogSource;
use crate::error::RefillResult;

use ethers::types::{Address, Filter, Log, TransactionReceipt, H256, U256};
use lazy_static::lazy_static;
use serde::Serialize;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use tracing::debug;

/// Events the monitor looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RefillEvent {
    /// Faucet sent the volatility request (local chain)
    RefillTriggered,
    /// Helper answered the request (remote chain)
    VolatilityResponseSent,
    /// Faucet received the answer (local chain)
    VolatilityResponseReceived,
}

impl RefillEvent {
    pub const ALL: [RefillEvent; 3] = [
        RefillEvent::RefillTriggered,
        RefillEvent::VolatilityResponseSent,
        RefillEvent::VolatilityResponseReceived,
    ];

    /// Human-readable signature as declared in the contract
    pub fn signature(&self) -> &'static str {
        match self {
            RefillEvent::RefillTriggered => "RefillTriggered(bytes32 indexed outboundMessageId)",
            RefillEvent::VolatilityResponseSent => {
                "VolatilityResponseSent(bytes32 indexed responseMessageId, bytes32 indexed requestMessageId, uint256 volatilityScore)"
            }
            RefillEvent::VolatilityResponseReceived => {
                "VolatilityResponseReceived(bytes32 indexed messageId, uint256 volatilityScore, int256 volatilityTrend, uint256 dripMultiplierBps)"
            }
        }
    }

    /// Precomputed topic hash
    pub fn topic(&self) -> H256 {
        TOPICS[self]
    }

    pub fn name(&self) -> &'static str {
        match self {
            RefillEvent::RefillTriggered => "refill_triggered",
            RefillEvent::VolatilityResponseSent => "volatility_response_sent",
            RefillEvent::VolatilityResponseReceived => "volatility_response_received",
        }
    }
}

lazy_static! {
    static ref TOPICS: HashMap<RefillEvent, H256> = RefillEvent::ALL
        .into_iter()
        .map(|event| (event, compute_topic(event.signature())))
        .collect();
}

/// Strip parameter names and `indexed` markers: `Foo(bytes32 indexed id)` -> `Foo(bytes32)`
pub fn canonical_signature(signature: &str) -> String {
    let signature = signature.trim();
    let (name, rest) = match signature.split_once('(') {
        Some(parts) => parts,
        None => return signature.to_string(),
    };
    let params = rest.trim_end_matches(')');

    let types: Vec<&str> = params
        .split(',')
        .filter_map(|p| p.split_whitespace().next())
        .collect();

    format!("{}({})", name.trim(), types.join(","))
}

/// keccak-256 of the canonical signature
pub fn compute_topic(signature: &str) -> H256 {
    let canonical = canonical_signature(signature);
    H256::from_slice(&Keccak256::digest(canonical.as_bytes()))
}

/// Topic for a signature, served from the table when it is a known event
pub fn topic_for(signature: &str) -> H256 {
    RefillEvent::ALL
        .into_iter()
        .find(|event| event.signature() == signature)
        .map(|event| event.topic())
        .unwrap_or_else(|| compute_topic(signature))
}

/// First log emitted by `contract` with `topic` that satisfies `filter`
pub fn find_log<'a, F>(logs: &'a [Log], topic: H256, contract: Address, filter: F) -> Option<&'a Log>
where
    F: Fn(&Log) -> bool,
{
    logs.iter().find(|log| {
        log.address == contract && log.topics.first() == Some(&topic) && filter(log)
    })
}

/// Indexed parameter `index` (1-based topic position)
pub fn indexed_param(log: &Log, index: usize) -> Option<H256> {
    log.topics.get(index).copied()
}

/// Message id carried as the first indexed parameter of `signature`
pub fn extract_from_logs(logs: &[Log], signature: &str, contract: Address) -> Option<H256> {
    find_log(logs, topic_for(signature), contract, |_| true).and_then(|log| indexed_param(log, 1))
}

/// Outbound id from the trigger receipt, re-fetching the block's logs when
/// the receipt itself carries none.
pub async fn extract_outbound(
    source: &dyn LogSource,
    receipt: &TransactionReceipt,
    faucet: Address,
) -> RefillResult<Option<H256>> {
    let signature = RefillEvent::RefillTriggered.signature();

    if let Some(id) = extract_from_logs(&receipt.logs, signature, faucet) {
        return Ok(Some(id));
    }

    let block = match receipt.block_number {
        Some(block) => block,
        None => return Ok(None),
    };

    debug!(
        "Receipt {:?} carried no trigger log, scanning block {}",
        receipt.transaction_hash, block
    );

    let filter = Filter::new()
        .address(faucet)
        .topic0(RefillEvent::RefillTriggered.topic())
        .from_block(block)
        .to_block(block);
    let logs = source.logs(&filter).await?;

    let tx_hash = receipt.transaction_hash;
    Ok(find_log(&logs, RefillEvent::RefillTriggered.topic(), faucet, |log| {
        log.transaction_hash.map_or(true, |h| h == tx_hash)
    })
    .and_then(|log| indexed_param(log, 1)))
}

/// Response id from helper logs; when the request id is known the response
/// must reference it.
pub fn extract_response(logs: &[Log], helper: Address, request_id: Option<H256>) -> Option<H256> {
    find_log(
        logs,
        RefillEvent::VolatilityResponseSent.topic(),
        helper,
        |log| match request_id {
            Some(request) => indexed_param(log, 2) == Some(request),
            None => true,
        },
    )
    .and_then(|log| indexed_param(log, 1))
}

/// Payload of `VolatilityResponseReceived`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatilityReport {
    pub message_id: H256,
    pub volatility_score: Option<u64>,
    pub volatility_trend: Option<i64>,
    pub drip_multiplier_bps: U256,
}

/// Arrival of the response on the faucet, matching `inbound_id` when known
pub fn extract_arrival(
    logs: &[Log],
    faucet: Address,
    inbound_id: Option<H256>,
) -> Option<VolatilityReport> {
    let log = find_log(
        logs,
        RefillEvent::VolatilityResponseReceived.topic(),
        faucet,
        |log| match inbound_id {
            Some(id) => indexed_param(log, 1) == Some(id),
            None => true,
        },
    )?;

    let message_id = indexed_param(log, 1)?;
    let data = log.data.as_ref();
    let word = |i: usize| data.get(i * 32..(i + 1) * 32);

    let score = word(0).map(U256::from_big_endian);
    Some(VolatilityReport {
        message_id,
        volatility_score: score.filter(|s| s.bits() <= 64).map(|s| s.as_u64()),
        volatility_trend: word(1).and_then(decode_i64_word),
        drip_multiplier_bps: word(2).map(U256::from_big_endian).unwrap_or_default(),
    })
}

/// Two's-complement int256 word narrowed to i64, if it fits
fn decode_i64_word(word: &[u8]) -> Option<i64> {
    let (high, low) = word.split_at(24);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(low);
    let value = i64::from_be_bytes(bytes);

    let extension = if value < 0 { 0xff } else { 0x00 };
    high.iter().all(|b| *b == extension).then_some(value)
}

#[cfg(test)]
pub(crate) mod test_logs {
    use super::*;
    use ethers::types::Bytes;

    pub fn log(address: Address, topics: Vec<H256>, data: Vec<u8>, tx_hash: H256) -> Log {
        Log {
            address,
            topics,
            data: Bytes::from(data),
            transaction_hash: Some(tx_hash),
            ..Default::default()
        }
    }

    pub fn trigger_log(faucet: Address, id: H256, tx_hash: H256) -> Log {
        log(faucet, vec![RefillEvent::RefillTriggered.topic(), id], vec![], tx_hash)
    }

    pub fn response_sent_log(helper: Address, response: H256, request: H256) -> Log {
        let mut data = [0u8; 32];
        data[31] = 42;
        log(
            helper,
            vec![RefillEvent::VolatilityResponseSent.topic(), response, request],
            data.to_vec(),
            H256::zero(),
        )
    }

    pub fn arrival_log(faucet: Address, id: H256, score: u64, trend: i64, bps: u64) -> Log {
        let mut data = Vec::with_capacity(96);
        let mut word = [0u8; 32];
        U256::from(score).to_big_endian(&mut word);
        data.extend_from_slice(&word);
        let fill = if trend < 0 { 0xff } else { 0x00 };
        let mut word = [fill; 32];
        word[24..].copy_from_slice(&trend.to_be_bytes());
        data.extend_from_slice(&word);
        let mut word = [0u8; 32];
        U256::from(bps).to_big_endian(&mut word);
        data.extend_from_slice(&word);
        log(
            faucet,
            vec![RefillEvent::VolatilityResponseReceived.topic(), id],
            data,
            H256::zero(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_logs::*;
    use super::*;
    use crate::chain::MockLogSource;
    use ethers::types::U64;

    fn faucet() -> Address {
        Address::from_low_u64_be(0xf1)
    }

    #[test]
    fn test_canonical_signature() {
        assert_eq!(
            canonical_signature(RefillEvent::VolatilityResponseSent.signature()),
            "VolatilityResponseSent(bytes32,bytes32,uint256)"
        );
        assert_eq!(
            canonical_signature("Transfer(address indexed from, address indexed to, uint256 value)"),
            "Transfer(address,address,uint256)"
        );
    }

    #[test]
    fn test_topic_matches_known_hash() {
        // keccak256("Transfer(address,address,uint256)")
        let expected: H256 = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
            .parse()
            .unwrap();
        assert_eq!(
            compute_topic("Transfer(address indexed from, address indexed to, uint256 value)"),
            expected
        );
        assert_eq!(
            topic_for(RefillEvent::RefillTriggered.signature()),
            RefillEvent::RefillTriggered.topic()
        );
    }

    #[test]
    fn test_extracts_id_from_matching_contract_only() {
        let id = H256::repeat_byte(0x5a);
        let other = Address::from_low_u64_be(0xbad);
        let tx = H256::repeat_byte(0x01);

        let logs = vec![
            trigger_log(other, H256::repeat_byte(0x99), tx),
            trigger_log(faucet(), id, tx),
        ];
        let signature = RefillEvent::RefillTriggered.signature();

        let extracted = extract_from_logs(&logs, signature, faucet()).unwrap();
        assert_eq!(extracted, id);
        assert_eq!(extracted.as_bytes().len(), 32);

        assert!(extract_from_logs(&logs[..1], signature, faucet()).is_none());
        assert!(extract_from_logs(&[], signature, faucet()).is_none());
    }

    #[test]
    fn test_response_cross_reference() {
        let helper = Address::from_low_u64_be(0xa2);
        let ours = H256::repeat_byte(0x0a);
        let logs = vec![
            response_sent_log(helper, H256::repeat_byte(0xee), H256::repeat_byte(0x0b)),
            response_sent_log(helper, H256::repeat_byte(0xff), ours),
        ];

        assert_eq!(
            extract_response(&logs, helper, Some(ours)),
            Some(H256::repeat_byte(0xff))
        );
        assert_eq!(
            extract_response(&logs, helper, None),
            Some(H256::repeat_byte(0xee))
        );
        assert_eq!(extract_response(&logs, helper, Some(H256::zero())), None);
    }

    #[test]
    fn test_arrival_payload_decoding() {
        let id = H256::repeat_byte(0x33);
        let logs = vec![arrival_log(faucet(), id, 63, -4, 12_500)];

        let report = extract_arrival(&logs, faucet(), Some(id)).unwrap();
        assert_eq!(report.message_id, id);
        assert_eq!(report.volatility_score, Some(63));
        assert_eq!(report.volatility_trend, Some(-4));
        assert_eq!(report.drip_multiplier_bps, U256::from(12_500u64));

        assert!(extract_arrival(&logs, faucet(), Some(H256::zero())).is_none());
    }

    #[tokio::test]
    async fn test_outbound_falls_back_to_block_logs() {
        let tx = H256::repeat_byte(0x07);
        let id = H256::repeat_byte(0x44);
        let receipt = TransactionReceipt {
            transaction_hash: tx,
            block_number: Some(U64::from(812u64)),
            ..Default::default()
        };

        let mut source = MockLogSource::new();
        source.expect_logs().times(1).returning(move |_| {
            Ok(vec![
                trigger_log(faucet(), H256::repeat_byte(0x45), H256::repeat_byte(0x08)),
                trigger_log(faucet(), id, tx),
            ])
        });

        let extracted = extract_outbound(&source, &receipt, faucet()).await.unwrap();
        assert_eq!(extracted, Some(id));
    }

    #[tokio::test]
    async fn test_outbound_prefers_receipt_logs() {
        let tx = H256::repeat_byte(0x07);
        let id = H256::repeat_byte(0x44);
        let receipt = TransactionReceipt {
            transaction_hash: tx,
            block_number: Some(U64::from(812u64)),
            logs: vec![trigger_log(faucet(), id, tx)],
            ..Default::default()
        };

        let mut source = MockLogSource::new();
        source.expect_logs().never();

        let extracted = extract_outbound(&source, &receipt, faucet()).await.unwrap();
        assert_eq!(extracted, Some(id));
    }
}
