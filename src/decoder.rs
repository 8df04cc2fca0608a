// src/decoder.rs

//! # Log Decoding
//!
//! Turns raw `eth_getLogs` entries into typed event candidates. One decode
//! path handles every event kind, driven by the kind's topic/data layout;
//! adding a stream means adding a variant and a match arm, not a new
//! handler.
//!
//! Payloads are rendered to JSON with uint256 values as decimal strings
//! (they do not fit in JSON numbers) and addresses as 0x-prefixed lowercase
//! hex.

use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use serde_json::json;

use crate::errors::DecodeError;
use crate::types::EventKind;

/// keccak256 of the event's canonical signature, i.e. the log's topic0.
pub fn topic0(kind: EventKind) -> H256 {
    H256::from(keccak256(kind.signature_text().as_bytes()))
}

/// A decoded log that has not yet passed receipt validation.
#[derive(Debug, Clone)]
pub struct EventCandidate {
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub event_kind: EventKind,
    pub contract_address: Address,
    pub payload: serde_json::Value,
}

/// Decode one raw log as `kind`. The caller already filtered by topic0, so
/// a signature mismatch here means the provider returned something we did
/// not ask for.
pub fn decode_log(kind: EventKind, log: &Log) -> Result<EventCandidate, DecodeError> {
    let sig = log.topics.first().ok_or(DecodeError::MissingTopics)?;
    if *sig != topic0(kind) {
        return Err(DecodeError::UnknownSignature(*sig));
    }

    let payload = match kind {
        EventKind::MarketCreated => {
            require_topics(log, 3)?;
            let market_id = topic_u256(log, 1);
            let creator = topic_address(log, 2);
            let start_time = u256_to_u64(word_u256(&log.data, 0)?, "start_time")?;
            let end_time = u256_to_u64(word_u256(&log.data, 1)?, "end_time")?;
            json!({
                "market_id": market_id.to_string(),
                "creator": format_address(creator),
                "start_time": start_time,
                "end_time": end_time,
            })
        }
        EventKind::TicketPurchased => {
            require_topics(log, 3)?;
            let market_id = topic_u256(log, 1);
            let buyer = topic_address(log, 2);
            let outcome = u256_to_u64(word_u256(&log.data, 0)?, "outcome")?;
            let amount = word_u256(&log.data, 1)?;
            json!({
                "market_id": market_id.to_string(),
                "buyer": format_address(buyer),
                "outcome": outcome,
                "amount": amount.to_string(),
            })
        }
        EventKind::MarketResolved => {
            require_topics(log, 2)?;
            let market_id = topic_u256(log, 1);
            let winning_outcome = u256_to_u64(word_u256(&log.data, 0)?, "winning_outcome")?;
            let oracle = word_address(&log.data, 1)?;
            json!({
                "market_id": market_id.to_string(),
                "winning_outcome": winning_outcome,
                "oracle": format_address(oracle),
            })
        }
        EventKind::RewardClaimed => {
            require_topics(log, 3)?;
            let market_id = topic_u256(log, 1);
            let account = topic_address(log, 2);
            let amount = word_u256(&log.data, 0)?;
            json!({
                "market_id": market_id.to_string(),
                "account": format_address(account),
                "amount": amount.to_string(),
            })
        }
        EventKind::Staked | EventKind::Unstaked => {
            require_topics(log, 2)?;
            let account = topic_address(log, 1);
            let amount = word_u256(&log.data, 0)?;
            let total_staked = word_u256(&log.data, 1)?;
            json!({
                "account": format_address(account),
                "amount": amount.to_string(),
                "total_staked": total_staked.to_string(),
            })
        }
    };

    Ok(EventCandidate {
        block_number: log
            .block_number
            .ok_or(DecodeError::MissingField("block_number"))?
            .as_u64(),
        transaction_hash: log
            .transaction_hash
            .ok_or(DecodeError::MissingField("transaction_hash"))?,
        log_index: log
            .log_index
            .map(|i| i.as_u64())
            .ok_or(DecodeError::MissingField("log_index"))?,
        event_kind: kind,
        contract_address: log.address,
        payload,
    })
}

fn require_topics(log: &Log, expected: usize) -> Result<(), DecodeError> {
    if log.topics.len() != expected {
        return Err(DecodeError::TopicCount {
            expected,
            found: log.topics.len(),
        });
    }
    Ok(())
}

fn topic_u256(log: &Log, index: usize) -> U256 {
    U256::from_big_endian(log.topics[index].as_bytes())
}

fn topic_address(log: &Log, index: usize) -> Address {
    Address::from_slice(&log.topics[index].as_bytes()[12..])
}

fn word_u256(data: &[u8], word: usize) -> Result<U256, DecodeError> {
    let start = word * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(DecodeError::DataTooShort {
            needed: end,
            found: data.len(),
        });
    }
    Ok(U256::from_big_endian(&data[start..end]))
}

fn word_address(data: &[u8], word: usize) -> Result<Address, DecodeError> {
    let start = word * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(DecodeError::DataTooShort {
            needed: end,
            found: data.len(),
        });
    }
    Ok(Address::from_slice(&data[start + 12..end]))
}

fn u256_to_u64(value: U256, field: &'static str) -> Result<u64, DecodeError> {
    if value > U256::from(u64::MAX) {
        return Err(DecodeError::ValueOutOfRange(field));
    }
    Ok(value.as_u64())
}

fn format_address(addr: Address) -> String {
    format!("{:#x}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    fn h256_from_u256(value: U256) -> H256 {
        let mut buf = [0u8; 32];
        value.to_big_endian(&mut buf);
        H256::from(buf)
    }

    fn h256_from_address(addr: Address) -> H256 {
        let mut buf = [0u8; 32];
        buf[12..].copy_from_slice(addr.as_bytes());
        H256::from(buf)
    }

    fn encode_words(words: &[U256]) -> Bytes {
        let mut data = Vec::with_capacity(words.len() * 32);
        for w in words {
            let mut buf = [0u8; 32];
            w.to_big_endian(&mut buf);
            data.extend_from_slice(&buf);
        }
        Bytes::from(data)
    }

    fn base_log(kind: EventKind, topics: Vec<H256>, data: Bytes) -> Log {
        let mut all_topics = vec![topic0(kind)];
        all_topics.extend(topics);
        Log {
            address: Address::repeat_byte(0xaa),
            topics: all_topics,
            data,
            block_number: Some(U64::from(1_000u64)),
            transaction_hash: Some(H256::repeat_byte(0x11)),
            log_index: Some(U256::from(3u64)),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_ticket_purchased() {
        let buyer = Address::repeat_byte(0x42);
        let log = base_log(
            EventKind::TicketPurchased,
            vec![h256_from_u256(U256::from(7u64)), h256_from_address(buyer)],
            encode_words(&[U256::from(2u64), U256::exp10(18)]),
        );
        let candidate = decode_log(EventKind::TicketPurchased, &log).unwrap();
        assert_eq!(candidate.block_number, 1_000);
        assert_eq!(candidate.log_index, 3);
        assert_eq!(candidate.payload["market_id"], "7");
        assert_eq!(candidate.payload["buyer"], format!("{:#x}", buyer));
        assert_eq!(candidate.payload["outcome"], 2);
        assert_eq!(candidate.payload["amount"], "1000000000000000000");
    }

    #[test]
    fn decodes_market_resolved_oracle_from_data() {
        let oracle = Address::repeat_byte(0x33);
        let mut oracle_word = [0u8; 32];
        oracle_word[12..].copy_from_slice(oracle.as_bytes());
        let mut data = Vec::new();
        let mut outcome = [0u8; 32];
        U256::from(1u64).to_big_endian(&mut outcome);
        data.extend_from_slice(&outcome);
        data.extend_from_slice(&oracle_word);

        let log = base_log(
            EventKind::MarketResolved,
            vec![h256_from_u256(U256::from(99u64))],
            Bytes::from(data),
        );
        let candidate = decode_log(EventKind::MarketResolved, &log).unwrap();
        assert_eq!(candidate.payload["winning_outcome"], 1);
        assert_eq!(candidate.payload["oracle"], format!("{:#x}", oracle));
    }

    #[test]
    fn rejects_truncated_data() {
        let log = base_log(
            EventKind::Staked,
            vec![h256_from_address(Address::repeat_byte(0x01))],
            encode_words(&[U256::from(5u64)]),
        );
        match decode_log(EventKind::Staked, &log) {
            Err(DecodeError::DataTooShort { needed, found }) => {
                assert_eq!(needed, 64);
                assert_eq!(found, 32);
            }
            other => panic!("expected DataTooShort, got {:?}", other),
        }
    }

    #[test]
    fn rejects_wrong_signature() {
        let mut log = base_log(
            EventKind::Staked,
            vec![h256_from_address(Address::repeat_byte(0x01))],
            encode_words(&[U256::one(), U256::one()]),
        );
        log.topics[0] = H256::repeat_byte(0xff);
        assert!(matches!(
            decode_log(EventKind::Staked, &log),
            Err(DecodeError::UnknownSignature(_))
        ));
    }

    #[test]
    fn rejects_wrong_topic_count() {
        let log = base_log(
            EventKind::RewardClaimed,
            vec![h256_from_u256(U256::one())],
            encode_words(&[U256::one()]),
        );
        assert!(matches!(
            decode_log(EventKind::RewardClaimed, &log),
            Err(DecodeError::TopicCount {
                expected: 3,
                found: 2
            })
        ));
    }

    #[test]
    fn topic0_values_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for kind in EventKind::all() {
            assert!(seen.insert(topic0(*kind)), "duplicate topic0 for {:?}", kind);
        }
    }
}
