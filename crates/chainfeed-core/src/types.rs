//! Typed records carried by the event streams.

use alloy_primitives::{Address, Bloom, Bytes, B256};
use serde::{Deserialize, Serialize};

/// Hash of a transaction accepted into the mempool.
pub type PendingTxHash = B256;

// ─── RpcHeader ────────────────────────────────────────────────────────────────

/// A block header in Ethereum JSON-RPC shape, together with its hash.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcHeader {
    /// Block hash.
    pub hash: B256,
    #[serde(with = "quantity")]
    pub number: u64,
    pub parent_hash: B256,
    /// Unix timestamp in seconds.
    #[serde(with = "quantity")]
    pub timestamp: u64,
    /// Block proposer, reported as `miner`.
    pub miner: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(
        default,
        with = "quantity::opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_fee_per_gas: Option<u64>,
    #[serde(default)]
    pub extra_data: Bytes,
}

// ─── LogRecord ────────────────────────────────────────────────────────────────

/// A log emitted by a transaction, in Ethereum JSON-RPC shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Contract that emitted the log.
    pub address: Address,
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Bytes,
    #[serde(with = "quantity")]
    pub block_number: u64,
    pub transaction_hash: B256,
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    pub block_hash: B256,
    #[serde(with = "quantity")]
    pub log_index: u64,
    /// `true` if the log was reverted by a reorg.
    #[serde(default)]
    pub removed: bool,
}

/// Hex quantity encoding (`"0x1a"`) for integer fields.
pub mod quantity {
    use alloy_primitives::U64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        U64::from(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        Ok(U64::deserialize(deserializer)?.to::<u64>())
    }

    pub mod opt {
        use alloy_primitives::U64;
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<u64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            value.map(U64::from).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            Ok(Option::<U64>::deserialize(deserializer)?.map(|v| v.to::<u64>()))
        }
    }
}
