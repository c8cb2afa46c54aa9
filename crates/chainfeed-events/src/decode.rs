//! Raw event → typed record decoding.

use std::str::FromStr;

use alloy_primitives::{Bloom, Bytes, B256};
use chainfeed_core::{LogRecord, RpcHeader};

use crate::error::AggregatorError;
use crate::source::{RawBlockEvent, RawTxEvent};

/// Event type carrying the block's aggregated logs bloom.
pub const EVENT_BLOCK_BLOOM: &str = "block_bloom";
/// Attribute of [`EVENT_BLOCK_BLOOM`] holding the hex bloom.
pub const ATTR_BLOOM: &str = "bloom";
/// Event type emitted by the fee market at the end of a block.
pub const EVENT_FEE_MARKET: &str = "fee_market";
/// Attribute of [`EVENT_FEE_MARKET`] holding the decimal base fee.
pub const ATTR_BASE_FEE: &str = "base_fee";
/// Event type carrying the logs of one EVM transaction.
pub const EVENT_TX_LOG: &str = "tx_log";
/// Attribute of [`EVENT_TX_LOG`]; one JSON-encoded log per attribute.
pub const ATTR_TX_LOG: &str = "txLog";

/// Turns raw upstream payloads into typed records.
pub trait EventDecoder: Send + Sync {
    fn decode_header(&self, block: &RawBlockEvent) -> Result<RpcHeader, AggregatorError>;

    /// Logs emitted by the transaction, in emission order. May be empty.
    fn decode_logs(&self, tx: &RawTxEvent) -> Result<Vec<LogRecord>, AggregatorError>;
}

/// Decoder for ABCI-style events emitted by an EVM module.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbciEventDecoder;

impl EventDecoder for AbciEventDecoder {
    fn decode_header(&self, block: &RawBlockEvent) -> Result<RpcHeader, AggregatorError> {
        let mut logs_bloom = Bloom::default();
        let mut base_fee_per_gas = None;

        for event in &block.events {
            match event.kind.as_str() {
                EVENT_BLOCK_BLOOM => {
                    if let Some(raw) = event.attribute(ATTR_BLOOM) {
                        logs_bloom = Bloom::from_str(raw).map_err(|e| {
                            AggregatorError::Decode(format!("block {}: bad bloom: {e}", block.height))
                        })?;
                    }
                }
                EVENT_FEE_MARKET => {
                    if let Some(raw) = event.attribute(ATTR_BASE_FEE) {
                        let fee = raw.parse::<u64>().map_err(|e| {
                            AggregatorError::Decode(format!("block {}: bad base fee {raw:?}: {e}", block.height))
                        })?;
                        base_fee_per_gas = Some(fee);
                    }
                }
                _ => {}
            }
        }

        Ok(RpcHeader {
            hash: block.hash,
            number: block.height,
            parent_hash: block.parent_hash,
            timestamp: block.time,
            miner: block.proposer,
            state_root: block.app_hash,
            transactions_root: block.data_hash,
            receipts_root: B256::ZERO,
            logs_bloom,
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            base_fee_per_gas,
            extra_data: Bytes::new(),
        })
    }

    fn decode_logs(&self, tx: &RawTxEvent) -> Result<Vec<LogRecord>, AggregatorError> {
        tx.events
            .iter()
            .filter(|e| e.kind == EVENT_TX_LOG)
            .flat_map(|e| e.attributes.iter())
            .filter(|a| a.key == ATTR_TX_LOG)
            .map(|a| {
                let mut log: LogRecord = serde_json::from_str(&a.value).map_err(|e| {
                    AggregatorError::Decode(format!("block {} tx {}: bad txLog: {e}", tx.height, tx.index))
                })?;
                log.block_number = tx.height;
                Ok(log)
            })
            .collect()
    }
}
