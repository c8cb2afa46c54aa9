//! Historical log queries against indexed block storage.

use std::collections::{BTreeMap, HashMap};

use alloy_primitives::B256;
use async_trait::async_trait;
use chainfeed_core::{BlockNumber, FilterCriteria, LogRecord, RpcHeader};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::FilterConfig;
use crate::error::FilterError;

/// Indexed block and log storage.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Height of the newest indexed block.
    async fn latest_block_number(&self) -> Result<u64, FilterError>;

    async fn header_by_number(&self, number: u64) -> Result<Option<RpcHeader>, FilterError>;

    async fn header_by_hash(&self, hash: B256) -> Result<Option<RpcHeader>, FilterError>;

    /// Logs of block `number`, grouped per transaction in execution order.
    async fn logs_by_block_number(&self, number: u64) -> Result<Vec<Vec<LogRecord>>, FilterError>;
}

/// A one-shot log query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogQuery {
    /// Logs of a single block.
    Block { hash: B256 },
    /// Logs of every block in `from..=to`.
    Range { from: u64, to: u64 },
}

impl LogQuery {
    /// Build the query for `criteria`, resolving relative block tags against
    /// the backend's head.
    ///
    /// Only explicit bounds are checked for order (see
    /// [`FilterCriteria::validate`]). A range that inverts once a tag is
    /// resolved, such as `fromBlock` one past the head, is empty.
    pub async fn resolve(criteria: &FilterCriteria, backend: &dyn LogBackend) -> Result<Self, FilterError> {
        if let Some(hash) = criteria.block_hash {
            return Ok(Self::Block { hash });
        }
        let head = backend.latest_block_number().await?;
        let resolve = |bound: Option<BlockNumber>| bound.map_or(head, |b| b.resolve(head));
        Ok(Self::Range {
            from: resolve(criteria.from_block),
            to: resolve(criteria.to_block),
        })
    }

    /// Returns `true` if the query cannot match any block.
    pub fn is_empty(&self) -> bool {
        matches!(*self, Self::Range { from, to } if from > to)
    }

    /// Run the query, returning matching logs in block order.
    pub async fn execute(
        &self,
        criteria: &FilterCriteria,
        backend: &dyn LogBackend,
        config: &FilterConfig,
    ) -> Result<Vec<LogRecord>, FilterError> {
        match *self {
            Self::Block { hash } => {
                let header = backend
                    .header_by_hash(hash)
                    .await?
                    .ok_or(FilterError::UnknownBlock(hash))?;
                let mut out = Vec::new();
                collect_block(&header, criteria, backend, config, &mut out).await?;
                Ok(out)
            }
            Self::Range { from, to } => {
                if from > to {
                    trace!(from, to, "empty block range");
                    return Ok(Vec::new());
                }
                if to - from > config.block_range_cap {
                    return Err(FilterError::BlockRangeTooLarge {
                        cap: config.block_range_cap,
                    });
                }
                let mut out = Vec::new();
                for number in from..=to {
                    let Some(header) = backend.header_by_number(number).await? else {
                        trace!(number, "block not indexed, skipping");
                        continue;
                    };
                    collect_block(&header, criteria, backend, config, &mut out).await?;
                }
                debug!(from, to, matched = out.len(), "range log query finished");
                Ok(out)
            }
        }
    }
}

async fn collect_block(
    header: &RpcHeader,
    criteria: &FilterCriteria,
    backend: &dyn LogBackend,
    config: &FilterConfig,
    out: &mut Vec<LogRecord>,
) -> Result<(), FilterError> {
    if !criteria.bloom_matches(&header.logs_bloom) {
        return Ok(());
    }
    for tx_logs in backend.logs_by_block_number(header.number).await? {
        for log in tx_logs {
            if criteria.matches_address_and_topics(&log) {
                out.push(log);
            }
        }
        if out.len() > config.logs_cap {
            return Err(FilterError::TooManyResults { cap: config.logs_cap });
        }
    }
    Ok(())
}

// ─── InMemoryLogBackend ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredBlock {
    header: RpcHeader,
    logs: Vec<Vec<LogRecord>>,
}

/// A [`LogBackend`] over blocks held in memory.
#[derive(Debug, Default)]
pub struct InMemoryLogBackend {
    blocks: RwLock<BTreeMap<u64, StoredBlock>>,
    by_hash: RwLock<HashMap<B256, u64>>,
}

impl InMemoryLogBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a block and its per-transaction logs, replacing any block at
    /// the same height.
    pub fn insert_block(&self, header: RpcHeader, logs: Vec<Vec<LogRecord>>) {
        let number = header.number;
        let mut blocks = self.blocks.write();
        let mut by_hash = self.by_hash.write();
        if let Some(old) = blocks.insert(number, StoredBlock { header: header.clone(), logs }) {
            by_hash.remove(&old.header.hash);
        }
        by_hash.insert(header.hash, number);
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[async_trait]
impl LogBackend for InMemoryLogBackend {
    async fn latest_block_number(&self) -> Result<u64, FilterError> {
        Ok(self.blocks.read().keys().next_back().copied().unwrap_or(0))
    }

    async fn header_by_number(&self, number: u64) -> Result<Option<RpcHeader>, FilterError> {
        Ok(self.blocks.read().get(&number).map(|b| b.header.clone()))
    }

    async fn header_by_hash(&self, hash: B256) -> Result<Option<RpcHeader>, FilterError> {
        let number = self.by_hash.read().get(&hash).copied();
        match number {
            Some(number) => self.header_by_number(number).await,
            None => Ok(None),
        }
    }

    async fn logs_by_block_number(&self, number: u64) -> Result<Vec<Vec<LogRecord>>, FilterError> {
        Ok(self
            .blocks
            .read()
            .get(&number)
            .map(|b| b.logs.clone())
            .unwrap_or_default())
    }
}
