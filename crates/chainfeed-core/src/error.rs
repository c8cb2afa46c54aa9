//! Error types shared by the ChainFeed crates.

use thiserror::Error;

/// Errors raised while interpreting filter criteria.
#[derive(Debug, Error)]
pub enum CoreError {
    /// `fromBlock` is above `toBlock`.
    #[error("invalid block range: from {from} > to {to}")]
    InvalidBlockRange { from: u64, to: u64 },

    /// Criteria could not be parsed or are self-contradictory.
    #[error("invalid filter criteria: {0}")]
    InvalidCriteria(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

