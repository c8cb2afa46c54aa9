//! Polling filter error types.

use alloy_primitives::B256;
use chainfeed_core::CoreError;
use chainfeed_events::AggregatorError;
use thiserror::Error;

/// JSON-RPC "invalid params".
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC "internal error".
pub const INTERNAL_ERROR: i64 = -32603;
/// Generic server error, used by Ethereum nodes for filter failures.
pub const SERVER_ERROR: i64 = -32000;

/// Errors returned by filter operations.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The registry already holds `filter_cap` filters.
    #[error("error creating filter: max limit reached ({cap})")]
    LimitReached { cap: usize },

    /// No filter is installed under this id (never created, uninstalled or
    /// expired).
    #[error("filter {0} not found")]
    NotFound(String),

    /// The filter exists but does not produce logs.
    #[error("filter {0} is not a log filter")]
    WrongKind(String),

    #[error("invalid block range: from {from} > to {to}")]
    InvalidBlockRange { from: u64, to: u64 },

    #[error("invalid filter criteria: {0}")]
    InvalidCriteria(String),

    /// `blockHash` criteria named a block the backend does not know.
    #[error("unknown block {0}")]
    UnknownBlock(B256),

    /// The log backend failed.
    #[error("log backend error: {0}")]
    Backend(String),

    #[error("query exceeds max block range {cap}")]
    BlockRangeTooLarge { cap: u64 },

    #[error("query returned more than {cap} results")]
    TooManyResults { cap: usize },

    /// The event aggregator could not provide a stream.
    #[error("event stream unavailable: {0}")]
    Upstream(String),
}

impl FilterError {
    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidBlockRange { .. } | Self::InvalidCriteria(_) | Self::WrongKind(_) => INVALID_PARAMS,
            Self::Backend(_) | Self::Upstream(_) => INTERNAL_ERROR,
            Self::LimitReached { .. }
            | Self::NotFound(_)
            | Self::UnknownBlock(_)
            | Self::BlockRangeTooLarge { .. }
            | Self::TooManyResults { .. } => SERVER_ERROR,
        }
    }

    /// Returns `true` if the request could succeed with narrower parameters.
    pub fn is_query_limit(&self) -> bool {
        matches!(self, Self::BlockRangeTooLarge { .. } | Self::TooManyResults { .. })
    }
}

impl From<CoreError> for FilterError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidBlockRange { from, to } => Self::InvalidBlockRange { from, to },
            CoreError::InvalidCriteria(msg) => Self::InvalidCriteria(msg),
            CoreError::Serialization(e) => Self::InvalidCriteria(e.to_string()),
        }
    }
}

impl From<AggregatorError> for FilterError {
    fn from(e: AggregatorError) -> Self {
        Self::Upstream(e.to_string())
    }
}
