//! Aggregator and event-source error types.

use thiserror::Error;

/// Errors reported by a [`ChainEventSource`](crate::ChainEventSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The source refused the subscription.
    #[error("subscription rejected: {0}")]
    Rejected(String),

    /// No subscription exists for this subscriber and query.
    #[error("no subscription for {subscriber} on {query}")]
    NotSubscribed { subscriber: String, query: String },

    /// The source is unreachable or shut down.
    #[error("event source unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the [`EventAggregator`](crate::EventAggregator).
#[derive(Debug, Clone, Error)]
pub enum AggregatorError {
    /// Subscribing to an upstream query failed. The aggregator cannot feed
    /// its header and log streams without it.
    #[error("upstream subscription to {query} failed: {reason}")]
    Upstream { query: String, reason: String },

    /// A raw event payload could not be turned into typed records.
    #[error("decode error: {0}")]
    Decode(String),

    /// The aggregator was shut down.
    #[error("aggregator is shut down")]
    Shutdown,
}

impl AggregatorError {
    /// Returns `true` for failures that leave the aggregator unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Shutdown)
    }
}
