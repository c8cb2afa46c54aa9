//! # chainfeed-events
//!
//! Feeds ChainFeed's segmented streams from an upstream chain-event source.
//!
//! - [`ChainEventSource`]: upstream publisher of block and transaction events
//! - [`EventDecoder`]: raw payload → [`RpcHeader`](chainfeed_core::RpcHeader) /
//!   [`LogRecord`](chainfeed_core::LogRecord)
//! - [`EventAggregator`]: owns the header, log and pending-tx streams
//! - [`ChannelEventSource`]: in-process source

pub mod aggregator;
pub mod config;
pub mod decode;
pub mod error;
pub mod source;

pub use aggregator::{AggregatorMetrics, EventAggregator, PendingTxListener};
pub use config::AggregatorConfig;
pub use decode::{AbciEventDecoder, EventDecoder};
pub use error::{AggregatorError, SourceError};
pub use source::{
    AbciEvent, ChainEventSource, ChannelEventSource, EventAttribute, EventQuery, RawBlockEvent,
    RawEvent, RawTxEvent,
};
