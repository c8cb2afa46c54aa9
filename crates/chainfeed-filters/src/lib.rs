//! # chainfeed-filters
//!
//! Ethereum JSON-RPC polling filters (`eth_newFilter`, `eth_newBlockFilter`,
//! `eth_newPendingTransactionFilter`, `eth_getFilterChanges`,
//! `eth_getFilterLogs`, `eth_uninstallFilter`) and `eth_getLogs`.
//!
//! Live changes come from the [`EventAggregator`](chainfeed_events::EventAggregator)
//! streams; historical queries go to a [`LogBackend`].

pub mod config;
pub mod error;
pub mod query;
pub mod registry;

pub use config::FilterConfig;
pub use error::FilterError;
pub use query::{InMemoryLogBackend, LogBackend, LogQuery};
pub use registry::{FilterChanges, FilterId, FilterKind, PollingFilterRegistry};
