//! # chainfeed-core
//!
//! Building blocks for real-time chain event distribution.
//!
//! ## Components
//! - [`RingQueue`]: growable circular queue
//! - [`BroadcastGate`]: wake-all signal for blocked readers
//! - [`SegmentedStream`]: bounded multi-reader event log with offset cursors
//! - [`FilterCriteria`]: Ethereum log filter criteria and matching
//! - [`RpcHeader`] / [`LogRecord`]: the records carried by the streams
//!
//! ## Reading a stream
//! ```text
//! producer ── add(items) ──► SegmentedStream ──► read_blocking(offset) ── reader A
//!                                │                                    ── reader B
//!                                └── evicts oldest segment when full
//! ```
//! Each reader owns its offset; the stream holds no per-reader state.

pub mod config;
pub mod error;
pub mod filter;
pub mod gate;
pub mod ring;
pub mod stream;
pub mod types;

pub use config::StreamConfig;
pub use error::CoreError;
pub use filter::{filter_logs, BlockNumber, FilterCriteria};
pub use gate::{BroadcastGate, GateListener};
pub use ring::{RingError, RingQueue};
pub use stream::SegmentedStream;
pub use types::{LogRecord, PendingTxHash, RpcHeader};
