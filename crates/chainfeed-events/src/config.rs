//! Aggregator configuration.

use chainfeed_core::StreamConfig;
use serde::{Deserialize, Serialize};

/// Configuration for an [`EventAggregator`](crate::EventAggregator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Subscriber name presented to the upstream event source.
    #[serde(default = "default_subscriber_name")]
    pub subscriber_name: String,
    /// Only transaction events emitted by this module produce logs.
    #[serde(default = "default_target_module")]
    pub target_module: String,
    /// Buffer of each upstream subscription channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_header_stream")]
    pub header: StreamConfig,
    #[serde(default = "default_log_stream")]
    pub logs: StreamConfig,
    #[serde(default = "default_pending_tx_stream")]
    pub pending_txs: StreamConfig,
}

fn default_subscriber_name() -> String { "chainfeed-json-rpc".to_string() }
fn default_target_module() -> String { "evm".to_string() }
fn default_channel_capacity() -> usize { 1_024 }
fn default_header_stream() -> StreamConfig { StreamConfig::with_segments(128, 32) }
fn default_log_stream() -> StreamConfig { StreamConfig::with_segments(2_048, 32) }
fn default_pending_tx_stream() -> StreamConfig { StreamConfig::with_segments(1_024, 32) }

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            subscriber_name: default_subscriber_name(),
            target_module: default_target_module(),
            channel_capacity: default_channel_capacity(),
            header: default_header_stream(),
            logs: default_log_stream(),
            pending_txs: default_pending_tx_stream(),
        }
    }
}
