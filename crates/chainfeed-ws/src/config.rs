//! WebSocket server configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the [`WsServer`](crate::WsServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsConfig {
    /// Listen address, e.g. "127.0.0.1:8546".
    #[serde(default = "default_address")]
    pub address: String,
    /// Largest accepted incoming message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Hosts allowed in the `Origin` header. Empty rejects every browser
    /// origin; `"*"` allows all.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Maximum concurrent subscriptions on one connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_conn: usize,
    /// HTTP JSON-RPC endpoint that answers every method other than
    /// `eth_subscribe` / `eth_unsubscribe`.
    #[serde(default)]
    pub rpc_forward_url: Option<String>,
}

fn default_address() -> String { "127.0.0.1:8546".to_string() }
fn default_max_message_size() -> usize { 1 << 20 }
fn default_allowed_origins() -> Vec<String> { vec!["localhost".to_string(), "127.0.0.1".to_string()] }
fn default_max_subscriptions() -> usize { 100 }

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_message_size: default_max_message_size(),
            allowed_origins: default_allowed_origins(),
            max_subscriptions_per_conn: default_max_subscriptions(),
            rpc_forward_url: None,
        }
    }
}
