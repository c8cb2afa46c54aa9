//! # chainfeed-ws
//!
//! WebSocket `eth_subscribe` server.
//!
//! ## Features
//! - `newHeads`, `logs` and `newPendingTransactions` push subscriptions
//! - Serialized writes per connection; one failed write drops the peer
//! - `Origin` allow-list and message size limit at handshake
//! - Forwarding of every other method to an HTTP JSON-RPC endpoint

pub mod config;
pub mod conn;
pub mod error;
pub mod pubsub;
pub mod server;
pub mod wire;

pub use config::WsConfig;
pub use conn::{FrameSink, WsConn};
pub use error::WsError;
pub use pubsub::{PushSubscriptionRegistry, SubscriptionId, SubscriptionKind};
pub use server::{origin_allowed, sanitize_origin, HttpForwarder, RpcForwarder, WsServer};
pub use wire::{JsonRpcError, JsonRpcResponse, RpcId, SubscriptionNotification};
