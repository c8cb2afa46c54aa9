//! JSON-RPC 2.0 wire types for the subscription server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Malformed request; also used for every subscription-level failure.
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;

/// Method name of server-pushed notifications.
pub const SUBSCRIPTION_METHOD: &str = "eth_subscription";

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    /// Interpret the `id` member of a raw request. Only numbers and
    /// strings identify a call.
    pub fn from_value(value: Option<&Value>) -> Option<Self> {
        match value? {
            Value::Number(n) => n.as_u64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns `true` if this is a successful response (has result, no error).
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }
}

/// Payload of an `eth_subscription` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResult<T> {
    pub subscription: String,
    pub result: T,
}

/// A server-pushed `eth_subscription` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionNotification<T> {
    pub jsonrpc: String,
    pub method: String,
    pub params: SubscriptionResult<T>,
}

impl<T> SubscriptionNotification<T> {
    pub fn new(subscription: impl Into<String>, result: T) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: SUBSCRIPTION_METHOD.into(),
            params: SubscriptionResult {
                subscription: subscription.into(),
                result,
            },
        }
    }
}

/// Returns `true` when the first non-whitespace character is `[`.
pub fn is_batch(raw: &str) -> bool {
    raw.trim_start_matches([' ', '\t', '\n', '\r']).starts_with('[')
}
