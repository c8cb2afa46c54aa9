//! WebSocket JSON-RPC server.
//!
//! Serves `eth_subscribe` / `eth_unsubscribe` from the aggregator's streams
//! and hands every other call, batches included, to an [`RpcForwarder`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainfeed_events::EventAggregator;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::ORIGIN, StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::WsConfig;
use crate::conn::WsConn;
use crate::error::WsError;
use crate::pubsub::{PushSubscriptionRegistry, SubscriptionId};
use crate::wire::{is_batch, JsonRpcError, JsonRpcResponse, RpcId, INVALID_REQUEST};

const MAX_LOGGED_ORIGIN: usize = 200;

// ─── Forwarding ───────────────────────────────────────────────────────────────

/// Answers JSON-RPC calls the WebSocket server does not serve itself.
#[async_trait]
pub trait RpcForwarder: Send + Sync {
    /// Forward one raw request (or batch) and return the raw response.
    async fn forward(&self, request: Value) -> Result<Value, WsError>;
}

/// Posts forwarded calls to an HTTP JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    url: String,
    http: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, WsError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WsError::Forward(e.to_string()))?;
        Ok(Self { url: url.into(), http })
    }
}

#[async_trait]
impl RpcForwarder for HttpForwarder {
    async fn forward(&self, request: Value) -> Result<Value, WsError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| WsError::Forward(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(WsError::Forward(format!("HTTP {status}: {body}")));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| WsError::Forward(e.to_string()))
    }
}

// ─── Origin policy ────────────────────────────────────────────────────────────

/// Returns `true` if a browser `Origin` may open a connection.
///
/// An empty allow-list rejects every origin and `"*"` accepts all. Otherwise
/// the origin's host must equal one of the entries.
pub fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let Some(host) = origin.parse::<Uri>().ok().and_then(|u| u.host().map(str::to_owned)) else {
        return false;
    };
    allowed.iter().any(|a| a.eq_ignore_ascii_case(&host))
}

/// Origin header value made safe for log output.
pub fn sanitize_origin(origin: &str) -> String {
    origin
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_LOGGED_ORIGIN)
        .collect()
}

fn forbidden(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::FORBIDDEN;
    resp
}

// ─── WsServer ─────────────────────────────────────────────────────────────────

/// Accepts WebSocket clients and serves push subscriptions.
pub struct WsServer {
    aggregator: Arc<EventAggregator>,
    config: WsConfig,
    forwarder: Option<Arc<dyn RpcForwarder>>,
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("config", &self.config)
            .field("forwarding", &self.forwarder.is_some())
            .finish_non_exhaustive()
    }
}

impl WsServer {
    /// Build a server. Non-subscription calls go to `config.rpc_forward_url`
    /// when set.
    pub fn new(aggregator: Arc<EventAggregator>, config: WsConfig) -> Result<Self, WsError> {
        let forwarder = match &config.rpc_forward_url {
            Some(url) => {
                let http = HttpForwarder::new(url.clone(), Duration::from_secs(30))?;
                Some(Arc::new(http) as Arc<dyn RpcForwarder>)
            }
            None => None,
        };
        Ok(Self {
            aggregator,
            config,
            forwarder,
        })
    }

    /// Replace the forwarder.
    pub fn with_forwarder(mut self, forwarder: Arc<dyn RpcForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, WsError> {
        let listener = TcpListener::bind(&self.config.address).await?;
        info!(address = %self.config.address, "websocket server listening");
        Ok(listener)
    }

    /// Accept clients until `shutdown` fires, then wait for every connection
    /// to wind down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<(), WsError> {
        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            server.handle_connection(stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
            }
        }
        info!(open = connections.len(), "websocket server shutting down");
        connections.close();
        connections.wait().await;
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let allowed = self.config.allowed_origins.clone();
        let check_origin = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let Some(origin) = req.headers().get(ORIGIN) else {
                return Ok(resp);
            };
            match origin.to_str() {
                Ok(origin) if origin_allowed(origin, &allowed) => Ok(resp),
                Ok(origin) => {
                    warn!(%peer, origin = %sanitize_origin(origin), "origin not allowed");
                    Err(forbidden("origin not allowed"))
                }
                Err(_) => {
                    warn!(%peer, "origin header is not valid text");
                    Err(forbidden("invalid origin"))
                }
            }
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_size);
        let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, check_origin, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "websocket handshake failed");
                return;
            }
        };
        debug!(%peer, "websocket client connected");

        let (sink, mut frames) = ws.split();
        let conn = Arc::new(WsConn::new(peer.to_string(), sink));
        let registry = PushSubscriptionRegistry::new(
            Arc::clone(&self.aggregator),
            Arc::clone(&conn),
            self.config.max_subscriptions_per_conn,
        );

        loop {
            let text = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = conn.closed().cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => text.to_owned(),
                        Err(_) => {
                            debug!(%peer, "ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(%peer, error = %e, "read failed");
                        break;
                    }
                },
            };
            if let Err(e) = self.handle_text(&text, &conn, &registry).await {
                if e.is_disconnect() {
                    break;
                }
                warn!(%peer, error = %e, "request handling failed");
            }
        }

        registry.close().await;
        conn.close().await;
        debug!(%peer, "websocket client disconnected");
    }

    /// Handle one request frame, writing its response to `conn`.
    pub async fn handle_text(
        &self,
        text: &str,
        conn: &WsConn,
        registry: &PushSubscriptionRegistry,
    ) -> Result<(), WsError> {
        if is_batch(text) {
            return self.forward(text, RpcId::Null, conn).await;
        }

        let request: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                return reply_error(conn, RpcId::Null, INVALID_REQUEST, format!("invalid request: {e}")).await;
            }
        };

        let method = request.get("method").and_then(Value::as_str);
        if !matches!(method, Some("eth_subscribe" | "eth_unsubscribe")) {
            let id = RpcId::from_value(request.get("id")).unwrap_or(RpcId::Null);
            return self.forward(text, id, conn).await;
        }

        let Some(id) = RpcId::from_value(request.get("id")) else {
            return reply_error(conn, RpcId::Null, INVALID_REQUEST, "invalid type for connection ID").await;
        };
        let Some(params) = request.get("params").and_then(Value::as_array) else {
            return reply_error(conn, id, INVALID_REQUEST, "invalid parameters").await;
        };
        if params.is_empty() {
            return reply_error(conn, id, INVALID_REQUEST, "empty parameters").await;
        }

        if method == Some("eth_subscribe") {
            match registry.subscribe(params).await {
                Ok(sub) => conn.write_json(&JsonRpcResponse::success(id, json!(sub))).await,
                Err(e) => reply_error(conn, id, e.code(), e.to_string()).await,
            }
        } else {
            let Some(sub) = params[0].as_str() else {
                return reply_error(conn, id, INVALID_REQUEST, "invalid parameters").await;
            };
            let removed = registry.unsubscribe(&SubscriptionId::from(sub));
            conn.write_json(&JsonRpcResponse::success(id, json!(removed))).await
        }
    }

    async fn forward(&self, text: &str, id: RpcId, conn: &WsConn) -> Result<(), WsError> {
        let Some(forwarder) = &self.forwarder else {
            let e = WsError::MethodNotFound(method_of(text));
            return reply_error(conn, id, e.code(), e.to_string()).await;
        };
        let request: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                return reply_error(conn, id, INVALID_REQUEST, format!("invalid request: {e}")).await;
            }
        };
        match forwarder.forward(request).await {
            Ok(response) => conn.write_json(&response).await,
            Err(e) => {
                warn!(peer = %conn.peer(), error = %e, "forwarding failed");
                reply_error(conn, id, e.code(), e.to_string()).await
            }
        }
    }
}

fn method_of(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("method").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| "batch".to_string())
}

async fn reply_error(conn: &WsConn, id: RpcId, code: i64, message: impl Into<String>) -> Result<(), WsError> {
    conn.write_json(&JsonRpcResponse::failure(id, JsonRpcError::new(code, message)))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainfeed_events::{AbciEventDecoder, AggregatorConfig, ChainEventSource, ChannelEventSource};
    use rstest::rstest;
    use tokio::sync::mpsc;

    fn origins(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case("http://localhost:3000", &["localhost"], true)]
    #[case("https://LOCALHOST", &["localhost"], true)]
    #[case("http://127.0.0.1:8080", &["localhost", "127.0.0.1"], true)]
    #[case("http://evil.example", &["localhost"], false)]
    #[case("http://evil.example", &["*"], true)]
    #[case("http://localhost", &[], false)]
    #[case("not a url", &["localhost"], false)]
    fn origin_policy(#[case] origin: &str, #[case] allowed: &[&str], #[case] ok: bool) {
        assert_eq!(origin_allowed(origin, &origins(allowed)), ok);
    }

    #[test]
    fn sanitize_strips_control_and_truncates() {
        assert_eq!(sanitize_origin("http://a\r\nb"), "http://ab");
        assert_eq!(sanitize_origin(&"x".repeat(500)).len(), MAX_LOGGED_ORIGIN);
    }

    struct Echo;

    #[async_trait]
    impl RpcForwarder for Echo {
        async fn forward(&self, request: Value) -> Result<Value, WsError> {
            Ok(json!({"jsonrpc": "2.0", "id": request.get("id").cloned(), "result": "forwarded"}))
        }
    }

    struct Harness {
        server: WsServer,
        conn: Arc<WsConn>,
        registry: PushSubscriptionRegistry,
        frames: mpsc::Receiver<String>,
    }

    impl Harness {
        fn new(forwarder: Option<Arc<dyn RpcForwarder>>) -> Self {
            let source = Arc::new(ChannelEventSource::new());
            let aggregator = Arc::new(EventAggregator::new(
                source as Arc<dyn ChainEventSource>,
                Arc::new(AbciEventDecoder),
                AggregatorConfig::default(),
            ));
            let mut server = WsServer::new(Arc::clone(&aggregator), WsConfig::default()).unwrap();
            if let Some(f) = forwarder {
                server = server.with_forwarder(f);
            }
            let (tx, frames) = mpsc::channel(16);
            let conn = Arc::new(WsConn::new("test", tx));
            let registry = PushSubscriptionRegistry::new(aggregator, Arc::clone(&conn), 4);
            Self { server, conn, registry, frames }
        }

        async fn call(&mut self, text: &str) -> Value {
            self.server.handle_text(text, &self.conn, &self.registry).await.unwrap();
            serde_json::from_str(&self.frames.recv().await.unwrap()).unwrap()
        }
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe() {
        let mut h = Harness::new(None);
        let resp = h
            .call(r#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newPendingTransactions"]}"#)
            .await;
        assert_eq!(resp["id"], 1);
        let sub = resp["result"].as_str().unwrap().to_string();
        assert!(sub.starts_with("0x"));

        let req = json!({"jsonrpc":"2.0","id":"u","method":"eth_unsubscribe","params":[sub]});
        let resp = h.call(&req.to_string()).await;
        assert_eq!(resp["id"], "u");
        assert_eq!(resp["result"], true);

        let resp = h.call(&req.to_string()).await;
        assert_eq!(resp["result"], false);
        h.registry.close().await;
    }

    #[rstest]
    #[case(r#"{"id":1,"method":"eth_subscribe","params":["syncing"]}"#, "syncing subscription is not implemented")]
    #[case(r#"{"id":1,"method":"eth_subscribe","params":[]}"#, "empty parameters")]
    #[case(r#"{"id":1,"method":"eth_subscribe","params":{}}"#, "invalid parameters")]
    #[case(r#"{"id":null,"method":"eth_subscribe","params":["newHeads"]}"#, "invalid type for connection ID")]
    #[case(r#"{"id":1,"method":"eth_unsubscribe","params":[7]}"#, "invalid parameters")]
    #[tokio::test]
    async fn rejected_requests(#[case] text: &str, #[case] message: &str) {
        let mut h = Harness::new(None);
        let resp = h.call(text).await;
        assert_eq!(resp["error"]["code"], INVALID_REQUEST);
        assert_eq!(resp["error"]["message"], message);
        assert!(resp.get("result").is_none());
    }

    #[tokio::test]
    async fn malformed_json() {
        let mut h = Harness::new(None);
        let resp = h.call("{not json").await;
        assert_eq!(resp["error"]["code"], INVALID_REQUEST);
        assert_eq!(resp["id"], Value::Null);
    }

    #[tokio::test]
    async fn other_methods_need_a_forwarder() {
        let mut h = Harness::new(None);
        let resp = h.call(r#"{"jsonrpc":"2.0","id":3,"method":"eth_blockNumber","params":[]}"#).await;
        assert_eq!(resp["id"], 3);
        assert_eq!(resp["error"]["code"], crate::wire::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn forwards_other_methods_and_batches() {
        let mut h = Harness::new(Some(Arc::new(Echo)));
        let resp = h.call(r#"{"jsonrpc":"2.0","id":9,"method":"eth_chainId","params":[]}"#).await;
        assert_eq!(resp["id"], 9);
        assert_eq!(resp["result"], "forwarded");

        let resp = h.call(r#" [{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}]"#).await;
        assert_eq!(resp["result"], "forwarded");
    }
}
