//! Push subscriptions for one connection.
//!
//! Each `eth_subscribe` call spawns a task that follows one aggregator stream
//! and writes every delivered item to the connection as an `eth_subscription`
//! notification. All tasks hang off a token derived from the connection's
//! close signal, so a failed write on any of them stops the rest.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chainfeed_core::{filter_logs, FilterCriteria, SegmentedStream};
use chainfeed_events::EventAggregator;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::conn::WsConn;
use crate::error::WsError;
use crate::wire::SubscriptionNotification;

// ─── SubscriptionId ───────────────────────────────────────────────────────────

/// Opaque push subscription identifier, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn random() -> Self {
        Self(format!("0x{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── SubscriptionKind ─────────────────────────────────────────────────────────

/// What a push subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionKind {
    NewHeads,
    Logs(FilterCriteria),
    NewPendingTransactions,
}

impl SubscriptionKind {
    /// Parse `eth_subscribe` params: `[kind, criteria?]`.
    pub fn from_params(params: &[Value]) -> Result<Self, WsError> {
        let kind = params
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| WsError::InvalidParams("subscription kind must be a string".into()))?;
        match kind {
            "newHeads" => Ok(Self::NewHeads),
            "logs" => {
                let criteria = match params.get(1) {
                    Some(raw) => FilterCriteria::from_value(raw.clone())?,
                    None => FilterCriteria::default(),
                };
                criteria.validate()?;
                Ok(Self::Logs(criteria))
            }
            "newPendingTransactions" => Ok(Self::NewPendingTransactions),
            "syncing" => Err(WsError::Unsupported(
                "syncing subscription is not implemented".into(),
            )),
            other => Err(WsError::Unsupported(format!("unsupported method {other}"))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NewHeads => "newHeads",
            Self::Logs(_) => "logs",
            Self::NewPendingTransactions => "newPendingTransactions",
        }
    }
}

// ─── PushSubscriptionRegistry ─────────────────────────────────────────────────

/// The push subscriptions of a single connection.
pub struct PushSubscriptionRegistry {
    aggregator: Arc<EventAggregator>,
    conn: Arc<WsConn>,
    max_subscriptions: usize,
    root: CancellationToken,
    tasks: TaskTracker,
    subs: Mutex<HashMap<SubscriptionId, CancellationToken>>,
}

impl fmt::Debug for PushSubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSubscriptionRegistry")
            .field("peer", &self.conn.peer())
            .field("subscriptions", &self.len())
            .field("max_subscriptions", &self.max_subscriptions)
            .finish_non_exhaustive()
    }
}

impl PushSubscriptionRegistry {
    pub fn new(aggregator: Arc<EventAggregator>, conn: Arc<WsConn>, max_subscriptions: usize) -> Self {
        let root = conn.closed().child_token();
        Self {
            aggregator,
            conn,
            max_subscriptions,
            root,
            tasks: TaskTracker::new(),
            subs: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.lock().is_empty()
    }

    /// Handle `eth_subscribe` params and start delivering.
    pub async fn subscribe(&self, params: &[Value]) -> Result<SubscriptionId, WsError> {
        let kind = SubscriptionKind::from_params(params)?;
        if self.root.is_cancelled() {
            return Err(WsError::Closed);
        }
        if self.len() >= self.max_subscriptions {
            return Err(WsError::LimitReached {
                cap: self.max_subscriptions,
            });
        }

        let id = SubscriptionId::random();
        let token = self.root.child_token();
        let name = kind.name();
        match kind {
            SubscriptionKind::NewHeads => {
                let stream = self.aggregator.header_stream().await?;
                self.spawn_forward(stream, id.clone(), token.clone());
            }
            SubscriptionKind::NewPendingTransactions => {
                let stream = self.aggregator.pending_tx_stream();
                self.spawn_forward(stream, id.clone(), token.clone());
            }
            SubscriptionKind::Logs(criteria) => {
                let stream = self.aggregator.log_stream().await?;
                self.spawn_logs(stream, criteria, id.clone(), token.clone());
            }
        }

        let mut subs = self.subs.lock();
        subs.insert(id.clone(), token);
        info!(peer = %self.conn.peer(), %id, kind = name, active = subs.len(), "subscription started");
        Ok(id)
    }

    /// Stop a subscription. Returns `false` if `id` is unknown.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        match self.subs.lock().remove(id) {
            Some(token) => {
                token.cancel();
                debug!(peer = %self.conn.peer(), %id, "subscription cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription and wait for their tasks to exit.
    pub async fn close(&self) {
        self.root.cancel();
        self.subs.lock().clear();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// One notification per item appended after this call.
    fn spawn_forward<T>(&self, stream: Arc<SegmentedStream<T>>, id: SubscriptionId, token: CancellationToken)
    where
        T: Clone + Serialize + Send + Sync + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let (_, from) = stream.read_from_end();
        self.tasks.spawn(async move {
            let res = stream
                .subscribe_from(&token, from, |items: Vec<T>, _offset| {
                    let conn = Arc::clone(&conn);
                    let id = id.clone();
                    async move { notify_each(&conn, &id, items).await }
                })
                .await;
            finish(&conn, &id, res);
        });
    }

    /// Like [`Self::spawn_forward`], keeping only logs that match `criteria`.
    fn spawn_logs(
        &self,
        stream: Arc<SegmentedStream<chainfeed_core::LogRecord>>,
        criteria: FilterCriteria,
        id: SubscriptionId,
        token: CancellationToken,
    ) {
        let conn = Arc::clone(&self.conn);
        let criteria = Arc::new(criteria);
        let (_, from) = stream.read_from_end();
        self.tasks.spawn(async move {
            let res = stream
                .subscribe_from(&token, from, |logs, _offset| {
                    let conn = Arc::clone(&conn);
                    let id = id.clone();
                    let criteria = Arc::clone(&criteria);
                    async move {
                        let matched = filter_logs(logs, &criteria);
                        if matched.is_empty() {
                            return Ok(());
                        }
                        notify_each(&conn, &id, matched).await
                    }
                })
                .await;
            finish(&conn, &id, res);
        });
    }
}

async fn notify_each<T: Serialize>(conn: &WsConn, id: &SubscriptionId, items: Vec<T>) -> Result<(), WsError> {
    for item in items {
        conn.write_json(&SubscriptionNotification::new(id.as_str(), item))
            .await?;
    }
    Ok(())
}

fn finish(conn: &WsConn, id: &SubscriptionId, res: Result<(), WsError>) {
    match res {
        Ok(()) => debug!(peer = %conn.peer(), %id, "subscription task exited"),
        Err(e) => debug!(peer = %conn.peer(), %id, error = %e, "subscription task stopped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use chainfeed_events::{
        AbciEventDecoder, AggregatorConfig, ChainEventSource, ChannelEventSource, RawBlockEvent,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        source: Arc<ChannelEventSource>,
        aggregator: Arc<EventAggregator>,
        conn: Arc<WsConn>,
        frames: mpsc::Receiver<String>,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(ChannelEventSource::new());
        let aggregator = Arc::new(EventAggregator::new(
            Arc::clone(&source) as Arc<dyn ChainEventSource>,
            Arc::new(AbciEventDecoder),
            AggregatorConfig::default(),
        ));
        let (tx, frames) = mpsc::channel(64);
        Fixture {
            source,
            aggregator,
            conn: Arc::new(WsConn::new("test", tx)),
            frames,
        }
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("sink closed");
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn parses_kinds() {
        assert_eq!(
            SubscriptionKind::from_params(&[json!("newHeads")]).unwrap(),
            SubscriptionKind::NewHeads
        );
        assert!(matches!(
            SubscriptionKind::from_params(&[json!("logs")]).unwrap(),
            SubscriptionKind::Logs(_)
        ));
        assert!(matches!(
            SubscriptionKind::from_params(&[json!("syncing")]),
            Err(WsError::Unsupported(msg)) if msg.contains("syncing")
        ));
        assert!(matches!(
            SubscriptionKind::from_params(&[json!("blocks")]),
            Err(WsError::Unsupported(msg)) if msg == "unsupported method blocks"
        ));
        assert!(matches!(
            SubscriptionKind::from_params(&[json!(1)]),
            Err(WsError::InvalidParams(_))
        ));
        assert!(matches!(
            SubscriptionKind::from_params(&[json!("logs"), json!("nope")]),
            Err(WsError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn pending_tx_notifications() {
        let mut f = fixture();
        let registry = PushSubscriptionRegistry::new(Arc::clone(&f.aggregator), Arc::clone(&f.conn), 4);
        let id = registry.subscribe(&[json!("newPendingTransactions")]).await.unwrap();
        f.aggregator.listen_pending_tx(B256::repeat_byte(7));

        let msg = next_frame(&mut f.frames).await;
        assert_eq!(msg["method"], "eth_subscription");
        assert_eq!(msg["params"]["subscription"], id.as_str());
        assert_eq!(msg["params"]["result"], json!(B256::repeat_byte(7)));
        registry.close().await;
    }

    #[tokio::test]
    async fn new_heads_notifications() {
        let mut f = fixture();
        let registry = PushSubscriptionRegistry::new(Arc::clone(&f.aggregator), Arc::clone(&f.conn), 4);
        registry.subscribe(&[json!("newHeads")]).await.unwrap();

        f.source
            .publish_block(RawBlockEvent {
                height: 42,
                hash: B256::repeat_byte(1),
                ..Default::default()
            })
            .await;

        let msg = next_frame(&mut f.frames).await;
        assert_eq!(msg["params"]["result"]["number"], "0x2a");
        registry.close().await;
        f.aggregator.shutdown().await;
    }

    #[tokio::test]
    async fn limit_and_unsubscribe() {
        let f = fixture();
        let registry = PushSubscriptionRegistry::new(Arc::clone(&f.aggregator), Arc::clone(&f.conn), 1);
        let id = registry.subscribe(&[json!("newPendingTransactions")]).await.unwrap();
        assert!(matches!(
            registry.subscribe(&[json!("newPendingTransactions")]).await,
            Err(WsError::LimitReached { cap: 1 })
        ));
        assert!(registry.unsubscribe(&id));
        assert!(!registry.unsubscribe(&id));
        assert!(registry.is_empty());
        registry.subscribe(&[json!("newPendingTransactions")]).await.unwrap();
        registry.close().await;
    }

    #[tokio::test]
    async fn closing_the_connection_stops_tasks() {
        let f = fixture();
        let registry = PushSubscriptionRegistry::new(Arc::clone(&f.aggregator), Arc::clone(&f.conn), 4);
        registry.subscribe(&[json!("newPendingTransactions")]).await.unwrap();
        registry.subscribe(&[json!("newPendingTransactions")]).await.unwrap();
        f.conn.close().await;

        tokio::time::timeout(Duration::from_secs(2), registry.close())
            .await
            .expect("subscription tasks did not exit");
        assert!(matches!(
            registry.subscribe(&[json!("newHeads")]).await,
            Err(WsError::Closed)
        ));
    }
}
