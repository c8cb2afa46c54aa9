//! Upstream chain-event source abstraction.
//!
//! The node that executes blocks publishes ABCI-style events. A
//! [`ChainEventSource`] hands them out per query as a bounded channel of
//! [`RawEvent`]s. [`ChannelEventSource`] is an in-process implementation the
//! node (or a test) can publish into directly.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::SourceError;

// ─── Queries ──────────────────────────────────────────────────────────────────

/// An upstream event query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventQuery {
    /// Every committed block.
    NewBlock,
    /// Transaction results whose message was handled by `module`.
    Tx { module: String },
}

impl fmt::Display for EventQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewBlock => write!(f, "tm.event='NewBlock'"),
            Self::Tx { module } => write!(f, "tm.event='Tx' AND message.module='{module}'"),
        }
    }
}

// ─── Raw events ───────────────────────────────────────────────────────────────

/// A key/value pair attached to an [`AbciEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
}

/// A typed event emitted during block or transaction execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AbciEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

impl AbciEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    /// Builder-style: append an attribute.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(EventAttribute {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Value of the first attribute named `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}

/// A committed block as reported by the consensus engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawBlockEvent {
    pub height: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix timestamp in seconds.
    pub time: u64,
    pub proposer: Address,
    /// Application state root after executing the block.
    pub app_hash: B256,
    pub data_hash: B256,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// End-of-block events (bloom, fee market, ...).
    pub events: Vec<AbciEvent>,
}

/// The result of one executed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawTxEvent {
    pub height: u64,
    pub index: u32,
    pub events: Vec<AbciEvent>,
}

impl RawTxEvent {
    /// The module that handled the transaction's message, if reported.
    pub fn module(&self) -> Option<&str> {
        self.events
            .iter()
            .filter(|e| e.kind == "message")
            .find_map(|e| e.attribute("module"))
    }
}

/// An event delivered on an upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    NewBlock(RawBlockEvent),
    Tx(RawTxEvent),
}

// ─── Source trait ─────────────────────────────────────────────────────────────

/// Publishes chain events to named subscribers.
#[async_trait]
pub trait ChainEventSource: Send + Sync {
    /// Start delivering events matching `query` to a new channel of
    /// `capacity` slots.
    async fn subscribe(
        &self,
        subscriber: &str,
        query: &EventQuery,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RawEvent>, SourceError>;

    /// Stop delivery; the receiver returned by `subscribe` then closes.
    async fn unsubscribe(&self, subscriber: &str, query: &EventQuery) -> Result<(), SourceError>;
}

// ─── ChannelEventSource ───────────────────────────────────────────────────────

type SubscriptionKey = (String, EventQuery);

/// In-process [`ChainEventSource`].
#[derive(Debug, Default)]
pub struct ChannelEventSource {
    subscriptions: Mutex<HashMap<SubscriptionKey, mpsc::Sender<RawEvent>>>,
    reject_subscribe: AtomicBool,
    subscribe_attempts: AtomicUsize,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `subscribe` call fail (or succeed again).
    pub fn set_reject_subscribe(&self, reject: bool) {
        self.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    /// Number of `subscribe` calls received, rejected ones included.
    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Deliver a committed block to every `NewBlock` subscriber.
    ///
    /// Returns the number of subscribers reached.
    pub async fn publish_block(&self, block: RawBlockEvent) -> usize {
        let targets = self.senders(|q| matches!(q, EventQuery::NewBlock));
        self.deliver(targets, RawEvent::NewBlock(block)).await
    }

    /// Deliver a transaction result to every `Tx` subscriber whose module
    /// matches the transaction's.
    pub async fn publish_tx(&self, tx: RawTxEvent) -> usize {
        let module = tx.module().map(str::to_owned);
        let targets = self.senders(|q| match q {
            EventQuery::Tx { module: wanted } => module.as_deref() == Some(wanted.as_str()),
            EventQuery::NewBlock => false,
        });
        self.deliver(targets, RawEvent::Tx(tx)).await
    }

    fn senders(&self, select: impl Fn(&EventQuery) -> bool) -> Vec<(SubscriptionKey, mpsc::Sender<RawEvent>)> {
        self.subscriptions
            .lock()
            .iter()
            .filter(|((_, q), _)| select(q))
            .map(|(k, tx)| (k.clone(), tx.clone()))
            .collect()
    }

    async fn deliver(&self, targets: Vec<(SubscriptionKey, mpsc::Sender<RawEvent>)>, event: RawEvent) -> usize {
        let mut delivered = 0;
        for (key, tx) in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            } else {
                trace!(subscriber = %key.0, query = %key.1, "dropping closed subscription");
                self.subscriptions.lock().remove(&key);
            }
        }
        delivered
    }
}

#[async_trait]
impl ChainEventSource for ChannelEventSource {
    async fn subscribe(
        &self,
        subscriber: &str,
        query: &EventQuery,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RawEvent>, SourceError> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_subscribe.load(Ordering::SeqCst) {
            return Err(SourceError::Rejected(format!("{subscriber} may not subscribe")));
        }
        let mut subs = self.subscriptions.lock();
        let key = (subscriber.to_string(), query.clone());
        if subs.contains_key(&key) {
            return Err(SourceError::Rejected(format!(
                "{subscriber} already subscribed to {query}"
            )));
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        subs.insert(key, tx);
        debug!(subscriber, %query, "upstream subscription added");
        Ok(rx)
    }

    async fn unsubscribe(&self, subscriber: &str, query: &EventQuery) -> Result<(), SourceError> {
        let key = (subscriber.to_string(), query.clone());
        match self.subscriptions.lock().remove(&key) {
            Some(_) => {
                debug!(subscriber, %query, "upstream subscription removed");
                Ok(())
            }
            None => Err(SourceError::NotSubscribed {
                subscriber: subscriber.to_string(),
                query: query.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evm_tx(height: u64) -> RawTxEvent {
        RawTxEvent {
            height,
            index: 0,
            events: vec![AbciEvent::new("message").with("module", "evm")],
        }
    }

    #[test]
    fn query_strings() {
        assert_eq!(EventQuery::NewBlock.to_string(), "tm.event='NewBlock'");
        assert_eq!(
            EventQuery::Tx { module: "evm".into() }.to_string(),
            "tm.event='Tx' AND message.module='evm'"
        );
    }

    #[test]
    fn tx_module_lookup() {
        assert_eq!(evm_tx(1).module(), Some("evm"));
        let other = RawTxEvent {
            events: vec![AbciEvent::new("transfer").with("module", "bank")],
            ..Default::default()
        };
        assert_eq!(other.module(), None);
    }

    #[tokio::test]
    async fn publishes_by_query() {
        let source = ChannelEventSource::new();
        let mut blocks = source.subscribe("t", &EventQuery::NewBlock, 4).await.unwrap();
        let mut evm = source
            .subscribe("t", &EventQuery::Tx { module: "evm".into() }, 4)
            .await
            .unwrap();
        let _wasm = source
            .subscribe("t", &EventQuery::Tx { module: "wasm".into() }, 4)
            .await
            .unwrap();

        assert_eq!(source.publish_block(RawBlockEvent { height: 7, ..Default::default() }).await, 1);
        assert_eq!(source.publish_tx(evm_tx(7)).await, 1);

        assert!(matches!(blocks.recv().await, Some(RawEvent::NewBlock(b)) if b.height == 7));
        assert!(matches!(evm.recv().await, Some(RawEvent::Tx(t)) if t.height == 7));
    }

    #[tokio::test]
    async fn unsubscribe_closes_receiver() {
        let source = ChannelEventSource::new();
        let mut rx = source.subscribe("t", &EventQuery::NewBlock, 1).await.unwrap();
        source.unsubscribe("t", &EventQuery::NewBlock).await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(matches!(
            source.unsubscribe("t", &EventQuery::NewBlock).await,
            Err(SourceError::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn rejection_and_duplicates() {
        let source = ChannelEventSource::new();
        source.set_reject_subscribe(true);
        assert!(source.subscribe("t", &EventQuery::NewBlock, 1).await.is_err());
        source.set_reject_subscribe(false);
        let _rx = source.subscribe("t", &EventQuery::NewBlock, 1).await.unwrap();
        assert!(source.subscribe("t", &EventQuery::NewBlock, 1).await.is_err());
        assert_eq!(source.subscription_count(), 1);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let source = ChannelEventSource::new();
        drop(source.subscribe("t", &EventQuery::NewBlock, 1).await.unwrap());
        assert_eq!(source.publish_block(RawBlockEvent::default()).await, 0);
        assert_eq!(source.subscription_count(), 0);
    }
}
