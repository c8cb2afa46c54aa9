//! `EventAggregator`: upstream chain events into segmented streams.
//!
//! ```text
//! ChainEventSource ── NewBlock rx ──┐
//!                                   ├─► consumer task ─► headers stream
//! ChainEventSource ── Tx(evm) rx ───┘                 └► logs stream
//!
//! mempool hook ── listen_pending_tx ──────────────────► pending tx stream
//! ```
//!
//! The three streams exist from construction. The upstream subscriptions
//! and the consumer task start on the first `header_stream()` /
//! `log_stream()` call.

use std::sync::Arc;

use chainfeed_core::{LogRecord, PendingTxHash, RpcHeader, SegmentedStream};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AggregatorConfig;
use crate::decode::EventDecoder;
use crate::error::AggregatorError;
use crate::source::{ChainEventSource, EventQuery, RawEvent};

/// Counters for the consumer task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorMetrics {
    pub headers_appended: u64,
    pub logs_appended: u64,
    pub pending_txs_appended: u64,
    pub events_skipped: u64,
    pub decode_errors: u64,
}

/// Mempool-side hook invoked once per accepted transaction.
pub trait PendingTxListener: Send + Sync {
    fn on_pending_tx(&self, hash: PendingTxHash);
}

/// Owns the header, log and pending-transaction streams.
pub struct EventAggregator {
    source: Arc<dyn ChainEventSource>,
    decoder: Arc<dyn EventDecoder>,
    config: AggregatorConfig,
    headers: Arc<SegmentedStream<RpcHeader>>,
    logs: Arc<SegmentedStream<LogRecord>>,
    pending_txs: Arc<SegmentedStream<PendingTxHash>>,
    started: OnceCell<()>,
    /// Upstream queries currently subscribed.
    upstream: Mutex<Vec<EventQuery>>,
    /// Set once upstream subscription fails; never cleared.
    failed: Mutex<Option<AggregatorError>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<Mutex<AggregatorMetrics>>,
}

impl std::fmt::Debug for EventAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventAggregator")
            .field("config", &self.config)
            .field("started", &self.started.initialized())
            .finish_non_exhaustive()
    }
}

impl EventAggregator {
    pub fn new(
        source: Arc<dyn ChainEventSource>,
        decoder: Arc<dyn EventDecoder>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            source,
            decoder,
            headers: Arc::new(SegmentedStream::from_config(&config.header)),
            logs: Arc::new(SegmentedStream::from_config(&config.logs)),
            pending_txs: Arc::new(SegmentedStream::from_config(&config.pending_txs)),
            config,
            started: OnceCell::new(),
            upstream: Mutex::new(Vec::new()),
            failed: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            metrics: Arc::new(Mutex::new(AggregatorMetrics::default())),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Block headers, starting upstream consumption on first use.
    pub async fn header_stream(&self) -> Result<Arc<SegmentedStream<RpcHeader>>, AggregatorError> {
        self.ensure_started().await?;
        Ok(Arc::clone(&self.headers))
    }

    /// Logs from the target module, starting upstream consumption on first use.
    pub async fn log_stream(&self) -> Result<Arc<SegmentedStream<LogRecord>>, AggregatorError> {
        self.ensure_started().await?;
        Ok(Arc::clone(&self.logs))
    }

    /// Pending transaction hashes. Fed by [`Self::listen_pending_tx`] only.
    pub fn pending_tx_stream(&self) -> Arc<SegmentedStream<PendingTxHash>> {
        Arc::clone(&self.pending_txs)
    }

    /// Record a transaction accepted into the mempool.
    pub fn listen_pending_tx(&self, hash: PendingTxHash) {
        self.pending_txs.add([hash]);
        self.metrics.lock().pending_txs_appended += 1;
    }

    /// Returns `true` once upstream consumption has started.
    pub fn is_started(&self) -> bool {
        self.started.initialized()
    }

    /// Returns a snapshot of current metrics.
    pub fn metrics(&self) -> AggregatorMetrics {
        self.metrics.lock().clone()
    }

    /// Returns the upstream failure, if subscribing ever failed.
    pub fn failure(&self) -> Option<AggregatorError> {
        self.failed.lock().clone()
    }

    /// Unsubscribe from the source and wait for the consumer task to exit.
    ///
    /// Later `header_stream()` / `log_stream()` calls fail with
    /// [`AggregatorError::Shutdown`] if consumption never started.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.release_upstream().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "event consumer task panicked");
            }
        }
        info!("event aggregator stopped");
    }

    fn queries(&self) -> [EventQuery; 2] {
        [
            EventQuery::NewBlock,
            EventQuery::Tx {
                module: self.config.target_module.clone(),
            },
        ]
    }

    async fn ensure_started(&self) -> Result<(), AggregatorError> {
        self.started.get_or_try_init(|| self.start()).await.map(|_| ())
    }

    /// Unsubscribe every upstream query still held. Whoever drains the list
    /// first does the unsubscribing.
    async fn release_upstream(&self) {
        let held = std::mem::take(&mut *self.upstream.lock());
        let name = &self.config.subscriber_name;
        for query in held {
            if let Err(e) = self.source.unsubscribe(name, &query).await {
                warn!(%query, error = %e, "failed to unsubscribe from upstream");
            }
        }
    }

    async fn start(&self) -> Result<(), AggregatorError> {
        if let Some(e) = self.failure() {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(AggregatorError::Shutdown);
        }
        let name = &self.config.subscriber_name;
        let [block_query, tx_query] = self.queries();

        let blocks = match self.subscribe(&block_query).await {
            Ok(rx) => rx,
            Err(e) => return Err(self.fail(e)),
        };
        let txs = match self.subscribe(&tx_query).await {
            Ok(rx) => rx,
            Err(e) => {
                self.release_upstream().await;
                return Err(self.fail(e));
            }
        };

        // A shutdown that raced the subscriptions may have missed them.
        if self.cancel.is_cancelled() {
            self.release_upstream().await;
            return Err(AggregatorError::Shutdown);
        }

        let consumer = Consumer {
            decoder: Arc::clone(&self.decoder),
            headers: Arc::clone(&self.headers),
            logs: Arc::clone(&self.logs),
            target_module: self.config.target_module.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        let handle = tokio::spawn(consumer.run(blocks, txs, self.cancel.clone()));
        *self.task.lock() = Some(handle);

        info!(subscriber = %name, module = %self.config.target_module, "event aggregator started");
        Ok(())
    }

    /// Latch `err` as the aggregator's terminal failure.
    fn fail(&self, err: AggregatorError) -> AggregatorError {
        error!(error = %err, "event aggregator failed, header and log streams will stay empty");
        self.failed.lock().get_or_insert(err).clone()
    }

    async fn subscribe(&self, query: &EventQuery) -> Result<mpsc::Receiver<RawEvent>, AggregatorError> {
        let rx = self
            .source
            .subscribe(&self.config.subscriber_name, query, self.config.channel_capacity)
            .await
            .map_err(|e| {
                error!(%query, error = %e, "upstream subscription failed");
                AggregatorError::Upstream {
                    query: query.to_string(),
                    reason: e.to_string(),
                }
            })?;
        self.upstream.lock().push(query.clone());
        Ok(rx)
    }
}

impl PendingTxListener for EventAggregator {
    fn on_pending_tx(&self, hash: PendingTxHash) {
        self.listen_pending_tx(hash);
    }
}

// ─── Consumer task ────────────────────────────────────────────────────────────

struct Consumer {
    decoder: Arc<dyn EventDecoder>,
    headers: Arc<SegmentedStream<RpcHeader>>,
    logs: Arc<SegmentedStream<LogRecord>>,
    target_module: String,
    metrics: Arc<Mutex<AggregatorMetrics>>,
}

impl Consumer {
    async fn run(
        self,
        mut blocks: mpsc::Receiver<RawEvent>,
        mut txs: mpsc::Receiver<RawEvent>,
        cancel: CancellationToken,
    ) {
        let mut blocks_open = true;
        let mut txs_open = true;

        while blocks_open || txs_open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = blocks.recv(), if blocks_open => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("block event channel closed");
                        blocks_open = false;
                    }
                },
                event = txs.recv(), if txs_open => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("tx event channel closed");
                        txs_open = false;
                    }
                },
            }
        }
        debug!("event consumer exiting");
    }

    fn handle(&self, event: RawEvent) {
        match event {
            RawEvent::NewBlock(block) => match self.decoder.decode_header(&block) {
                Ok(header) => {
                    self.headers.add([header]);
                    self.metrics.lock().headers_appended += 1;
                }
                Err(e) => {
                    warn!(height = block.height, error = %e, "failed to decode block header");
                    self.metrics.lock().decode_errors += 1;
                }
            },
            RawEvent::Tx(tx) => {
                if tx.module() != Some(self.target_module.as_str()) {
                    self.metrics.lock().events_skipped += 1;
                    return;
                }
                match self.decoder.decode_logs(&tx) {
                    Ok(logs) if logs.is_empty() => {}
                    Ok(logs) => {
                        let n = logs.len() as u64;
                        self.logs.add(logs);
                        self.metrics.lock().logs_appended += n;
                    }
                    Err(e) => {
                        warn!(height = tx.height, index = tx.index, error = %e, "failed to decode tx logs");
                        self.metrics.lock().decode_errors += 1;
                    }
                }
            }
        }
    }
}
