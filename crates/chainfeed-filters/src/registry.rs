//! `PollingFilterRegistry`: server-side cursors polled by HTTP clients.
//!
//! Each filter is bound to one of the aggregator's streams and remembers the
//! offset of the last item it handed out. A filter not polled within the
//! deadline is evicted by a background sweep.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use alloy_primitives::B256;
use chainfeed_core::{filter_logs, FilterCriteria, LogRecord, PendingTxHash, RpcHeader, SegmentedStream};
use chainfeed_events::EventAggregator;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::query::{LogBackend, LogQuery};

// ─── Public types ─────────────────────────────────────────────────────────────

/// Opaque filter identifier handed to clients, e.g. `0x6f1c…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(String);

impl FilterId {
    /// A fresh, unguessable id.
    pub fn random() -> Self {
        Self(format!("0x{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FilterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FilterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a filter reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterKind {
    Blocks,
    PendingTransactions,
    Logs,
}

/// Result of `eth_getFilterChanges`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterChanges {
    /// Block hashes or pending transaction hashes.
    Hashes(Vec<B256>),
    Logs(Vec<LogRecord>),
}

impl FilterChanges {
    pub fn len(&self) -> usize {
        match self {
            Self::Hashes(h) => h.len(),
            Self::Logs(l) => l.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Filter state ─────────────────────────────────────────────────────────────

enum FilterSource {
    Blocks(Arc<SegmentedStream<RpcHeader>>),
    PendingTransactions(Arc<SegmentedStream<PendingTxHash>>),
    Logs {
        stream: Arc<SegmentedStream<LogRecord>>,
        criteria: FilterCriteria,
    },
}

impl FilterSource {
    fn kind(&self) -> FilterKind {
        match self {
            Self::Blocks(_) => FilterKind::Blocks,
            Self::PendingTransactions(_) => FilterKind::PendingTransactions,
            Self::Logs { .. } => FilterKind::Logs,
        }
    }

    fn last_offset(&self) -> u64 {
        match self {
            Self::Blocks(s) => s.last_offset(),
            Self::PendingTransactions(s) => s.last_offset(),
            Self::Logs { stream, .. } => stream.last_offset(),
        }
    }
}

struct PollFilter {
    source: FilterSource,
    cursor: u64,
    last_poll: Instant,
}

impl PollFilter {
    fn new(source: FilterSource) -> Self {
        Self {
            cursor: source.last_offset(),
            source,
            last_poll: Instant::now(),
        }
    }

    fn drain(&mut self) -> FilterChanges {
        match &self.source {
            FilterSource::Blocks(stream) => {
                let (headers, next) = stream.read_all_non_blocking(self.cursor);
                self.cursor = next;
                FilterChanges::Hashes(headers.into_iter().map(|h| h.hash).collect())
            }
            FilterSource::PendingTransactions(stream) => {
                let (hashes, next) = stream.read_all_non_blocking(self.cursor);
                self.cursor = next;
                FilterChanges::Hashes(hashes)
            }
            FilterSource::Logs { stream, criteria } => {
                let (logs, next) = stream.read_all_non_blocking(self.cursor);
                self.cursor = next;
                FilterChanges::Logs(filter_logs(logs, criteria))
            }
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Installed polling filters.
pub struct PollingFilterRegistry {
    aggregator: Arc<EventAggregator>,
    backend: Arc<dyn LogBackend>,
    config: FilterConfig,
    filters: Mutex<HashMap<FilterId, PollFilter>>,
}

impl fmt::Debug for PollingFilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingFilterRegistry")
            .field("config", &self.config)
            .field("filters", &self.len())
            .finish_non_exhaustive()
    }
}

impl PollingFilterRegistry {
    /// Create the registry and spawn its expiry sweep.
    ///
    /// Must be called from within a Tokio runtime. The sweep task exits once
    /// the returned registry is dropped.
    pub fn new(
        aggregator: Arc<EventAggregator>,
        backend: Arc<dyn LogBackend>,
        config: FilterConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            aggregator,
            backend,
            config,
            filters: Mutex::new(HashMap::new()),
        });
        tokio::spawn(sweep_loop(Arc::downgrade(&registry), registry.config.deadline()));
        registry
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Number of installed filters.
    pub fn len(&self) -> usize {
        self.filters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kind of the filter installed under `id`.
    pub fn kind(&self, id: &FilterId) -> Option<FilterKind> {
        self.filters.lock().get(id).map(|f| f.source.kind())
    }

    /// `eth_newPendingTransactionFilter`
    pub fn new_pending_transaction_filter(&self) -> Result<FilterId, FilterError> {
        self.install(FilterSource::PendingTransactions(self.aggregator.pending_tx_stream()))
    }

    /// `eth_newBlockFilter`
    pub async fn new_block_filter(&self) -> Result<FilterId, FilterError> {
        let stream = self.aggregator.header_stream().await?;
        self.install(FilterSource::Blocks(stream))
    }

    /// `eth_newFilter`
    pub async fn new_filter(&self, criteria: FilterCriteria) -> Result<FilterId, FilterError> {
        criteria.validate()?;
        let stream = self.aggregator.log_stream().await?;
        self.install(FilterSource::Logs { stream, criteria })
    }

    fn install(&self, source: FilterSource) -> Result<FilterId, FilterError> {
        let mut filters = self.filters.lock();
        if filters.len() >= self.config.filter_cap {
            return Err(FilterError::LimitReached {
                cap: self.config.filter_cap,
            });
        }
        let id = FilterId::random();
        let kind = source.kind();
        filters.insert(id.clone(), PollFilter::new(source));
        debug!(%id, ?kind, installed = filters.len(), "filter installed");
        Ok(id)
    }

    /// `eth_getFilterChanges`: everything appended since the last poll.
    ///
    /// Resets the filter's idle deadline. Never waits.
    pub fn get_filter_changes(&self, id: &FilterId) -> Result<FilterChanges, FilterError> {
        let mut filters = self.filters.lock();
        let filter = filters
            .get_mut(id)
            .ok_or_else(|| FilterError::NotFound(id.to_string()))?;
        filter.last_poll = Instant::now();
        Ok(filter.drain())
    }

    /// `eth_getFilterLogs`: every indexed log matching a log filter's
    /// criteria.
    pub async fn get_filter_logs(&self, id: &FilterId) -> Result<Vec<LogRecord>, FilterError> {
        let criteria = {
            let filters = self.filters.lock();
            let filter = filters
                .get(id)
                .ok_or_else(|| FilterError::NotFound(id.to_string()))?;
            match &filter.source {
                FilterSource::Logs { criteria, .. } => criteria.clone(),
                _ => return Err(FilterError::WrongKind(id.to_string())),
            }
        };
        self.query(&criteria).await
    }

    /// `eth_getLogs`
    pub async fn get_logs(&self, criteria: &FilterCriteria) -> Result<Vec<LogRecord>, FilterError> {
        criteria.validate()?;
        self.query(criteria).await
    }

    async fn query(&self, criteria: &FilterCriteria) -> Result<Vec<LogRecord>, FilterError> {
        let query = LogQuery::resolve(criteria, self.backend.as_ref()).await?;
        query.execute(criteria, self.backend.as_ref(), &self.config).await
    }

    /// `eth_uninstallFilter`. Returns `false` if no such filter exists.
    pub fn uninstall_filter(&self, id: &FilterId) -> bool {
        let removed = self.filters.lock().remove(id).is_some();
        if removed {
            debug!(%id, "filter uninstalled");
        }
        removed
    }

    /// Evict every filter idle for at least the deadline. Returns the
    /// number evicted.
    pub fn sweep_expired(&self) -> usize {
        let deadline = self.config.deadline();
        let now = Instant::now();
        let mut filters = self.filters.lock();
        let before = filters.len();
        filters.retain(|id, f| {
            let keep = now.duration_since(f.last_poll) < deadline;
            if !keep {
                debug!(%id, "filter expired");
            }
            keep
        });
        before - filters.len()
    }
}

async fn sweep_loop(registry: Weak<PollingFilterRegistry>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let evicted = registry.sweep_expired();
        if evicted > 0 {
            info!(evicted, remaining = registry.len(), "expired filters evicted");
        }
    }
    debug!("filter sweep stopped");
}
