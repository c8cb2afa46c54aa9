//! Polling filter limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits for the [`PollingFilterRegistry`](crate::PollingFilterRegistry)
/// and historical log queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Maximum number of installed filters.
    #[serde(default = "default_filter_cap")]
    pub filter_cap: usize,
    /// Maximum number of logs a single historical query may return.
    #[serde(default = "default_logs_cap")]
    pub logs_cap: usize,
    /// Maximum `to - from` distance of a historical range query.
    #[serde(default = "default_block_range_cap")]
    pub block_range_cap: u64,
    /// Filters not polled for this long are evicted.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

fn default_filter_cap() -> usize { 200 }
fn default_logs_cap() -> usize { 10_000 }
fn default_block_range_cap() -> u64 { 10_000 }
fn default_deadline_secs() -> u64 { 300 }

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            filter_cap: default_filter_cap(),
            logs_cap: default_logs_cap(),
            block_range_cap: default_block_range_cap(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl FilterConfig {
    /// Idle deadline; also the sweep interval. Never zero.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs.max(1))
    }
}
