//! # chainfeed-observability
//!
//! Structured logging for ChainFeed services. Levels are configurable per
//! component; output is human-readable text or JSON lines.

pub mod tracing_setup;

pub use tracing_setup::{directives, init_tracing, LogConfig};
