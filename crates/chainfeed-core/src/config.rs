//! Stream sizing configuration.

use serde::{Deserialize, Serialize};

/// Sizing of one [`SegmentedStream`](crate::SegmentedStream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Items per segment; also the unit of eviction.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    /// Minimum number of items retained before eviction starts.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_segment_size() -> usize { 128 }
fn default_capacity() -> usize { 128 * 32 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            capacity: default_capacity(),
        }
    }
}

impl StreamConfig {
    /// Segments of `segment_size`, retaining `segments` of them.
    pub fn with_segments(segment_size: usize, segments: usize) -> Self {
        Self {
            segment_size,
            capacity: segment_size * segments,
        }
    }
}
