//! Engine configuration.

use std::time::Duration;

use crate::timing::DEFAULT_THRESHOLD;

/// Fixed configuration for one page's watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Latency boundary between automatic and human-timed responses.
    pub threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl EngineConfig {
    pub fn with_threshold_ms(ms: u64) -> Self {
        EngineConfig {
            threshold: Duration::from_millis(ms),
        }
    }
}
