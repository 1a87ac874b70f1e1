//! Classifies response latency as human-scale or automatic.
//!
//! The heuristic: no human could have read a permission prompt and
//! answered it within the threshold, so anything at or under it was
//! decided by the browser (cached grant, policy block), not a person.

use std::time::Duration;

/// Observed across the measurement variants; any positive duration is
/// valid configuration.
pub const DEFAULT_THRESHOLD: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSpeed {
    /// At or under the threshold: automatic/cached.
    Fast,
    /// Over the threshold: plausibly a human decision.
    Slow,
}

/// `Fast` iff `elapsed <= threshold`. Deterministic and monotonic in
/// `elapsed`.
pub fn classify(elapsed: Duration, threshold: Duration) -> ResponseSpeed {
    if elapsed <= threshold {
        ResponseSpeed::Fast
    } else {
        ResponseSpeed::Slow
    }
}
