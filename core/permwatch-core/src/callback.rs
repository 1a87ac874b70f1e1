//! Tracks permission state using only the imperative request API.
//!
//! The request primitive exposes two outcomes (success, typed
//! failure) and nothing else, so everything here is inferred from
//! which callback fired and how long it took. This channel keeps
//! working when the declarative status API is absent entirely.

use std::time::Duration;

use permwatch_protocol::{ErrorCode, Outcome, Source};

use crate::config::EngineConfig;
use crate::reporter::Reporter;
use crate::timing::{classify, ResponseSpeed};

pub struct CallbackWatcher {
    threshold: Duration,
    pending: u32,
    // Single slot: with overlapping requests the latest invocation
    // wins and timing attribution is approximate. Known limitation.
    invoked_at: Option<Duration>,
}

impl CallbackWatcher {
    pub fn new(config: EngineConfig) -> Self {
        CallbackWatcher {
            threshold: config.threshold,
            pending: 0,
            invoked_at: None,
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Page load: nothing has been observed yet.
    pub fn reset(&mut self, reporter: &mut dyn Reporter) {
        self.pending = 0;
        self.invoked_at = None;
        reporter.report(Source::Callback, Outcome::Unknown, None);
    }

    pub fn record_invocation(&mut self, now: Duration, reporter: &mut dyn Reporter) {
        reporter.report(Source::Callback, Outcome::Requested, None);
        self.invoked_at = Some(now);
        self.pending = self.pending.saturating_add(1);
    }

    pub fn on_success(&mut self, now: Duration, reporter: &mut dyn Reporter) {
        let elapsed = self.elapsed_since_invocation(now);
        let outcome = match classify(elapsed, self.threshold) {
            ResponseSpeed::Slow => Outcome::UserGranted,
            ResponseSpeed::Fast => Outcome::AutoGranted,
        };
        reporter.report(Source::Callback, outcome, Some(elapsed));
        self.invoked_at = None;
        self.pending = self.pending.saturating_sub(1);
    }

    pub fn on_failure(&mut self, now: Duration, code: ErrorCode, reporter: &mut dyn Reporter) {
        // Elapsed must be read before the invocation slot is cleared,
        // otherwise it degenerates to zero and everything classifies
        // as automatic.
        let elapsed = self.elapsed_since_invocation(now);
        let permission_failure = code == ErrorCode::PermissionDenied;
        let outcome = match (classify(elapsed, self.threshold), permission_failure) {
            (ResponseSpeed::Slow, true) => Outcome::UserDenied,
            (ResponseSpeed::Slow, false) => Outcome::UserFailed,
            (ResponseSpeed::Fast, true) => Outcome::AutoDenied,
            (ResponseSpeed::Fast, false) => Outcome::AutoFailed,
        };
        reporter.report(Source::Callback, outcome, Some(elapsed));
        self.invoked_at = None;
        self.pending = self.pending.saturating_sub(1);
    }

    /// Page unload while a request is still in flight. The page is
    /// ending, so `pending` is left as-is.
    pub fn on_abandon(&mut self, now: Duration, reporter: &mut dyn Reporter) {
        if self.pending == 0 {
            return;
        }
        let elapsed = self.elapsed_since_invocation(now);
        let outcome = match classify(elapsed, self.threshold) {
            ResponseSpeed::Fast => Outcome::FastNavigate,
            ResponseSpeed::Slow => Outcome::SlowNavigate,
        };
        reporter.report(Source::Callback, outcome, Some(elapsed));
    }

    fn elapsed_since_invocation(&self, now: Duration) -> Duration {
        self.invoked_at
            .map(|at| now.saturating_sub(at))
            .unwrap_or_default()
    }
}
