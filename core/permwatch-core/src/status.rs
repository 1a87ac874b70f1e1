//! Tracks permission state using the declarative status-observation
//! API: an initial snapshot, asynchronous change notifications, and
//! correlation of both with in-flight requests.
//!
//! Snapshot queries are asynchronous at the host boundary, so they are
//! expressed sans-IO here: operations that need one return a
//! [`QueryPurpose`] token, the embedding performs the query, and the
//! answer comes back through [`StatusWatcher::on_snapshot`]. Any other
//! event may be delivered in between; the `pending`/`deferred` fields
//! absorb every interleaving.
//!
//! When the host has no query support the watcher degrades to a
//! guarded no-op; the only thing it ever emits is a single
//! `Unavailable` from [`StatusWatcher::report_compat`].

use std::time::Duration;

use permwatch_protocol::{Capabilities, Capability, ErrorCode, Outcome, PermissionState, Source};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::reporter::Reporter;
use crate::timing::{classify, ResponseSpeed};

/// Why a snapshot query was issued; routed back with the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPurpose {
    /// Page-load snapshot (or one forced by an early invocation).
    Initial,
    /// Post-failure re-query to disambiguate the failure cause.
    FailureRecheck,
}

/// Failure context held between `on_failure` and its snapshot answer.
#[derive(Debug, Clone, Copy)]
struct FailureRecheck {
    code: ErrorCode,
    elapsed: Duration,
    deferred: Option<PermissionState>,
}

pub struct StatusWatcher {
    caps: Capabilities,
    threshold: Duration,
    last_observed: PermissionState,
    pending: u32,
    deferred: Option<PermissionState>,
    invoked_at: Option<Duration>,
    initial_query_inflight: bool,
    recheck: Option<FailureRecheck>,
    unavailable_reported: bool,
}

impl StatusWatcher {
    pub fn new(caps: Capabilities, config: EngineConfig) -> Self {
        StatusWatcher {
            caps,
            threshold: config.threshold,
            last_observed: PermissionState::Unknown,
            pending: 0,
            deferred: None,
            invoked_at: None,
            initial_query_inflight: false,
            recheck: None,
            unavailable_reported: false,
        }
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    pub fn last_observed(&self) -> PermissionState {
        self.last_observed
    }

    /// Reports the three capability flags, and `Unavailable` (once)
    /// when the query surface is missing.
    pub fn report_compat(&mut self, reporter: &mut dyn Reporter) {
        reporter.report_capability(Capability::Query, self.caps.query);
        reporter.report_capability(Capability::Request, self.caps.request);
        reporter.report_capability(Capability::Revoke, self.caps.revoke);

        if !self.caps.query && !self.unavailable_reported {
            self.unavailable_reported = true;
            reporter.report(Source::Api, Outcome::Unavailable, None);
        }
    }

    /// Requests the page-load snapshot. Idempotent: once a snapshot
    /// has been taken, or while one is already in flight, this does
    /// nothing.
    pub fn check_initial_state(&mut self) -> Option<QueryPurpose> {
        if !self.caps.query {
            return None;
        }
        if self.last_observed != PermissionState::Unknown || self.initial_query_inflight {
            return None;
        }
        self.initial_query_inflight = true;
        Some(QueryPurpose::Initial)
    }

    /// A state change arrived from the subscription, not caused by
    /// this watcher's own in-flight request resolving.
    pub fn on_external_change(&mut self, new_state: PermissionState, reporter: &mut dyn Reporter) {
        if !self.caps.query {
            return;
        }

        if self.pending > 0 {
            // A resolution is still pending and must classify against
            // the pre-change state; buffer the change until then.
            self.deferred = Some(new_state);
            reporter.report(Source::Api, Outcome::Deferred, None);
            return;
        }

        reporter.report(Source::Api, elsewhere_outcome(new_state), None);
        self.last_observed = new_state;
    }

    /// The coordinator started a logical request. May force the
    /// initial snapshot when the invocation races ahead of it.
    pub fn record_invocation(
        &mut self,
        now: Duration,
        reporter: &mut dyn Reporter,
    ) -> Option<QueryPurpose> {
        if !self.caps.query {
            return None;
        }
        reporter.report(Source::Api, Outcome::Requested, None);
        self.pending = self.pending.saturating_add(1);
        self.invoked_at = Some(now);

        if self.last_observed == PermissionState::Unknown {
            self.check_initial_state()
        } else {
            None
        }
    }

    pub fn on_success(&mut self, reporter: &mut dyn Reporter) {
        if !self.caps.query {
            return;
        }
        self.pending = self.pending.saturating_sub(1);
        let outcome = if self.last_observed == PermissionState::Prompt {
            Outcome::UserGranted
        } else {
            Outcome::GrantedFromStorage
        };
        reporter.report(Source::Api, outcome, None);
        // Whatever change was buffered has been superseded.
        self.deferred = None;
    }

    /// The request failed. Classification needs the post-failure
    /// snapshot, so the failure context is stashed and a recheck query
    /// is requested.
    pub fn on_failure(&mut self, now: Duration, code: ErrorCode) -> Option<QueryPurpose> {
        if !self.caps.query {
            return None;
        }
        self.pending = self.pending.saturating_sub(1);
        let elapsed = self
            .invoked_at
            .map(|at| now.saturating_sub(at))
            .unwrap_or_default();
        self.recheck = Some(FailureRecheck {
            code,
            elapsed,
            deferred: self.deferred.take(),
        });
        Some(QueryPurpose::FailureRecheck)
    }

    /// The host answered an outstanding snapshot query.
    pub fn on_snapshot(
        &mut self,
        purpose: QueryPurpose,
        state: PermissionState,
        reporter: &mut dyn Reporter,
    ) {
        if !self.caps.query {
            return;
        }
        match purpose {
            QueryPurpose::Initial => self.resolve_initial(state, reporter),
            QueryPurpose::FailureRecheck => self.resolve_recheck(state, reporter),
        }
    }

    fn resolve_initial(&mut self, state: PermissionState, reporter: &mut dyn Reporter) {
        self.initial_query_inflight = false;
        if self.last_observed != PermissionState::Unknown {
            // Another path (external change, failure recheck) already
            // committed a state while the query was in flight.
            debug!(state = state.as_str(), "initial snapshot superseded");
            return;
        }
        let outcome = match state {
            PermissionState::Granted => Outcome::StartingGranted,
            PermissionState::Denied => Outcome::StartingDenied,
            PermissionState::Prompt => Outcome::NotYetPrompted,
            PermissionState::Unknown => {
                warn!("initial snapshot carried no state");
                return;
            }
        };
        self.last_observed = state;
        reporter.report(Source::Api, outcome, None);
    }

    fn resolve_recheck(&mut self, state: PermissionState, reporter: &mut dyn Reporter) {
        let Some(FailureRecheck {
            code,
            elapsed,
            deferred,
        }) = self.recheck.take()
        else {
            debug!(state = state.as_str(), "recheck snapshot without failure context");
            return;
        };

        let permission_failure = code == ErrorCode::PermissionDenied;
        match state {
            PermissionState::Prompt => {
                // Still prompt after a failure: either the user closed
                // the prompt without answering, or the browser never
                // showed one.
                let outcome = match classify(elapsed, self.threshold) {
                    ResponseSpeed::Slow => Outcome::UserDismissed,
                    ResponseSpeed::Fast => Outcome::BrowserBlocked,
                };
                reporter.report(Source::Api, outcome, Some(elapsed));
            }
            PermissionState::Granted
                if deferred == Some(PermissionState::Granted) && permission_failure =>
            {
                // The grant happened in another context while this
                // window's prompt was dismissed.
                reporter.report(Source::Api, Outcome::GrantedElsewhere, None);
                reporter.report(Source::Api, Outcome::UserDismissed, Some(elapsed));
            }
            PermissionState::Granted if !permission_failure => {
                let outcome = if self.last_observed == PermissionState::Prompt {
                    Outcome::UserGranted
                } else {
                    Outcome::GrantedFromStorage
                };
                reporter.report(Source::Api, outcome, Some(elapsed));
            }
            PermissionState::Granted => {
                // Granted at the browser level yet the request failed
                // with a permission error: blocked by the OS.
                reporter.report(Source::Api, Outcome::GrantedButOs, Some(elapsed));
            }
            PermissionState::Denied => {
                let outcome = if self.last_observed == PermissionState::Denied {
                    Outcome::DeniedFromStorage
                } else {
                    Outcome::UserDenied
                };
                reporter.report(Source::Api, outcome, Some(elapsed));
            }
            PermissionState::Unknown => {
                warn!("recheck snapshot carried no state");
            }
        }
        self.last_observed = state;
    }

    /// Page unload. Flushes any buffered external change before the
    /// navigation outcome; no-op when nothing is pending.
    pub fn on_abandon(&mut self, now: Duration, reporter: &mut dyn Reporter) {
        if !self.caps.query {
            return;
        }
        if self.pending == 0 {
            return;
        }

        if let Some(deferred) = self.deferred.take() {
            reporter.report(Source::Api, elsewhere_outcome(deferred), None);
        }

        let elapsed = self
            .invoked_at
            .map(|at| now.saturating_sub(at))
            .unwrap_or_default();
        let outcome = match classify(elapsed, self.threshold) {
            ResponseSpeed::Fast => Outcome::FastNavigate,
            ResponseSpeed::Slow => Outcome::SlowNavigate,
        };
        reporter.report(Source::Api, outcome, Some(elapsed));
    }
}

fn elsewhere_outcome(state: PermissionState) -> Outcome {
    match state {
        PermissionState::Granted => Outcome::GrantedElsewhere,
        PermissionState::Denied => Outcome::DeniedElsewhere,
        PermissionState::Prompt | PermissionState::Unknown => Outcome::ResetElsewhere,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::RecordingReporter;

    fn watcher() -> StatusWatcher {
        StatusWatcher::new(
            Capabilities {
                query: true,
                request: true,
                revoke: true,
            },
            EngineConfig::default(),
        )
    }

    fn at(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn initial_snapshot_classifies_starting_state() {
        for (state, expected) in [
            (PermissionState::Granted, Outcome::StartingGranted),
            (PermissionState::Denied, Outcome::StartingDenied),
            (PermissionState::Prompt, Outcome::NotYetPrompted),
        ] {
            let mut reporter = RecordingReporter::new();
            let mut watcher = watcher();
            assert_eq!(watcher.check_initial_state(), Some(QueryPurpose::Initial));
            watcher.on_snapshot(QueryPurpose::Initial, state, &mut reporter);
            assert_eq!(reporter.outcomes(), vec![expected]);
            assert_eq!(watcher.last_observed(), state);
        }
    }

    #[test]
    fn check_initial_state_is_idempotent_while_inflight() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        assert_eq!(watcher.check_initial_state(), Some(QueryPurpose::Initial));
        assert_eq!(watcher.check_initial_state(), None);

        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        assert_eq!(reporter.outcomes(), vec![Outcome::NotYetPrompted]);

        // Settled now; a later check does not re-query.
        assert_eq!(watcher.check_initial_state(), None);
    }

    #[test]
    fn initial_snapshot_yields_to_state_committed_while_inflight() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        assert_eq!(watcher.check_initial_state(), Some(QueryPurpose::Initial));

        // External change commits before the snapshot answer arrives.
        watcher.on_external_change(PermissionState::Denied, &mut reporter);
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);

        assert_eq!(reporter.outcomes(), vec![Outcome::DeniedElsewhere]);
        assert_eq!(watcher.last_observed(), PermissionState::Denied);
    }

    #[test]
    fn external_change_while_idle_commits_immediately() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_external_change(PermissionState::Granted, &mut reporter);
        watcher.on_external_change(PermissionState::Denied, &mut reporter);
        watcher.on_external_change(PermissionState::Prompt, &mut reporter);

        assert_eq!(
            reporter.outcomes(),
            vec![
                Outcome::GrantedElsewhere,
                Outcome::DeniedElsewhere,
                Outcome::ResetElsewhere,
            ]
        );
        assert_eq!(watcher.last_observed(), PermissionState::Prompt);
    }

    #[test]
    fn external_change_while_pending_is_deferred() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);

        watcher.on_external_change(PermissionState::Granted, &mut reporter);

        assert_eq!(
            reporter.outcomes(),
            vec![Outcome::NotYetPrompted, Outcome::Requested, Outcome::Deferred]
        );
        // Pre-change state preserved for the pending resolution.
        assert_eq!(watcher.last_observed(), PermissionState::Prompt);
    }

    #[test]
    fn invocation_forces_initial_query_when_still_unknown() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        assert_eq!(
            watcher.record_invocation(at(0), &mut reporter),
            Some(QueryPurpose::Initial)
        );
        assert_eq!(reporter.outcomes(), vec![Outcome::Requested]);
    }

    #[test]
    fn success_after_prompt_is_user_granted() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);
        watcher.on_success(&mut reporter);

        assert_eq!(
            reporter.outcomes(),
            vec![
                Outcome::NotYetPrompted,
                Outcome::Requested,
                Outcome::UserGranted,
            ]
        );
        assert_eq!(watcher.pending(), 0);
    }

    #[test]
    fn success_from_stored_grant() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(
            QueryPurpose::Initial,
            PermissionState::Granted,
            &mut reporter,
        );
        watcher.record_invocation(at(0), &mut reporter);
        watcher.on_success(&mut reporter);

        assert_eq!(
            reporter.outcomes(),
            vec![
                Outcome::StartingGranted,
                Outcome::Requested,
                Outcome::GrantedFromStorage,
            ]
        );
    }

    #[test]
    fn slow_failure_still_prompt_is_user_dismissed() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);

        let purpose = watcher.on_failure(at(12), ErrorCode::PermissionDenied);
        assert_eq!(purpose, Some(QueryPurpose::FailureRecheck));
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Prompt,
            &mut reporter,
        );

        assert_eq!(reporter.outcomes_for(Source::Api).last(), Some(&Outcome::UserDismissed));
        assert_eq!(reporter.last().and_then(|report| report.elapsed_ms), Some(12));
    }

    #[test]
    fn fast_failure_still_prompt_is_browser_blocked() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);

        watcher.on_failure(at(3), ErrorCode::PermissionDenied);
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Prompt,
            &mut reporter,
        );

        assert_eq!(
            reporter.outcomes().last(),
            Some(&Outcome::BrowserBlocked)
        );
    }

    #[test]
    fn deferred_grant_with_denied_failure_is_cross_context_race() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);

        // Grant lands in another tab while our prompt is up.
        watcher.on_external_change(PermissionState::Granted, &mut reporter);
        watcher.on_failure(at(12), ErrorCode::PermissionDenied);
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Granted,
            &mut reporter,
        );

        assert_eq!(
            reporter.outcomes(),
            vec![
                Outcome::NotYetPrompted,
                Outcome::Requested,
                Outcome::Deferred,
                Outcome::GrantedElsewhere,
                Outcome::UserDismissed,
            ]
        );
        assert_eq!(watcher.last_observed(), PermissionState::Granted);
    }

    #[test]
    fn granted_with_non_permission_failure_uses_pre_state() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);

        watcher.on_failure(at(12), ErrorCode::Timeout);
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Granted,
            &mut reporter,
        );

        assert_eq!(reporter.outcomes().last(), Some(&Outcome::UserGranted));
    }

    #[test]
    fn granted_with_permission_failure_and_no_deferral_is_os_block() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(
            QueryPurpose::Initial,
            PermissionState::Granted,
            &mut reporter,
        );
        watcher.record_invocation(at(0), &mut reporter);

        watcher.on_failure(at(12), ErrorCode::PermissionDenied);
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Granted,
            &mut reporter,
        );

        assert_eq!(reporter.outcomes().last(), Some(&Outcome::GrantedButOs));
    }

    #[test]
    fn denied_failure_from_stored_denial() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Denied, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);
        watcher.on_failure(at(2), ErrorCode::PermissionDenied);
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Denied,
            &mut reporter,
        );
        assert_eq!(reporter.outcomes().last(), Some(&Outcome::DeniedFromStorage));
    }

    #[test]
    fn denied_failure_after_prompt_is_user_denied() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);
        watcher.on_failure(at(40), ErrorCode::PermissionDenied);
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Denied,
            &mut reporter,
        );
        assert_eq!(reporter.outcomes().last(), Some(&Outcome::UserDenied));
    }

    #[test]
    fn recheck_commits_observed_state() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);
        watcher.on_failure(at(40), ErrorCode::PermissionDenied);
        watcher.on_snapshot(
            QueryPurpose::FailureRecheck,
            PermissionState::Denied,
            &mut reporter,
        );
        assert_eq!(watcher.last_observed(), PermissionState::Denied);
    }

    #[test]
    fn success_clears_deferred_state() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);
        watcher.on_external_change(PermissionState::Denied, &mut reporter);
        watcher.on_success(&mut reporter);

        // Unload right after: nothing deferred left to flush, and
        // nothing pending either.
        watcher.on_abandon(at(50), &mut reporter);
        assert_eq!(
            reporter.outcomes(),
            vec![
                Outcome::NotYetPrompted,
                Outcome::Requested,
                Outcome::Deferred,
                Outcome::UserGranted,
            ]
        );
    }

    #[test]
    fn abandon_flushes_deferred_then_classifies_navigation() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Prompt, &mut reporter);
        watcher.record_invocation(at(0), &mut reporter);
        watcher.on_external_change(PermissionState::Granted, &mut reporter);
        watcher.on_abandon(at(300), &mut reporter);

        assert_eq!(
            reporter.outcomes(),
            vec![
                Outcome::NotYetPrompted,
                Outcome::Requested,
                Outcome::Deferred,
                Outcome::GrantedElsewhere,
                Outcome::SlowNavigate,
            ]
        );
    }

    #[test]
    fn unavailable_host_emits_exactly_one_unavailable() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = StatusWatcher::new(Capabilities::default(), EngineConfig::default());

        watcher.report_compat(&mut reporter);
        watcher.report_compat(&mut reporter);
        assert_eq!(watcher.check_initial_state(), None);
        assert_eq!(watcher.record_invocation(at(0), &mut reporter), None);
        watcher.on_external_change(PermissionState::Granted, &mut reporter);
        watcher.on_success(&mut reporter);
        assert_eq!(watcher.on_failure(at(1), ErrorCode::PermissionDenied), None);
        watcher.on_snapshot(QueryPurpose::Initial, PermissionState::Granted, &mut reporter);
        watcher.on_abandon(at(2), &mut reporter);

        assert_eq!(reporter.outcomes(), vec![Outcome::Unavailable]);
        // Capability flags are still reported for display.
        assert_eq!(reporter.capabilities.len(), 6);
    }

    #[test]
    fn pending_never_goes_negative() {
        let mut reporter = RecordingReporter::new();
        let mut watcher = watcher();
        watcher.on_success(&mut reporter);
        watcher.on_failure(at(0), ErrorCode::Timeout);
        assert_eq!(watcher.pending(), 0);

        watcher.record_invocation(at(1), &mut reporter);
        watcher.on_success(&mut reporter);
        watcher.on_success(&mut reporter);
        assert_eq!(watcher.pending(), 0);
    }
}
