//! Single entry point wiring both watchers to host events.
//!
//! The coordinator owns the clock and both watchers and fans every
//! event out to them; host-side IO it cannot perform itself comes back
//! as [`Command`] values for the embedding to execute. For one
//! `initiate` call, both watchers see the invocation before the
//! `IssueRequest` command is even returned, so invocation-before-
//! resolution ordering holds by construction. Overlapping `initiate`
//! calls are not deduplicated; each one increments the pending count
//! on both watchers.

use permwatch_protocol::{Capabilities, ErrorCode, PermissionState};

use crate::callback::CallbackWatcher;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::reporter::Reporter;
use crate::status::{QueryPurpose, StatusWatcher};

/// Host-side work the embedding must perform on the engine's behalf.
///
/// The embedding executes commands in order and must deliver exactly
/// one resolution (`resolve_success` or `resolve_failure`) per
/// `IssueRequest`, and one `deliver_snapshot` per `QueryStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Invoke the underlying request primitive.
    IssueRequest,
    /// Query the declarative status API for a snapshot.
    QueryStatus(QueryPurpose),
    /// Fire-and-forget permission reset.
    Revoke,
}

pub struct RequestCoordinator {
    clock: Box<dyn Clock>,
    caps: Capabilities,
    callback: CallbackWatcher,
    status: StatusWatcher,
}

impl RequestCoordinator {
    pub fn new(caps: Capabilities, config: EngineConfig, clock: Box<dyn Clock>) -> Self {
        RequestCoordinator {
            clock,
            caps,
            callback: CallbackWatcher::new(config),
            status: StatusWatcher::new(caps, config),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn pending(&self) -> (u32, u32) {
        (self.callback.pending(), self.status.pending())
    }

    /// Page load: reset the callback channel, report the host surface,
    /// and kick off the initial status snapshot.
    pub fn startup(&mut self, reporter: &mut dyn Reporter) -> Vec<Command> {
        self.callback.reset(reporter);
        self.status.report_compat(reporter);
        self.status
            .check_initial_state()
            .map(Command::QueryStatus)
            .into_iter()
            .collect()
    }

    /// Starts one logical permission request. Both watchers are
    /// notified before the request command is handed back.
    pub fn initiate(&mut self, reporter: &mut dyn Reporter) -> Vec<Command> {
        let now = self.clock.now();
        self.callback.record_invocation(now, reporter);
        let forced_query = self.status.record_invocation(now, reporter);

        let mut commands = Vec::with_capacity(2);
        if let Some(purpose) = forced_query {
            commands.push(Command::QueryStatus(purpose));
        }
        commands.push(Command::IssueRequest);
        commands
    }

    /// The request primitive resolved successfully.
    pub fn resolve_success(&mut self, reporter: &mut dyn Reporter) {
        let now = self.clock.now();
        self.callback.on_success(now, reporter);
        self.status.on_success(reporter);
    }

    /// The request primitive failed with a typed code.
    pub fn resolve_failure(&mut self, code: ErrorCode, reporter: &mut dyn Reporter) -> Vec<Command> {
        let now = self.clock.now();
        self.callback.on_failure(now, code, reporter);
        self.status
            .on_failure(now, code)
            .map(Command::QueryStatus)
            .into_iter()
            .collect()
    }

    /// The host answered a `QueryStatus` command.
    pub fn deliver_snapshot(
        &mut self,
        purpose: QueryPurpose,
        state: PermissionState,
        reporter: &mut dyn Reporter,
    ) {
        self.status.on_snapshot(purpose, state, reporter);
    }

    /// The status subscription reported a change independent of any
    /// request this coordinator resolved.
    pub fn notify_external_change(
        &mut self,
        state: PermissionState,
        reporter: &mut dyn Reporter,
    ) {
        self.status.on_external_change(state, reporter);
    }

    /// The page is being discarded; a pending request is implicitly
    /// cancelled and classified by how long it had been up.
    pub fn notify_unload(&mut self, reporter: &mut dyn Reporter) {
        let now = self.clock.now();
        self.callback.on_abandon(now, reporter);
        self.status.on_abandon(now, reporter);
    }

    pub fn revoke(&mut self) -> Vec<Command> {
        if self.caps.revoke {
            vec![Command::Revoke]
        } else {
            Vec::new()
        }
    }
}
