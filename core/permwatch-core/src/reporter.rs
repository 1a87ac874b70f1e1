//! Output seam: where classified outcomes go.
//!
//! Delivery is fire-and-forget; the engine never inspects the result
//! of a report, and a reporter that drops lines is the embedding's
//! problem, not the engine's.

use std::time::Duration;

use permwatch_protocol::{Capability, Outcome, Report, Source};
use tracing::info;

pub trait Reporter {
    fn report(&mut self, source: Source, outcome: Outcome, elapsed: Option<Duration>);
    fn report_capability(&mut self, capability: Capability, supported: bool);
}

/// Emits every report as a structured tracing event.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, source: Source, outcome: Outcome, elapsed: Option<Duration>) {
        info!(
            source = ?source,
            outcome = ?outcome,
            elapsed_ms = elapsed.map(|value| value.as_millis() as u64),
            "permission outcome"
        );
    }

    fn report_capability(&mut self, capability: Capability, supported: bool) {
        info!(capability = ?capability, supported, "host capability");
    }
}

/// Collects reports in memory; the test suites and the replay harness
/// assert against it.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub reports: Vec<Report>,
    pub capabilities: Vec<(Capability, bool)>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        RecordingReporter::default()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.reports.iter().map(|report| report.outcome).collect()
    }

    pub fn outcomes_for(&self, source: Source) -> Vec<Outcome> {
        self.reports
            .iter()
            .filter(|report| report.source == source)
            .map(|report| report.outcome)
            .collect()
    }

    pub fn last(&self) -> Option<&Report> {
        self.reports.last()
    }
}

impl Reporter for RecordingReporter {
    fn report(&mut self, source: Source, outcome: Outcome, elapsed: Option<Duration>) {
        self.reports.push(Report {
            source,
            outcome,
            elapsed_ms: elapsed.map(|value| value.as_millis() as u64),
        });
    }

    fn report_capability(&mut self, capability: Capability, supported: bool) {
        self.capabilities.push((capability, supported));
    }
}
