//! Replays a scripted host-event log through the classifier and
//! prints each emitted report as a JSON line.
//!
//! Scripts are JSON lines. An optional first line describes the host
//! surface and threshold, e.g.
//! `{"host":{"permissions":{"query":true,"request":true,"revoke":true}},"threshold_ms":5}`;
//! without it the host is probed as having no permission surface at
//! all. Every following line is one event, e.g.
//! `{"event":"initiate"}` or
//! `{"event":"resolve_failure","code":1,"at_ms":12}`. Snapshot lines
//! answer the engine's outstanding status queries in issue order.

use std::collections::VecDeque;
use std::io::Read;
use std::time::Duration;

use clap::Parser;
use fs_err as fs;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use permwatch_core::{
    Command, EngineConfig, ManualClock, Outcome, Reporter, RequestCoordinator, Source,
};
use permwatch_protocol::{
    normalize_status, parse_script_line, Capabilities, Capability, CapabilityReport, ErrorCode,
    Report, ScriptAction, ScriptHeader, StampedReport,
};

#[derive(Parser)]
#[command(
    name = "permwatch-replay",
    about = "Replay a scripted permission-event log through the classifier"
)]
struct Args {
    /// Path to a JSON-lines script; `-` reads stdin.
    script: String,
}

fn main() {
    init_logging();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        tracing::error!(error = %err, "Replay failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args) -> Result<(), String> {
    let text = read_script(&args.script)?;
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .peekable();

    let header = parse_header(&mut lines);
    let caps = Capabilities::probe(&header.host);
    let config = match header.threshold_ms {
        Some(ms) => EngineConfig::with_threshold_ms(ms),
        None => EngineConfig::default(),
    };
    info!(?caps, threshold_ms = config.threshold.as_millis() as u64, "Replay starting");

    let clock = ManualClock::new();
    let mut coordinator = RequestCoordinator::new(caps, config, Box::new(clock.clone()));
    let mut reporter = JsonlReporter;
    let mut driver = CommandDriver::default();

    for (index, line) in lines.enumerate() {
        let event = parse_script_line(line)
            .map_err(|err| format!("script line {}: {}", index + 1, err))?;
        if let Some(ms) = event.at_ms {
            clock.set_ms(ms);
        }

        match event.action {
            ScriptAction::Startup => {
                driver.absorb(coordinator.startup(&mut reporter));
            }
            ScriptAction::Initiate => {
                driver.absorb(coordinator.initiate(&mut reporter));
            }
            ScriptAction::ResolveSuccess => {
                coordinator.resolve_success(&mut reporter);
            }
            ScriptAction::ResolveFailure { code } => {
                // Validation already vetted the code.
                let code = ErrorCode::from_code(code)
                    .ok_or_else(|| format!("script line {}: unknown code {}", index + 1, code))?;
                driver.absorb(coordinator.resolve_failure(code, &mut reporter));
            }
            ScriptAction::ExternalChange { status } => {
                let state = normalize_status(&status)
                    .map_err(|err| format!("script line {}: {}", index + 1, err))?;
                coordinator.notify_external_change(state, &mut reporter);
            }
            ScriptAction::Snapshot { status } => {
                let state = normalize_status(&status)
                    .map_err(|err| format!("script line {}: {}", index + 1, err))?;
                match driver.next_query() {
                    Some(purpose) => {
                        coordinator.deliver_snapshot(purpose, state, &mut reporter);
                    }
                    None => warn!(
                        state = state.as_str(),
                        "snapshot line with no outstanding status query"
                    ),
                }
            }
            ScriptAction::Unload => {
                coordinator.notify_unload(&mut reporter);
            }
            ScriptAction::Revoke => {
                driver.absorb(coordinator.revoke());
            }
            ScriptAction::Advance { ms } => {
                clock.advance_ms(ms);
            }
        }
    }

    if driver.outstanding() > 0 {
        warn!(
            outstanding = driver.outstanding(),
            "script ended with unanswered status queries"
        );
    }
    Ok(())
}

fn read_script(path: &str) -> Result<String, String> {
    if path == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .map_err(|err| format!("Failed to read stdin: {}", err))?;
        return Ok(text);
    }
    fs::read_to_string(path).map_err(|err| format!("Failed to read script: {}", err))
}

fn parse_header<'a, I>(lines: &mut std::iter::Peekable<I>) -> ScriptHeader
where
    I: Iterator<Item = &'a str>,
{
    let Some(first) = lines.peek() else {
        return empty_header();
    };
    match serde_json::from_str::<ScriptHeader>(first) {
        Ok(header) => {
            lines.next();
            header
        }
        // Event lines carry an `event` field the header rejects, so a
        // parse failure just means the script has no header.
        Err(_) => empty_header(),
    }
}

fn empty_header() -> ScriptHeader {
    ScriptHeader {
        host: serde_json::json!({}),
        threshold_ms: None,
    }
}

/// Tracks the engine's outstanding host-side work. Status queries are
/// answered by `snapshot` script lines in issue order; request
/// resolutions come from the script directly.
#[derive(Default)]
struct CommandDriver {
    queries: VecDeque<permwatch_core::QueryPurpose>,
}

impl CommandDriver {
    fn absorb(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::QueryStatus(purpose) => self.queries.push_back(purpose),
                Command::IssueRequest => {
                    debug!("request primitive invoked; awaiting scripted resolution")
                }
                Command::Revoke => info!("permission revoked"),
            }
        }
    }

    fn next_query(&mut self) -> Option<permwatch_core::QueryPurpose> {
        self.queries.pop_front()
    }

    fn outstanding(&self) -> usize {
        self.queries.len()
    }
}

/// Prints every report as one stamped JSON line on stdout.
struct JsonlReporter;

impl Reporter for JsonlReporter {
    fn report(&mut self, source: Source, outcome: Outcome, elapsed: Option<Duration>) {
        let stamped = StampedReport::now(Report {
            source,
            outcome,
            elapsed_ms: elapsed.map(|value| value.as_millis() as u64),
        });
        print_line(&stamped);
    }

    fn report_capability(&mut self, capability: Capability, supported: bool) {
        print_line(&CapabilityReport {
            capability,
            supported,
        });
    }
}

fn print_line<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(err) => warn!(error = %err, "Failed to serialize report line"),
    }
}
