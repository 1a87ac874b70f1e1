//! Wire types and boundary adapters for the permwatch classifier.
//!
//! This crate is shared by the engine and its drivers (replay harness,
//! embedding code) to prevent schema drift. The engine works only with
//! the normalized types defined here; duck-typed host values are
//! converted at the boundary by [`normalize_status`] and
//! [`Capabilities::probe`], so internal logic never branches on
//! field-naming variance.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Snapshot value of the declarative permission-status API.
///
/// `Unknown` is only ever the engine-side initial value; it never
/// appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Prompt,
    Granted,
    Denied,
    #[default]
    Unknown,
}

impl PermissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionState::Prompt => "prompt",
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
            PermissionState::Unknown => "unknown",
        }
    }

    /// Parses a raw status string. Accepts `"default"` as an alias for
    /// the prompt state (older hosts report it that way).
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "prompt" | "default" => Some(PermissionState::Prompt),
            "granted" => Some(PermissionState::Granted),
            "denied" => Some(PermissionState::Denied),
            _ => None,
        }
    }
}

/// Typed failure delivered by the imperative request API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

impl ErrorCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::PermissionDenied),
            2 => Some(ErrorCode::PositionUnavailable),
            3 => Some(ErrorCode::Timeout),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ErrorCode::PermissionDenied => 1,
            ErrorCode::PositionUnavailable => 2,
            ErrorCode::Timeout => 3,
        }
    }
}

/// Which observation channel produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The declarative status-observation channel.
    Api,
    /// The imperative request/response channel.
    Callback,
}

/// A host feature the engine may rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Query,
    Request,
    Revoke,
}

/// Availability flags for the declarative permission surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub query: bool,
    pub request: bool,
    pub revoke: bool,
}

impl Capabilities {
    /// Inspects a duck-typed host descriptor once and yields the three
    /// availability flags. A missing or non-object `permissions`
    /// member yields all-false. Pure; never fails.
    pub fn probe(host: &Value) -> Capabilities {
        let Some(permissions) = host.get("permissions").filter(|value| value.is_object()) else {
            return Capabilities::default();
        };

        Capabilities {
            query: member_supported(permissions, "query"),
            request: member_supported(permissions, "request"),
            revoke: member_supported(permissions, "revoke"),
        }
    }

    pub fn all() -> Capabilities {
        Capabilities {
            query: true,
            request: true,
            revoke: true,
        }
    }
}

fn member_supported(permissions: &Value, name: &str) -> bool {
    match permissions.get(name) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Classified terminal outcome for one request/observation cycle.
///
/// Each value is terminal for its cycle but not for the watcher that
/// emitted it; watchers stay live for the lifetime of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Page loaded; no observation has been made yet.
    Unknown,
    /// A logical permission request was started.
    Requested,
    /// The declarative status API is not supported by this host.
    Unavailable,
    /// Initial snapshot found the permission already granted.
    StartingGranted,
    /// Initial snapshot found the permission already denied.
    StartingDenied,
    /// Initial snapshot found the user has never been prompted.
    NotYetPrompted,
    /// Grant with human-scale latency: the user answered a prompt.
    UserGranted,
    /// Grant faster than a human could react: cached or automatic.
    AutoGranted,
    /// Denial with human-scale latency.
    UserDenied,
    /// Denial faster than a human could react.
    AutoDenied,
    /// Non-permission failure with human-scale latency.
    UserFailed,
    /// Non-permission failure faster than a human could react.
    AutoFailed,
    /// Request succeeded without prompting; a stored grant applied.
    GrantedFromStorage,
    /// Request failed without prompting; a stored denial applied.
    DeniedFromStorage,
    /// Permission was granted outside this page's own request flow.
    GrantedElsewhere,
    /// Permission was denied outside this page's own request flow.
    DeniedElsewhere,
    /// Permission was reset to prompt outside this page's request flow.
    ResetElsewhere,
    /// A state change arrived while a request was in flight; buffered.
    Deferred,
    /// The user dismissed the prompt without answering it.
    UserDismissed,
    /// The browser suppressed the prompt outright.
    BrowserBlocked,
    /// Granted at the browser level but blocked by the OS.
    GrantedButOs,
    /// Page unloaded almost immediately after requesting.
    FastNavigate,
    /// Page unloaded after the prompt had been visible a while.
    SlowNavigate,
}

/// One reporter delivery: a classified outcome plus optional timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub source: Source,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
}

/// A [`Report`] stamped with the wall-clock time it was emitted, for
/// replay output and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedReport {
    pub recorded_at: String,
    #[serde(flatten)]
    pub report: Report,
}

impl StampedReport {
    pub fn now(report: Report) -> StampedReport {
        StampedReport {
            recorded_at: Utc::now().to_rfc3339(),
            report,
        }
    }
}

/// Capability support line emitted alongside outcome reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub capability: Capability,
    pub supported: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed script line: {0}")]
    MalformedLine(#[from] serde_json::Error),

    #[error("unknown error code: {0}")]
    UnknownErrorCode(u8),

    #[error("malformed status value: {0}")]
    MalformedStatus(String),
}

/// Normalizes a duck-typed status value into a [`PermissionState`].
///
/// Hosts disagree on the field name (`state` vs `status`) and some
/// report a bare string; all three shapes are accepted here so the
/// engine never sees the variance.
pub fn normalize_status(value: &Value) -> Result<PermissionState, ProtocolError> {
    let raw = match value {
        Value::String(raw) => raw.as_str(),
        Value::Object(fields) => fields
            .get("state")
            .or_else(|| fields.get("status"))
            .and_then(|field| field.as_str())
            .ok_or_else(|| {
                ProtocolError::MalformedStatus("object carries no state or status string".into())
            })?,
        other => {
            return Err(ProtocolError::MalformedStatus(format!(
                "expected string or object, got {}",
                other
            )))
        }
    };

    PermissionState::from_str(raw)
        .ok_or_else(|| ProtocolError::MalformedStatus(format!("unrecognized state {:?}", raw)))
}

/// Optional first line of a replay script: the host surface and a
/// threshold override.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptHeader {
    pub host: Value,
    #[serde(default)]
    pub threshold_ms: Option<u64>,
}

/// One externally delivered event in a replay script.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScriptEvent {
    /// Absolute manual-clock position for this event, in milliseconds.
    #[serde(default)]
    pub at_ms: Option<u64>,
    #[serde(flatten)]
    pub action: ScriptAction,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScriptAction {
    /// Page load: compat report plus the initial status query.
    Startup,
    /// The UI started a logical permission request.
    Initiate,
    /// The in-flight request primitive resolved successfully.
    ResolveSuccess,
    /// The in-flight request primitive failed with a typed code.
    ResolveFailure { code: u8 },
    /// The status subscription delivered an independent change.
    ExternalChange { status: Value },
    /// The host answered an outstanding status query.
    Snapshot { status: Value },
    /// The page is being discarded.
    Unload,
    /// The UI asked for the permission to be reset.
    Revoke,
    /// Advance the manual clock without delivering anything.
    Advance { ms: u64 },
}

impl ScriptEvent {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match &self.action {
            ScriptAction::ResolveFailure { code } => {
                ErrorCode::from_code(*code).ok_or(ProtocolError::UnknownErrorCode(*code))?;
            }
            ScriptAction::ExternalChange { status } | ScriptAction::Snapshot { status } => {
                normalize_status(status)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Parses and validates one replay script line.
pub fn parse_script_line(line: &str) -> Result<ScriptEvent, ProtocolError> {
    let event: ScriptEvent = serde_json::from_str(line)?;
    event.validate()?;
    Ok(event)
}
