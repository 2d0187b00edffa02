//! Wire vocabulary for the workspace status daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! It covers two protocols:
//!
//! - the ingress line protocol (`status\t<workspace>\t<verb>\t[args...]\n`)
//!   written by hook scripts and never answered, and
//! - the JSON query protocol (one request line, one response line, or a stream
//!   of status lines after `subscribe`).
//!
//! The daemon remains the authority on validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Literal first field of every ingress line.
pub const STATUS_MARKER: &str = "status";
pub const FIELD_SEPARATOR: char = '\t';

/// Socket file name inside the runtime directory.
pub const STATUS_SOCKET_NAME: &str = "workspace-claude-status";
/// Appended to the status socket path to get the default query socket path.
pub const QUERY_SOCKET_SUFFIX: &str = ".query";
pub const STATUS_SOCKET_ENV: &str = "WORKSPACE_STATUS_SOCKET";
pub const QUERY_SOCKET_ENV: &str = "WORKSPACE_STATUS_QUERY_SOCKET";

// ─────────────────────────────────────────────────────────────────────────────
// Status vocabulary
// ─────────────────────────────────────────────────────────────────────────────

/// Execution state of an assistant session within a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeState {
    NotRunning,
    Idle,
    Working,
    Waiting,
}

impl ClaudeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaudeState::NotRunning => "not_running",
            ClaudeState::Idle => "idle",
            ClaudeState::Working => "working",
            ClaudeState::Waiting => "waiting",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "not_running" => Some(ClaudeState::NotRunning),
            "idle" => Some(ClaudeState::Idle),
            "working" => Some(ClaudeState::Working),
            "waiting" => Some(ClaudeState::Waiting),
            _ => None,
        }
    }
}

impl fmt::Display for ClaudeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event verbs reported by hook scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventVerb {
    SessionStart,
    Working,
    PostTool,
    Stop,
    Notification,
    SessionEnd,
}

impl EventVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventVerb::SessionStart => "session_start",
            EventVerb::Working => "working",
            EventVerb::PostTool => "post_tool",
            EventVerb::Stop => "stop",
            EventVerb::Notification => "notification",
            EventVerb::SessionEnd => "session_end",
        }
    }

    /// Case-insensitive: `SESSION_START` and `session_start` are the same verb.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "session_start" => Some(EventVerb::SessionStart),
            "working" => Some(EventVerb::Working),
            "post_tool" => Some(EventVerb::PostTool),
            "stop" => Some(EventVerb::Stop),
            "notification" => Some(EventVerb::Notification),
            "session_end" => Some(EventVerb::SessionEnd),
            _ => None,
        }
    }
}

impl fmt::Display for EventVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subtypes carried as the first argument of `notification` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    PermissionPrompt,
    ElicitationDialog,
    IdlePrompt,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PermissionPrompt => "permission_prompt",
            NotificationKind::ElicitationDialog => "elicitation_dialog",
            NotificationKind::IdlePrompt => "idle_prompt",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "permission_prompt" => Some(NotificationKind::PermissionPrompt),
            "elicitation_dialog" => Some(NotificationKind::ElicitationDialog),
            "idle_prompt" => Some(NotificationKind::IdlePrompt),
            _ => None,
        }
    }
}

/// Egress snapshot of one workspace, used by both the pull query and the
/// change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub workspace: String,
    pub state: ClaudeState,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub wait_reason: String,
    #[serde(default)]
    pub wait_message: String,
    pub state_since_ms: i64,
}

impl WorkspaceStatus {
    /// Placeholder for a workspace the daemon has never seen.
    pub fn not_running(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            state: ClaudeState::NotRunning,
            tool_name: String::new(),
            wait_reason: String::new(),
            wait_message: String::new(),
            state_since_ms: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ingress line protocol
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed ingress line. The verb stays raw so the tracker can log
/// unknown verbs with their original spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub workspace: String,
    pub verb: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("expected at least 3 tab-separated fields, got {0}")]
    TooFewFields(usize),
    #[error("unexpected line marker '{0}'")]
    BadMarker(String),
    #[error("workspace name is empty")]
    EmptyWorkspace,
}

impl StatusLine {
    pub fn new(workspace: impl Into<String>, verb: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            workspace: workspace.into(),
            verb: verb.into(),
            args,
        }
    }

    /// Encodes the line including its trailing newline. Separators inside
    /// fields are replaced with spaces so one field never becomes two.
    pub fn to_wire(&self) -> String {
        let mut line = String::from(STATUS_MARKER);
        for field in [&self.workspace, &self.verb].into_iter().chain(self.args.iter()) {
            line.push(FIELD_SEPARATOR);
            line.push_str(&sanitize_field(field));
        }
        line.push('\n');
        line
    }
}

/// Parses a single ingress line (with or without its terminator).
///
/// Surrounding whitespace is trimmed first, so trailing empty arguments
/// disappear; the tracker treats missing arguments as empty anyway.
pub fn parse_status_line(line: &str) -> Result<StatusLine, LineError> {
    let parts: Vec<&str> = line.trim().split(FIELD_SEPARATOR).collect();
    if parts.len() < 3 {
        return Err(LineError::TooFewFields(parts.len()));
    }
    if parts[0] != STATUS_MARKER {
        return Err(LineError::BadMarker(parts[0].to_string()));
    }
    if parts[1].is_empty() {
        return Err(LineError::EmptyWorkspace);
    }

    Ok(StatusLine {
        workspace: parts[1].to_string(),
        verb: parts[2].to_string(),
        args: parts[3..].iter().map(|arg| arg.to_string()).collect(),
    })
}

fn sanitize_field(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Query protocol
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetAllStatuses,
    GetStatus,
    Subscribe,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetStatusParams {
    pub workspace: String,
}

pub fn parse_get_status(params: Value) -> Result<GetStatusParams, ErrorInfo> {
    let parsed: GetStatusParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("get_status params are invalid: {}", err),
        )
    })?;
    if parsed.workspace.is_empty() {
        return Err(ErrorInfo::new("missing_field", "workspace is required"));
    }
    Ok(parsed)
}
