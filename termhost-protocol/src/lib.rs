//! Wire types for the termhostd control/stream protocol.
//!
//! Frames are newline-delimited JSON (one value per line). Requests and
//! responses flow on the control socket; [`EventMessage`] flows on the
//! stream socket. See the daemon's `daemon::server` module for the
//! connection/dispatch side of this protocol.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// The protocol version this build of termhostd speaks. Bumped whenever the
/// wire shape changes in a way a client needs to know about.
pub const PROTOCOL_VERSION: u32 = 1;

/// The daemon version string reported in the `hello` reply. Kept distinct
/// from the crate version so the wire contract doesn't shift every release.
pub const DAEMON_VERSION: &str = "1.0.0";

/// The role a connection authenticates as. Every client opens one of each.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Carries request/response traffic.
    Control,
    /// Carries `data`/`exit`/`error` events.
    Stream,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Control => write!(f, "control"),
            Role::Stream => write!(f, "stream"),
        }
    }
}

/// The envelope every request arrives in. `payload` is left as a raw JSON
/// value because its shape depends on `kind`; handlers decode it into the
/// typed payload struct for that request type.
#[derive(Deserialize, Debug)]
pub struct IpcRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
}

fn default_payload() -> serde_json::Value {
    serde_json::Value::Null
}

/// The stable set of error codes surfaced at the wire boundary. Internal
/// errors carry a free-text `message`, but `code` is always one of these so
/// clients can match on it without parsing prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ProtocolMismatch,
    AuthFailed,
    InvalidHello,
    NotAuthenticated,
    InvalidRole,
    UnknownRequest,
    StreamNotConnected,
    CreateAttachFailed,
    WriteFailed,
    SessionNotFound,
    SessionNotAttachable,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ProtocolMismatch => "PROTOCOL_MISMATCH",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidHello => "INVALID_HELLO",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::InvalidRole => "INVALID_ROLE",
            ErrorCode::UnknownRequest => "UNKNOWN_REQUEST",
            ErrorCode::StreamNotConnected => "STREAM_NOT_CONNECTED",
            ErrorCode::CreateAttachFailed => "CREATE_ATTACH_FAILED",
            ErrorCode::WriteFailed => "WRITE_FAILED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionNotAttachable => "SESSION_NOT_ATTACHABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{s}")
    }
}

impl serde::Serialize for ErrorCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// Hand-rolled rather than derived so the wire strings (`PROTOCOL_MISMATCH`)
// stay exactly the §6 error codes instead of whatever `rename_all` would
// produce for a `ProtocolMismatch` variant.
impl<'de> serde::Deserialize<'de> for ErrorCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "PROTOCOL_MISMATCH" => ErrorCode::ProtocolMismatch,
            "AUTH_FAILED" => ErrorCode::AuthFailed,
            "INVALID_HELLO" => ErrorCode::InvalidHello,
            "NOT_AUTHENTICATED" => ErrorCode::NotAuthenticated,
            "INVALID_ROLE" => ErrorCode::InvalidRole,
            "UNKNOWN_REQUEST" => ErrorCode::UnknownRequest,
            "STREAM_NOT_CONNECTED" => ErrorCode::StreamNotConnected,
            "CREATE_ATTACH_FAILED" => ErrorCode::CreateAttachFailed,
            "WRITE_FAILED" => ErrorCode::WriteFailed,
            "SESSION_NOT_FOUND" => ErrorCode::SessionNotFound,
            "SESSION_NOT_ATTACHABLE" => ErrorCode::SessionNotAttachable,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            other => return Err(serde::de::Error::custom(format!("unknown error code {other}"))),
        })
    }
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// The `hello` handshake payload.
#[derive(Deserialize, Debug, Default)]
pub struct HelloPayload {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(default)]
    pub token: String,
    #[serde(default, rename = "clientId")]
    pub client_id: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Serialize, Debug)]
pub struct HelloResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "daemonVersion")]
    pub daemon_version: String,
    #[serde(rename = "daemonPid")]
    pub daemon_pid: i32,
}

#[derive(Deserialize, Debug)]
pub struct CreateOrAttachPayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(default, rename = "workspaceId")]
    pub workspace_id: Option<String>,
    #[serde(default, rename = "paneId")]
    pub pane_id: Option<String>,
    #[serde(default, rename = "tabId")]
    pub tab_id: Option<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, rename = "initialCommands")]
    pub initial_commands: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct Snapshot {
    pub cols: u16,
    pub rows: u16,
    /// Scrollback lines above the current screen, oldest first.
    pub scrollback: Vec<String>,
    /// The current on-screen grid, one string per row.
    pub screen: Vec<String>,
    #[serde(rename = "cursorRow")]
    pub cursor_row: u16,
    #[serde(rename = "cursorCol")]
    pub cursor_col: u16,
    #[serde(rename = "cursorVisible")]
    pub cursor_visible: bool,
    #[serde(rename = "alternateScreen")]
    pub alternate_screen: bool,
}

#[derive(Serialize, Debug)]
pub struct CreateOrAttachResult {
    #[serde(rename = "isNew")]
    pub is_new: bool,
    #[serde(rename = "wasRecovered")]
    pub was_recovered: bool,
    pub pid: i32,
    pub snapshot: Snapshot,
}

#[derive(Deserialize, Debug)]
pub struct SessionIdPayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Deserialize, Debug)]
pub struct WritePayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub data: String,
}

#[derive(Deserialize, Debug)]
pub struct ResizePayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Interrupt,
    Hangup,
    Quit,
    Terminate,
}

#[derive(Deserialize, Debug)]
pub struct SignalPayload {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub signal: Signal,
}

#[derive(Deserialize, Debug, Default)]
pub struct KillAllPayload {
    #[serde(default, rename = "deleteHistory")]
    pub delete_history: bool,
}

#[derive(Serialize, Debug)]
pub struct SessionDescriptor {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "workspaceId")]
    pub workspace_id: Option<String>,
    #[serde(rename = "paneId")]
    pub pane_id: Option<String>,
    #[serde(rename = "isAlive")]
    pub is_alive: bool,
    #[serde(rename = "attachedClients")]
    pub attached_clients: usize,
    pub pid: i32,
    #[serde(rename = "createdAt")]
    pub created_at_unix_ms: i64,
    #[serde(rename = "lastAttachedAt")]
    pub last_attached_at_unix_ms: i64,
    pub shell: String,
}

#[derive(Serialize, Debug)]
pub struct ListSessionsResult {
    pub sessions: Vec<SessionDescriptor>,
}

/// Events delivered on the stream socket only.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Data,
    Exit,
    Error,
}

#[derive(Serialize, Debug)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub event: EventKind,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub payload: serde_json::Value,
}

impl EventMessage {
    pub fn new(event: EventKind, session_id: impl Into<String>, payload: serde_json::Value) -> Self {
        EventMessage { kind: "event", event, session_id: session_id.into(), payload }
    }
}

#[derive(Serialize, Debug)]
pub struct ExitPayload {
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}
