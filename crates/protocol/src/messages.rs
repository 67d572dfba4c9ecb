//! Protocol message definitions for agentdeck.
//!
//! This module defines every message exchanged between the broker and browser
//! clients. Messages travel as JSON text frames over a WebSocket; each frame is
//! an object whose `type` field names the message kind (snake_case) and whose
//! remaining fields are camelCase.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Maximum number of buffered chunks replayed to a joining connection.
pub const DEFAULT_REPLAY_LIMIT: usize = 200;

/// The interactive agent program a session's bridge drives.
///
/// A session with no running agent carries `None` instead of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Anthropic's Claude CLI.
    Claude,
    /// OpenAI's Codex CLI.
    Codex,
    /// Google's Gemini CLI.
    Gemini,
}

impl AgentKind {
    /// Returns the lowercase wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Client -> broker
// ============================================================================

/// Messages sent by a browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a new session.
    CreateSession(CreateSession),
    /// Bind this connection to a session and receive its replay.
    JoinSession(JoinSession),
    /// Unbind from the current session.
    LeaveSession,
    /// Start an agent in the bound session.
    StartBridge(StartBridge),
    /// Keystrokes for the bound session's agent.
    Input(Input),
    /// Terminal size change for the bound session's agent.
    Resize(Resize),
    /// Stop the bound session's agent.
    Stop,
    /// Keepalive.
    Ping,
    /// List every session known to the broker.
    ListSessions,
    /// Delete a session, disconnecting everyone bound to it.
    DeleteSession(DeleteSession),
}

/// Request to create a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    /// Display name. The broker picks one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Working directory for agents started in this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Request to join a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    /// Session to join.
    pub session_id: String,
}

/// Request to start an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBridge {
    /// Which agent to launch.
    pub kind: AgentKind,
    /// Launch options.
    #[serde(default)]
    pub options: StartOptions,
}

/// Options applied when launching an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Initial terminal columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Initial terminal rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    /// Extra arguments appended to the configured agent command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Terminal input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Raw text typed by the user.
    pub data: String,
}

/// Terminal resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    /// New column count.
    pub cols: u16,
    /// New row count.
    pub rows: u16,
}

/// Request to delete a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSession {
    /// Session to delete.
    pub session_id: String,
}

// ============================================================================
// Broker -> client
// ============================================================================

/// Messages sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    Connected(Connected),
    /// A session was created.
    SessionCreated(SessionCreated),
    /// This connection is now bound to a session; carries the replay.
    SessionJoined(SessionJoined),
    /// This connection is no longer bound.
    SessionLeft,
    /// Agent output.
    Output(Output),
    /// A Claude agent started.
    ClaudeStarted(AgentStarted),
    /// A Codex agent started.
    CodexStarted(AgentStarted),
    /// A Gemini agent started.
    GeminiStarted(AgentStarted),
    /// The agent process ended.
    Exit(Exit),
    /// A request failed.
    Error(Notice),
    /// Advisory notice that does not indicate failure.
    Info(Notice),
    /// Keepalive reply.
    Pong,
    /// The bound session was deleted; the connection is about to close.
    SessionDeleted(Notice),
    /// Every session known to the broker.
    SessionList(SessionList),
}

/// Connection greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    /// Identifier assigned to this connection.
    pub connection_id: String,
}

/// Session creation confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    /// New session identifier.
    pub session_id: String,
    /// Display name.
    pub name: String,
    /// Resolved working directory.
    pub working_dir: String,
}

/// Join confirmation with replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJoined {
    /// Joined session.
    pub session_id: String,
    /// Display name.
    pub name: String,
    /// Working directory.
    pub working_dir: String,
    /// Agent currently running, if any.
    pub agent_kind: Option<AgentKind>,
    /// Whether an agent is running.
    pub active: bool,
    /// Most recent buffered output, oldest first.
    pub output_buffer: Vec<String>,
}

/// A chunk of agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Terminal text, including escape sequences.
    pub data: String,
}

/// Agent start confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStarted {
    /// Session the agent runs in.
    pub session_id: String,
}

/// Agent exit notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    /// Exit code, when the process exited on its own.
    pub code: Option<i32>,
    /// Signal name, when the process was terminated by one.
    pub signal: Option<String>,
}

/// Free-form text carried by `error`, `info` and `session_deleted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Human-readable text.
    pub message: String,
}

/// Session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    /// One entry per session.
    pub sessions: Vec<SessionSummary>,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Working directory.
    pub working_dir: String,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: u64,
    /// Last input, output or bridge change (Unix epoch milliseconds).
    pub last_activity: u64,
    /// First successful agent start (Unix epoch milliseconds).
    pub session_start_time: Option<u64>,
    /// Whether an agent is running.
    pub active: bool,
    /// Agent currently running, if any.
    pub agent_kind: Option<AgentKind>,
    /// Number of bound connections.
    pub connections: usize,
    /// Number of buffered output chunks.
    pub buffered_chunks: usize,
}

impl ServerMessage {
    /// Builds the `<kind>_started` message for an agent kind.
    pub fn agent_started(kind: AgentKind, session_id: impl Into<String>) -> Self {
        let started = AgentStarted {
            session_id: session_id.into(),
        };
        match kind {
            AgentKind::Claude => ServerMessage::ClaudeStarted(started),
            AgentKind::Codex => ServerMessage::CodexStarted(started),
            AgentKind::Gemini => ServerMessage::GeminiStarted(started),
        }
    }

    /// Builds an `output` message.
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output(Output { data: data.into() })
    }

    /// Builds an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(Notice {
            message: message.into(),
        })
    }

    /// Builds an `info` message.
    pub fn info(message: impl Into<String>) -> Self {
        ServerMessage::Info(Notice {
            message: message.into(),
        })
    }

    /// Builds a `session_deleted` message.
    pub fn session_deleted(message: impl Into<String>) -> Self {
        ServerMessage::SessionDeleted(Notice {
            message: message.into(),
        })
    }

    /// Returns the wire `type` of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected(_) => "connected",
            ServerMessage::SessionCreated(_) => "session_created",
            ServerMessage::SessionJoined(_) => "session_joined",
            ServerMessage::SessionLeft => "session_left",
            ServerMessage::Output(_) => "output",
            ServerMessage::ClaudeStarted(_) => "claude_started",
            ServerMessage::CodexStarted(_) => "codex_started",
            ServerMessage::GeminiStarted(_) => "gemini_started",
            ServerMessage::Exit(_) => "exit",
            ServerMessage::Error(_) => "error",
            ServerMessage::Info(_) => "info",
            ServerMessage::Pong => "pong",
            ServerMessage::SessionDeleted(_) => "session_deleted",
            ServerMessage::SessionList(_) => "session_list",
        }
    }
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl ClientMessage {
    /// Returns the wire `type` of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateSession(_) => "create_session",
            ClientMessage::JoinSession(_) => "join_session",
            ClientMessage::LeaveSession => "leave_session",
            ClientMessage::StartBridge(_) => "start_bridge",
            ClientMessage::Input(_) => "input",
            ClientMessage::Resize(_) => "resize",
            ClientMessage::Stop => "stop",
            ClientMessage::Ping => "ping",
            ClientMessage::ListSessions => "list_sessions",
            ClientMessage::DeleteSession(_) => "delete_session",
        }
    }

    /// Decodes a client message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(ProtocolError::decode)
    }

    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

impl ServerMessage {
    /// Decodes a broker message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(ProtocolError::decode)
    }

    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}
