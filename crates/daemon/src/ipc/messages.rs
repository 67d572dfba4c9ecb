//! Control-plane requests and replies.
//!
//! One JSON object per line, tagged by `op` on the way in and by `reply` on
//! the way out. Session listings reuse [`SessionSummary`], so `sessions list
//! --json` prints the same shape the browser sees in `session_list`.

use protocol::SessionSummary;
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// A command from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcRequest {
    Ping,
    Status,
    /// Ask the daemon to shut down gracefully.
    Stop,
    ListSessions,
    /// Stop the session's agent, notify its viewers and forget it.
    DeleteSession { session_id: SessionId },
}

/// The daemon's answer to one [`IpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,
    Status(DaemonStatus),
    Stopping,
    Sessions {
        sessions: Vec<SessionSummary>,
    },
    SessionDeleted {
        session_id: SessionId,
        /// Connections that were bound to the session and have been closed.
        disconnected: usize,
    },
    Error {
        message: String,
    },
}

impl IpcResponse {
    /// Shorthand for an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        IpcResponse::Error {
            message: message.into(),
        }
    }
}

/// Snapshot of a running broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatus {
    pub uptime_secs: u64,
    /// WebSocket listen address.
    pub bind_addr: String,
    pub sessions: usize,
    /// Sessions with a running agent.
    pub active_agents: usize,
    /// Open WebSocket connections.
    pub connections: usize,
}
