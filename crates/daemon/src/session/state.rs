//! Session state and the errors the session layer reports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{AgentKind, ServerMessage, SessionJoined, SessionSummary};
use thiserror::Error;

use super::bridge::{BridgeError, SessionId};
use super::buffer::OutputBuffer;
use super::multiplexer::{ConnectionHandle, ConnectionId};
use crate::persistence::SessionRecord;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Request input was rejected (bad working directory, bad name).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// An agent is already running or starting in the session.
    #[error("an agent is already running in session {0}")]
    AlreadyActive(SessionId),

    /// No agent is running in the session.
    #[error("no agent is running in session {0}")]
    NotActive(SessionId),

    /// The agent could not be started.
    #[error("failed to start agent: {0}")]
    Spawn(String),

    /// The session limit was reached.
    #[error("session limit reached ({0})")]
    TooManySessions(usize),

    /// The process bridge reported an error.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Where a session's bridge is in its lifecycle.
///
/// Every non-idle state carries the id of the run it belongs to, so events
/// from a superseded run can be recognized and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting { run_id: u64 },
    Active { run_id: u64, kind: AgentKind },
    Stopping { run_id: u64 },
}

impl BridgeState {
    /// Run id of the current run, if any.
    pub fn run_id(&self) -> Option<u64> {
        match self {
            BridgeState::Idle => None,
            BridgeState::Starting { run_id }
            | BridgeState::Active { run_id, .. }
            | BridgeState::Stopping { run_id } => Some(*run_id),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            BridgeState::Idle => "idle",
            BridgeState::Starting { .. } => "starting",
            BridgeState::Active { .. } => "active",
            BridgeState::Stopping { .. } => "stopping",
        }
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A long-lived session: metadata, bridge state, output history and the
/// connections currently bound to it.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub working_dir: PathBuf,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: u64,
    /// Last input, output or bridge change (Unix epoch milliseconds).
    pub last_activity: u64,
    /// First successful agent start. Never reset.
    pub session_start_time: Option<u64>,
    /// Agent of the current run; `None` when idle.
    pub agent_kind: Option<AgentKind>,
    pub bridge: BridgeState,
    pub output: OutputBuffer,
    pub connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Set once deletion has begun; a deleted session accepts nothing.
    pub deleted: bool,
}

impl Session {
    /// Creates an idle session.
    pub fn new(id: SessionId, name: String, working_dir: PathBuf, max_buffer_size: usize) -> Self {
        let now = now_millis();
        Self {
            id,
            name,
            working_dir,
            created_at: now,
            last_activity: now,
            session_start_time: None,
            agent_kind: None,
            bridge: BridgeState::Idle,
            output: OutputBuffer::new(max_buffer_size),
            connections: HashMap::new(),
            deleted: false,
        }
    }

    /// Rebuilds an idle session from its durable record.
    pub fn from_record(record: SessionRecord, max_buffer_size: usize) -> Self {
        Self {
            id: record.id,
            name: record.name,
            working_dir: record.working_dir,
            created_at: record.created_at,
            last_activity: record.last_activity,
            session_start_time: None,
            agent_kind: None,
            bridge: BridgeState::Idle,
            output: OutputBuffer::new(max_buffer_size),
            connections: HashMap::new(),
            deleted: false,
        }
    }

    /// Whether an agent is running and accepting input.
    pub fn is_active(&self) -> bool {
        matches!(self.bridge, BridgeState::Active { .. })
    }

    /// Bumps the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = now_millis();
    }

    /// Working directory as wire text.
    pub fn working_dir_display(&self) -> String {
        self.working_dir.to_string_lossy().into_owned()
    }

    /// Read-only view of the session.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            working_dir: self.working_dir_display(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            session_start_time: self.session_start_time,
            active: self.is_active(),
            agent_kind: self.agent_kind,
            connections: self.connections.len(),
            buffered_chunks: self.output.len(),
        }
    }

    /// Durable subset of the session.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    /// `session_joined` reply carrying the last `replay_limit` chunks.
    pub fn joined_message(&self, replay_limit: usize) -> ServerMessage {
        ServerMessage::SessionJoined(SessionJoined {
            session_id: self.id.clone(),
            name: self.name.clone(),
            working_dir: self.working_dir_display(),
            agent_kind: self.agent_kind,
            active: self.is_active(),
            output_buffer: self.output.tail(replay_limit),
        })
    }

    /// Enqueues a message on every bound connection.
    ///
    /// Connections whose transport is closed, or which fell too far behind,
    /// are unbound. Returns how many connections accepted the message.
    pub fn broadcast(&mut self, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (connection_id, handle) in &self.connections {
            match handle.try_deliver(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(
                        session_id = %self.id,
                        connection_id = %connection_id,
                        error = %e,
                        "Unbinding connection after failed delivery"
                    );
                    dropped.push(connection_id.clone());
                }
            }
        }

        for connection_id in dropped {
            self.connections.remove(&connection_id);
        }

        delivered
    }
}
