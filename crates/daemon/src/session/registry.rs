//! Session registry.
//!
//! The registry owns every session, drives each session's bridge state
//! machine and fans agent output out to bound connections.
//!
//! ```text
//!          start_bridge           spawn ok
//!   Idle ───────────────▶ Starting ────────▶ Active
//!    ▲                       │                 │ stop_bridge
//!    │ exit                  │ stop_bridge     ▼
//!    └──────────────────── Stopping ◀──────────┘
//! ```
//!
//! Each session sits behind its own `tokio::sync::Mutex`; the map itself is a
//! `DashMap`, so registry-wide locking is limited to inserts and removals.
//! Every fan-out happens under the session lock by non-blocking enqueue, which
//! makes a join's replay and the live stream one gap-free sequence.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use protocol::{AgentKind, Exit, ServerMessage, SessionSummary, StartOptions};
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use super::bridge::{BridgeConfig, BridgeEvent, CommandSpec, ProcessBridge, SessionId};
use super::multiplexer::{ConnectionHandle, ConnectionId};
use super::state::{now_millis, BridgeState, Session, SessionError};
use crate::config::{AgentsConfig, Config};
use crate::paths::PathValidator;
use crate::persistence::SessionRecord;

/// Registry tunables, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub max_buffer_size: usize,
    pub replay_limit: usize,
    pub start_timeout: Duration,
    pub default_working_dir: PathBuf,
    pub default_cols: u16,
    pub default_rows: u16,
    pub agents: AgentsConfig,
}

impl RegistrySettings {
    /// Extracts the registry settings from a configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_sessions: config.session.max_sessions,
            max_buffer_size: config.session.max_buffer_size,
            replay_limit: config.session.replay_limit,
            start_timeout: Duration::from_secs(config.session.start_timeout_secs),
            default_working_dir: config.session.default_working_dir.clone(),
            default_cols: config.session.default_cols,
            default_rows: config.session.default_rows,
            agents: config.agents.clone(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Owner of all sessions.
pub struct SessionRegistry<B: ProcessBridge> {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    bridge: Arc<B>,
    paths: Arc<dyn PathValidator>,
    settings: RegistrySettings,
    /// Signalled whenever durable session data changes.
    dirty: Arc<Notify>,
    next_run_id: AtomicU64,
}

impl<B: ProcessBridge> SessionRegistry<B> {
    /// Creates an empty registry.
    pub fn new(bridge: Arc<B>, paths: Arc<dyn PathValidator>, settings: RegistrySettings) -> Self {
        Self {
            sessions: DashMap::new(),
            bridge,
            paths,
            settings,
            dirty: Arc::new(Notify::new()),
            next_run_id: AtomicU64::new(0),
        }
    }

    /// The process bridge sessions run on.
    pub fn bridge(&self) -> &Arc<B> {
        &self.bridge
    }

    /// Registry settings.
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Notified whenever a session is created, deleted or changes bridge
    /// state.
    pub fn dirty_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.dirty)
    }

    fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    fn session(&self, session_id: &SessionId) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    /// Whether a session with this id exists.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Creates an idle session.
    ///
    /// The working directory (or the configured default) must pass the path
    /// validator; the name defaults to `Session <n>`.
    pub async fn create(
        &self,
        name: Option<String>,
        working_dir: Option<String>,
    ) -> Result<SessionSummary, SessionError> {
        if self.sessions.len() >= self.settings.max_sessions {
            return Err(SessionError::TooManySessions(self.settings.max_sessions));
        }

        let requested = working_dir
            .filter(|dir| !dir.trim().is_empty())
            .unwrap_or_else(|| {
                self.settings
                    .default_working_dir
                    .to_string_lossy()
                    .into_owned()
            });
        let resolved = self
            .paths
            .validate(&requested)
            .map_err(|e| SessionError::Validation(e.to_string()))?;

        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Session {}", self.sessions.len() + 1));

        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), name, resolved, self.settings.max_buffer_size);
        let summary = session.summary();
        self.sessions
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        self.mark_dirty();

        tracing::info!(
            session_id = %id,
            name = %summary.name,
            working_dir = %summary.working_dir,
            "Created session"
        );
        Ok(summary)
    }

    /// Read-only view of one session.
    pub async fn get(&self, session_id: &SessionId) -> Option<SessionSummary> {
        let session = self.session(session_id).ok()?;
        let session = session.lock().await;
        Some(session.summary())
    }

    /// Read-only view of every session, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::with_capacity(self.sessions.len());
        for session in self.snapshot_handles() {
            let session = session.lock().await;
            if !session.deleted {
                summaries.push(session.summary());
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Number of sessions with a running agent.
    pub async fn active_count(&self) -> usize {
        let mut active = 0;
        for session in self.snapshot_handles() {
            if session.lock().await.is_active() {
                active += 1;
            }
        }
        active
    }

    /// Buffered output of a session, oldest first.
    pub async fn output_snapshot(&self, session_id: &SessionId) -> Result<Vec<String>, SessionError> {
        let session = self.session(session_id)?;
        let session = session.lock().await;
        Ok(session.output.to_vec())
    }

    fn snapshot_handles(&self) -> Vec<Arc<Mutex<Session>>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Deletes a session.
    ///
    /// Stops its agent, tells every bound connection and closes it, then
    /// forgets the session. Returns the ids of the disconnected connections.
    pub async fn delete(&self, session_id: &SessionId) -> Result<Vec<ConnectionId>, SessionError> {
        let session = self.session(session_id)?;
        let mut session = session.lock().await;
        if session.deleted {
            return Err(SessionError::NotFound(session_id.clone()));
        }

        session.deleted = true;
        let previous = std::mem::replace(&mut session.bridge, BridgeState::Idle);
        session.agent_kind = None;

        if previous != BridgeState::Idle || self.bridge.is_running(session_id) {
            if let Err(e) = self.bridge.stop(session_id) {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to stop agent during delete");
            }
        }

        let notice = ServerMessage::session_deleted(format!("Session \"{}\" was deleted", session.name));
        let disconnected: Vec<ConnectionId> = session
            .connections
            .drain()
            .map(|(connection_id, handle)| {
                let _ = handle.try_deliver(notice.clone());
                handle.close();
                connection_id
            })
            .collect();
        drop(session);

        self.sessions.remove(session_id);
        self.mark_dirty();

        tracing::info!(
            session_id = %session_id,
            disconnected = disconnected.len(),
            "Deleted session"
        );
        Ok(disconnected)
    }

    /// Starts an agent in an idle session.
    ///
    /// Suspends only the caller while the process spawns. Concurrent starts
    /// on the same session see `AlreadyActive`.
    pub async fn start_bridge(
        &self,
        session_id: &SessionId,
        kind: AgentKind,
        options: StartOptions,
    ) -> Result<(), SessionError> {
        let handle = self.session(session_id)?;
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;

        let config = {
            let mut session = handle.lock().await;
            if session.deleted {
                return Err(SessionError::NotFound(session_id.clone()));
            }
            if session.bridge != BridgeState::Idle {
                return Err(SessionError::AlreadyActive(session_id.clone()));
            }
            session.bridge = BridgeState::Starting { run_id };
            session.touch();

            BridgeConfig {
                kind,
                command: CommandSpec::for_agent(kind, &self.settings.agents, &options.args),
                working_dir: session.working_dir.clone(),
                cols: options
                    .cols
                    .filter(|c| *c > 0)
                    .unwrap_or(self.settings.default_cols),
                rows: options
                    .rows
                    .filter(|r| *r > 0)
                    .unwrap_or(self.settings.default_rows),
            }
        };

        tracing::info!(session_id = %session_id, kind = %kind, run_id = run_id, "Starting agent");

        let bridge = Arc::clone(&self.bridge);
        let id = session_id.clone();
        let mut spawn = tokio::task::spawn_blocking(move || bridge.start(&id, config));

        let outcome = tokio::time::timeout(self.settings.start_timeout, &mut spawn).await;
        let result = match outcome {
            Ok(Ok(result)) => result.map_err(|e| SessionError::Spawn(e.to_string())),
            Ok(Err(e)) => Err(SessionError::Spawn(format!("spawn task failed: {}", e))),
            Err(_) => {
                // The spawn may still finish; make sure its process does not linger.
                let bridge = Arc::clone(&self.bridge);
                let id = session_id.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(run)) = spawn.await {
                        drop(run);
                        if let Err(e) = bridge.stop(&id) {
                            tracing::warn!(session_id = %id, error = %e, "Failed to stop late agent");
                        }
                    }
                });
                Err(SessionError::Spawn(format!(
                    "agent did not start within {}s",
                    self.settings.start_timeout.as_secs()
                )))
            }
        };

        let mut session = handle.lock().await;
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                if session.bridge.run_id() == Some(run_id) {
                    session.bridge = BridgeState::Idle;
                    session.agent_kind = None;
                }
                tracing::warn!(session_id = %session_id, kind = %kind, error = %e, "Agent failed to start");
                return Err(e);
            }
        };

        let state = session.bridge;
        match state {
            BridgeState::Starting { run_id: current } if current == run_id && !session.deleted => {
                session.bridge = BridgeState::Active { run_id, kind };
                session.agent_kind = Some(kind);
                session.session_start_time.get_or_insert_with(now_millis);
                session.touch();
                session.broadcast(&ServerMessage::agent_started(kind, session_id.clone()));
                drop(session);

                tokio::spawn(pump_events(
                    Arc::clone(&handle),
                    session_id.clone(),
                    run_id,
                    run.events,
                    Arc::clone(&self.dirty),
                ));
                self.mark_dirty();

                tracing::info!(session_id = %session_id, kind = %kind, pid = ?run.pid, "Agent started");
                Ok(())
            }
            BridgeState::Stopping { run_id: current } if current == run_id => {
                // Stopped while starting; the pump returns the session to Idle on exit.
                drop(session);
                tokio::spawn(pump_events(
                    Arc::clone(&handle),
                    session_id.clone(),
                    run_id,
                    run.events,
                    Arc::clone(&self.dirty),
                ));
                if let Err(e) = self.bridge.stop(session_id) {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to stop cancelled agent");
                }
                Err(SessionError::Spawn("start cancelled".to_string()))
            }
            _ => {
                drop(session);
                drop(run);
                if let Err(e) = self.bridge.stop(session_id) {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to stop superseded agent");
                }
                Err(SessionError::Spawn("start cancelled".to_string()))
            }
        }
    }

    /// Stops the session's agent.
    ///
    /// Returns `false` when no agent was running or starting.
    pub async fn stop_bridge(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        if session.deleted {
            return Err(SessionError::NotFound(session_id.clone()));
        }

        let state = session.bridge;
        match state {
            BridgeState::Idle => Ok(false),
            BridgeState::Stopping { .. } => Ok(true),
            BridgeState::Starting { run_id } => {
                session.bridge = BridgeState::Stopping { run_id };
                tracing::info!(session_id = %session_id, "Agent stop requested while starting");
                Ok(true)
            }
            BridgeState::Active { run_id, .. } => {
                if let Err(e) = self.bridge.stop(session_id) {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to stop agent");
                    return Err(e.into());
                }
                session.bridge = BridgeState::Stopping { run_id };
                session.touch();
                tracing::info!(session_id = %session_id, run_id = run_id, "Stopping agent");
                Ok(true)
            }
        }
    }

    /// Writes input to the session's agent.
    pub async fn send_input(&self, session_id: &SessionId, data: &str) -> Result<(), SessionError> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        if session.deleted {
            return Err(SessionError::NotFound(session_id.clone()));
        }
        if !session.is_active() {
            return Err(SessionError::NotActive(session_id.clone()));
        }
        self.bridge.send_input(session_id, data)?;
        session.touch();
        Ok(())
    }

    /// Resizes the session's terminal.
    pub async fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::Validation(format!(
                "terminal size must be non-zero, got {}x{}",
                cols, rows
            )));
        }
        let handle = self.session(session_id)?;
        let session = handle.lock().await;
        if session.deleted {
            return Err(SessionError::NotFound(session_id.clone()));
        }
        if !session.is_active() {
            return Err(SessionError::NotActive(session_id.clone()));
        }
        self.bridge.resize(session_id, cols, rows)?;
        Ok(())
    }

    /// Binds a connection to a session and enqueues its `session_joined`
    /// replay in the same critical section as the binding.
    pub async fn attach(&self, session_id: &SessionId, connection: ConnectionHandle) -> Result<(), SessionError> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        if session.deleted {
            return Err(SessionError::NotFound(session_id.clone()));
        }

        let connection_id = connection.id().clone();
        match connection.try_deliver(session.joined_message(self.settings.replay_limit)) {
            Ok(()) => {
                session.connections.insert(connection_id.clone(), connection);
                tracing::debug!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    connections = session.connections.len(),
                    "Attached connection"
                );
            }
            Err(e) => {
                tracing::debug!(
                    session_id = %session_id,
                    connection_id = %connection_id,
                    error = %e,
                    "Connection went away before attach"
                );
            }
        }
        Ok(())
    }

    /// Unbinds a connection. Returns whether it was bound.
    pub async fn detach(&self, session_id: &SessionId, connection_id: &ConnectionId) -> bool {
        let Ok(handle) = self.session(session_id) else {
            return false;
        };
        let removed = handle.lock().await.connections.remove(connection_id).is_some();
        if removed {
            tracing::debug!(session_id = %session_id, connection_id = %connection_id, "Detached connection");
        }
        removed
    }

    /// Whether the connection is still in the session's viewer set.
    pub async fn is_attached(&self, session_id: &SessionId, connection_id: &ConnectionId) -> bool {
        let Ok(handle) = self.session(session_id) else {
            return false;
        };
        let session = handle.lock().await;
        !session.deleted && session.connections.contains_key(connection_id)
    }

    /// Sends a message to every connection bound to a session.
    pub async fn broadcast(&self, session_id: &SessionId, message: &ServerMessage) -> Result<usize, SessionError> {
        let handle = self.session(session_id)?;
        let mut session = handle.lock().await;
        Ok(session.broadcast(message))
    }

    /// Inserts persisted sessions as idle sessions. Existing ids are kept.
    ///
    /// Returns how many sessions were restored.
    pub fn restore(&self, records: Vec<SessionRecord>) -> usize {
        let mut restored = 0;
        for record in records {
            if self.sessions.contains_key(&record.id) {
                tracing::warn!(session_id = %record.id, "Skipping duplicate session record");
                continue;
            }
            let id = record.id.clone();
            let session = Session::from_record(record, self.settings.max_buffer_size);
            self.sessions.insert(id, Arc::new(Mutex::new(session)));
            restored += 1;
        }
        restored
    }

    /// Durable subset of every session, oldest first.
    pub async fn records(&self) -> Vec<SessionRecord> {
        let mut records = Vec::with_capacity(self.sessions.len());
        for session in self.snapshot_handles() {
            let session = session.lock().await;
            if !session.deleted {
                records.push(session.record());
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    #[cfg(test)]
    async fn state_of(&self, session_id: &SessionId) -> Option<BridgeState> {
        let handle = self.session(session_id).ok()?;
        let state = handle.lock().await.bridge;
        Some(state)
    }

    /// Stops every running agent. Returns how many were asked to stop.
    pub async fn shutdown(&self) -> usize {
        let mut stopped = 0;
        for handle in self.snapshot_handles() {
            let mut session = handle.lock().await;
            let Some(run_id) = session.bridge.run_id() else {
                continue;
            };
            session.bridge = BridgeState::Stopping { run_id };
            match self.bridge.stop(&session.id) {
                Ok(_) => stopped += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Failed to stop agent at shutdown")
                }
            }
        }
        if stopped > 0 {
            tracing::info!(count = stopped, "Stopped running agents");
        }
        stopped
    }
}

/// Consumes one run's events in order and applies them to the session.
async fn pump_events(
    handle: Arc<Mutex<Session>>,
    session_id: SessionId,
    run_id: u64,
    mut events: mpsc::Receiver<BridgeEvent>,
    dirty: Arc<Notify>,
) {
    while let Some(event) = events.recv().await {
        let mut session = handle.lock().await;
        let state = session.bridge;
        match event {
            BridgeEvent::Output(data) => match state {
                BridgeState::Active { run_id: current, .. } if current == run_id => {
                    session.output.push(data.clone());
                    session.touch();
                    session.broadcast(&ServerMessage::output(data));
                }
                _ => {
                    tracing::debug!(
                        session_id = %session_id,
                        run_id = run_id,
                        state = state.name(),
                        bytes = data.len(),
                        "Dropping output outside active run"
                    );
                }
            },
            BridgeEvent::Error(message) => {
                tracing::warn!(session_id = %session_id, run_id = run_id, error = %message, "Agent bridge error");
                if session.bridge.run_id() == Some(run_id) {
                    session.broadcast(&ServerMessage::error(message));
                }
            }
            BridgeEvent::Exit { code, signal } => {
                if session.bridge.run_id() == Some(run_id) {
                    session.bridge = BridgeState::Idle;
                    session.agent_kind = None;
                    session.touch();
                    session.broadcast(&ServerMessage::Exit(Exit {
                        code,
                        signal: signal.clone(),
                    }));
                    dirty.notify_one();
                }
                tracing::info!(
                    session_id = %session_id,
                    run_id = run_id,
                    code = ?code,
                    signal = ?signal,
                    "Agent exited"
                );
                return;
            }
        }
    }

    // The stream ended without an exit event.
    let mut session = handle.lock().await;
    if session.bridge.run_id() == Some(run_id) {
        session.bridge = BridgeState::Idle;
        session.agent_kind = None;
        session.broadcast(&ServerMessage::Exit(Exit {
            code: None,
            signal: None,
        }));
        dirty.notify_one();
    }
}
