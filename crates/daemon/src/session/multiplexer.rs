//! Connection multiplexer.
//!
//! Each browser connection gets a [`ConnectionHandle`]: a bounded outbound
//! queue drained by the socket writer task, plus a shutdown token. The
//! [`ConnectionMultiplexer`] tracks which session every connection is bound
//! to and routes joins, leaves, input and fan-out through the session
//! registry.
//!
//! Enqueueing never blocks. A connection whose queue is full is marked lagged
//! and closed, so the client reconnects and receives a clean replay instead of
//! silently missing output.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::{AgentKind, Connected, ServerMessage, SessionSummary, StartOptions};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::bridge::{ProcessBridge, SessionId};
use super::registry::SessionRegistry;
use super::state::{now_millis, SessionError};

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Delivery failures on a single connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is closed or closing.
    #[error("connection closed")]
    Closed,

    /// The connection fell behind and was closed.
    #[error("connection lagged and was closed")]
    Lagged,
}

/// Errors reported by multiplexer operations.
#[derive(Debug, Error)]
pub enum MultiplexError {
    /// The connection is not registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection has not joined a session.
    #[error("not joined to a session")]
    NotJoined,

    /// The session layer rejected the request.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Statistics about a connection's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Total messages enqueued successfully.
    pub messages_sent: u64,
    /// Messages refused because the queue was full.
    pub messages_dropped: u64,
    /// Whether the connection was closed for falling behind.
    pub lagged: bool,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    lagged: AtomicBool,
}

/// Sending side of a connection. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

/// Receiving side of a connection, owned by the socket writer task.
#[derive(Debug)]
pub struct ConnectionOutbound {
    /// Messages to write, in order.
    pub messages: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the broker wants the socket closed.
    pub shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle with a queue of `capacity` messages.
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, ConnectionOutbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shutdown = CancellationToken::new();
        let handle = ConnectionHandle {
            id,
            tx,
            shutdown: shutdown.clone(),
            counters: Arc::new(Counters::default()),
        };
        (
            handle,
            ConnectionOutbound {
                messages: rx,
                shutdown,
            },
        )
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Returns a snapshot of the delivery statistics.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            lagged: self.counters.lagged.load(Ordering::Relaxed),
        }
    }

    /// Whether the connection is closed or closing.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    /// Enqueues a message without blocking.
    pub fn try_deliver(&self, message: ServerMessage) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }

        match self.tx.try_send(message) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters.lagged.store(true, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %self.id,
                    dropped = dropped,
                    "Connection fell behind, closing"
                );
                self.shutdown.cancel();
                Err(TransportError::Lagged)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.id, "Connection channel closed");
                Err(TransportError::Closed)
            }
        }
    }

    /// Asks the writer task to flush what is queued and close the socket.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    bound: Option<SessionId>,
    created_at: u64,
}

/// Read-only view of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub bound_session: Option<SessionId>,
    pub created_at: u64,
    pub stats: ConnectionStats,
}

/// Binds connections to sessions and forwards their requests.
pub struct ConnectionMultiplexer<B: ProcessBridge> {
    registry: Arc<SessionRegistry<B>>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    channel_capacity: usize,
}

impl<B: ProcessBridge> ConnectionMultiplexer<B> {
    /// Creates a multiplexer over an existing registry.
    pub fn new(registry: Arc<SessionRegistry<B>>, channel_capacity: usize) -> Self {
        Self {
            registry,
            connections: DashMap::new(),
            channel_capacity,
        }
    }

    /// The registry this multiplexer routes to.
    pub fn registry(&self) -> &Arc<SessionRegistry<B>> {
        &self.registry
    }

    fn handle(&self, connection_id: &ConnectionId) -> Result<ConnectionHandle, MultiplexError> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| MultiplexError::UnknownConnection(connection_id.clone()))
    }

    fn require_bound(&self, connection_id: &ConnectionId) -> Result<SessionId, MultiplexError> {
        let entry = self
            .connections
            .get(connection_id)
            .ok_or_else(|| MultiplexError::UnknownConnection(connection_id.clone()))?;
        entry.bound.clone().ok_or(MultiplexError::NotJoined)
    }

    fn set_bound(&self, connection_id: &ConnectionId, session: Option<SessionId>) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.bound = session;
        }
    }

    /// Registers a new connection and greets it with `connected`.
    pub fn open_connection(&self) -> (ConnectionId, ConnectionOutbound) {
        let id = Uuid::new_v4().to_string();
        let (handle, outbound) = ConnectionHandle::new(id.clone(), self.channel_capacity);
        let _ = handle.try_deliver(ServerMessage::Connected(Connected {
            connection_id: id.clone(),
        }));
        self.connections.insert(
            id.clone(),
            ConnectionEntry {
                handle,
                bound: None,
                created_at: now_millis(),
            },
        );
        tracing::info!(connection_id = %id, "Connection opened");
        (id, outbound)
    }

    /// Binds a connection to a session, leaving any previous session first.
    ///
    /// The joiner receives `session_joined` with the replay, followed by live
    /// output with no gap.
    pub async fn join(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Result<(), MultiplexError> {
        let handle = self.handle(connection_id)?;
        if !self.registry.contains(session_id) {
            return Err(SessionError::NotFound(session_id.clone()).into());
        }

        if let Ok(previous) = self.require_bound(connection_id) {
            self.registry.detach(&previous, connection_id).await;
            self.set_bound(connection_id, None);
        }

        self.registry.attach(session_id, handle).await?;
        self.commit_binding(connection_id, session_id).await?;

        tracing::info!(
            connection_id = %connection_id,
            session_id = %session_id,
            "Connection joined session"
        );
        Ok(())
    }

    /// Records an attached connection as bound.
    ///
    /// A delete that drained the session between attach and here has already
    /// run its unbind pass, so the binding is withdrawn instead.
    async fn commit_binding(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Result<(), MultiplexError> {
        self.set_bound(connection_id, Some(session_id.clone()));
        if self.registry.is_attached(session_id, connection_id).await {
            return Ok(());
        }

        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            if entry.bound.as_deref() == Some(session_id.as_str()) {
                entry.bound = None;
            }
        }
        Err(SessionError::NotFound(session_id.clone()).into())
    }

    /// Unbinds a connection. The session's agent keeps running.
    ///
    /// Returns the session the connection left, if it was bound.
    pub async fn leave(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<SessionId>, MultiplexError> {
        let handle = self.handle(connection_id)?;
        let previous = self
            .connections
            .get_mut(connection_id)
            .and_then(|mut entry| entry.bound.take());

        if let Some(session_id) = &previous {
            self.registry.detach(session_id, connection_id).await;
            tracing::info!(
                connection_id = %connection_id,
                session_id = %session_id,
                "Connection left session"
            );
        }

        let _ = handle.try_deliver(ServerMessage::SessionLeft);
        Ok(previous)
    }

    /// Sends a message to every connection bound to a session.
    pub async fn broadcast(
        &self,
        session_id: &SessionId,
        message: &ServerMessage,
    ) -> Result<usize, MultiplexError> {
        Ok(self.registry.broadcast(session_id, message).await?)
    }

    /// Creates a session on behalf of a connection.
    pub async fn create_session(
        &self,
        name: Option<String>,
        working_dir: Option<String>,
    ) -> Result<SessionSummary, MultiplexError> {
        Ok(self.registry.create(name, working_dir).await?)
    }

    /// Starts an agent in the connection's session.
    pub async fn start_bridge(
        &self,
        connection_id: &ConnectionId,
        kind: AgentKind,
        options: StartOptions,
    ) -> Result<(), MultiplexError> {
        let session_id = self.require_bound(connection_id)?;
        Ok(self.registry.start_bridge(&session_id, kind, options).await?)
    }

    /// Stops the agent in the connection's session.
    pub async fn stop_bridge(&self, connection_id: &ConnectionId) -> Result<bool, MultiplexError> {
        let session_id = self.require_bound(connection_id)?;
        Ok(self.registry.stop_bridge(&session_id).await?)
    }

    /// Forwards keystrokes to the connection's session.
    pub async fn forward_input(
        &self,
        connection_id: &ConnectionId,
        data: &str,
    ) -> Result<(), MultiplexError> {
        let session_id = self.require_bound(connection_id)?;
        Ok(self.registry.send_input(&session_id, data).await?)
    }

    /// Forwards a terminal resize to the connection's session.
    pub async fn forward_resize(
        &self,
        connection_id: &ConnectionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), MultiplexError> {
        let session_id = self.require_bound(connection_id)?;
        Ok(self.registry.resize(&session_id, cols, rows).await?)
    }

    /// Deletes a session and clears the bindings of everyone bound to it.
    pub async fn delete_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<ConnectionId>, MultiplexError> {
        let disconnected = self.registry.delete(session_id).await?;
        for connection_id in &disconnected {
            if let Some(mut entry) = self.connections.get_mut(connection_id) {
                if entry.bound.as_deref() == Some(session_id.as_str()) {
                    entry.bound = None;
                }
            }
        }
        Ok(disconnected)
    }

    /// Forgets a connection whose transport has ended.
    pub async fn close_connection(&self, connection_id: &ConnectionId) {
        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return;
        };
        if let Some(session_id) = &entry.bound {
            self.registry.detach(session_id, connection_id).await;
        }
        entry.handle.close();

        let stats = entry.handle.stats();
        tracing::info!(
            connection_id = %connection_id,
            sent = stats.messages_sent,
            dropped = stats.messages_dropped,
            lagged = stats.lagged,
            "Connection closed"
        );
    }

    /// Direct reply to one connection.
    pub fn send_to(
        &self,
        connection_id: &ConnectionId,
        message: ServerMessage,
    ) -> Result<(), TransportError> {
        let handle = self
            .connections
            .get(connection_id)
            .map(|entry| entry.handle.clone())
            .ok_or(TransportError::Closed)?;
        handle.try_deliver(message)
    }

    /// The session a connection is bound to.
    pub fn bound_session(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.bound.clone())
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Read-only view of a connection.
    pub fn connection_info(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|entry| ConnectionInfo {
            id: connection_id.clone(),
            bound_session: entry.bound.clone(),
            created_at: entry.created_at,
            stats: entry.handle.stats(),
        })
    }

    /// Closes every connection. Used at teardown.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::RootedPathValidator;
    use crate::session::mock::MockBridge;
    use crate::session::registry::RegistrySettings;
    use std::time::Duration;
    use tokio::time::timeout;

    fn setup() -> (Arc<ConnectionMultiplexer<MockBridge>>, Arc<MockBridge>) {
        let bridge = Arc::new(MockBridge::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&bridge),
            Arc::new(RootedPathValidator::allow_all()),
            RegistrySettings::default(),
        ));
        (
            Arc::new(ConnectionMultiplexer::new(registry, 64)),
            bridge,
        )
    }

    fn temp_dir_string() -> String {
        std::env::temp_dir().to_string_lossy().into_owned()
    }

    async fn next(outbound: &mut ConnectionOutbound) -> ServerMessage {
        timeout(Duration::from_secs(2), outbound.messages.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound channel closed")
    }

    fn drain(outbound: &mut ConnectionOutbound) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = outbound.messages.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_handle_creation() {
        let (handle, _outbound) = ConnectionHandle::new("c1".to_string(), 4);
        assert_eq!(handle.id(), "c1");
        assert_eq!(handle.stats(), ConnectionStats::default());
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_handle_lags_when_full() {
        let (handle, mut outbound) = ConnectionHandle::new("slow".to_string(), 2);
        assert!(handle.try_deliver(ServerMessage::output("1")).is_ok());
        assert!(handle.try_deliver(ServerMessage::output("2")).is_ok());
        assert_eq!(
            handle.try_deliver(ServerMessage::output("3")),
            Err(TransportError::Lagged)
        );

        let stats = handle.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 1);
        assert!(stats.lagged);
        assert!(handle.is_closed());
        assert!(outbound.shutdown.is_cancelled());

        // Nothing more is accepted once closed
        assert_eq!(
            handle.try_deliver(ServerMessage::output("4")),
            Err(TransportError::Closed)
        );
        // What was queued before the lag is still readable
        assert_eq!(outbound.messages.recv().await, Some(ServerMessage::output("1")));
    }

    #[tokio::test]
    async fn test_handle_detects_dropped_receiver() {
        let (handle, outbound) = ConnectionHandle::new("gone".to_string(), 2);
        drop(outbound);
        assert!(handle.is_closed());
        assert_eq!(
            handle.try_deliver(ServerMessage::Pong),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_open_connection_sends_connected() {
        let (mux, _) = setup();
        let (id, mut outbound) = mux.open_connection();
        assert_eq!(
            next(&mut outbound).await,
            ServerMessage::Connected(Connected {
                connection_id: id.clone()
            })
        );
        assert_eq!(mux.connection_count(), 1);
        assert!(mux.bound_session(&id).is_none());
    }

    #[tokio::test]
    async fn test_join_unknown_session() {
        let (mux, _) = setup();
        let (id, _outbound) = mux.open_connection();
        let result = mux.join(&id, &"missing".to_string()).await;
        assert!(matches!(
            result,
            Err(MultiplexError::Session(SessionError::NotFound(_)))
        ));
        assert!(mux.bound_session(&id).is_none());
    }

    #[tokio::test]
    async fn test_join_switches_sessions() {
        let (mux, _) = setup();
        let first = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let second = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (id, mut outbound) = mux.open_connection();

        mux.join(&id, &first.id).await.unwrap();
        mux.join(&id, &second.id).await.unwrap();
        assert_eq!(mux.bound_session(&id), Some(second.id.clone()));

        let first_summary = mux.registry().get(&first.id).await.unwrap();
        let second_summary = mux.registry().get(&second.id).await.unwrap();
        assert_eq!(first_summary.connections, 0);
        assert_eq!(second_summary.connections, 1);

        let joined: Vec<_> = drain(&mut outbound)
            .into_iter()
            .filter(|m| m.kind() == "session_joined")
            .collect();
        assert_eq!(joined.len(), 2);
    }

    #[tokio::test]
    async fn test_leave_keeps_agent_running() {
        let (mux, bridge) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (id, mut outbound) = mux.open_connection();
        mux.join(&id, &session.id).await.unwrap();
        mux.start_bridge(&id, AgentKind::Claude, StartOptions::default())
            .await
            .unwrap();

        assert_eq!(mux.leave(&id).await.unwrap(), Some(session.id.clone()));
        assert!(bridge.is_running(&session.id));
        assert!(mux.registry().get(&session.id).await.unwrap().active);

        let kinds: Vec<_> = drain(&mut outbound).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds.last(), Some(&"session_left"));
    }

    #[tokio::test]
    async fn test_forward_requires_join() {
        let (mux, _) = setup();
        let (id, _outbound) = mux.open_connection();
        assert!(matches!(
            mux.forward_input(&id, "ls\n").await,
            Err(MultiplexError::NotJoined)
        ));
        assert!(matches!(
            mux.forward_resize(&id, 100, 30).await,
            Err(MultiplexError::NotJoined)
        ));
        assert!(matches!(
            mux.stop_bridge(&id).await,
            Err(MultiplexError::NotJoined)
        ));
    }

    #[tokio::test]
    async fn test_forward_requires_active_agent() {
        let (mux, _) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (id, _outbound) = mux.open_connection();
        mux.join(&id, &session.id).await.unwrap();

        assert!(matches!(
            mux.forward_input(&id, "ls\n").await,
            Err(MultiplexError::Session(SessionError::NotActive(_)))
        ));
    }

    #[tokio::test]
    async fn test_forward_input_and_resize() {
        let (mux, bridge) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (id, _outbound) = mux.open_connection();
        mux.join(&id, &session.id).await.unwrap();
        mux.start_bridge(&id, AgentKind::Gemini, StartOptions::default())
            .await
            .unwrap();

        mux.forward_input(&id, "hello\n").await.unwrap();
        mux.forward_resize(&id, 120, 40).await.unwrap();

        assert_eq!(
            bridge.inputs.lock().unwrap().clone(),
            vec![(session.id.clone(), "hello\n".to_string())]
        );
        assert_eq!(
            bridge.resizes.lock().unwrap().clone(),
            vec![(session.id.clone(), 120, 40)]
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_bound_connection() {
        let (mux, _) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (a, mut out_a) = mux.open_connection();
        let (b, mut out_b) = mux.open_connection();
        let (_c, mut out_c) = mux.open_connection();
        mux.join(&a, &session.id).await.unwrap();
        mux.join(&b, &session.id).await.unwrap();
        drain(&mut out_a);
        drain(&mut out_b);
        drain(&mut out_c);

        let delivered = mux
            .broadcast(&session.id, &ServerMessage::info("hello"))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut out_a), vec![ServerMessage::info("hello")]);
        assert_eq!(drain(&mut out_b), vec![ServerMessage::info("hello")]);
        assert!(drain(&mut out_c).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_transport() {
        let (mux, _) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (a, out_a) = mux.open_connection();
        let (b, mut out_b) = mux.open_connection();
        mux.join(&a, &session.id).await.unwrap();
        mux.join(&b, &session.id).await.unwrap();
        drop(out_a);
        drain(&mut out_b);

        let delivered = mux
            .broadcast(&session.id, &ServerMessage::output("x"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut out_b), vec![ServerMessage::output("x")]);
    }

    #[tokio::test]
    async fn test_slow_connection_is_closed_not_blocking_others() {
        let bridge = Arc::new(MockBridge::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&bridge),
            Arc::new(RootedPathValidator::allow_all()),
            RegistrySettings::default(),
        ));
        let mux = ConnectionMultiplexer::new(registry, 4);
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (slow, slow_out) = mux.open_connection();
        let (fast, mut fast_out) = mux.open_connection();
        mux.join(&slow, &session.id).await.unwrap();
        mux.join(&fast, &session.id).await.unwrap();

        for i in 0..10 {
            let _ = fast_out.messages.try_recv();
            let _ = fast_out.messages.try_recv();
            mux.broadcast(&session.id, &ServerMessage::output(i.to_string()))
                .await
                .unwrap();
        }

        assert!(slow_out.shutdown.is_cancelled());
        let info = mux.connection_info(&slow).unwrap();
        assert!(info.stats.lagged);
        assert!(!fast_out.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_delete_session_clears_bindings() {
        let (mux, _) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (a, mut out_a) = mux.open_connection();
        mux.join(&a, &session.id).await.unwrap();

        let disconnected = mux.delete_session(&session.id).await.unwrap();
        assert_eq!(disconnected, vec![a.clone()]);
        assert!(mux.bound_session(&a).is_none());

        let kinds: Vec<_> = drain(&mut out_a).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds.last(), Some(&"session_deleted"));
        assert!(out_a.shutdown.is_cancelled());

        let (b, _out_b) = mux.open_connection();
        assert!(matches!(
            mux.join(&b, &session.id).await,
            Err(MultiplexError::Session(SessionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_join_racing_delete_leaves_connection_unbound() {
        let (mux, _) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (a, _out_a) = mux.open_connection();

        // Delete lands after attach but before the binding is recorded.
        mux.registry()
            .attach(&session.id, mux.handle(&a).unwrap())
            .await
            .unwrap();
        mux.delete_session(&session.id).await.unwrap();

        assert!(matches!(
            mux.commit_binding(&a, &session.id).await,
            Err(MultiplexError::Session(SessionError::NotFound(_)))
        ));
        assert!(mux.bound_session(&a).is_none());
    }

    #[tokio::test]
    async fn test_close_connection_unbinds() {
        let (mux, _) = setup();
        let session = mux.create_session(None, Some(temp_dir_string())).await.unwrap();
        let (a, _out_a) = mux.open_connection();
        mux.join(&a, &session.id).await.unwrap();

        mux.close_connection(&a).await;
        assert_eq!(mux.connection_count(), 0);
        assert_eq!(mux.registry().get(&session.id).await.unwrap().connections, 0);
        assert_eq!(
            mux.send_to(&a, ServerMessage::Pong),
            Err(TransportError::Closed)
        );
    }
}
