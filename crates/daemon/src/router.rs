//! Message router for dispatching client messages to the session layer.
//!
//! The router receives decoded [`ClientMessage`]s for one connection and
//! routes them through the [`ConnectionMultiplexer`]. Replies go straight
//! back to the sender; anything that concerns every viewer of a session
//! (output, agent start, exit) is broadcast by the session layer itself.

use std::sync::Arc;

use protocol::{
    ClientMessage, CreateSession, DeleteSession, JoinSession, ProtocolError, Resize,
    ServerMessage, SessionCreated, SessionList, StartBridge,
};
use tracing::{debug, info, warn};

use crate::session::{
    BridgeError, ConnectionId, ConnectionMultiplexer, MultiplexError, ProcessBridge, SessionError,
};

/// Result type for router operations.
///
/// `Ok(Some(reply))` is sent to the requesting connection only.
pub type RouterResult = Result<Option<ServerMessage>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The session layer rejected the request.
    #[error(transparent)]
    Multiplex(#[from] MultiplexError),

    /// The frame could not be decoded.
    #[error("invalid message: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<SessionError> for RouterError {
    fn from(e: SessionError) -> Self {
        RouterError::Multiplex(MultiplexError::Session(e))
    }
}

impl RouterError {
    /// Whether the error is advisory rather than a failed request.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            RouterError::Multiplex(MultiplexError::NotJoined)
                | RouterError::Multiplex(MultiplexError::Session(SessionError::NotActive(_)))
                | RouterError::Multiplex(MultiplexError::Session(SessionError::Bridge(
                    BridgeError::NotRunning(_)
                )))
        )
    }

    /// Converts the error to the message sent back to the client.
    ///
    /// Advisory conditions become `info`; everything else is `error`.
    pub fn to_server_message(&self) -> ServerMessage {
        match self {
            RouterError::Multiplex(MultiplexError::NotJoined) => {
                ServerMessage::info("Join a session first")
            }
            _ if self.is_advisory() => ServerMessage::info("No agent is running in this session"),
            _ => ServerMessage::error(self.to_string()),
        }
    }
}

/// Message router that dispatches client messages for every connection.
pub struct MessageRouter<B: ProcessBridge> {
    multiplexer: Arc<ConnectionMultiplexer<B>>,
}

impl<B: ProcessBridge> MessageRouter<B> {
    /// Create a new message router over a multiplexer.
    pub fn new(multiplexer: Arc<ConnectionMultiplexer<B>>) -> Self {
        Self { multiplexer }
    }

    /// The multiplexer this router dispatches to.
    pub fn multiplexer(&self) -> &Arc<ConnectionMultiplexer<B>> {
        &self.multiplexer
    }

    /// Decodes and routes one text frame, delivering the reply or error to
    /// the sender. Never fails: malformed frames are answered with `error`
    /// and the connection stays open.
    pub async fn handle_frame(&self, connection_id: &ConnectionId, text: &str) {
        let result = match ClientMessage::from_json(text) {
            Ok(message) => self.route(connection_id, message).await,
            Err(e) => Err(e.into()),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_advisory() {
                    debug!(connection_id = %connection_id, error = %e, "Advisory reply");
                } else {
                    warn!(connection_id = %connection_id, error = %e, "Request failed");
                }
                Some(e.to_server_message())
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = self.multiplexer.send_to(connection_id, reply) {
                debug!(connection_id = %connection_id, error = %e, "Dropping reply");
            }
        }
    }

    /// Route a message to the appropriate handler.
    pub async fn route(&self, connection_id: &ConnectionId, message: ClientMessage) -> RouterResult {
        debug!(connection_id = %connection_id, kind = message.kind(), "Routing message");

        match message {
            ClientMessage::CreateSession(req) => self.handle_create_session(req).await,
            ClientMessage::JoinSession(req) => self.handle_join_session(connection_id, req).await,
            ClientMessage::LeaveSession => {
                self.multiplexer.leave(connection_id).await?;
                Ok(None)
            }
            ClientMessage::StartBridge(req) => self.handle_start_bridge(connection_id, req).await,
            ClientMessage::Input(input) => {
                self.multiplexer
                    .forward_input(connection_id, &input.data)
                    .await?;
                Ok(None)
            }
            ClientMessage::Resize(req) => self.handle_resize(connection_id, req).await,
            ClientMessage::Stop => self.handle_stop(connection_id).await,
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
            ClientMessage::ListSessions => {
                let sessions = self.multiplexer.registry().list().await;
                Ok(Some(ServerMessage::SessionList(SessionList { sessions })))
            }
            ClientMessage::DeleteSession(req) => {
                self.handle_delete_session(connection_id, req).await
            }
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_create_session(&self, req: CreateSession) -> RouterResult {
        let summary = self
            .multiplexer
            .create_session(req.name, req.working_dir)
            .await?;

        Ok(Some(ServerMessage::SessionCreated(SessionCreated {
            session_id: summary.id,
            name: summary.name,
            working_dir: summary.working_dir,
        })))
    }

    async fn handle_join_session(
        &self,
        connection_id: &ConnectionId,
        req: JoinSession,
    ) -> RouterResult {
        // session_joined is enqueued by the registry together with the binding
        self.multiplexer.join(connection_id, &req.session_id).await?;
        Ok(None)
    }

    async fn handle_delete_session(
        &self,
        connection_id: &ConnectionId,
        req: DeleteSession,
    ) -> RouterResult {
        info!(connection_id = %connection_id, session_id = %req.session_id, "Deleting session");

        let disconnected = self.multiplexer.delete_session(&req.session_id).await?;
        if disconnected.contains(connection_id) {
            // Already told along with every other viewer
            return Ok(None);
        }
        Ok(Some(ServerMessage::session_deleted(format!(
            "Session {} was deleted",
            req.session_id
        ))))
    }

    // =========================================================================
    // Agent Handlers
    // =========================================================================

    async fn handle_start_bridge(
        &self,
        connection_id: &ConnectionId,
        req: StartBridge,
    ) -> RouterResult {
        // <kind>_started is broadcast to every viewer on success
        self.multiplexer
            .start_bridge(connection_id, req.kind, req.options)
            .await?;
        Ok(None)
    }

    async fn handle_resize(&self, connection_id: &ConnectionId, req: Resize) -> RouterResult {
        self.multiplexer
            .forward_resize(connection_id, req.cols, req.rows)
            .await?;
        Ok(None)
    }

    async fn handle_stop(&self, connection_id: &ConnectionId) -> RouterResult {
        if self.multiplexer.stop_bridge(connection_id).await? {
            Ok(None)
        } else {
            Ok(Some(ServerMessage::info("No agent is running in this session")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::RootedPathValidator;
    use crate::session::mock::MockBridge;
    use crate::session::{ConnectionOutbound, RegistrySettings, SessionRegistry};
    use protocol::{AgentKind, Exit, Notice};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        router: MessageRouter<MockBridge>,
        bridge: Arc<MockBridge>,
    }

    impl Harness {
        fn new() -> Self {
            let bridge = Arc::new(MockBridge::new());
            let registry = Arc::new(SessionRegistry::new(
                Arc::clone(&bridge),
                Arc::new(RootedPathValidator::allow_all()),
                RegistrySettings::default(),
            ));
            let multiplexer = Arc::new(ConnectionMultiplexer::new(registry, 64));
            Self {
                router: MessageRouter::new(multiplexer),
                bridge,
            }
        }

        /// Opens a connection and consumes its `connected` greeting.
        async fn connect(&self) -> (ConnectionId, ConnectionOutbound) {
            let (id, mut outbound) = self.router.multiplexer().open_connection();
            assert_eq!(next(&mut outbound).await.kind(), "connected");
            (id, outbound)
        }

        async fn send(&self, connection_id: &ConnectionId, json: &str) {
            self.router.handle_frame(connection_id, json).await;
        }

        /// Creates a session in the temp dir and returns its id.
        async fn create(&self, connection_id: &ConnectionId, outbound: &mut ConnectionOutbound) -> String {
            let request = serde_json::json!({
                "type": "create_session",
                "name": "demo",
                "workingDir": std::env::temp_dir(),
            });
            self.send(connection_id, &request.to_string()).await;
            match next(outbound).await {
                ServerMessage::SessionCreated(created) => created.session_id,
                other => panic!("unexpected message: {:?}", other),
            }
        }

        async fn join(&self, connection_id: &ConnectionId, outbound: &mut ConnectionOutbound, session_id: &str) {
            let request = serde_json::json!({"type": "join_session", "sessionId": session_id});
            self.send(connection_id, &request.to_string()).await;
            assert_eq!(next(outbound).await.kind(), "session_joined");
        }
    }

    async fn next(outbound: &mut ConnectionOutbound) -> ServerMessage {
        timeout(Duration::from_secs(2), outbound.messages.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound channel closed")
    }

    #[tokio::test]
    async fn test_route_ping() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        harness.send(&id, r#"{"type":"ping"}"#).await;
        assert_eq!(next(&mut out).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;

        harness.send(&id, "not json").await;
        assert_eq!(next(&mut out).await.kind(), "error");
        harness.send(&id, r#"{"type":"teleport"}"#).await;
        assert_eq!(next(&mut out).await.kind(), "error");
        harness
            .send(&id, r#"{"type":"start_bridge","kind":"cobol"}"#)
            .await;
        assert_eq!(next(&mut out).await.kind(), "error");

        harness.send(&id, r#"{"type":"ping"}"#).await;
        assert_eq!(next(&mut out).await, ServerMessage::Pong);
    }

    #[tokio::test]
    async fn test_route_create_session() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        let session_id = harness.create(&id, &mut out).await;
        assert!(harness
            .router
            .multiplexer()
            .registry()
            .contains(&session_id));
        // Creating does not join
        assert_eq!(harness.router.multiplexer().bound_session(&id), None);
    }

    #[tokio::test]
    async fn test_route_create_session_bad_directory() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        harness
            .send(
                &id,
                r#"{"type":"create_session","workingDir":"/nonexistent/agentdeck"}"#,
            )
            .await;
        match next(&mut out).await {
            ServerMessage::Error(Notice { message }) => assert!(message.contains("invalid request")),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(harness.router.multiplexer().registry().count(), 0);
    }

    #[tokio::test]
    async fn test_route_join_unknown_session() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        harness
            .send(&id, r#"{"type":"join_session","sessionId":"missing"}"#)
            .await;
        match next(&mut out).await {
            ServerMessage::Error(Notice { message }) => assert!(message.contains("not found")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_input_before_join_is_advisory() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        harness.send(&id, r#"{"type":"input","data":"ls\r"}"#).await;
        assert_eq!(next(&mut out).await.kind(), "info");
        harness.send(&id, r#"{"type":"stop"}"#).await;
        assert_eq!(next(&mut out).await.kind(), "info");
    }

    #[tokio::test]
    async fn test_input_while_idle_is_advisory() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        let session_id = harness.create(&id, &mut out).await;
        harness.join(&id, &mut out, &session_id).await;

        harness.send(&id, r#"{"type":"input","data":"ls\r"}"#).await;
        assert_eq!(
            next(&mut out).await,
            ServerMessage::info("No agent is running in this session")
        );
        harness
            .send(&id, r#"{"type":"resize","cols":100,"rows":30}"#)
            .await;
        assert_eq!(next(&mut out).await.kind(), "info");
        harness.send(&id, r#"{"type":"stop"}"#).await;
        assert_eq!(next(&mut out).await.kind(), "info");
    }

    #[tokio::test]
    async fn test_start_input_stop_flow() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        let session_id = harness.create(&id, &mut out).await;
        harness.join(&id, &mut out, &session_id).await;

        harness
            .send(&id, r#"{"type":"start_bridge","kind":"gemini","options":{"cols":120}}"#)
            .await;
        assert_eq!(
            next(&mut out).await,
            ServerMessage::agent_started(AgentKind::Gemini, session_id.clone())
        );

        harness.send(&id, r#"{"type":"input","data":"hello"}"#).await;
        harness
            .send(&id, r#"{"type":"resize","cols":100,"rows":30}"#)
            .await;
        assert_eq!(
            harness.bridge.inputs.lock().unwrap().clone(),
            vec![(session_id.clone(), "hello".to_string())]
        );
        assert_eq!(
            harness.bridge.resizes.lock().unwrap().clone(),
            vec![(session_id.clone(), 100, 30)]
        );

        harness.bridge.emit(&session_id, "hi there").await;
        assert_eq!(next(&mut out).await, ServerMessage::output("hi there"));

        harness.send(&id, r#"{"type":"stop"}"#).await;
        assert_eq!(
            next(&mut out).await,
            ServerMessage::Exit(Exit {
                code: None,
                signal: Some("SIGTERM".to_string())
            })
        );
    }

    #[tokio::test]
    async fn test_start_twice_reports_error() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        let session_id = harness.create(&id, &mut out).await;
        harness.join(&id, &mut out, &session_id).await;

        harness
            .send(&id, r#"{"type":"start_bridge","kind":"claude"}"#)
            .await;
        assert_eq!(next(&mut out).await.kind(), "claude_started");
        harness
            .send(&id, r#"{"type":"start_bridge","kind":"codex"}"#)
            .await;
        match next(&mut out).await {
            ServerMessage::Error(Notice { message }) => assert!(message.contains("already running")),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leave_session() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        let session_id = harness.create(&id, &mut out).await;
        harness.join(&id, &mut out, &session_id).await;

        harness.send(&id, r#"{"type":"leave_session"}"#).await;
        assert_eq!(next(&mut out).await, ServerMessage::SessionLeft);
        assert_eq!(harness.router.multiplexer().bound_session(&id), None);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let harness = Harness::new();
        let (id, mut out) = harness.connect().await;
        let first = harness.create(&id, &mut out).await;
        let second = harness.create(&id, &mut out).await;

        harness.send(&id, r#"{"type":"list_sessions"}"#).await;
        match next(&mut out).await {
            ServerMessage::SessionList(list) => {
                let ids: Vec<_> = list.sessions.iter().map(|s| s.id.clone()).collect();
                assert_eq!(ids.len(), 2);
                assert!(ids.contains(&first));
                assert!(ids.contains(&second));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_session_notifies_viewers_and_requester() {
        let harness = Harness::new();
        let (viewer, mut viewer_out) = harness.connect().await;
        let (admin, mut admin_out) = harness.connect().await;
        let session_id = harness.create(&viewer, &mut viewer_out).await;
        harness.join(&viewer, &mut viewer_out, &session_id).await;

        let request = serde_json::json!({"type": "delete_session", "sessionId": session_id});
        harness.send(&admin, &request.to_string()).await;

        assert_eq!(next(&mut viewer_out).await.kind(), "session_deleted");
        assert_eq!(next(&mut admin_out).await.kind(), "session_deleted");
        assert_eq!(harness.router.multiplexer().bound_session(&viewer), None);

        // A later join fails
        let request = serde_json::json!({"type": "join_session", "sessionId": session_id});
        harness.send(&admin, &request.to_string()).await;
        assert_eq!(next(&mut admin_out).await.kind(), "error");
    }

    #[test]
    fn test_error_mapping() {
        let not_joined = RouterError::from(MultiplexError::NotJoined);
        assert!(not_joined.is_advisory());
        assert_eq!(not_joined.to_server_message().kind(), "info");

        let not_active = RouterError::from(SessionError::NotActive("s".to_string()));
        assert_eq!(not_active.to_server_message().kind(), "info");

        let not_found = RouterError::from(SessionError::NotFound("s".to_string()));
        assert!(!not_found.is_advisory());
        assert_eq!(not_found.to_server_message().kind(), "error");

        let spawn = RouterError::from(SessionError::Spawn("boom".to_string()));
        assert_eq!(
            spawn.to_server_message(),
            ServerMessage::error("failed to start agent: boom")
        );
    }
}
