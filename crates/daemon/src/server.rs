//! WebSocket front door.
//!
//! Every accepted socket becomes one multiplexer connection. A writer task
//! drains the connection's outbound queue into the socket while the reader
//! loop hands text frames to the [`MessageRouter`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::ServerMessage;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::MessageRouter;
use crate::session::{ConnectionId, ConnectionOutbound, ProcessBridge};

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Errors raised while setting up the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The bound socket has no local address.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),
}

/// Accepts browser connections and serves them until cancelled.
pub struct WsServer<B: ProcessBridge> {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Arc<MessageRouter<B>>,
}

impl<B: ProcessBridge> WsServer<B> {
    /// Binds the listener. Port 0 picks a free port; see [`Self::local_addr`].
    pub async fn bind(addr: &str, router: Arc<MessageRouter<B>>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        Ok(Self {
            listener,
            local_addr,
            router,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Returns once `token` is cancelled; open sockets observe
    /// the same token and close themselves.
    pub async fn run(self, token: CancellationToken) {
        info!(addr = %self.local_addr, "WebSocket server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept TCP connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let router = Arc::clone(&self.router);
            let token = token.child_token();
            tokio::spawn(async move {
                if let Err(e) = serve_socket(stream, peer, router, token).await {
                    debug!(peer = %peer, error = %e, "WebSocket handshake failed");
                }
            });
        }

        info!(addr = %self.local_addr, "WebSocket server stopped");
    }
}

async fn serve_socket<B: ProcessBridge>(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<MessageRouter<B>>,
    token: CancellationToken,
) -> Result<(), tungstenite::Error> {
    let socket = tokio_tungstenite::accept_async(stream).await?;
    let (sink, mut frames) = socket.split();

    let multiplexer = router.multiplexer();
    let (connection_id, outbound) = multiplexer.open_connection();
    let closing = outbound.shutdown.clone();
    debug!(connection_id = %connection_id, peer = %peer, "WebSocket connected");

    let writer = tokio::spawn(write_outbound(sink, outbound, connection_id.clone()));

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            _ = closing.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => router.handle_frame(&connection_id, &text).await,
            Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => router.handle_frame(&connection_id, text).await,
                Err(_) => {
                    let _ = multiplexer.send_to(
                        &connection_id,
                        ServerMessage::error("Binary frames must contain UTF-8 JSON"),
                    );
                }
            },
            Some(Ok(WsMessage::Close(_))) | None => break,
            // Ping/pong are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    multiplexer.close_connection(&connection_id).await;
    let _ = writer.await;
    Ok(())
}

/// Drains the outbound queue into the socket, in order.
///
/// On shutdown whatever is already queued is still written before the close
/// frame, so a `session_deleted` or final `exit` is not lost.
async fn write_outbound(mut sink: WsSink, outbound: ConnectionOutbound, connection_id: ConnectionId) {
    let ConnectionOutbound {
        mut messages,
        shutdown,
    } = outbound;

    loop {
        let message = tokio::select! {
            biased;
            message = messages.recv() => message,
            _ = shutdown.cancelled() => None,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = send_frame(&mut sink, &message).await {
            debug!(connection_id = %connection_id, error = %e, "WebSocket write failed");
            shutdown.cancel();
            return;
        }
    }

    while let Ok(message) = messages.try_recv() {
        if send_frame(&mut sink, &message).await.is_err() {
            return;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
}

async fn send_frame(sink: &mut WsSink, message: &ServerMessage) -> Result<(), tungstenite::Error> {
    match message.to_json() {
        Ok(json) => sink.send(WsMessage::Text(json)).await,
        Err(e) => {
            warn!(kind = message.kind(), error = %e, "Failed to encode outbound message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::RootedPathValidator;
    use crate::session::mock::MockBridge;
    use crate::session::{ConnectionMultiplexer, RegistrySettings, SessionRegistry};
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Fixture {
        addr: SocketAddr,
        bridge: Arc<MockBridge>,
        router: Arc<MessageRouter<MockBridge>>,
        token: CancellationToken,
        dir: tempfile::TempDir,
    }

    async fn start_server() -> Fixture {
        let bridge = Arc::new(MockBridge::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&bridge),
            Arc::new(RootedPathValidator::allow_all()),
            RegistrySettings::default(),
        ));
        let multiplexer = Arc::new(ConnectionMultiplexer::new(registry, 64));
        let router = Arc::new(MessageRouter::new(multiplexer));

        let server = WsServer::bind("127.0.0.1:0", Arc::clone(&router))
            .await
            .unwrap();
        let addr = server.local_addr();
        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));

        Fixture {
            addr,
            bridge,
            router,
            token,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        client
    }

    async fn recv(client: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn send(client: &mut Client, json: &str) {
        client.send(WsMessage::Text(json.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let fixture = start_server().await;
        assert_ne!(fixture.addr.port(), 0);
        fixture.token.cancel();
    }

    #[tokio::test]
    async fn test_bind_invalid_address_fails() {
        let bridge = Arc::new(MockBridge::new());
        let registry = Arc::new(SessionRegistry::new(
            bridge,
            Arc::new(RootedPathValidator::allow_all()),
            RegistrySettings::default(),
        ));
        let router = Arc::new(MessageRouter::new(Arc::new(ConnectionMultiplexer::new(
            registry, 64,
        ))));

        let result = WsServer::bind("not-an-address", router).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_greeting_and_ping() {
        let fixture = start_server().await;
        let mut client = connect(fixture.addr).await;

        assert_eq!(recv(&mut client).await.kind(), "connected");
        send(&mut client, r#"{"type":"ping"}"#).await;
        assert_eq!(recv(&mut client).await.kind(), "pong");

        fixture.token.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let fixture = start_server().await;
        let mut client = connect(fixture.addr).await;
        recv(&mut client).await;

        send(&mut client, "{not json").await;
        assert_eq!(recv(&mut client).await.kind(), "error");

        client
            .send(WsMessage::Binary(vec![0xff, 0xfe]))
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await.kind(), "error");

        send(&mut client, r#"{"type":"ping"}"#).await;
        assert_eq!(recv(&mut client).await.kind(), "pong");

        fixture.token.cancel();
    }

    #[tokio::test]
    async fn test_output_reaches_socket() {
        let fixture = start_server().await;
        let mut client = connect(fixture.addr).await;
        recv(&mut client).await;

        let create = serde_json::json!({
            "type": "create_session",
            "name": "demo",
            "workingDir": fixture.dir.path(),
        });
        send(&mut client, &create.to_string()).await;
        let session_id = match recv(&mut client).await {
            ServerMessage::SessionCreated(created) => created.session_id,
            other => panic!("unexpected message: {:?}", other),
        };

        let join = serde_json::json!({"type": "join_session", "sessionId": session_id});
        send(&mut client, &join.to_string()).await;
        assert_eq!(recv(&mut client).await.kind(), "session_joined");

        send(&mut client, r#"{"type":"start_bridge","kind":"claude"}"#).await;
        assert_eq!(recv(&mut client).await.kind(), "claude_started");

        fixture.bridge.emit(&session_id, "hello").await;
        match recv(&mut client).await {
            ServerMessage::Output(output) => assert_eq!(output.data, "hello"),
            other => panic!("unexpected message: {:?}", other),
        }

        fixture.token.cancel();
    }

    #[tokio::test]
    async fn test_client_close_releases_connection() {
        let fixture = start_server().await;
        let mut client = connect(fixture.addr).await;
        recv(&mut client).await;
        assert_eq!(fixture.router.multiplexer().connection_count(), 1);

        client.close(None).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fixture.router.multiplexer().connection_count() != 0 {
            assert!(tokio::time::Instant::now() < deadline, "connection not released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        fixture.token.cancel();
    }

    #[tokio::test]
    async fn test_cancel_closes_open_sockets() {
        let fixture = start_server().await;
        let mut client = connect(fixture.addr).await;
        recv(&mut client).await;

        fixture.token.cancel();

        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "socket stayed open after cancel");
    }
}
