//! CLI side of the control plane.
//!
//! One request is in flight at a time. The typed helpers turn an `error`
//! reply into [`IpcError::Rejected`].

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use protocol::SessionSummary;

use super::messages::{DaemonStatus, IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

fn timed_out(what: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
}

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when nothing listens on the socket, which usually means the
    /// daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout for the connect and for
    /// every later request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for a response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns true if the daemon answered the ping.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Current status of the daemon.
    pub async fn status(&mut self) -> Result<DaemonStatus, IpcError> {
        match self.send(IpcRequest::Status).await? {
            IpcResponse::Status(status) => Ok(status),
            other => Err(unexpected("status", other)),
        }
    }

    /// Asks the daemon to shut down. Returns once the request is acknowledged.
    pub async fn stop(&mut self) -> Result<(), IpcError> {
        match self.send(IpcRequest::Stop).await? {
            IpcResponse::Stopping => Ok(()),
            other => Err(unexpected("stop", other)),
        }
    }

    /// Every session the daemon knows.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSummary>, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected("list_sessions", other)),
        }
    }

    /// Deletes a session. Returns how many connections were closed.
    pub async fn delete_session(&mut self, session_id: &str) -> Result<usize, IpcError> {
        let request = IpcRequest::DeleteSession {
            session_id: session_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::SessionDeleted {
                session_id: deleted,
                disconnected,
            } if deleted == session_id => Ok(disconnected),
            other => Err(unexpected("delete_session", other)),
        }
    }
}

fn unexpected(request: &'static str, response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error { message } => IpcError::Rejected(message),
        _ => IpcError::UnexpectedReply(request),
    }
}
