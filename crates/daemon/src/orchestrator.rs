//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and coordinates
//! all daemon subsystems: the session registry, the connection multiplexer,
//! the WebSocket server, snapshot persistence and the local IPC control plane.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{ControlPaths, DaemonStatus, IpcRequest, IpcResponse, IpcServer, PidFile};
use crate::paths::RootedPathValidator;
use crate::persistence::{JsonSnapshotStore, Persister};
use crate::router::MessageRouter;
use crate::server::WsServer;
use crate::session::{
    ConnectionMultiplexer, ProcessBridge, PtyBridge, RegistrySettings, SessionRegistry,
};

/// How long `stop` waits for background tasks to finish.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The WebSocket server is accepting connections.
    Listening { addr: SocketAddr },
    /// A `Stop` request arrived over IPC.
    StopRequested,
}

/// Answers IPC requests from the CLI.
struct ControlPlane<B: ProcessBridge> {
    registry: Arc<SessionRegistry<B>>,
    multiplexer: Arc<ConnectionMultiplexer<B>>,
    started_at: Instant,
    bind_addr: SocketAddr,
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl<B: ProcessBridge> ControlPlane<B> {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status(DaemonStatus {
                uptime_secs: self.started_at.elapsed().as_secs(),
                bind_addr: self.bind_addr.to_string(),
                sessions: self.registry.count(),
                active_agents: self.registry.active_count().await,
                connections: self.multiplexer.connection_count(),
            }),
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.stop_requested.cancel();
                let _ = self.event_tx.send(OrchestratorEvent::StopRequested);
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.registry.list().await,
            },
            IpcRequest::DeleteSession { session_id } => {
                match self.multiplexer.delete_session(&session_id).await {
                    Ok(disconnected) => IpcResponse::SessionDeleted {
                        session_id,
                        disconnected: disconnected.len(),
                    },
                    Err(e) => IpcResponse::error(e.to_string()),
                }
            }
        }
    }
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator<B: ProcessBridge = PtyBridge> {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Owner of all sessions.
    registry: Arc<SessionRegistry<B>>,
    /// Connection bookkeeping and fan-out.
    multiplexer: Arc<ConnectionMultiplexer<B>>,
    /// Message router.
    router: Arc<MessageRouter<B>>,
    /// Snapshot writer.
    persister: Arc<Persister<B>>,
    /// IPC socket and PID file locations.
    control_paths: ControlPaths,
    /// Written while running.
    pid_file: Option<PidFile>,
    /// Address the WebSocket server bound to.
    local_addr: Option<SocketAddr>,
    /// Background tasks started by `start`.
    tasks: Vec<JoinHandle<()>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Cancelled when the CLI asks the daemon to stop.
    stop_requested: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator<PtyBridge> {
    /// Creates a new daemon orchestrator driving real PTYs.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_bridge(config, Arc::new(PtyBridge::new()))
    }
}

impl<B: ProcessBridge> DaemonOrchestrator<B> {
    /// Creates an orchestrator over a specific process bridge.
    pub fn with_bridge(config: Config, bridge: Arc<B>) -> Result<Self> {
        std::fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.daemon.data_dir.display()
            )
        })?;

        let paths = Arc::new(
            RootedPathValidator::new(config.session.allowed_roots.clone())
                .context("Invalid session.allowed_roots")?,
        );
        let registry = Arc::new(SessionRegistry::new(
            bridge,
            paths,
            RegistrySettings::from_config(&config),
        ));
        let multiplexer = Arc::new(ConnectionMultiplexer::new(
            Arc::clone(&registry),
            config.server.channel_capacity,
        ));
        let router = Arc::new(MessageRouter::new(Arc::clone(&multiplexer)));

        let store = Arc::new(JsonSnapshotStore::new(config.snapshot_path()));
        let persister = Arc::new(Persister::new(
            Arc::clone(&registry),
            store,
            Duration::from_secs(config.session.persist_interval_secs),
        ));

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            multiplexer,
            router,
            persister,
            control_paths: ControlPaths::resolve(),
            pid_file: None,
            local_addr: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        })
    }

    /// Overrides where the IPC socket and PID file are placed.
    pub fn with_control_paths(mut self, control_paths: ControlPaths) -> Self {
        self.control_paths = control_paths;
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    ///
    /// Restores the session snapshot, binds the WebSocket server and the IPC
    /// socket, writes the PID file and launches the persistence loop.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.start_components().await {
            self.shutdown_token.cancel();
            for task in self.tasks.drain(..) {
                task.abort();
            }
            self.pid_file = None;
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn start_components(&mut self) -> Result<()> {
        self.persister
            .restore()
            .await
            .context("Failed to restore session snapshot")?;

        let server = WsServer::bind(&self.config.server.bind_addr, Arc::clone(&self.router))
            .await
            .context("Failed to start WebSocket server")?;
        let addr = server.local_addr();
        self.local_addr = Some(addr);

        let ipc_server = IpcServer::bind(&self.control_paths.socket).await.with_context(|| {
            format!(
                "Failed to bind IPC socket: {}",
                self.control_paths.socket.display()
            )
        })?;
        self.pid_file = Some(PidFile::create(&self.control_paths.pid_file).with_context(|| {
            format!(
                "Failed to write PID file: {}",
                self.control_paths.pid_file.display()
            )
        })?);

        self.tasks
            .push(tokio::spawn(server.run(self.shutdown_token.clone())));
        self.emit_event(OrchestratorEvent::Listening { addr });

        self.tasks
            .push(Arc::clone(&self.persister).spawn(self.shutdown_token.clone()));
        debug!("Started persistence task");

        let control = Arc::new(ControlPlane {
            registry: Arc::clone(&self.registry),
            multiplexer: Arc::clone(&self.multiplexer),
            started_at: Instant::now(),
            bind_addr: addr,
            stop_requested: self.stop_requested.clone(),
            event_tx: self.event_tx.clone(),
        });
        self.tasks.push(tokio::spawn(ipc_server.serve(
            move |request| {
                let control = Arc::clone(&control);
                async move { control.handle(request).await }
            },
            self.shutdown_token.clone(),
        )));

        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Running agents are stopped, sockets closed, the snapshot flushed a final
    /// time and the PID file removed.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.registry.shutdown().await;
        self.multiplexer.close_all();

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task failed"),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        self.pid_file = None;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Address the WebSocket server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry<B>> {
        &self.registry
    }

    /// Returns the connection multiplexer.
    pub fn multiplexer(&self) -> &Arc<ConnectionMultiplexer<B>> {
        &self.multiplexer
    }

    /// Returns the message router.
    pub fn router(&self) -> &Arc<MessageRouter<B>> {
        &self.router
    }

    /// Path of the IPC socket.
    pub fn ipc_socket(&self) -> &Path {
        &self.control_paths.socket
    }

    /// Returns the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.multiplexer.connection_count()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Cancelled when a CLI `stop` arrives over IPC.
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop_requested.clone()
    }
}
