//! # agentdeck Daemon Library
//!
//! This crate provides the broker behind agentdeck: it runs interactive agent
//! CLIs (Claude, Codex, Gemini) inside pseudo-terminals and shares each one
//! with any number of browser tabs over WebSocket.
//!
//! ## Overview
//!
//! - **Sessions**: named workspaces bound to a working directory, each with at
//!   most one running agent and a bounded replay buffer of its output
//! - **Multiplexing**: many browser connections per session, with gap-free
//!   replay on join and ordered live fan-out
//! - **Persistence**: session metadata survives restarts via an atomic JSON
//!   snapshot
//! - **Control plane**: a Unix socket the CLI uses for status, listing,
//!   deletion and shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────────┐   │
//! │  │  WebSocket   │──▶│   Message    │──▶│    Connection      │   │
//! │  │   Server     │   │   Router     │   │    Multiplexer     │   │
//! │  └──────────────┘   └──────────────┘   └─────────┬──────────┘   │
//! │                                                  │              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌─────────▼──────────┐   │
//! │  │  IPC Server  │   │  Persister   │──▶│  Session Registry  │   │
//! │  └──────────────┘   └──────────────┘   └─────────┬──────────┘   │
//! │                                                  │              │
//! │                                        ┌─────────▼──────────┐   │
//! │                                        │   PTY Bridge       │   │
//! │                                        └────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until asked to stop...
//!     orchestrator.stop_requested().cancelled().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`ipc`]: Unix socket control plane for the CLI
//! - [`orchestrator`]: Component wiring and lifecycle
//! - [`paths`]: Working directory validation
//! - [`persistence`]: Durable session snapshots
//! - [`router`]: Client message dispatch
//! - [`server`]: WebSocket transport
//! - [`session`]: Sessions, bridges and connection fan-out

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod paths;
pub mod persistence;
pub mod router;
pub mod server;
pub mod session;

// Re-export protocol crate for convenience
pub use protocol;

// Configuration
pub use config::{Config, ConfigError};

// Sessions
pub use session::{
    BridgeState, ConnectionMultiplexer, ProcessBridge, PtyBridge, Session, SessionError,
    SessionId, SessionRegistry,
};

// Persistence
pub use persistence::{JsonSnapshotStore, Persister, SessionRecord, SnapshotStore};

// Routing and transport
pub use router::{MessageRouter, RouterError, RouterResult};
pub use server::{ServerError, WsServer};

// Orchestrator
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
