//! # agentdeck Protocol Library
//!
//! Wire types shared by the agentdeck broker and its browser clients.
//!
//! ## Overview
//!
//! Every frame on the broker's WebSocket is a JSON object tagged by `type`.
//! Clients send [`ClientMessage`] values; the broker answers and pushes
//! [`ServerMessage`] values.
//!
//! ```text
//! browser ──ClientMessage──▶ broker ──▶ agent process (PTY)
//! browser ◀──ServerMessage── broker ◀── agent output
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{AgentKind, ClientMessage, ServerMessage};
//!
//! let msg = ClientMessage::from_json(r#"{"type":"start_bridge","kind":"claude"}"#).unwrap();
//! assert!(matches!(msg, ClientMessage::StartBridge(_)));
//!
//! let reply = ServerMessage::agent_started(AgentKind::Claude, "s1");
//! assert_eq!(reply.kind(), "claude_started");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`error`]: Frame codec errors

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    AgentKind, AgentStarted, ClientMessage, Connected, CreateSession, DeleteSession, Exit, Input,
    JoinSession, Notice, Output, Resize, ServerMessage, SessionCreated, SessionJoined,
    SessionList, SessionSummary, StartBridge, StartOptions, DEFAULT_REPLAY_LIMIT,
};
