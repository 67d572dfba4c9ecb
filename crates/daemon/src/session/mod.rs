//! Session management module.
//!
//! Sessions are long-lived containers for one agent process at a time. The
//! registry owns them, the bridge runs their agents in a PTY and the
//! multiplexer binds WebSocket connections to them.

pub mod bridge;
pub mod buffer;
#[cfg(test)]
pub mod mock;
pub mod multiplexer;
pub mod registry;
pub mod state;

pub use bridge::{BridgeError, BridgeEvent, CommandSpec, ProcessBridge, PtyBridge, SessionId};
pub use buffer::OutputBuffer;
pub use multiplexer::{
    ConnectionHandle, ConnectionId, ConnectionMultiplexer, ConnectionOutbound, MultiplexError,
};
pub use registry::{RegistrySettings, SessionRegistry};
pub use state::{BridgeState, Session, SessionError};
