//! Local control plane used by the `agentdeck-daemon` CLI.
//!
//! The running broker listens on a Unix socket and answers newline-delimited
//! JSON requests: liveness, status, shutdown, and the session listing and
//! deletion operators need without opening a browser. A PID file next to the
//! broker's data lets the CLI detect a running instance and force-kill it.
//!
//! Both locations come from [`ControlPaths`]:
//! - socket: `$XDG_RUNTIME_DIR/agentdeck/daemon.sock`, or
//!   `<tmp>/agentdeck-<uid>/daemon.sock` when no runtime dir exists
//! - PID file: `$XDG_DATA_HOME/agentdeck/daemon.pid`
//!
//! ```rust,no_run
//! use daemon::ipc::{ControlPaths, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let paths = ControlPaths::resolve();
//!     let mut client = IpcClient::connect(&paths.socket).await?;
//!
//!     for session in client.list_sessions().await? {
//!         println!("{} {}", session.id, session.name);
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{DaemonStatus, IpcRequest, IpcResponse};
pub use pidfile::{read_live_pid, PidFile};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::{Path, PathBuf};

const APP_DIR: &str = "agentdeck";
const SOCKET_FILE: &str = "daemon.sock";
const PID_FILE: &str = "daemon.pid";

/// Where the control socket and PID file live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPaths {
    pub socket: PathBuf,
    pub pid_file: PathBuf,
}

impl ControlPaths {
    /// Per-user locations from the XDG environment.
    pub fn resolve() -> Self {
        Self::from_dirs(dirs::runtime_dir(), dirs::data_dir())
    }

    /// Both files inside one directory. Used to run isolated instances.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            socket: dir.join(SOCKET_FILE),
            pid_file: dir.join(PID_FILE),
        }
    }

    fn from_dirs(runtime_dir: Option<PathBuf>, data_dir: Option<PathBuf>) -> Self {
        let socket_dir = runtime_dir
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(private_tmp_dir);
        let pid_dir = data_dir
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(private_tmp_dir);

        Self {
            socket: socket_dir.join(SOCKET_FILE),
            pid_file: pid_dir.join(PID_FILE),
        }
    }

    /// PID of the broker owning these paths, if one is alive.
    ///
    /// Stale PID files are removed.
    pub fn running_pid(&self) -> Option<u32> {
        read_live_pid(&self.pid_file)
    }
}

/// `<tmp>/agentdeck-<uid>`, so users on one host do not share a socket.
fn private_tmp_dir() -> PathBuf {
    let uid = nix::unistd::Uid::current();
    std::env::temp_dir().join(format!("{}-{}", APP_DIR, uid))
}
