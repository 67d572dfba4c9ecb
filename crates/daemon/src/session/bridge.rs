//! Process bridge: launches an agent CLI under a PTY and streams its output.
//!
//! The broker talks to agent processes only through the [`ProcessBridge`]
//! trait. A successful [`ProcessBridge::start`] hands back a [`BridgeRun`]
//! whose receiver yields an ordered stream of [`BridgeEvent::Output`] and
//! [`BridgeEvent::Error`] events terminated by exactly one
//! [`BridgeEvent::Exit`]. Dropping the receiver cancels the run.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::AgentKind;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AgentsConfig;

/// Unique identifier for a session.
pub type SessionId = String;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Events buffered between the reader thread and the event pump.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long a process may ignore SIGTERM before it is killed outright.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Errors that can occur during bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A process is already running for the session.
    #[error("a process is already running for session {0}")]
    AlreadyRunning(SessionId),

    /// The process could not be launched.
    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    /// No process is running for the session.
    #[error("no process running for session {0}")]
    NotRunning(SessionId),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to terminate the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),
}

/// One event from a running agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Terminal output, valid UTF-8.
    Output(String),
    /// A non-fatal problem reported by the bridge.
    Error(String),
    /// The process ended. Always the last event of a run.
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}

/// Handle to a started process.
#[derive(Debug)]
pub struct BridgeRun {
    /// Ordered event stream for this run.
    pub events: mpsc::Receiver<BridgeEvent>,
    /// OS process id, when known.
    pub pid: Option<u32>,
}

/// Fully resolved command line for an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Builds the command for `kind` from the configured agents, appending
    /// per-start arguments after the configured ones.
    pub fn for_agent(kind: AgentKind, agents: &AgentsConfig, extra_args: &[String]) -> Self {
        let agent = agents.get(kind);
        let mut args = agent.args.clone();
        args.extend(extra_args.iter().cloned());
        Self {
            program: agent.program(kind).to_string(),
            args,
            env: agent
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Resolves the program to an executable path.
    pub fn resolve(&self) -> Result<PathBuf, BridgeError> {
        which::which(&self.program)
            .map_err(|e| BridgeError::SpawnFailed(format!("{}: {}", self.program, e)))
    }
}

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub kind: AgentKind,
    pub command: CommandSpec,
    pub working_dir: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Capability to run agent processes on behalf of sessions.
///
/// Implementations keep at most one process per session id. All methods are
/// synchronous; callers on the async runtime run `start` on a blocking thread.
pub trait ProcessBridge: Send + Sync + 'static {
    /// Launches a process for the session.
    fn start(&self, session_id: &SessionId, config: BridgeConfig) -> Result<BridgeRun, BridgeError>;

    /// Writes input to the session's process.
    fn send_input(&self, session_id: &SessionId, data: &str) -> Result<(), BridgeError>;

    /// Resizes the session's terminal.
    fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), BridgeError>;

    /// Asks the session's process to terminate. Idempotent.
    ///
    /// Returns whether a process was running.
    fn stop(&self, session_id: &SessionId) -> Result<bool, BridgeError>;

    /// Returns whether a process is running for the session.
    fn is_running(&self, session_id: &SessionId) -> bool;
}

/// Incremental UTF-8 decoder that never splits a code point across chunks.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes as much of the accumulated input as possible.
    ///
    /// A trailing incomplete sequence is held back for the next call; invalid
    /// bytes become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut start = 0;

        loop {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(text) => {
                    out.push_str(text);
                    start = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(
                        std::str::from_utf8(&self.pending[start..start + valid])
                            .unwrap_or_default(),
                    );
                    start += valid;
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += len;
                        }
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flushes whatever is left, replacing an incomplete tail.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

const NO_SIGNAL: u8 = 0;
const SENT_SIGTERM: u8 = 1;
const SENT_SIGKILL: u8 = 2;

/// A live PTY process.
struct PtyProcess {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    /// Strongest signal the bridge has sent.
    signal_sent: AtomicU8,
}

impl PtyProcess {
    fn kill(&self) -> Result<(), BridgeError> {
        self.signal_sent.store(SENT_SIGKILL, Ordering::SeqCst);
        if let Some(pid) = self.pid {
            if signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
                return Ok(());
            }
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| BridgeError::KillFailed("killer lock poisoned".to_string()))?;
        killer
            .kill()
            .map_err(|e| BridgeError::KillFailed(e.to_string()))
    }

    fn terminate(&self) -> Result<(), BridgeError> {
        let Some(pid) = self.pid else {
            return self.kill();
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                self.signal_sent.store(SENT_SIGTERM, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(pid = pid, error = %e, "SIGTERM failed, killing");
                self.kill()
            }
        }
    }

    fn exit_signal(&self) -> Option<String> {
        match self.signal_sent.load(Ordering::SeqCst) {
            SENT_SIGTERM => Some("SIGTERM".to_string()),
            SENT_SIGKILL => Some("SIGKILL".to_string()),
            _ => None,
        }
    }
}

/// [`ProcessBridge`] backed by native pseudo-terminals.
pub struct PtyBridge {
    processes: Arc<DashMap<SessionId, Arc<PtyProcess>>>,
}

impl PtyBridge {
    /// Creates a bridge with no running processes.
    pub fn new() -> Self {
        Self {
            processes: Arc::new(DashMap::new()),
        }
    }

    /// Number of running processes.
    pub fn running_count(&self) -> usize {
        self.processes.len()
    }

    fn process(&self, session_id: &SessionId) -> Result<Arc<PtyProcess>, BridgeError> {
        self.processes
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BridgeError::NotRunning(session_id.clone()))
    }
}

impl Default for PtyBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessBridge for PtyBridge {
    fn start(&self, session_id: &SessionId, config: BridgeConfig) -> Result<BridgeRun, BridgeError> {
        if self.processes.contains_key(session_id) {
            return Err(BridgeError::AlreadyRunning(session_id.clone()));
        }

        let program = config.command.resolve()?;
        if !config.working_dir.is_dir() {
            return Err(BridgeError::SpawnFailed(format!(
                "working directory does not exist: {}",
                config.working_dir.display()
            )));
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&config.command.args);
        cmd.cwd(&config.working_dir);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &config.command.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let handles = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                discard_child(child);
                return Err(BridgeError::SpawnFailed(e.to_string()));
            }
        };

        let process = Arc::new(PtyProcess {
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(child.clone_killer()),
            pid,
            signal_sent: AtomicU8::new(NO_SIGNAL),
        });

        let claimed = match self.processes.entry(session_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&process));
                true
            }
        };
        if !claimed {
            discard_child(child);
            return Err(BridgeError::AlreadyRunning(session_id.clone()));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let processes = Arc::clone(&self.processes);
        let id = session_id.clone();
        let reader_process = Arc::clone(&process);

        let spawned = std::thread::Builder::new()
            .name(format!("pty-{}", id.chars().take(8).collect::<String>()))
            .spawn(move || read_loop(id, reader, child, reader_process, processes, tx));

        if let Err(e) = spawned {
            self.processes.remove(session_id);
            let _ = process.kill();
            return Err(BridgeError::SpawnFailed(e.to_string()));
        }

        tracing::info!(
            session_id = %session_id,
            kind = %config.kind,
            pid = ?pid,
            program = %program.display(),
            cols = config.cols,
            rows = config.rows,
            "Spawned agent process"
        );

        Ok(BridgeRun { events: rx, pid })
    }

    fn send_input(&self, session_id: &SessionId, data: &str) -> Result<(), BridgeError> {
        let process = self.process(session_id)?;
        let mut writer = process
            .writer
            .lock()
            .map_err(|_| BridgeError::WriteFailed("writer lock poisoned".to_string()))?;
        writer
            .write_all(data.as_bytes())
            .map_err(|e| BridgeError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| BridgeError::WriteFailed(e.to_string()))
    }

    fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), BridgeError> {
        let process = self.process(session_id)?;
        let master = process
            .master
            .lock()
            .map_err(|_| BridgeError::ResizeFailed("master lock poisoned".to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BridgeError::ResizeFailed(e.to_string()))?;

        tracing::debug!(session_id = %session_id, cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    fn stop(&self, session_id: &SessionId) -> Result<bool, BridgeError> {
        let Ok(process) = self.process(session_id) else {
            return Ok(false);
        };
        if process.signal_sent.load(Ordering::SeqCst) != NO_SIGNAL {
            return Ok(true);
        }

        process.terminate()?;
        tracing::info!(session_id = %session_id, pid = ?process.pid, "Sent SIGTERM to agent");

        // Escalate if the process outlives the grace period.
        let processes = Arc::clone(&self.processes);
        let id = session_id.clone();
        let _ = std::thread::Builder::new()
            .name("pty-reaper".to_string())
            .spawn(move || {
                std::thread::sleep(KILL_GRACE);
                let still_running = processes
                    .get(&id)
                    .map(|entry| Arc::ptr_eq(entry.value(), &process))
                    .unwrap_or(false);
                if still_running {
                    tracing::warn!(session_id = %id, "Agent ignored SIGTERM, killing");
                    if let Err(e) = process.kill() {
                        tracing::error!(session_id = %id, error = %e, "Failed to kill agent");
                    }
                }
            });

        Ok(true)
    }

    fn is_running(&self, session_id: &SessionId) -> bool {
        self.processes.contains_key(session_id)
    }
}

/// Kills a child that never got a reader thread and reaps it.
fn discard_child(mut child: Box<dyn Child + Send + Sync>) {
    if let Err(e) = child.kill() {
        tracing::debug!(pid = ?child.process_id(), error = %e, "Kill of unused child failed");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = ?child.process_id(), error = %e, "Failed to reap unused child");
    }
}

/// Blocking reader thread body for one process.
fn read_loop(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    process: Arc<PtyProcess>,
    processes: Arc<DashMap<SessionId, Arc<PtyProcess>>>,
    tx: mpsc::Sender<BridgeEvent>,
) {
    let mut decoder = Utf8Decoder::default();
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut consumer_gone = false;

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if text.is_empty() {
                    continue;
                }
                if tx.blocking_send(BridgeEvent::Output(text)).is_err() {
                    consumer_gone = true;
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO on the master once the child side closes.
                tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                break;
            }
        }
    }

    if consumer_gone {
        tracing::debug!(session_id = %session_id, "Event receiver dropped, killing agent");
        if let Err(e) = process.kill() {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to kill agent");
        }
    } else {
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = tx.blocking_send(BridgeEvent::Output(rest));
        }
    }

    let exit = match child.wait() {
        Ok(status) => match process.exit_signal() {
            Some(signal) if !status.success() => BridgeEvent::Exit {
                code: None,
                signal: Some(signal),
            },
            _ => BridgeEvent::Exit {
                code: Some(status.exit_code() as i32),
                signal: None,
            },
        },
        Err(e) => {
            let _ = tx.blocking_send(BridgeEvent::Error(format!("wait failed: {}", e)));
            BridgeEvent::Exit {
                code: None,
                signal: process.exit_signal(),
            }
        }
    };

    processes.remove_if(&session_id, |_, current| Arc::ptr_eq(current, &process));
    tracing::info!(session_id = %session_id, exit = ?exit, "Agent process exited");
    let _ = tx.blocking_send(exit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentCommand;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shell_config(script: &str) -> BridgeConfig {
        BridgeConfig {
            kind: AgentKind::Claude,
            command: CommandSpec {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                env: vec![("AGENTDECK_TEST".to_string(), "marker-42".to_string())],
            },
            working_dir: std::env::temp_dir(),
            cols: 80,
            rows: 24,
        }
    }

    /// Drains a run until Exit, returning all output and the exit event.
    async fn drain(run: &mut BridgeRun) -> (String, BridgeEvent) {
        let mut output = String::new();
        loop {
            let event = timeout(Duration::from_secs(10), run.events.recv())
                .await
                .expect("timed out waiting for bridge event")
                .expect("event stream ended without exit");
            match event {
                BridgeEvent::Output(text) => output.push_str(&text),
                BridgeEvent::Error(_) => {}
                exit @ BridgeEvent::Exit { .. } => return (output, exit),
            }
        }
    }

    #[test]
    fn test_decoder_ascii() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_split_code_point() {
        let bytes = "héllo ✓".as_bytes();
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        assert_eq!(out, "héllo ✓");
    }

    #[test]
    fn test_decoder_holds_incomplete_tail() {
        let check = "✓".as_bytes();
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', check[0], check[1]]), "a");
        assert_eq!(decoder.decode(&check[2..]), "✓");
    }

    #[test]
    fn test_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_decoder_finish_replaces_truncated() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xe2, 0x9c]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_command_spec_for_agent() {
        let mut agents = AgentsConfig::default();
        agents.codex = AgentCommand {
            command: "/usr/local/bin/codex".to_string(),
            args: vec!["--full-auto".to_string()],
            env: [("CODEX_HOME".to_string(), "/tmp/codex".to_string())]
                .into_iter()
                .collect(),
        };

        let spec = CommandSpec::for_agent(AgentKind::Codex, &agents, &["--model".to_string()]);
        assert_eq!(spec.program, "/usr/local/bin/codex");
        assert_eq!(spec.args, vec!["--full-auto", "--model"]);
        assert_eq!(
            spec.env,
            vec![("CODEX_HOME".to_string(), "/tmp/codex".to_string())]
        );

        let spec = CommandSpec::for_agent(AgentKind::Gemini, &agents, &[]);
        assert_eq!(spec.program, "gemini");
        assert!(spec.args.is_empty());
    }

    #[test]
    fn test_resolve_missing_program() {
        let spec = CommandSpec {
            program: "agentdeck-definitely-not-installed".to_string(),
            args: vec![],
            env: vec![],
        };
        assert!(matches!(spec.resolve(), Err(BridgeError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_start_streams_output_then_exit() {
        let bridge = PtyBridge::new();
        let id = "s-output".to_string();
        let mut run = bridge
            .start(&id, shell_config("echo $AGENTDECK_TEST; exit 3"))
            .unwrap();

        let (output, exit) = drain(&mut run).await;
        assert!(output.contains("marker-42"), "output was {:?}", output);
        assert_eq!(
            exit,
            BridgeEvent::Exit {
                code: Some(3),
                signal: None
            }
        );
        assert!(run.events.recv().await.is_none());
        assert!(!bridge.is_running(&id));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let bridge = PtyBridge::new();
        let id = "s-twice".to_string();
        let mut run = bridge.start(&id, shell_config("exec sleep 5")).unwrap();

        let second = bridge.start(&id, shell_config("true"));
        assert!(matches!(second, Err(BridgeError::AlreadyRunning(_))));
        assert_eq!(bridge.running_count(), 1);

        assert!(bridge.stop(&id).unwrap());
        let _ = drain(&mut run).await;
    }

    #[tokio::test]
    async fn test_start_with_missing_working_dir() {
        let bridge = PtyBridge::new();
        let mut config = shell_config("true");
        config.working_dir = PathBuf::from("/nonexistent/agentdeck/dir");
        let result = bridge.start(&"s-dir".to_string(), config);
        assert!(matches!(result, Err(BridgeError::SpawnFailed(_))));
        assert_eq!(bridge.running_count(), 0);
    }

    #[tokio::test]
    async fn test_input_is_echoed() {
        let bridge = PtyBridge::new();
        let id = "s-input".to_string();
        let mut run = bridge.start(&id, shell_config("read line; echo got:$line")).unwrap();

        bridge.send_input(&id, "ping\n").unwrap();
        let (output, _) = drain(&mut run).await;
        assert!(output.contains("got:ping"), "output was {:?}", output);
    }

    #[tokio::test]
    async fn test_stop_reports_sigterm_and_is_idempotent() {
        let bridge = PtyBridge::new();
        let id = "s-stop".to_string();
        let mut run = bridge.start(&id, shell_config("exec sleep 30")).unwrap();

        assert!(bridge.stop(&id).unwrap());
        assert!(bridge.stop(&id).unwrap());

        let (_, exit) = drain(&mut run).await;
        assert_eq!(
            exit,
            BridgeEvent::Exit {
                code: None,
                signal: Some("SIGTERM".to_string())
            }
        );
        assert!(!bridge.stop(&id).unwrap());
    }

    #[tokio::test]
    async fn test_resize_and_input_without_process() {
        let bridge = PtyBridge::new();
        let id = "missing".to_string();
        assert!(matches!(
            bridge.send_input(&id, "x"),
            Err(BridgeError::NotRunning(_))
        ));
        assert!(matches!(
            bridge.resize(&id, 100, 30),
            Err(BridgeError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_resize_running_process() {
        let bridge = PtyBridge::new();
        let id = "s-resize".to_string();
        let mut run = bridge.start(&id, shell_config("exec sleep 30")).unwrap();
        assert!(bridge.resize(&id, 132, 50).is_ok());
        bridge.stop(&id).unwrap();
        let _ = drain(&mut run).await;
    }

    #[tokio::test]
    async fn test_dropping_receiver_kills_process() {
        let bridge = PtyBridge::new();
        let id = "s-drop".to_string();
        let run = bridge
            .start(&id, shell_config("while true; do echo tick; sleep 0.05; done"))
            .unwrap();
        drop(run);

        for _ in 0..100 {
            if !bridge.is_running(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process still running after receiver was dropped");
    }

    #[test]
    fn test_discarded_child_is_reaped() {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", "sleep 30"]);
        let child = pair.slave.spawn_command(cmd).unwrap();
        let pid = Pid::from_raw(child.process_id().unwrap() as i32);

        discard_child(child);

        // A zombie still accepts signal 0; a reaped pid does not.
        assert!(signal::kill(pid, None).is_err());
    }
}
