//! Scripted process bridge for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use super::bridge::{BridgeConfig, BridgeError, BridgeEvent, BridgeRun, ProcessBridge, SessionId};

/// A bridge whose "processes" are channels driven by the test.
#[derive(Default)]
pub struct MockBridge {
    runs: Mutex<HashMap<SessionId, mpsc::Sender<BridgeEvent>>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub inputs: Mutex<Vec<(SessionId, String)>>,
    pub resizes: Mutex<Vec<(SessionId, u16, u16)>>,
    pub configs: Mutex<Vec<BridgeConfig>>,
    pub fail_spawn: AtomicBool,
    pub fail_stop: AtomicBool,
    /// When set, `stop` leaves the run alive until the test calls `exit`.
    pub manual_exit: AtomicBool,
    pub start_delay: Mutex<Duration>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_delay(delay: Duration) -> Self {
        let bridge = Self::default();
        *bridge.start_delay.lock().unwrap() = delay;
        bridge
    }

    /// Emits one output chunk on the session's current run.
    pub async fn emit(&self, session_id: &str, text: &str) {
        let tx = self.runs.lock().unwrap().get(session_id).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(BridgeEvent::Output(text.to_string())).await;
        }
    }

    /// Ends the session's current run with an exit code.
    pub async fn exit(&self, session_id: &str, code: Option<i32>, signal: Option<&str>) {
        let tx = self.runs.lock().unwrap().remove(session_id);
        if let Some(tx) = tx {
            let _ = tx
                .send(BridgeEvent::Exit {
                    code,
                    signal: signal.map(str::to_string),
                })
                .await;
        }
    }
}

impl ProcessBridge for MockBridge {
    fn start(&self, session_id: &SessionId, config: BridgeConfig) -> Result<BridgeRun, BridgeError> {
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(BridgeError::SpawnFailed("mock spawn failure".to_string()));
        }

        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(session_id) {
            return Err(BridgeError::AlreadyRunning(session_id.clone()));
        }
        let (tx, rx) = mpsc::channel(64);
        runs.insert(session_id.clone(), tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().unwrap().push(config);
        Ok(BridgeRun {
            events: rx,
            pid: None,
        })
    }

    fn send_input(&self, session_id: &SessionId, data: &str) -> Result<(), BridgeError> {
        if !self.is_running(session_id) {
            return Err(BridgeError::NotRunning(session_id.clone()));
        }
        self.inputs
            .lock()
            .unwrap()
            .push((session_id.clone(), data.to_string()));
        Ok(())
    }

    fn resize(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), BridgeError> {
        if !self.is_running(session_id) {
            return Err(BridgeError::NotRunning(session_id.clone()));
        }
        self.resizes
            .lock()
            .unwrap()
            .push((session_id.clone(), cols, rows));
        Ok(())
    }

    fn stop(&self, session_id: &SessionId) -> Result<bool, BridgeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(BridgeError::KillFailed("mock kill failure".to_string()));
        }
        if self.manual_exit.load(Ordering::SeqCst) {
            return Ok(self.is_running(session_id));
        }
        match self.runs.lock().unwrap().remove(session_id) {
            Some(tx) => {
                let _ = tx.try_send(BridgeEvent::Exit {
                    code: None,
                    signal: Some("SIGTERM".to_string()),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn is_running(&self, session_id: &SessionId) -> bool {
        self.runs.lock().unwrap().contains_key(session_id)
    }
}
