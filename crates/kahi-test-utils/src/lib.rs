//! Programmable fake collaborators for API-level tests.
//!
//! Each stub records the calls it receives and returns whatever the
//! test scripted, so suites can drive the control API without spawning
//! real children.

use kahi_events::EventBus;
use kahid::api::AppState;
use kahid::control::{
    ConfigManager, ControlError, DaemonInfo, GroupManager, LogStream, ProcessInfo, ProcessManager,
    ProcessState, ReadyStatus, ReloadOutcome,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A full set of stub collaborators wired into an [`AppState`], handed
/// back individually so tests can script and inspect them.
pub struct StubWorld {
    pub state: AppState,
    pub bus: Arc<EventBus>,
    pub processes: Arc<StubProcessManager>,
    pub groups: Arc<StubGroupManager>,
    pub config: Arc<StubConfigManager>,
    pub daemon: Arc<StubDaemon>,
}

impl StubWorld {
    pub fn new() -> Self {
        let bus = Arc::new(EventBus::new());
        let processes = Arc::new(StubProcessManager::default());
        let groups = Arc::new(StubGroupManager::default());
        let config = Arc::new(StubConfigManager::default());
        let daemon = Arc::new(StubDaemon::default());
        let state = AppState {
            bus: bus.clone(),
            processes: processes.clone(),
            groups: groups.clone(),
            config: config.clone(),
            daemon: daemon.clone(),
            auth: None,
        };
        Self {
            state,
            bus,
            processes,
            groups,
            config,
            daemon,
        }
    }
}

impl Default for StubWorld {
    fn default() -> Self {
        Self::new()
    }
}

pub fn process_info(name: &str, state: ProcessState) -> ProcessInfo {
    ProcessInfo {
        name: name.to_owned(),
        group: name.to_owned(),
        state,
        statecode: state.code(),
        pid: if state == ProcessState::Running { 4242 } else { 0 },
        uptime: 0,
        description: state.as_str().to_ascii_lowercase(),
        exitstatus: 0,
    }
}

type OpResult = Result<(), ControlError>;

fn clone_result(result: &OpResult) -> OpResult {
    match result {
        Ok(()) => Ok(()),
        Err(error) => Err(clone_error(error)),
    }
}

fn clone_error(error: &ControlError) -> ControlError {
    match error {
        ControlError::NoSuchProcess(name) => ControlError::NoSuchProcess(name.clone()),
        ControlError::NoSuchGroup(name) => ControlError::NoSuchGroup(name.clone()),
        ControlError::AlreadyStarted(name) => ControlError::AlreadyStarted(name.clone()),
        ControlError::NotRunning(name) => ControlError::NotRunning(name.clone()),
        ControlError::InvalidSignal(name) => ControlError::InvalidSignal(name.clone()),
        ControlError::StdinNotAccepted(name) => ControlError::StdinNotAccepted(name.clone()),
        ControlError::Internal(message) => ControlError::Internal(message.clone()),
    }
}

// ---------------------------------------------------------------------------
// Process manager stub
// ---------------------------------------------------------------------------

pub struct StubProcessManager {
    pub processes: Mutex<Vec<ProcessInfo>>,
    pub start_result: Mutex<OpResult>,
    pub stop_result: Mutex<OpResult>,
    pub restart_result: Mutex<OpResult>,
    pub signal_result: Mutex<OpResult>,
    pub stdin_result: Mutex<OpResult>,
    pub log_bytes: Mutex<Vec<u8>>,
    /// Every (name, signal) delivered through `signal`.
    pub signals_seen: Mutex<Vec<(String, String)>>,
    /// Every (name, data) forwarded through `write_stdin`.
    pub stdin_seen: Mutex<Vec<(String, Vec<u8>)>>,
    /// Every (name, stream, offset, length) passed to `read_log`.
    pub log_reads_seen: Mutex<Vec<(String, LogStream, i64, usize)>>,
}

impl Default for StubProcessManager {
    fn default() -> Self {
        Self {
            processes: Mutex::new(Vec::new()),
            start_result: Mutex::new(Ok(())),
            stop_result: Mutex::new(Ok(())),
            restart_result: Mutex::new(Ok(())),
            signal_result: Mutex::new(Ok(())),
            stdin_result: Mutex::new(Ok(())),
            log_bytes: Mutex::new(Vec::new()),
            signals_seen: Mutex::new(Vec::new()),
            stdin_seen: Mutex::new(Vec::new()),
            log_reads_seen: Mutex::new(Vec::new()),
        }
    }
}

impl StubProcessManager {
    pub fn with_processes(processes: Vec<ProcessInfo>) -> Arc<Self> {
        let stub = Self::default();
        *stub.processes.lock() = processes;
        Arc::new(stub)
    }
}

impl ProcessManager for StubProcessManager {
    fn list(&self) -> Vec<ProcessInfo> {
        self.processes.lock().clone()
    }

    fn get(&self, name: &str) -> Result<ProcessInfo, ControlError> {
        self.processes
            .lock()
            .iter()
            .find(|info| info.name == name)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchProcess(name.to_owned()))
    }

    fn start(&self, _name: &str) -> OpResult {
        clone_result(&self.start_result.lock())
    }

    fn stop(&self, _name: &str) -> OpResult {
        clone_result(&self.stop_result.lock())
    }

    fn restart(&self, _name: &str) -> OpResult {
        clone_result(&self.restart_result.lock())
    }

    fn signal(&self, name: &str, signal: &str) -> OpResult {
        self.signals_seen
            .lock()
            .push((name.to_owned(), signal.to_owned()));
        clone_result(&self.signal_result.lock())
    }

    fn write_stdin(&self, name: &str, data: &[u8]) -> OpResult {
        self.stdin_seen.lock().push((name.to_owned(), data.to_vec()));
        clone_result(&self.stdin_result.lock())
    }

    fn read_log(
        &self,
        name: &str,
        stream: LogStream,
        offset: i64,
        length: usize,
    ) -> Result<Vec<u8>, ControlError> {
        if self.get(name).is_err() {
            return Err(ControlError::NoSuchProcess(name.to_owned()));
        }
        self.log_reads_seen
            .lock()
            .push((name.to_owned(), stream, offset, length));
        Ok(self.log_bytes.lock().clone())
    }
}

// ---------------------------------------------------------------------------
// Group manager stub
// ---------------------------------------------------------------------------

pub struct StubGroupManager {
    pub groups: Mutex<Vec<String>>,
    pub op_result: Mutex<OpResult>,
    pub ops_seen: Mutex<Vec<(String, String)>>,
}

impl Default for StubGroupManager {
    fn default() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
            op_result: Mutex::new(Ok(())),
            ops_seen: Mutex::new(Vec::new()),
        }
    }
}

impl GroupManager for StubGroupManager {
    fn list_groups(&self) -> Vec<String> {
        self.groups.lock().clone()
    }

    fn start_group(&self, name: &str) -> OpResult {
        self.ops_seen.lock().push((name.to_owned(), "start".to_owned()));
        clone_result(&self.op_result.lock())
    }

    fn stop_group(&self, name: &str) -> OpResult {
        self.ops_seen.lock().push((name.to_owned(), "stop".to_owned()));
        clone_result(&self.op_result.lock())
    }

    fn restart_group(&self, name: &str) -> OpResult {
        self.ops_seen
            .lock()
            .push((name.to_owned(), "restart".to_owned()));
        clone_result(&self.op_result.lock())
    }
}

// ---------------------------------------------------------------------------
// Config manager stub
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StubConfigManager {
    pub config: Mutex<serde_json::Value>,
    pub reload_error: Mutex<Option<String>>,
    pub reload_outcome: Mutex<(Vec<String>, Vec<String>, Vec<String>)>,
}

impl ConfigManager for StubConfigManager {
    fn get_config(&self) -> serde_json::Value {
        self.config.lock().clone()
    }

    fn reload(&self) -> Result<ReloadOutcome, ControlError> {
        if let Some(message) = self.reload_error.lock().clone() {
            return Err(ControlError::Internal(message));
        }
        let (added, changed, removed) = self.reload_outcome.lock().clone();
        Ok(ReloadOutcome {
            added,
            changed,
            removed,
        })
    }
}

// ---------------------------------------------------------------------------
// Daemon info stub
// ---------------------------------------------------------------------------

pub struct StubDaemon {
    pub shutting_down: AtomicBool,
    pub ready: AtomicBool,
    /// Names `check_ready` reports as pending; an unknown-name error is
    /// simulated with [`StubDaemon::unknown_process`].
    pub pending: Mutex<Vec<String>>,
    pub unknown_process: Mutex<Option<String>>,
    pub shutdown_requested: AtomicBool,
}

impl Default for StubDaemon {
    fn default() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            pending: Mutex::new(Vec::new()),
            unknown_process: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
        }
    }
}

impl DaemonInfo for StubDaemon {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn check_ready(&self, _processes: &[String]) -> Result<ReadyStatus, ControlError> {
        if let Some(name) = self.unknown_process.lock().clone() {
            return Err(ControlError::NoSuchProcess(name));
        }
        let pending = self.pending.lock().clone();
        Ok(ReadyStatus {
            ready: pending.is_empty(),
            pending,
        })
    }

    fn version(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_owned(), "kahi".to_owned()),
            ("version".to_owned(), "0.0.0-test".to_owned()),
        ])
    }

    fn pid(&self) -> u32 {
        4242
    }

    fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }
}
