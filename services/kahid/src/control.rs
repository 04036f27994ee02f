//! Capability interfaces the control API consumes.
//!
//! The API never reaches into the supervisor directly; it talks to
//! these four traits.  Errors cross the boundary as [`ControlError`], a
//! tagged enum whose variants map one-to-one onto HTTP responses (see
//! `api::response::control_error`), so the HTTP classification is a
//! total match instead of message sniffing.

use kahi_events::EventType;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no such process: {0}")]
    NoSuchProcess(String),
    #[error("no such group: {0}")]
    NoSuchGroup(String),
    #[error("already started: {0}")]
    AlreadyStarted(String),
    #[error("process not running: {0}")]
    NotRunning(String),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error("process {0} does not accept stdin")]
    StdinNotAccepted(String),
    #[error("{0}")]
    Internal(String),
}

/// Lifecycle states of a supervised process, with the numeric codes
/// exposed as `statecode` in [`ProcessInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
}

impl ProcessState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Backoff => "BACKOFF",
            Self::Stopping => "STOPPING",
            Self::Exited => "EXITED",
            Self::Fatal => "FATAL",
        }
    }

    pub const fn code(self) -> u32 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 10,
            Self::Running => 20,
            Self::Backoff => 30,
            Self::Stopping => 40,
            Self::Exited => 100,
            Self::Fatal => 200,
        }
    }

    pub const fn event_type(self) -> EventType {
        match self {
            Self::Stopped => EventType::ProcessStateStopped,
            Self::Starting => EventType::ProcessStateStarting,
            Self::Running => EventType::ProcessStateRunning,
            Self::Backoff => EventType::ProcessStateBackoff,
            Self::Stopping => EventType::ProcessStateStopping,
            Self::Exited => EventType::ProcessStateExited,
            Self::Fatal => EventType::ProcessStateFatal,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which captured output stream of a process to read or tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    /// Parse the `{stream}` path segment; anything other than
    /// `stdout`/`stderr` is a client error.
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }

    pub const fn event_type(self) -> EventType {
        match self {
            Self::Stdout => EventType::ProcessLogStdout,
            Self::Stderr => EventType::ProcessLogStderr,
        }
    }
}

/// Snapshot of one supervised process, as served by the API.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub group: String,
    pub state: ProcessState,
    pub statecode: u32,
    /// 0 when no child is running.
    pub pid: u32,
    /// Seconds since the current child was spawned; 0 when not running.
    pub uptime: u64,
    pub description: String,
    pub exitstatus: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReadyStatus {
    pub ready: bool,
    pub pending: Vec<String>,
}

pub trait ProcessManager: Send + Sync {
    fn list(&self) -> Vec<ProcessInfo>;
    fn get(&self, name: &str) -> Result<ProcessInfo, ControlError>;
    fn start(&self, name: &str) -> Result<(), ControlError>;
    fn stop(&self, name: &str) -> Result<(), ControlError>;
    fn restart(&self, name: &str) -> Result<(), ControlError>;
    /// `signal` is a name from {TERM, HUP, INT, KILL, USR1, USR2, QUIT};
    /// the implementation validates and returns `InvalidSignal` otherwise.
    fn signal(&self, name: &str, signal: &str) -> Result<(), ControlError>;
    fn write_stdin(&self, name: &str, data: &[u8]) -> Result<(), ControlError>;
    /// Read up to `length` bytes from the captured log; a negative
    /// `offset` counts back from the end.
    fn read_log(
        &self,
        name: &str,
        stream: LogStream,
        offset: i64,
        length: usize,
    ) -> Result<Vec<u8>, ControlError>;
}

pub trait GroupManager: Send + Sync {
    fn list_groups(&self) -> Vec<String>;
    fn start_group(&self, name: &str) -> Result<(), ControlError>;
    fn stop_group(&self, name: &str) -> Result<(), ControlError>;
    fn restart_group(&self, name: &str) -> Result<(), ControlError>;
}

pub trait ConfigManager: Send + Sync {
    /// The effective configuration as a JSON document, secrets redacted.
    fn get_config(&self) -> serde_json::Value;
    fn reload(&self) -> Result<ReloadOutcome, ControlError>;
}

pub trait DaemonInfo: Send + Sync {
    fn is_shutting_down(&self) -> bool;
    fn is_ready(&self) -> bool;
    /// Readiness of the named processes.  Unknown names are an error
    /// (the caller maps it to a client error).
    fn check_ready(&self, processes: &[String]) -> Result<ReadyStatus, ControlError>;
    fn version(&self) -> BTreeMap<String, String>;
    fn pid(&self) -> u32;
    /// Request an asynchronous daemon shutdown; returns immediately.
    fn shutdown(&self);
}
