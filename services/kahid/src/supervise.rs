//! Child program supervision.
//!
//! [`Supervisor`] owns the configured programs and implements the
//! process/group capabilities the control API consumes.  Each running
//! child gets three background tasks: one pump per output stream
//! (ring-buffer capture + `PROCESS_LOG_*` publication) and an exit
//! waiter that records the status and publishes the terminal state
//! event.  Stdin writes go through a per-child writer task so the
//! manager's methods stay synchronous.
//!
//! All methods that spawn or signal children must be called from within
//! a tokio runtime.

use crate::config::{KahiConfig, ProgramConfig, load_config_from_path};
use crate::control::{
    ConfigManager, ControlError, DaemonInfo, GroupManager, LogStream, ProcessInfo, ProcessManager,
    ProcessState, ReadyStatus, ReloadOutcome,
};
use kahi_events::{Event, EventBus, EventType};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const LOG_BUFFER_CAPACITY: usize = 64 * 1024;
const STOP_KILL_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Captured-output ring buffer
// ---------------------------------------------------------------------------

struct LogBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        if self.bytes.len() > self.capacity {
            let excess = self.bytes.len() - self.capacity;
            self.bytes.drain(..excess);
        }
    }

    /// Read up to `length` bytes starting at `offset`; a negative
    /// offset counts back from the end of the buffer.
    fn read(&self, offset: i64, length: usize) -> Vec<u8> {
        let len = self.bytes.len() as i64;
        let start = if offset < 0 {
            (len + offset).max(0)
        } else {
            offset.min(len)
        } as usize;
        self.bytes.iter().skip(start).take(length).copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Per-program state
// ---------------------------------------------------------------------------

struct Program {
    name: String,
    config: RwLock<ProgramConfig>,
    runtime: Mutex<ProgramRuntime>,
}

struct ProgramRuntime {
    state: ProcessState,
    pid: u32,
    started_at: Option<Instant>,
    exit_status: i32,
    /// Set by stop so the exit waiter lands on STOPPED, not EXITED.
    stopping: bool,
    /// Whether this program has ever been spawned (readiness tracking).
    launched: bool,
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stdout_log: LogBuffer,
    stderr_log: LogBuffer,
}

impl Program {
    fn new(name: String, config: ProgramConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config: RwLock::new(config),
            runtime: Mutex::new(ProgramRuntime {
                state: ProcessState::Stopped,
                pid: 0,
                started_at: None,
                exit_status: 0,
                stopping: false,
                launched: false,
                stdin_tx: None,
                stdout_log: LogBuffer::new(LOG_BUFFER_CAPACITY),
                stderr_log: LogBuffer::new(LOG_BUFFER_CAPACITY),
            }),
        })
    }

    fn group(&self) -> String {
        self.config
            .read()
            .group
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    bus: Arc<EventBus>,
    programs: RwLock<BTreeMap<String, Arc<Program>>>,
}

impl Supervisor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                programs: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Register a program and announce its group.
    pub fn add_program(&self, name: impl Into<String>, config: ProgramConfig) {
        let name = name.into();
        let program = Program::new(name.clone(), config);
        let group = program.group();
        self.shared.programs.write().insert(name, program);
        self.shared
            .bus
            .publish(Event::new(EventType::ProcessGroupAdded).with_entry("name", group));
    }

    /// Replace a program's configuration; takes effect on next start.
    pub fn update_program(&self, name: &str, config: ProgramConfig) -> bool {
        match self.shared.programs.read().get(name) {
            Some(program) => {
                *program.config.write() = config;
                true
            }
            None => false,
        }
    }

    /// Stop (best effort) and deregister a program.
    pub fn remove_program(&self, name: &str) -> Result<(), ControlError> {
        match self.shared.stop(name) {
            Ok(()) | Err(ControlError::NotRunning(_)) => {}
            Err(error) => return Err(error),
        }
        let removed = self.shared.programs.write().remove(name);
        match removed {
            Some(program) => {
                self.shared.bus.publish(
                    Event::new(EventType::ProcessGroupRemoved).with_entry("name", program.group()),
                );
                Ok(())
            }
            None => Err(ControlError::NoSuchProcess(name.to_owned())),
        }
    }

    pub fn load_programs(&self, programs: &BTreeMap<String, ProgramConfig>) {
        for (name, config) in programs {
            self.add_program(name.clone(), config.clone());
        }
    }

    /// Start every program marked autostart, logging failures.
    pub fn start_autostart(&self) {
        let names: Vec<String> = {
            let programs = self.shared.programs.read();
            programs
                .values()
                .filter(|program| program.config.read().autostart)
                .map(|program| program.name.clone())
                .collect()
        };
        for name in names {
            if let Err(error) = Shared::start(&self.shared, &name) {
                warn!(process = %name, error = %error, "autostart failed");
            }
        }
    }

    /// Signal every running child and wait (up to `timeout`) for all of
    /// them to reach a terminal state, escalating to SIGKILL past the
    /// deadline.
    pub async fn stop_all(&self, timeout: Duration) {
        let names: Vec<String> = self.shared.programs.read().keys().cloned().collect();
        for name in &names {
            match self.shared.stop(name) {
                Ok(()) | Err(ControlError::NotRunning(_)) => {}
                Err(error) => warn!(process = %name, error = %error, "stop failed"),
            }
        }
        let deadline = Instant::now() + timeout;
        let mut killed = false;
        loop {
            let still_running: Vec<(String, u32)> = {
                let programs = self.shared.programs.read();
                programs
                    .values()
                    .filter_map(|program| {
                        let runtime = program.runtime.lock();
                        (!is_terminal(runtime.state))
                            .then(|| (program.name.clone(), runtime.pid))
                    })
                    .collect()
            };
            if still_running.is_empty() {
                return;
            }
            if Instant::now() > deadline {
                if killed {
                    warn!("children survived SIGKILL grace period, giving up");
                    return;
                }
                for (name, pid) in &still_running {
                    warn!(process = %name, "stop deadline exceeded, sending SIGKILL");
                    if *pid != 0 {
                        let _ = deliver(*pid, Signal::SIGKILL);
                    }
                }
                killed = true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.shared.programs.read().contains_key(name)
    }

    pub fn state_of(&self, name: &str) -> Option<ProcessState> {
        self.shared
            .programs
            .read()
            .get(name)
            .map(|program| program.runtime.lock().state)
    }

    /// Autostart programs that have not yet been spawned (or are still
    /// starting) — the daemon is ready once this is empty.
    pub fn autostart_pending(&self) -> Vec<String> {
        let programs = self.shared.programs.read();
        programs
            .values()
            .filter(|program| {
                let runtime = program.runtime.lock();
                let autostart = program.config.read().autostart;
                (autostart && !runtime.launched) || runtime.state == ProcessState::Starting
            })
            .map(|program| program.name.clone())
            .collect()
    }
}

fn is_terminal(state: ProcessState) -> bool {
    matches!(
        state,
        ProcessState::Stopped | ProcessState::Exited | ProcessState::Fatal
    )
}

impl Shared {
    fn program(&self, name: &str) -> Result<Arc<Program>, ControlError> {
        self.programs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ControlError::NoSuchProcess(name.to_owned()))
    }

    fn announce(&self, program: &Arc<Program>, state: ProcessState) {
        self.bus.publish(
            Event::new(state.event_type())
                .with_entry("name", program.name.clone())
                .with_entry("group", program.group()),
        );
    }

    fn transition(&self, program: &Arc<Program>, state: ProcessState) {
        program.runtime.lock().state = state;
        self.announce(program, state);
    }

    fn start(shared: &Arc<Shared>, name: &str) -> Result<(), ControlError> {
        let program = shared.program(name)?;
        {
            // Claim the slot before spawning so concurrent starts race
            // on this lock, not on the spawn.
            let mut runtime = program.runtime.lock();
            if matches!(
                runtime.state,
                ProcessState::Starting | ProcessState::Running
            ) {
                return Err(ControlError::AlreadyStarted(name.to_owned()));
            }
            runtime.state = ProcessState::Starting;
        }
        shared.announce(&program, ProcessState::Starting);

        let config = program.config.read().clone();
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if config.stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                shared.transition(&program, ProcessState::Fatal);
                return Err(ControlError::Internal(format!("spawning {name}: {error}")));
            }
        };
        let pid = child.id().unwrap_or(0);
        let stdin_tx = child.stdin.take().map(spawn_stdin_writer);
        if let Some(stdout) = child.stdout.take() {
            Shared::spawn_output_pump(shared, &program, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            Shared::spawn_output_pump(shared, &program, LogStream::Stderr, stderr);
        }
        {
            let mut runtime = program.runtime.lock();
            runtime.pid = pid;
            runtime.started_at = Some(Instant::now());
            runtime.exit_status = 0;
            runtime.stopping = false;
            runtime.launched = true;
            runtime.stdin_tx = stdin_tx;
        }
        info!(process = %name, pid, "child spawned");
        shared.transition(&program, ProcessState::Running);
        Shared::spawn_exit_waiter(shared, &program, child);
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<(), ControlError> {
        let program = self.program(name)?;
        let pid = {
            let mut runtime = program.runtime.lock();
            if !matches!(
                runtime.state,
                ProcessState::Starting | ProcessState::Running
            ) || runtime.pid == 0
            {
                return Err(ControlError::NotRunning(name.to_owned()));
            }
            runtime.stopping = true;
            runtime.state = ProcessState::Stopping;
            runtime.pid
        };
        self.announce(&program, ProcessState::Stopping);
        deliver(pid, Signal::SIGTERM)
    }

    fn restart(shared: &Arc<Shared>, name: &str) -> Result<(), ControlError> {
        match shared.stop(name) {
            Ok(()) => {
                let shared = shared.clone();
                let name = name.to_owned();
                tokio::spawn(async move {
                    shared.respawn_when_stopped(name).await;
                });
                Ok(())
            }
            Err(ControlError::NotRunning(_)) => Shared::start(shared, name),
            Err(error) => Err(error),
        }
    }

    /// Restart tail: wait for the stopped child to reach a terminal
    /// state (escalating to SIGKILL past the deadline), then respawn.
    async fn respawn_when_stopped(self: Arc<Self>, name: String) {
        let deadline = Instant::now() + STOP_KILL_TIMEOUT;
        let mut killed = false;
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let Ok(program) = self.program(&name) else {
                return; // removed while restarting
            };
            let (state, pid) = {
                let runtime = program.runtime.lock();
                (runtime.state, runtime.pid)
            };
            if is_terminal(state) {
                break;
            }
            if Instant::now() > deadline && !killed {
                warn!(process = %name, "stop deadline exceeded during restart, sending SIGKILL");
                if pid != 0 {
                    let _ = deliver(pid, Signal::SIGKILL);
                }
                killed = true;
            }
        }
        if let Err(error) = Shared::start(&self, &name) {
            warn!(process = %name, error = %error, "restart respawn failed");
        }
    }

    fn spawn_output_pump(
        shared: &Arc<Shared>,
        program: &Arc<Program>,
        stream: LogStream,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) {
        let shared = shared.clone();
        let program = program.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        {
                            let mut runtime = program.runtime.lock();
                            let log = match stream {
                                LogStream::Stdout => &mut runtime.stdout_log,
                                LogStream::Stderr => &mut runtime.stderr_log,
                            };
                            log.push(&buf[..n]);
                        }
                        shared.bus.publish(
                            Event::new(stream.event_type())
                                .with_entry("name", program.name.clone())
                                .with_entry("group", program.group())
                                .with_entry(
                                    "data",
                                    String::from_utf8_lossy(&buf[..n]).into_owned(),
                                ),
                        );
                    }
                }
            }
        });
    }

    fn spawn_exit_waiter(shared: &Arc<Shared>, program: &Arc<Program>, mut child: Child) {
        let shared = shared.clone();
        let program = program.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let next = {
                let mut runtime = program.runtime.lock();
                runtime.pid = 0;
                runtime.started_at = None;
                runtime.stdin_tx = None;
                runtime.exit_status = match &status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(_) => -1,
                };
                if runtime.stopping {
                    ProcessState::Stopped
                } else {
                    ProcessState::Exited
                }
            };
            debug!(process = %program.name, status = ?status.ok(), "child exited");
            shared.transition(&program, next);
        });
    }

    fn info(&self, program: &Arc<Program>) -> ProcessInfo {
        let runtime = program.runtime.lock();
        let uptime = match (runtime.state, runtime.started_at) {
            (ProcessState::Running | ProcessState::Stopping, Some(started_at)) => {
                started_at.elapsed().as_secs()
            }
            _ => 0,
        };
        let description = match runtime.state {
            ProcessState::Running => format!("pid {}, uptime {}s", runtime.pid, uptime),
            ProcessState::Exited => format!("exited with status {}", runtime.exit_status),
            ProcessState::Fatal => "spawn failed".to_owned(),
            ProcessState::Stopped if !runtime.launched => "not started".to_owned(),
            state => state.as_str().to_ascii_lowercase(),
        };
        ProcessInfo {
            name: program.name.clone(),
            group: program.group(),
            state: runtime.state,
            statecode: runtime.state.code(),
            pid: runtime.pid,
            uptime,
            description,
            exitstatus: runtime.exit_status,
        }
    }

    fn group_members(&self, group: &str) -> Vec<Arc<Program>> {
        self.programs
            .read()
            .values()
            .filter(|program| program.group() == group)
            .cloned()
            .collect()
    }
}

fn spawn_stdin_writer(mut stdin: tokio::process::ChildStdin) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if stdin.write_all(&chunk).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "TERM" => Some(Signal::SIGTERM),
        "HUP" => Some(Signal::SIGHUP),
        "INT" => Some(Signal::SIGINT),
        "KILL" => Some(Signal::SIGKILL),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        "QUIT" => Some(Signal::SIGQUIT),
        _ => None,
    }
}

fn deliver(pid: u32, signal: Signal) -> Result<(), ControlError> {
    signal::kill(Pid::from_raw(pid as i32), signal).map_err(|error| {
        ControlError::Internal(format!("delivering {signal} to pid {pid}: {error}"))
    })
}

// ---------------------------------------------------------------------------
// Capability impls
// ---------------------------------------------------------------------------

impl ProcessManager for Supervisor {
    fn list(&self) -> Vec<ProcessInfo> {
        let programs = self.shared.programs.read();
        programs
            .values()
            .map(|program| self.shared.info(program))
            .collect()
    }

    fn get(&self, name: &str) -> Result<ProcessInfo, ControlError> {
        let program = self.shared.program(name)?;
        Ok(self.shared.info(&program))
    }

    fn start(&self, name: &str) -> Result<(), ControlError> {
        Shared::start(&self.shared, name)
    }

    fn stop(&self, name: &str) -> Result<(), ControlError> {
        self.shared.stop(name)
    }

    fn restart(&self, name: &str) -> Result<(), ControlError> {
        Shared::restart(&self.shared, name)
    }

    fn signal(&self, name: &str, signal_name: &str) -> Result<(), ControlError> {
        let Some(signal) = parse_signal(signal_name) else {
            return Err(ControlError::InvalidSignal(signal_name.to_owned()));
        };
        let program = self.shared.program(name)?;
        let pid = {
            let runtime = program.runtime.lock();
            if runtime.pid == 0 || is_terminal(runtime.state) {
                return Err(ControlError::NotRunning(name.to_owned()));
            }
            runtime.pid
        };
        deliver(pid, signal)
    }

    fn write_stdin(&self, name: &str, data: &[u8]) -> Result<(), ControlError> {
        let program = self.shared.program(name)?;
        let runtime = program.runtime.lock();
        if !matches!(
            runtime.state,
            ProcessState::Starting | ProcessState::Running
        ) {
            return Err(ControlError::NotRunning(name.to_owned()));
        }
        match &runtime.stdin_tx {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| ControlError::StdinNotAccepted(name.to_owned())),
            None => Err(ControlError::StdinNotAccepted(name.to_owned())),
        }
    }

    fn read_log(
        &self,
        name: &str,
        stream: LogStream,
        offset: i64,
        length: usize,
    ) -> Result<Vec<u8>, ControlError> {
        let program = self.shared.program(name)?;
        let runtime = program.runtime.lock();
        let log = match stream {
            LogStream::Stdout => &runtime.stdout_log,
            LogStream::Stderr => &runtime.stderr_log,
        };
        Ok(log.read(offset, length))
    }
}

impl GroupManager for Supervisor {
    fn list_groups(&self) -> Vec<String> {
        let programs = self.shared.programs.read();
        let groups: BTreeSet<String> =
            programs.values().map(|program| program.group()).collect();
        groups.into_iter().collect()
    }

    fn start_group(&self, name: &str) -> Result<(), ControlError> {
        let members = self.shared.group_members(name);
        if members.is_empty() {
            return Err(ControlError::NoSuchGroup(name.to_owned()));
        }
        for member in members {
            Shared::start(&self.shared, &member.name)?;
        }
        Ok(())
    }

    fn stop_group(&self, name: &str) -> Result<(), ControlError> {
        let members = self.shared.group_members(name);
        if members.is_empty() {
            return Err(ControlError::NoSuchGroup(name.to_owned()));
        }
        for member in members {
            self.shared.stop(&member.name)?;
        }
        Ok(())
    }

    fn restart_group(&self, name: &str) -> Result<(), ControlError> {
        let members = self.shared.group_members(name);
        if members.is_empty() {
            return Err(ControlError::NoSuchGroup(name.to_owned()));
        }
        for member in members {
            Shared::restart(&self.shared, &member.name)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Daemon introspection
// ---------------------------------------------------------------------------

pub struct Daemon {
    supervisor: Arc<Supervisor>,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(supervisor: Arc<Supervisor>) -> (Self, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self {
                supervisor,
                shutdown_tx,
            },
            shutdown_rx,
        )
    }
}

impl DaemonInfo for Daemon {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn is_ready(&self) -> bool {
        !self.is_shutting_down() && self.supervisor.autostart_pending().is_empty()
    }

    fn check_ready(&self, processes: &[String]) -> Result<ReadyStatus, ControlError> {
        let mut pending = Vec::new();
        for name in processes {
            match self.supervisor.state_of(name) {
                None => return Err(ControlError::NoSuchProcess(name.clone())),
                Some(ProcessState::Running) => {}
                Some(_) => pending.push(name.clone()),
            }
        }
        Ok(ReadyStatus {
            ready: pending.is_empty(),
            pending,
        })
    }

    fn version(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_owned(), "kahi".to_owned()),
            ("version".to_owned(), env!("CARGO_PKG_VERSION").to_owned()),
            ("pid".to_owned(), std::process::id().to_string()),
        ])
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ---------------------------------------------------------------------------
// Config manager
// ---------------------------------------------------------------------------

/// The live configuration plus the path it came from; `reload` re-reads
/// the file, diffs the program set, and applies additions/removals to
/// the supervisor.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<KahiConfig>,
    supervisor: Arc<Supervisor>,
}

impl ConfigStore {
    pub fn new(path: PathBuf, current: KahiConfig, supervisor: Arc<Supervisor>) -> Self {
        Self {
            path,
            current: RwLock::new(current),
            supervisor,
        }
    }
}

impl ConfigManager for ConfigStore {
    fn get_config(&self) -> serde_json::Value {
        self.current.read().to_sanitized_json()
    }

    fn reload(&self) -> Result<ReloadOutcome, ControlError> {
        let next =
            load_config_from_path(&self.path).map_err(|e| ControlError::Internal(e.to_string()))?;

        let (added, changed, removed) = {
            let current = self.current.read();
            let mut added = Vec::new();
            let mut changed = Vec::new();
            for (name, config) in &next.programs {
                match current.programs.get(name) {
                    None => added.push(name.clone()),
                    Some(existing) if existing != config => changed.push(name.clone()),
                    Some(_) => {}
                }
            }
            let removed: Vec<String> = current
                .programs
                .keys()
                .filter(|name| !next.programs.contains_key(*name))
                .cloned()
                .collect();
            (added, changed, removed)
        };

        for name in &removed {
            if let Err(error) = self.supervisor.remove_program(name) {
                warn!(process = %name, error = %error, "removing program on reload failed");
            }
        }
        for name in &added {
            self.supervisor
                .add_program(name.clone(), next.programs[name].clone());
        }
        for name in &changed {
            // New definition takes effect on the next (re)start.
            self.supervisor
                .update_program(name, next.programs[name].clone());
        }

        info!(
            added = added.len(),
            changed = changed.len(),
            removed = removed.len(),
            "configuration reloaded"
        );
        *self.current.write() = next;
        Ok(ReloadOutcome {
            added,
            changed,
            removed,
        })
    }
}
