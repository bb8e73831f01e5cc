//! Managed Process - direct child-process supervision with stdio capture
//!
//! One `ManagedProcess` owns one external OS process:
//! - state machine driving (`stopped -> starting -> running -> stopping`)
//! - real-time stdout/stderr capture with incremental line reassembly
//! - bounded rolling log buffer that survives restarts until cleared
//! - readiness detection via a regex matched against raw output chunks
//! - stdin injection for interactive tools
//! - whole-process-tree termination

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use super::state_machine::{self, ProcessState};

/// Maximum number of log lines kept per process.
pub const LOG_BUFFER_LINES: usize = 200;

// ─── Errors ──────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },
    #[error("process '{name}' exited before becoming ready ({exit})")]
    ExitedBeforeReady { name: String, exit: String },
    #[error("failed to terminate process tree (pid {pid}): {reason}")]
    TerminationFailed { pid: u32, reason: String },
    #[error("no open input channel for '{name}'")]
    InputUnavailable { name: String },
    #[error("process '{name}' is {state:?}, cannot start")]
    Busy { name: String, state: ProcessState },
}

// ─── Launch descriptor ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdinMode {
    /// No input channel; the child reads EOF immediately.
    Null,
    /// Piped stdin, written to via `write_input`.
    Piped,
    /// Child inherits the supervisor's stdin.
    Inherit,
}

/// How a stop should be delivered to the process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSignal {
    Terminate,
    Interrupt,
}

/// Immutable launch descriptor, set once at construction.
#[derive(Debug, Clone)]
pub struct ManagedProcessConfig {
    /// Display name used in logs and traces.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    /// Environment overlay applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    /// Regex matched against raw output chunks to detect readiness.
    /// `None` means the process is considered ready as soon as it spawns.
    pub ready_pattern: Option<String>,
    pub stdin: StdinMode,
}

// ─── Log types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Narrative entries written by the supervisor itself.
    System,
}

/// A single captured line of output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for incremental polling (`?since=<id>`).
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
}

/// Last known termination of the child: one of the two fields populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl LastExit {
    fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for LastExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Observable event emitted by a managed process.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Output { source: LogSource, text: String },
    State(ProcessState),
}

// ─── Log buffer ──────────────────────────────────────────────

/// Ring buffer of the most recent output lines, oldest evicted first.
struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn new() -> Self {
        Self::with_capacity(LOG_BUFFER_LINES)
    }

    fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, content: String) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with `id > since_id`; `None` returns the whole buffer,
    /// so a first poll never misses line 0.
    fn get_since(&self, since_id: Option<u64>) -> Vec<LogLine> {
        self.lines
            .iter()
            .filter(|l| since_id.map_or(true, |s| l.id > s))
            .cloned()
            .collect()
    }

    fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.lines.clear();
    }
}

// ─── Line reassembly ─────────────────────────────────────────

/// Reassembles a byte stream into newline-delimited lines. A trailing
/// unterminated fragment is held back until more bytes arrive or the
/// stream closes.
struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    fn new() -> Self {
        Self {
            partial: Vec::new(),
        }
    }

    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            out.push(String::from_utf8_lossy(&line).into_owned());
        }
        out
    }

    /// Flush the held-back fragment at stream close, if any.
    fn finish(mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        Some(String::from_utf8_lossy(&self.partial).into_owned())
    }
}

// ─── Managed process ─────────────────────────────────────────

/// Live handle to the spawned child, present only while the process
/// is starting/running/stopping.
struct Runtime {
    pid: u32,
    stdin_tx: Option<mpsc::Sender<String>>,
    running_rx: watch::Receiver<bool>,
}

struct Shared {
    state: ProcessState,
    runtime: Option<Runtime>,
    last_exit: Option<LastExit>,
    /// Incremented on every successful start; lets tasks from an old
    /// run detect that they are stale before touching state.
    epoch: u64,
}

struct Inner {
    config: ManagedProcessConfig,
    ready_regex: Option<Regex>,
    shared: Mutex<Shared>,
    logs: Mutex<LogBuffer>,
    events: broadcast::Sender<ProcessEvent>,
    #[cfg(test)]
    fail_termination: AtomicBool,
}

impl Inner {
    /// Apply a state transition while holding the shared lock. Refused
    /// edges mean a stale task lost a race and are dropped.
    fn apply(&self, sh: &mut Shared, to: ProcessState) {
        match state_machine::transition(&self.config.name, &mut sh.state, to) {
            Ok(()) => {
                let _ = self.events.send(ProcessEvent::State(to));
            }
            Err(e) => {
                tracing::debug!("[{}] {}", self.config.name, e);
            }
        }
    }

    async fn push_log(&self, source: LogSource, content: String) {
        tracing::debug!("[{}][{:?}] {}", self.config.name, source, content);
        let line = self.logs.lock().await.push(source, content);
        let _ = self.events.send(ProcessEvent::Output {
            source,
            text: line.content,
        });
    }
}

/// One external OS process under supervision. Cloning shares the same
/// underlying process; state changes are serialized internally.
#[derive(Clone)]
pub struct ManagedProcess {
    inner: Arc<Inner>,
}

/// Read-only snapshot of a process's observable state. The logs are a
/// defensive copy; mutating them does not affect the process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub last_exit: Option<LastExit>,
    pub logs: Vec<LogLine>,
}

impl ManagedProcess {
    pub fn new(config: ManagedProcessConfig) -> Self {
        // Invalid readiness patterns degrade to "ready on spawn" rather
        // than making the service unstartable.
        let ready_regex = config.ready_pattern.as_deref().and_then(|pat| {
            match Regex::new(pat) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(
                        "[{}] invalid ready_pattern '{}': {}, treating as absent",
                        config.name,
                        pat,
                        e
                    );
                    None
                }
            }
        });
        let (events, _) = broadcast::channel::<ProcessEvent>(2048);
        Self {
            inner: Arc::new(Inner {
                config,
                ready_regex,
                shared: Mutex::new(Shared {
                    state: ProcessState::Stopped,
                    runtime: None,
                    last_exit: None,
                    epoch: 0,
                }),
                logs: Mutex::new(LogBuffer::new()),
                events,
                #[cfg(test)]
                fail_termination: AtomicBool::new(false),
            }),
        }
    }

    #[allow(dead_code)]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Spawn the process and wait until it is ready.
    ///
    /// Resolves once the readiness pattern matches (or immediately after
    /// spawning when none is configured). Errors if the executable could
    /// not be spawned or the process exited before becoming ready. A
    /// start while already starting/running is an idempotent no-op.
    pub async fn start(&self) -> Result<(), ProcessError> {
        let inner = &self.inner;
        let name = inner.config.name.clone();

        let mut sh = inner.shared.lock().await;
        match sh.state {
            ProcessState::Starting | ProcessState::Running => {
                tracing::debug!("[{}] start ignored: already {:?}", name, sh.state);
                return Ok(());
            }
            ProcessState::Stopping => {
                return Err(ProcessError::Busy {
                    name,
                    state: sh.state,
                });
            }
            ProcessState::Stopped => {}
        }
        sh.epoch += 1;
        let epoch = sh.epoch;
        inner.apply(&mut sh, ProcessState::Starting);

        let mut cmd = TokioCommand::new(&inner.config.program);
        cmd.args(&inner.config.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        match inner.config.stdin {
            StdinMode::Null => cmd.stdin(std::process::Stdio::null()),
            StdinMode::Piped => cmd.stdin(std::process::Stdio::piped()),
            StdinMode::Inherit => cmd.stdin(std::process::Stdio::inherit()),
        };
        if let Some(dir) = &inner.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &inner.config.env {
            cmd.env(key, value);
        }
        // Children get their own process group so stop() can reach the
        // whole tree, not just the immediate child.
        #[cfg(unix)]
        cmd.process_group(0);
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                inner.apply(&mut sh, ProcessState::Stopped);
                drop(sh);
                let msg = format!("Failed to spawn '{}': {}", inner.config.program, e);
                tracing::error!("[{}] {}", name, msg);
                inner.push_log(LogSource::System, msg).await;
                return Err(ProcessError::Spawn {
                    program: inner.config.program.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let (running_tx, running_rx) = watch::channel(true);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let ready_pending = Arc::new(AtomicBool::new(inner.ready_regex.is_some()));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stream(
                Arc::clone(inner),
                stdout,
                LogSource::Stdout,
                Arc::clone(&ready_pending),
                ready_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stream(
                Arc::clone(inner),
                stderr,
                LogSource::Stderr,
                Arc::clone(&ready_pending),
                ready_tx.clone(),
            ));
        }

        let stdin_tx = child.stdin.take().map(|mut handle| {
            let (tx, mut rx) = mpsc::channel::<String>(256);
            tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    if handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if handle.flush().await.is_err() {
                        break;
                    }
                }
            });
            tx
        });

        // Waiter: records the exit, settles the state and signals
        // everyone blocked on the running watch.
        {
            let inner = Arc::clone(inner);
            let name = name.clone();
            tokio::spawn(async move {
                let exit = match child.wait().await {
                    Ok(status) => LastExit::from_status(&status),
                    Err(e) => {
                        tracing::warn!("[{}] failed to wait for process: {}", name, e);
                        LastExit {
                            code: None,
                            signal: None,
                        }
                    }
                };
                let msg = format!("Process exited ({})", exit);
                {
                    let mut sh = inner.shared.lock().await;
                    if sh.epoch == epoch {
                        sh.last_exit = Some(exit);
                        sh.runtime = None;
                        if sh.state != ProcessState::Stopped {
                            inner.apply(&mut sh, ProcessState::Stopped);
                        }
                    }
                }
                tracing::info!("[{}] {}", name, msg);
                inner.push_log(LogSource::System, msg).await;
                let _ = running_tx.send(false);
            });
        }

        sh.last_exit = None;
        sh.runtime = Some(Runtime {
            pid,
            stdin_tx,
            running_rx: running_rx.clone(),
        });
        drop(sh);

        inner
            .push_log(LogSource::System, format!("Process started with PID {}", pid))
            .await;

        // Readiness wait
        if inner.ready_regex.is_none() {
            let mut sh = inner.shared.lock().await;
            if sh.epoch == epoch && sh.state == ProcessState::Starting {
                inner.apply(&mut sh, ProcessState::Running);
            }
            return Ok(());
        }

        let mut running_wait = running_rx.clone();
        loop {
            if *ready_rx.borrow() {
                let mut sh = inner.shared.lock().await;
                if sh.epoch == epoch && sh.state == ProcessState::Starting {
                    inner.apply(&mut sh, ProcessState::Running);
                    drop(sh);
                    inner
                        .push_log(LogSource::System, "Readiness pattern matched".to_string())
                        .await;
                }
                return Ok(());
            }
            if !*running_wait.borrow() {
                let exit = inner
                    .shared
                    .lock()
                    .await
                    .last_exit
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown exit".to_string());
                return Err(ProcessError::ExitedBeforeReady { name, exit });
            }
            // The waiter always publishes `false` before dropping its
            // sender, so this select cannot spin forever.
            tokio::select! {
                changed = ready_rx.changed() => { let _ = changed; }
                changed = running_wait.changed() => { let _ = changed; }
            }
        }
    }

    /// Terminate the whole process tree and wait for the OS to confirm.
    ///
    /// With no live handle this is an immediate idempotent success. On a
    /// delivery failure the state is left at `stopping` to flag an
    /// unknown condition needing operator attention.
    pub async fn stop(&self, signal: StopSignal) -> Result<(), ProcessError> {
        let inner = &self.inner;
        let name = &inner.config.name;

        let (pid, running_rx) = {
            let mut sh = inner.shared.lock().await;
            match sh.state {
                ProcessState::Stopped => {
                    tracing::debug!("[{}] stop ignored: no live process", name);
                    return Ok(());
                }
                ProcessState::Stopping => {
                    // A previous stop is in flight; wait for it to settle
                    // instead of signalling twice.
                    match sh.runtime.as_ref() {
                        Some(rt) => {
                            let rx = rt.running_rx.clone();
                            drop(sh);
                            wait_until_exited(rx).await;
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
                ProcessState::Starting | ProcessState::Running => {}
            }
            let rt = match sh.runtime.as_ref() {
                Some(rt) => rt,
                None => {
                    inner.apply(&mut sh, ProcessState::Stopped);
                    return Ok(());
                }
            };
            let pid = rt.pid;
            let rx = rt.running_rx.clone();
            inner.apply(&mut sh, ProcessState::Stopping);
            (pid, rx)
        };

        inner
            .push_log(
                LogSource::System,
                format!("Stop requested ({:?} signal)", signal),
            )
            .await;

        if let Err(reason) = self.deliver_signal(pid, signal) {
            tracing::error!("[{}] failed to terminate process tree {}: {}", name, pid, reason);
            inner
                .push_log(
                    LogSource::System,
                    format!("Failed to terminate process tree: {}", reason),
                )
                .await;
            return Err(ProcessError::TerminationFailed { pid, reason });
        }

        wait_until_exited(running_rx).await;
        Ok(())
    }

    fn deliver_signal(&self, pid: u32, signal: StopSignal) -> Result<(), String> {
        #[cfg(test)]
        if self.inner.fail_termination.load(Ordering::Relaxed) {
            return Err("signal delivery refused".to_string());
        }
        kill_process_tree(pid, signal)
    }

    /// Make the next stop fail at signal delivery (test hook).
    #[cfg(test)]
    pub(crate) fn fail_next_termination(&self) {
        self.inner.fail_termination.store(true, Ordering::Relaxed);
    }

    /// Write raw bytes to the child's stdin. No framing is added beyond
    /// what the caller supplies.
    pub async fn write_input(&self, text: &str) -> Result<(), ProcessError> {
        let unavailable = || ProcessError::InputUnavailable {
            name: self.inner.config.name.clone(),
        };
        let tx = {
            let sh = self.inner.shared.lock().await;
            match sh.state {
                ProcessState::Starting | ProcessState::Running => {
                    sh.runtime.as_ref().and_then(|rt| rt.stdin_tx.clone())
                }
                _ => None,
            }
        };
        let tx = tx.ok_or_else(unavailable)?;
        tx.send(text.to_string()).await.map_err(|_| unavailable())
    }

    /// Pure read of the observable state; logs are a defensive copy.
    pub async fn get_info(&self) -> ProcessInfo {
        let (state, pid, last_exit) = {
            let sh = self.inner.shared.lock().await;
            (
                sh.state,
                sh.runtime.as_ref().map(|rt| rt.pid),
                sh.last_exit.clone(),
            )
        };
        let logs = self.inner.logs.lock().await.snapshot();
        ProcessInfo {
            state,
            pid,
            last_exit,
            logs,
        }
    }

    #[allow(dead_code)]
    pub async fn state(&self) -> ProcessState {
        self.inner.shared.lock().await.state
    }

    /// All log lines with `id > since_id`, or every buffered line for
    /// `None`.
    pub async fn logs_since(&self, since_id: Option<u64>) -> Vec<LogLine> {
        self.inner.logs.lock().await.get_since(since_id)
    }

    /// Empty the log buffer. Safe in any state.
    pub async fn clear_logs(&self) {
        self.inner.logs.lock().await.clear();
    }

    /// Subscribe to output and state-change events.
    #[allow(dead_code)]
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }
}

async fn wait_until_exited(mut running_rx: watch::Receiver<bool>) {
    while *running_rx.borrow() {
        if running_rx.changed().await.is_err() {
            break;
        }
    }
}

/// Drive one stdio stream: readiness matching on raw chunks first, then
/// line reassembly into the log buffer.
async fn pump_stream<R>(
    inner: Arc<Inner>,
    mut reader: R,
    source: LogSource,
    ready_pending: Arc<AtomicBool>,
    ready_tx: watch::Sender<bool>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                // Readiness is decided on the raw chunk, before any line
                // splitting, and never re-fires once resolved.
                if ready_pending.load(Ordering::Acquire) {
                    if let Some(re) = &inner.ready_regex {
                        if re.is_match(&String::from_utf8_lossy(chunk)) {
                            ready_pending.store(false, Ordering::Release);
                            let _ = ready_tx.send(true);
                        }
                    }
                }
                for line in assembler.feed(chunk) {
                    inner.push_log(source, line).await;
                }
            }
        }
    }
    if let Some(rest) = assembler.finish() {
        inner.push_log(source, rest).await;
    }
}

// ─── Process-tree termination ────────────────────────────────

#[cfg(unix)]
fn kill_process_tree(pid: u32, signal: StopSignal) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Interrupt => Signal::SIGINT,
    };
    // The child was spawned as its own process group leader, so the
    // group id equals its pid.
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        // Group already gone; the waiter settles the state.
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32, _signal: StopSignal) -> Result<(), String> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    // taskkill /T reaches descendants; there is no graceful-signal
    // equivalent on this path.
    let output = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).into_owned())
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────
