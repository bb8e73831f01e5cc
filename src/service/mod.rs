//! Service adapters: one per downstream tool of the bridge stack.
//!
//! An adapter binds a launch descriptor (built from configuration in
//! [`launch`]) to a [`ManagedProcess`] and adds the tool-specific
//! start-gating: the auto-start flag short-circuit and, for Ollama, the
//! external liveness probe.

pub mod launch;
pub mod probe;

use serde::Serialize;

use crate::supervisor::managed_process::{
    LastExit, LogLine, LogSource, ManagedProcess, ManagedProcessConfig, ProcessError, ProcessEvent,
    StopSignal,
};
use crate::supervisor::state_machine::ProcessState;
use probe::LivenessProbe;

/// Read-only composite view of one service, produced on demand.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub id: String,
    pub label: String,
    pub description: String,
    pub auto_start: bool,
    /// Display state. Reports `running` when an external instance
    /// satisfies the liveness probe while no managed instance runs;
    /// `external` keeps the owned-vs-detected distinction.
    pub state: ProcessState,
    pub external: bool,
    pub pid: Option<u32>,
    pub last_exit: Option<LastExit>,
    pub logs: Vec<LogLine>,
}

pub struct ServiceAdapter {
    id: String,
    label: String,
    description: String,
    auto_start: bool,
    supports_input: bool,
    process: ManagedProcess,
    probe: Option<LivenessProbe>,
}

impl ServiceAdapter {
    pub fn new(
        id: &str,
        label: &str,
        description: &str,
        auto_start: bool,
        supports_input: bool,
        config: ManagedProcessConfig,
        probe: Option<LivenessProbe>,
    ) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            auto_start,
            supports_input,
            process: ManagedProcess::new(config),
            probe,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[allow(dead_code)]
    pub fn auto_start(&self) -> bool {
        self.auto_start
    }

    pub fn supports_input(&self) -> bool {
        self.supports_input
    }

    /// Bring the service up if its configuration asks for that.
    ///
    /// Auto-start disabled: report and return without side effects.
    /// External instance detected by the probe: skip spawning; the
    /// snapshot will reflect the external instance instead.
    pub async fn ensure_running(&self) -> Result<(), ProcessError> {
        if !self.auto_start {
            tracing::info!("[{}] auto-start disabled, not starting", self.id);
            return Ok(());
        }
        if let Some(probe) = &self.probe {
            if probe.external_running() {
                tracing::info!(
                    "[{}] external instance already running, skipping spawn",
                    self.id
                );
                return Ok(());
            }
        }
        self.process.start().await
    }

    pub async fn start(&self) -> Result<(), ProcessError> {
        self.process.start().await
    }

    pub async fn stop(&self, signal: StopSignal) -> Result<(), ProcessError> {
        self.process.stop(signal).await
    }

    pub async fn clear_logs(&self) {
        self.process.clear_logs().await;
    }

    pub async fn logs_since(&self, since_id: Option<u64>) -> Vec<LogLine> {
        self.process.logs_since(since_id).await
    }

    #[allow(dead_code)]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProcessEvent> {
        self.process.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn process(&self) -> &ManagedProcess {
        &self.process
    }

    /// Send one line of input to the tool's stdin, normalized to end
    /// with exactly one line terminator.
    ///
    /// The interactive-capability check is the registry's concern; this
    /// only fails when the process has no open input channel.
    pub async fn send_input(&self, line: &str) -> Result<(), ProcessError> {
        let normalized = format!("{}\n", line.trim_end_matches(['\r', '\n']));
        self.process.write_input(&normalized).await
    }

    /// Fresh snapshot of the service, never cached.
    pub async fn snapshot(&self) -> ServiceSnapshot {
        let info = self.process.get_info().await;
        let probe_status = self.probe.as_ref().map(|p| p.status());
        let external = probe_status
            .as_ref()
            .map(|s| s.external_running)
            .unwrap_or(false);

        let mut state = info.state;
        let mut logs = info.logs;
        if external && state == ProcessState::Stopped {
            // Display convenience only: the supervisor does not own the
            // external process and will never signal it.
            state = ProcessState::Running;
            if let Some(status) = &probe_status {
                logs.push(synthetic_line(&logs, status.detail.clone()));
            }
        }

        ServiceSnapshot {
            id: self.id.clone(),
            label: self.label.clone(),
            description: self.description.clone(),
            auto_start: self.auto_start,
            state,
            external,
            pid: info.pid,
            last_exit: info.last_exit,
            logs,
        }
    }
}

fn synthetic_line(logs: &[LogLine], content: String) -> LogLine {
    LogLine {
        id: logs.last().map(|l| l.id + 1).unwrap_or(0),
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        source: LogSource::System,
        content,
    }
}
