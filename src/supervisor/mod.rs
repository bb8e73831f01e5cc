//! Registry of supervised services and the aggregate control surface
//! exposed to the CLI/HTTP boundary.

pub mod managed_process;
pub mod state_machine;

use std::sync::Arc;

use thiserror::Error;

use crate::config::BridgeConfig;
use crate::service::{launch, ServiceAdapter, ServiceSnapshot};
use managed_process::{LogLine, ProcessError, StopSignal};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("service '{0}' does not accept input")]
    UnsupportedOperation(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("failed to start: {}", .0.join("; "))]
    AutoStartFailed(Vec<String>),
}

/// Fixed, ordered set of named service adapters. The set never changes
/// after construction, so concurrent reads need no extra locking; each
/// adapter serializes its own state changes internally.
pub struct ServiceManager {
    services: Vec<Arc<ServiceAdapter>>,
}

impl ServiceManager {
    pub fn new(services: Vec<ServiceAdapter>) -> Self {
        Self {
            services: services.into_iter().map(Arc::new).collect(),
        }
    }

    /// Build the bridge stack registry. Order matters for `start_all`:
    /// upstream services come first.
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self::new(vec![
            launch::ollama(&cfg.ollama),
            launch::msfrpcd(&cfg.msfrpcd),
            launch::bridge(&cfg.bridge, &cfg.msfrpcd),
            launch::console(&cfg.console),
        ])
    }

    fn get(&self, id: &str) -> Result<&Arc<ServiceAdapter>, ControlError> {
        self.services
            .iter()
            .find(|s| s.id() == id)
            .ok_or_else(|| ControlError::UnknownService(id.to_string()))
    }

    /// Membership test for validating untrusted identifiers.
    #[allow(dead_code)]
    pub fn has_service(&self, id: &str) -> bool {
        self.services.iter().any(|s| s.id() == id)
    }

    /// Start every service whose configuration asks for it, attempting
    /// all of them even when some fail; the accumulated failures are
    /// reported as one error for the caller to react to.
    pub async fn start_auto_managed(&self) -> Result<(), ControlError> {
        let mut failed = Vec::new();
        for svc in &self.services {
            if let Err(e) = svc.ensure_running().await {
                tracing::error!("[{}] failed to come up: {}", svc.id(), e);
                failed.push(format!("{}: {}", svc.id(), e));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(ControlError::AutoStartFailed(failed))
        }
    }

    /// Start every service regardless of its auto-start flag, strictly
    /// in registry order; the first failure aborts the sequence, since
    /// later services assume earlier ones are up.
    #[allow(dead_code)]
    pub async fn start_all(&self) -> Result<(), ControlError> {
        for svc in &self.services {
            svc.start().await?;
        }
        Ok(())
    }

    /// Stop all services concurrently and independently. One failed
    /// stop never prevents the others; every outcome is returned.
    pub async fn stop_all(&self) -> Vec<(String, Result<(), ProcessError>)> {
        let mut handles = Vec::with_capacity(self.services.len());
        for svc in &self.services {
            let svc = Arc::clone(svc);
            handles.push(tokio::spawn(async move {
                (svc.id().to_string(), svc.stop(StopSignal::Terminate).await)
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((id, result)) => {
                    if let Err(e) = &result {
                        tracing::error!("[{}] stop failed: {}", id, e);
                    }
                    outcomes.push((id, result));
                }
                Err(e) => {
                    tracing::error!("stop task panicked: {}", e);
                }
            }
        }
        outcomes
    }

    pub async fn start_service(&self, id: &str) -> Result<(), ControlError> {
        self.get(id)?.start().await.map_err(Into::into)
    }

    pub async fn stop_service(&self, id: &str, signal: StopSignal) -> Result<(), ControlError> {
        self.get(id)?.stop(signal).await.map_err(Into::into)
    }

    pub async fn clear_service_logs(&self, id: &str) -> Result<(), ControlError> {
        self.get(id)?.clear_logs().await;
        Ok(())
    }

    /// Send one input line to an interactive service.
    pub async fn send_service_input(&self, id: &str, line: &str) -> Result<(), ControlError> {
        let svc = self.get(id)?;
        if !svc.supports_input() {
            return Err(ControlError::UnsupportedOperation(id.to_string()));
        }
        svc.send_input(line).await.map_err(Into::into)
    }

    /// Fresh snapshot of every service, in stable registry order.
    pub async fn get_status(&self) -> Vec<ServiceSnapshot> {
        let mut snapshots = Vec::with_capacity(self.services.len());
        for svc in &self.services {
            snapshots.push(svc.snapshot().await);
        }
        snapshots
    }

    pub async fn service_snapshot(&self, id: &str) -> Result<ServiceSnapshot, ControlError> {
        Ok(self.get(id)?.snapshot().await)
    }

    pub async fn service_logs_since(
        &self,
        id: &str,
        since_id: Option<u64>,
    ) -> Result<Vec<LogLine>, ControlError> {
        Ok(self.get(id)?.logs_since(since_id).await)
    }
}
