//! Out-of-band liveness probing for services that may already be running
//! outside supervisor control (currently Ollama).
//!
//! The probe polls a well-known local endpoint on a fixed interval and
//! keeps the latest result as display state. Probe failures are fully
//! absorbed here; they never raise to callers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed interval between probe attempts.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(8);

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ProbeStatus {
    pub external_running: bool,
    /// Human-readable reason for the current verdict.
    pub detail: String,
}

/// Background liveness probe. The polling task is aborted on drop.
pub struct LivenessProbe {
    status: Arc<Mutex<ProbeStatus>>,
    handle: tokio::task::JoinHandle<()>,
}

impl LivenessProbe {
    /// Start probing `url`. Must be called from within a tokio runtime.
    pub fn spawn(service: &str, url: String) -> Self {
        let status = Arc::new(Mutex::new(ProbeStatus {
            external_running: false,
            detail: "probe has not run yet".to_string(),
        }));
        let handle = tokio::spawn(probe_loop(
            service.to_string(),
            url,
            Arc::clone(&status),
        ));
        Self { status, handle }
    }

    pub fn external_running(&self) -> bool {
        self.status
            .lock()
            .map(|s| s.external_running)
            .unwrap_or(false)
    }

    pub fn status(&self) -> ProbeStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| ProbeStatus {
                external_running: false,
                detail: "probe state unavailable".to_string(),
            })
    }

    /// Overwrite the probe verdict directly (test hook).
    #[cfg(test)]
    pub fn set_status(&self, external_running: bool, detail: &str) {
        if let Ok(mut s) = self.status.lock() {
            s.external_running = external_running;
            s.detail = detail.to_string();
        }
    }
}

impl Drop for LivenessProbe {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn probe_loop(service: String, url: String, status: Arc<Mutex<ProbeStatus>>) {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("[{}] liveness probe disabled: {}", service, e);
            return;
        }
    };

    loop {
        let (running, detail) = match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => (
                true,
                format!("external instance responding at {}", url),
            ),
            Ok(resp) => (
                false,
                format!("probe got HTTP {} from {}", resp.status(), url),
            ),
            Err(e) => (false, format!("probe request failed: {}", e)),
        };

        if let Ok(mut st) = status.lock() {
            if st.external_running != running {
                tracing::info!("[{}] external liveness changed: {}", service, detail);
            }
            st.external_running = running;
            st.detail = detail;
        }

        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}
