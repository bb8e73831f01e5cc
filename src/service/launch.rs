//! Per-tool adapter construction: turns configuration into launch
//! descriptors (command, arguments, environment overlay, readiness
//! pattern) and wraps each in a [`ServiceAdapter`].

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::{BridgeServerConfig, ConsoleConfig, MsfrpcdConfig, OllamaConfig};
use crate::supervisor::managed_process::{ManagedProcessConfig, StdinMode};

use super::probe::LivenessProbe;
use super::ServiceAdapter;

fn env_overlay(extra: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> =
        extra.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    env.sort();
    env
}

/// Metasploit RPC daemon. Ready once MSGRPC announces its listener.
pub fn msfrpcd(cfg: &MsfrpcdConfig) -> ServiceAdapter {
    let mut args = vec![
        "-f".to_string(),
        "-a".to_string(),
        cfg.host.clone(),
        "-p".to_string(),
        cfg.port.to_string(),
        "-U".to_string(),
        cfg.username.clone(),
        "-P".to_string(),
        cfg.password.clone(),
    ];
    if !cfg.ssl {
        args.push("-S".to_string());
    }

    ServiceAdapter::new(
        "msfrpcd",
        "Metasploit RPC",
        "Metasploit RPC daemon backing the bridge",
        cfg.auto_start,
        false,
        ManagedProcessConfig {
            name: "msfrpcd".to_string(),
            program: cfg.path.clone(),
            args,
            env: env_overlay(&cfg.extra_env),
            working_dir: cfg.working_dir.as_ref().map(PathBuf::from),
            ready_pattern: Some(r"MSGRPC starting on".to_string()),
            stdin: StdinMode::Null,
        },
        None,
    )
}

/// The MCP SSE bridge server. The Metasploit credentials travel via the
/// environment overlay rather than the command line.
pub fn bridge(cfg: &BridgeServerConfig, msf: &MsfrpcdConfig) -> ServiceAdapter {
    let mut env = env_overlay(&cfg.extra_env);
    env.push(("MSF_RPC_HOST".to_string(), msf.host.clone()));
    env.push(("MSF_RPC_PORT".to_string(), msf.port.to_string()));
    env.push(("MSF_RPC_USER".to_string(), msf.username.clone()));
    env.push(("MSF_RPC_PASS".to_string(), msf.password.clone()));
    env.push(("MSF_RPC_SSL".to_string(), msf.ssl.to_string()));

    ServiceAdapter::new(
        "bridge",
        "MCP Bridge",
        "MCP SSE bridge between clients and Metasploit",
        cfg.auto_start,
        false,
        ManagedProcessConfig {
            name: "bridge".to_string(),
            program: cfg.python.clone(),
            args: vec![
                cfg.script.clone(),
                "--host".to_string(),
                cfg.host.clone(),
                "--port".to_string(),
                cfg.port.to_string(),
            ],
            env,
            working_dir: cfg.working_dir.as_ref().map(PathBuf::from),
            // uvicorn prints this once the SSE endpoint is reachable
            ready_pattern: Some(r"Application startup complete|Uvicorn running on".to_string()),
            stdin: StdinMode::Null,
        },
        None,
    )
}

/// Interactive msfconsole session. No readiness pattern: the console is
/// usable as soon as it spawns, and input is line-oriented over stdin.
pub fn console(cfg: &ConsoleConfig) -> ServiceAdapter {
    ServiceAdapter::new(
        "console",
        "Metasploit Console",
        "interactive msfconsole session",
        cfg.auto_start,
        true,
        ManagedProcessConfig {
            name: "console".to_string(),
            program: cfg.path.clone(),
            args: vec!["-q".to_string()],
            env: env_overlay(&cfg.extra_env),
            working_dir: cfg.working_dir.as_ref().map(PathBuf::from),
            ready_pattern: None,
            stdin: StdinMode::Piped,
        },
        None,
    )
}

/// Ollama model server. May already be running outside the supervisor,
/// so a liveness probe watches the well-known local endpoint.
pub fn ollama(cfg: &OllamaConfig) -> ServiceAdapter {
    let mut env = env_overlay(&cfg.extra_env);
    env.push((
        "OLLAMA_HOST".to_string(),
        format!("{}:{}", cfg.host, cfg.port),
    ));

    let probe_url = format!("http://{}:{}/api/version", cfg.host, cfg.port);

    ServiceAdapter::new(
        "ollama",
        "Ollama",
        "local model server used by the bridge client",
        cfg.auto_start,
        false,
        ManagedProcessConfig {
            name: "ollama".to_string(),
            program: cfg.path.clone(),
            args: vec!["serve".to_string()],
            env,
            working_dir: None,
            ready_pattern: Some(r"Listening on".to_string()),
            stdin: StdinMode::Null,
        },
        Some(LivenessProbe::spawn("ollama", probe_url)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    #[test]
    fn msfrpcd_adapter_identity() {
        let cfg = MsfrpcdConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let adapter = msfrpcd(&cfg);
        assert_eq!(adapter.id(), "msfrpcd");
        assert!(adapter.auto_start());
        assert!(!adapter.supports_input());
    }

    #[tokio::test]
    async fn console_is_the_only_input_capable_adapter() {
        let cfg = BridgeConfig::default();
        assert!(console(&cfg.console).supports_input());
        assert!(!msfrpcd(&cfg.msfrpcd).supports_input());
        assert!(!bridge(&cfg.bridge, &cfg.msfrpcd).supports_input());
        assert!(!ollama(&cfg.ollama).supports_input());
    }

    #[tokio::test]
    async fn ollama_defaults_to_external_management() {
        let cfg = BridgeConfig::default();
        let adapter = ollama(&cfg.ollama);
        assert!(!adapter.auto_start());
    }
}
