//! Static configuration for the bridge supervisor.
//!
//! Loaded once at startup from a TOML file (default `config/bridge.toml`,
//! overridable via `BRIDGE_CONFIG_PATH`); never re-read afterwards.

use std::collections::HashMap;

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub control: ControlConfig,
    pub msfrpcd: MsfrpcdConfig,
    pub bridge: BridgeServerConfig,
    pub console: ConsoleConfig,
    pub ollama: OllamaConfig,
}

/// Bind address of the local control/status HTTP endpoint.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ControlConfig {
    pub listen_addr: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8790".to_string(),
        }
    }
}

/// Metasploit RPC daemon.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MsfrpcdConfig {
    pub path: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ssl: bool,
    pub auto_start: bool,
    pub working_dir: Option<String>,
    pub extra_env: HashMap<String, String>,
}

impl Default for MsfrpcdConfig {
    fn default() -> Self {
        Self {
            path: "msfrpcd".to_string(),
            host: "127.0.0.1".to_string(),
            port: 55553,
            username: "msf".to_string(),
            password: "msf".to_string(),
            ssl: false,
            auto_start: true,
            working_dir: None,
            extra_env: HashMap::new(),
        }
    }
}

/// The MCP SSE bridge server (a Python process).
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BridgeServerConfig {
    pub python: String,
    pub script: String,
    pub host: String,
    pub port: u16,
    pub auto_start: bool,
    pub working_dir: Option<String>,
    pub extra_env: HashMap<String, String>,
}

impl Default for BridgeServerConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            script: "bridge_server.py".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8085,
            auto_start: true,
            working_dir: None,
            extra_env: HashMap::new(),
        }
    }
}

/// Interactive msfconsole session (stdin-driven).
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub path: String,
    pub auto_start: bool,
    pub working_dir: Option<String>,
    pub extra_env: HashMap<String, String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            path: "msfconsole".to_string(),
            auto_start: false,
            working_dir: None,
            extra_env: HashMap::new(),
        }
    }
}

/// Ollama model server. Often run outside the supervisor, hence the
/// liveness probe and the disabled auto-start default.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OllamaConfig {
    pub path: String,
    pub host: String,
    pub port: u16,
    pub auto_start: bool,
    pub extra_env: HashMap<String, String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            path: "ollama".to_string(),
            host: "127.0.0.1".to_string(),
            port: 11434,
            auto_start: false,
            extra_env: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("BRIDGE_CONFIG_PATH")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let cfg: Self = toml::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("invalid config '{}': {}", path, e))?;
                Ok(cfg)
            }
            Err(_) => {
                tracing::info!("No config file at '{}', using defaults", path);
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.msfrpcd.port, 55553);
        assert!(cfg.msfrpcd.auto_start);
        assert!(!cfg.ollama.auto_start);
        assert_eq!(cfg.ollama.port, 11434);
        assert!(!cfg.control.listen_addr.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = BridgeConfig::load_from("/nonexistent/bridge.toml").unwrap();
        assert_eq!(cfg.msfrpcd.path, "msfrpcd");
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[msfrpcd]\npassword = \"s3cret\"\nport = 55554\n\n[ollama]\nauto_start = true\n"
        )
        .unwrap();

        let cfg = BridgeConfig::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.msfrpcd.password, "s3cret");
        assert_eq!(cfg.msfrpcd.port, 55554);
        // untouched sections keep their defaults
        assert_eq!(cfg.msfrpcd.username, "msf");
        assert!(cfg.ollama.auto_start);
        assert_eq!(cfg.bridge.port, 8085);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[msfrpcd\nport = oops").unwrap();
        assert!(BridgeConfig::load_from(file.path().to_str().unwrap()).is_err());
    }
}
