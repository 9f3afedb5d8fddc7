//! Configuration for the agent daemon.

use std::path::{Path, PathBuf};

use foundry_agent_lib::environment::HostEnvVar;
use foundry_agent_lib::executors::FileInjection;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure loaded from a TOML file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Hub (control plane) connection settings
    #[serde(default)]
    pub hub: HubConfig,
    /// Agent behavior settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// Legacy local endpoint settings (optional)
    #[serde(default)]
    pub server: ServerConfig,
}

/// Hub connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Hub host, e.g. "hub.example.com". Empty means the agent runs the
    /// legacy local endpoint instead of syncing with a hub.
    #[serde(default)]
    pub endpoint: String,

    /// URL scheme for hub requests
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Registration token
    #[serde(default)]
    pub token: String,

    /// Agent name; generated from the hostname when not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// How many times to retry registration before giving up
    #[serde(default = "default_register_retry_limit")]
    pub register_retry_limit: usize,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_register_retry_limit() -> usize {
    5
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            scheme: default_scheme(),
            token: String::new(),
            name: None,
            register_retry_limit: default_register_retry_limit(),
        }
    }
}

/// Agent behavior configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Plain-text env vars exported into every job
    #[serde(default)]
    pub env_vars: Vec<HostEnvVar>,

    /// Host files bind-mounted into compose jobs
    #[serde(default)]
    pub file_injections: Vec<FileInjection>,

    /// Abort jobs when an injected host file is missing instead of
    /// downgrading to a warning
    #[serde(default)]
    pub fail_on_missing_files: bool,

    /// Script executed right before the agent exits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_hook: Option<PathBuf>,

    /// Shut down once the current job finishes
    #[serde(default)]
    pub disconnect_after_job: bool,

    /// Shut down after this many idle seconds (0 disables)
    #[serde(default)]
    pub disconnect_after_idle_seconds: u64,

    /// Expose /dev/kvm to compose jobs
    #[serde(default)]
    pub expose_kvm_device: bool,
}

/// Legacy local endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// TLS certificate path (provisioned externally)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,

    /// TLS key path (provisioned externally)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            cert: None,
            key: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        // Expand ~ in paths
        config.agent.shutdown_hook = config.agent.shutdown_hook.map(|p| expand_tilde(&p));
        config.server.cert = config.server.cert.map(|p| expand_tilde(&p));
        config.server.key = config.server.key.map(|p| expand_tilde(&p));

        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {e}")))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the parts required to sync with a hub.
    pub fn validate_for_hub(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.hub.endpoint.is_empty() {
            errors.push("hub.endpoint: Hub host to sync with (e.g. \"hub.example.com\")");
        }

        if self.hub.token.is_empty() {
            errors.push("hub.token: Registration token issued by the hub");
        }

        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "Configuration incomplete\n\nPlease set:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }

    /// Validate the parts required for the legacy local endpoint.
    pub fn validate_for_server(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.server.cert.is_none() {
            errors.push("server.cert: TLS certificate path for the local endpoint");
        }

        if self.server.key.is_none() {
            errors.push("server.key: TLS key path for the local endpoint");
        }

        if !errors.is_empty() {
            return Err(Error::Config(format!(
                "Configuration incomplete\n\nPlease set:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("foundry-agent")
            .join("config.toml")
    }

    /// Get the default data directory (logs, scratch files).
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("foundry-agent")
    }
}

/// Expand ~ to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if path_str.starts_with("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(&path_str[2..]);
            }
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let path = Path::new("~/foo/bar");
        let expanded = expand_tilde(path);
        assert!(!expanded.to_string_lossy().contains('~'));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[hub]
endpoint = "hub.example.com"
token = "registration-token"

[agent]
disconnect_after_idle_seconds = 300

[[agent.env_vars]]
name = "CI"
value = "true"
"#;

        let config: Config = toml::from_str(toml).expect("Failed to parse config");
        assert_eq!(config.hub.endpoint, "hub.example.com");
        assert_eq!(config.hub.scheme, "https");
        assert_eq!(config.hub.register_retry_limit, 5);
        assert_eq!(config.agent.disconnect_after_idle_seconds, 300);
        assert_eq!(config.agent.env_vars.len(), 1);
        assert_eq!(config.server.port, 8000);
        assert!(config.validate_for_hub().is_ok());
    }

    #[test]
    fn test_validation_reports_missing_fields() {
        let config = Config::default();
        assert!(config.validate_for_hub().is_err());
        assert!(config.validate_for_server().is_err());
    }
}
