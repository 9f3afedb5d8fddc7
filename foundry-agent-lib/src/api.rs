//! Wire model for job requests received from the control plane.
//!
//! A job request is immutable after receipt. Env var values and file
//! contents travel base64-encoded; decoding failures are job-fatal.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{0} is not valid base64: {1}")]
    InvalidBase64(String, base64::DecodeError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub commands: Vec<Command>,

    #[serde(default)]
    pub epilogue_always_commands: Vec<Command>,

    #[serde(default)]
    pub epilogue_on_pass_commands: Vec<Command>,

    #[serde(default)]
    pub epilogue_on_fail_commands: Vec<Command>,

    #[serde(default)]
    pub env_vars: Vec<EnvVar>,

    #[serde(default)]
    pub files: Vec<File>,

    #[serde(default)]
    pub callbacks: Callbacks,

    #[serde(default)]
    pub compose: Option<Compose>,

    /// Base64-encoded public keys to install on the host for SSH debugging.
    #[serde(default)]
    pub ssh_public_keys: Vec<String>,

    #[serde(default)]
    pub logger: LoggerSpec,
}

/// A single shell directive as authored by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub directive: String,

    /// Shown in the log in place of the directive when non-empty.
    #[serde(default)]
    pub alias: String,

    /// Logged as a warning line before the command output.
    #[serde(default)]
    pub warning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,

    /// Base64-encoded value.
    pub value: String,
}

impl EnvVar {
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        BASE64
            .decode(&self.value)
            .map_err(|e| DecodeError::InvalidBase64(format!("env var {}", self.name), e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    /// Destination path. Relative paths land under the home directory.
    pub path: String,

    /// Base64-encoded content.
    pub content: String,

    /// POSIX mode string, e.g. "0644".
    pub mode: String,
}

impl File {
    pub fn decode(&self) -> Result<Vec<u8>, DecodeError> {
        BASE64
            .decode(&self.content)
            .map_err(|e| DecodeError::InvalidBase64(format!("file {}", self.path), e))
    }

    /// Destination with relative paths anchored at `~/`.
    pub fn destination(&self) -> String {
        if self.path.starts_with('/') || self.path.starts_with('~') {
            self.path.clone()
        } else {
            format!("~/{}", self.path)
        }
    }
}

/// URLs to POST to when the job finishes and when teardown finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Callbacks {
    #[serde(default)]
    pub finished: String,

    #[serde(default)]
    pub teardown_finished: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Compose {
    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub host_setup_commands: Vec<Command>,

    #[serde(default)]
    pub image_pull_credentials: Vec<ImagePullCredentials>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    pub name: String,

    pub image: String,

    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
}

/// Registry credentials for pulling the job's images. The strategy is
/// carried in the `DOCKER_CREDENTIAL_TYPE` env var.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePullCredentials {
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,

    #[serde(default)]
    pub files: Vec<File>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullStrategy {
    DockerHub,
    Ecr,
    GenericDocker,
    Gcr,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("DOCKER_CREDENTIAL_TYPE is missing")]
    Missing,

    #[error("unknown credential type {0}")]
    Unknown(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ImagePullCredentials {
    pub fn strategy(&self) -> Result<ImagePullStrategy, StrategyError> {
        let var = self
            .env_vars
            .iter()
            .find(|v| v.name == "DOCKER_CREDENTIAL_TYPE")
            .ok_or(StrategyError::Missing)?;

        let value = String::from_utf8(var.decode()?).map_err(|_| {
            StrategyError::Unknown("credential type is not valid UTF-8".to_string())
        })?;

        match value.as_str() {
            "DockerHub" => Ok(ImagePullStrategy::DockerHub),
            "AWS_ECR" => Ok(ImagePullStrategy::Ecr),
            "GenericDocker" => Ok(ImagePullStrategy::GenericDocker),
            "GCR" => Ok(ImagePullStrategy::Gcr),
            other => Err(StrategyError::Unknown(other.to_string())),
        }
    }

    /// Decoded `K=V` pairs for handing to a login subprocess.
    pub fn to_cmd_env_vars(&self) -> Result<Vec<String>, DecodeError> {
        self.env_vars
            .iter()
            .map(|var| {
                let value = var.decode()?;
                Ok(format!("{}={}", var.name, String::from_utf8_lossy(&value)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggerMethod {
    /// Events stay in a local file the control plane pulls from.
    #[default]
    Pull,

    /// Events are pushed to a remote log sink.
    Push,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggerSpec {
    #[serde(default)]
    pub method: LoggerMethod,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &str) -> String {
        BASE64.encode(value.as_bytes())
    }

    #[test]
    fn parses_a_minimal_request() {
        let request: JobRequest = serde_json::from_str(
            r#"{
                "id": "job-1",
                "commands": [{"directive": "echo hello"}],
                "logger": {"method": "push", "url": "http://logs.test", "token": "t"}
            }"#,
        )
        .unwrap();

        assert_eq!(request.id, "job-1");
        assert_eq!(request.commands.len(), 1);
        assert_eq!(request.commands[0].directive, "echo hello");
        assert!(request.commands[0].alias.is_empty());
        assert_eq!(request.logger.method, LoggerMethod::Push);
        assert!(request.compose.is_none());
    }

    #[test]
    fn logger_defaults_to_pull() {
        let request: JobRequest = serde_json::from_str(r#"{"id": "job-2"}"#).unwrap();
        assert_eq!(request.logger.method, LoggerMethod::Pull);
    }

    #[test]
    fn file_destination_anchors_relative_paths_at_home() {
        let file = File {
            path: "a/b.txt".into(),
            content: encoded("hello"),
            mode: "0644".into(),
        };
        assert_eq!(file.destination(), "~/a/b.txt");

        let absolute = File { path: "/etc/motd".into(), ..file.clone() };
        assert_eq!(absolute.destination(), "/etc/motd");

        let tilde = File { path: "~/b.txt".into(), ..file };
        assert_eq!(tilde.destination(), "~/b.txt");
    }

    #[test]
    fn credential_strategy_is_read_from_env_vars() {
        let credentials = ImagePullCredentials {
            env_vars: vec![EnvVar {
                name: "DOCKER_CREDENTIAL_TYPE".into(),
                value: encoded("AWS_ECR"),
            }],
            files: vec![],
        };
        assert_eq!(credentials.strategy().unwrap(), ImagePullStrategy::Ecr);

        let unknown = ImagePullCredentials {
            env_vars: vec![EnvVar {
                name: "DOCKER_CREDENTIAL_TYPE".into(),
                value: encoded("Quay"),
            }],
            files: vec![],
        };
        assert!(unknown.strategy().is_err());

        let missing = ImagePullCredentials::default();
        assert!(missing.strategy().is_err());
    }

    #[test]
    fn cmd_env_vars_are_decoded() {
        let credentials = ImagePullCredentials {
            env_vars: vec![
                EnvVar { name: "A".into(), value: encoded("1") },
                EnvVar { name: "B".into(), value: encoded("2") },
            ],
            files: vec![],
        };
        assert_eq!(
            credentials.to_cmd_env_vars().unwrap(),
            vec!["A=1".to_string(), "B=2".to_string()]
        );
    }
}
