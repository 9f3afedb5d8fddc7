//! Error types for the agent daemon.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport error talking to the hub.
    #[error("API request failed: {0}")]
    Api(#[from] reqwest::Error),

    /// Non-200 response from the hub.
    #[error("request to {path} failed with HTTP {status}")]
    Hub { path: String, status: u16 },

    /// Registration gave up or was rejected.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Job construction error.
    #[error("Job error: {0}")]
    Job(#[from] foundry_agent_lib::job::JobError),

    /// TLS setup error for the local endpoint.
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 401/422 from the hub mean the registration token is bad or the
    /// request is malformed; retrying cannot help.
    pub fn is_non_retryable_registration(&self) -> bool {
        matches!(self, Error::Hub { status: 401 | 422, .. })
    }
}

/// Result type alias for the agent daemon.
pub type Result<T, E = Error> = std::result::Result<T, E>;
