//! Structured job-event logging.
//!
//! Every lifecycle transition and every byte of command output becomes a
//! line-delimited JSON event in a local log file. Depending on the job's
//! logger descriptor the file either stays local for the control plane to
//! pull, or a push task ships it to a remote sink with at-least-once
//! delivery.

mod file_backend;
mod http_backend;

pub use file_backend::FileBackend;
pub use http_backend::HttpBackend;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::error;

use crate::api::{LoggerMethod, LoggerSpec};

/// Default pull-mode log location, also served by the legacy local
/// endpoint.
pub fn default_log_path() -> PathBuf {
    std::env::temp_dir().join("job_log.json")
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("log push to {url} failed: HTTP {status}")]
    PushFailed { url: String, status: u16 },

    #[error("logger is closed")]
    Closed,
}

pub type Result<T, E = LoggerError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Passed,
    Failed,
    Stopped,
}

impl std::fmt::Display for JobResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobResult::Passed => write!(f, "passed"),
            JobResult::Failed => write!(f, "failed"),
            JobResult::Stopped => write!(f, "stopped"),
        }
    }
}

/// One line in the job log. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted {
        timestamp: i64,
    },
    JobFinished {
        result: JobResult,
        timestamp: i64,
    },
    CommandStarted {
        directive: String,
        timestamp: i64,
    },
    CommandOutput {
        output: String,
        timestamp: i64,
    },
    CommandFinished {
        directive: String,
        exit_code: i32,
        started_at: i64,
        finished_at: i64,
        timestamp: i64,
    },
}

/// Captures events in memory. Only used by tests that assert on the
/// exact event stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    events: std::sync::Arc<std::sync::Mutex<Vec<JobEvent>>>,
}

impl MemoryBackend {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().expect("memory backend lock").clone()
    }
}

enum Backend {
    File(FileBackend),
    Http(HttpBackend),
    Memory(MemoryBackend),
}

/// Job-event sink shared by the job runner and its executor.
pub struct Logger {
    backend: Mutex<Option<Backend>>,
}

impl Logger {
    /// Logger for the job request's descriptor: push method gets an HTTP
    /// backend, everything else a local file the control plane pulls.
    pub fn create(client: reqwest::Client, spec: &LoggerSpec) -> Result<Logger> {
        match spec.method {
            LoggerMethod::Push => Logger::http(client, &spec.url, &spec.token),
            LoggerMethod::Pull => Logger::file(&default_log_path()),
        }
    }

    pub fn file(path: &Path) -> Result<Logger> {
        let mut backend = FileBackend::new(path);
        backend.open()?;
        Ok(Logger { backend: Mutex::new(Some(Backend::File(backend))) })
    }

    pub fn http(client: reqwest::Client, url: &str, token: &str) -> Result<Logger> {
        let mut backend = HttpBackend::new(client, url, token)?;
        backend.open()?;
        Ok(Logger { backend: Mutex::new(Some(Backend::Http(backend))) })
    }

    /// In-memory logger plus a handle for reading back the captured
    /// events after the job closed it.
    pub fn memory() -> (Logger, MemoryBackend) {
        let backend = MemoryBackend::default();
        let logger =
            Logger { backend: Mutex::new(Some(Backend::Memory(backend.clone()))) };
        (logger, backend)
    }

    /// Path of the underlying log file.
    pub async fn path(&self) -> Result<PathBuf> {
        match self.backend.lock().await.as_ref() {
            Some(Backend::File(backend)) => Ok(backend.path().to_path_buf()),
            Some(Backend::Http(backend)) => Ok(backend.path().to_path_buf()),
            Some(Backend::Memory(_)) | None => Err(LoggerError::Closed),
        }
    }

    pub async fn write(&self, event: JobEvent) -> Result<()> {
        match self.backend.lock().await.as_mut() {
            Some(Backend::File(backend)) => backend.write(&event),
            Some(Backend::Http(backend)) => backend.write(&event),
            Some(Backend::Memory(backend)) => {
                backend.events.lock().expect("memory backend lock").push(event);
                Ok(())
            }
            None => Err(LoggerError::Closed),
        }
    }

    /// Close the backend: for the HTTP variant this performs the final
    /// push with bounded retry. The log file is removed either way.
    pub async fn close(&self) -> Result<()> {
        match self.backend.lock().await.take() {
            Some(Backend::File(mut backend)) => backend.close(),
            Some(Backend::Http(backend)) => backend.close().await,
            Some(Backend::Memory(_)) => Ok(()),
            None => Err(LoggerError::Closed),
        }
    }

    pub async fn log_job_started(&self) {
        self.log(JobEvent::JobStarted { timestamp: now() }).await;
    }

    pub async fn log_job_finished(&self, result: JobResult) {
        self.log(JobEvent::JobFinished { result, timestamp: now() }).await;
    }

    pub async fn log_command_started(&self, directive: &str) {
        self.log(JobEvent::CommandStarted { directive: directive.to_string(), timestamp: now() })
            .await;
    }

    pub async fn log_command_output(&self, output: &str) {
        self.log(JobEvent::CommandOutput { output: output.to_string(), timestamp: now() })
            .await;
    }

    pub async fn log_command_finished(
        &self,
        directive: &str,
        exit_code: i32,
        started_at: i64,
        finished_at: i64,
    ) {
        self.log(JobEvent::CommandFinished {
            directive: directive.to_string(),
            exit_code,
            started_at,
            finished_at,
            timestamp: now(),
        })
        .await;
    }

    async fn log(&self, event: JobEvent) {
        if let Err(err) = self.write(event).await {
            error!("Error writing event to the log: {}", err);
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_an_event_tag() {
        let event = JobEvent::CommandStarted { directive: "echo hello".into(), timestamp: 100 };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"event":"command_started","directive":"echo hello","timestamp":100}"#
        );

        let event = JobEvent::JobFinished { result: JobResult::Passed, timestamp: 101 };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"job_finished","result":"passed","timestamp":101}"#);
    }

    #[tokio::test]
    async fn file_logger_writes_one_event_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");
        let logger = Logger::file(&path).unwrap();

        logger.log_job_started().await;
        logger.log_command_started("echo hello").await;
        logger.log_command_output("hello\n").await;
        logger.log_command_finished("echo hello", 0, 1, 2).await;
        logger.log_job_finished(JobResult::Passed).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);

        let first: JobEvent = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(first, JobEvent::JobStarted { .. }));
        let last: JobEvent = serde_json::from_str(lines[4]).unwrap();
        assert!(matches!(last, JobEvent::JobFinished { result: JobResult::Passed, .. }));

        logger.close().await.unwrap();
        assert!(!path.exists(), "close removes the log file");
    }
}
