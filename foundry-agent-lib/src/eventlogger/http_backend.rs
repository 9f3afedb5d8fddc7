//! HTTP push backend: a file backend plus a task that ships new lines to
//! a remote log sink once a second.
//!
//! Delivery is at-least-once: only a 200 advances the cursor, so a failed
//! push is simply replayed on the next tick. The server deduplicates on
//! `start_from`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::file_backend::{stream_file, FileBackend};
use super::{JobEvent, LoggerError, Result};
use crate::retry::retry_with_constant_wait;

const PUSH_INTERVAL: Duration = Duration::from_secs(1);
const CLOSE_PUSH_ATTEMPTS: usize = 5;
const CLOSE_PUSH_WAIT: Duration = Duration::from_secs(1);

struct PushState {
    client: reqwest::Client,
    url: String,
    token: String,
    path: PathBuf,

    /// Line number of the first not-yet-acknowledged log line. The lock
    /// also serializes pushes: read cursor, stream, push, advance.
    cursor: Mutex<usize>,
}

pub struct HttpBackend {
    file: FileBackend,
    state: Arc<PushState>,
    stop_tx: watch::Sender<bool>,
    push_task: Option<JoinHandle<()>>,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, url: &str, token: &str) -> Result<HttpBackend> {
        let path = std::env::temp_dir().join(format!(
            "job_log_{}.json",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        let state = Arc::new(PushState {
            client,
            url: url.to_string(),
            token: token.to_string(),
            path: path.clone(),
            cursor: Mutex::new(0),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let push_task = tokio::spawn(push_loop(Arc::clone(&state), stop_rx));

        debug!("Logs will be pushed to {}", url);

        Ok(HttpBackend {
            file: FileBackend::new(&path),
            state,
            stop_tx,
            push_task: Some(push_task),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn open(&mut self) -> Result<()> {
        self.file.open()
    }

    pub fn write(&mut self, event: &JobEvent) -> Result<()> {
        self.file.write(event)
    }

    /// Stop the push task, flush the remainder with bounded retry, then
    /// remove the file. The file goes away even when the flush fails; at
    /// that point the sink has everything we could deliver.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.push_task.take() {
            let _ = task.await;
        }

        let state = Arc::clone(&self.state);
        let result = retry_with_constant_wait(
            "Push logs",
            CLOSE_PUSH_ATTEMPTS,
            CLOSE_PUSH_WAIT,
            || push_logs(&state),
        )
        .await;

        match result {
            Ok(()) => info!("All logs successfully pushed to {}", self.state.url),
            Err(err) => error!("Could not push all logs to {}: {}", self.state.url, err),
        }

        self.file.close()
    }
}

async fn push_loop(state: Arc<PushState>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = push_logs(&state).await {
                    // No retry here: the next tick is the retry.
                    error!("Error pushing logs: {}", err);
                }
            }
            _ = stop_rx.changed() => {
                debug!("Stopped streaming logs");
                return;
            }
        }
    }
}

async fn push_logs(state: &PushState) -> Result<()> {
    let mut cursor = state.cursor.lock().await;

    let mut buffer = Vec::new();
    let next_cursor = stream_file(&state.path, *cursor, usize::MAX, &mut buffer)?;

    if next_cursor == *cursor {
        return Ok(());
    }

    let url = format!("{}?start_from={}", state.url, *cursor);
    debug!("Pushing logs to {}", url);

    let response = state
        .client
        .post(&url)
        .header(CONTENT_TYPE, "text/plain")
        .header(AUTHORIZATION, format!("Bearer {}", state.token))
        .body(buffer)
        .send()
        .await?;

    if response.status().as_u16() != 200 {
        return Err(LoggerError::PushFailed { url, status: response.status().as_u16() });
    }

    *cursor = next_cursor;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{JobResult, Logger};
    use super::*;
    use axum::extract::{Query, State};
    use axum::routing::post;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct SinkState {
        chunks: Vec<(usize, Vec<u8>)>,
        reject: usize,
    }

    async fn start_sink(reject: usize) -> (String, Arc<StdMutex<SinkState>>) {
        let state = Arc::new(StdMutex::new(SinkState { chunks: Vec::new(), reject }));

        let app_state = Arc::clone(&state);
        let app = Router::new()
            .route(
                "/logs",
                post(
                    |State(state): State<Arc<StdMutex<SinkState>>>,
                     Query(params): Query<HashMap<String, String>>,
                     body: axum::body::Bytes| async move {
                        let mut sink = state.lock().unwrap();
                        if sink.reject > 0 {
                            sink.reject -= 1;
                            return axum::http::StatusCode::SERVICE_UNAVAILABLE;
                        }
                        let start_from =
                            params.get("start_from").and_then(|v| v.parse().ok()).unwrap_or(0);
                        sink.chunks.push((start_from, body.to_vec()));
                        axum::http::StatusCode::OK
                    },
                ),
            )
            .with_state(app_state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/logs"), state)
    }

    fn received_lines(state: &Arc<StdMutex<SinkState>>) -> Vec<String> {
        let sink = state.lock().unwrap();
        let bytes: Vec<u8> = sink.chunks.iter().flat_map(|(_, body)| body.clone()).collect();
        String::from_utf8(bytes).unwrap().lines().map(String::from).collect()
    }

    #[tokio::test]
    async fn pushes_all_events_in_order() {
        let (url, sink) = start_sink(0).await;
        let logger = Logger::http(reqwest::Client::new(), &url, "secret").unwrap();

        logger.log_job_started().await;
        logger.log_command_started("echo hello").await;
        logger.log_command_output("hello\n").await;
        logger.log_command_finished("echo hello", 0, 1, 2).await;
        logger.log_job_finished(JobResult::Passed).await;
        logger.close().await.unwrap();

        let lines = received_lines(&sink);
        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("job_started"));
        assert!(lines[4].contains("job_finished"));
    }

    #[tokio::test]
    async fn cursor_only_advances_on_success() {
        let (url, sink) = start_sink(2).await;
        let logger = Logger::http(reqwest::Client::new(), &url, "secret").unwrap();

        logger.log_job_started().await;
        logger.log_job_finished(JobResult::Passed).await;

        // Close retries past the rejected attempts.
        logger.close().await.unwrap();

        let lines = received_lines(&sink);
        assert_eq!(lines.len(), 2);

        // start_from values must be monotonically non-decreasing.
        let sink = sink.lock().unwrap();
        let cursors: Vec<usize> = sink.chunks.iter().map(|(from, _)| *from).collect();
        assert!(cursors.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn close_removes_the_file_even_when_the_sink_is_gone() {
        let logger =
            Logger::http(reqwest::Client::new(), "http://127.0.0.1:1/logs", "secret").unwrap();
        let path = logger.path().await.unwrap();

        logger.log_job_started().await;
        assert!(path.exists());

        // The sink is unreachable; close still returns and removes the file.
        assert!(logger.close().await.is_ok());
        assert!(!path.exists());
    }
}
