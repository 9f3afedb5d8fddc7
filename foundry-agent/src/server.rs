//! Legacy local endpoint: a TLS listener that accepts one job at a time
//! over HTTP instead of pulling from a hub.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use foundry_agent_lib::api::JobRequest;
use foundry_agent_lib::job::{Job, JobOptions, RunOptions};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

const STATE_WAITING: &str = "waiting for job";
const STATE_RECEIVED: &str = "received-job";
const STATE_STARTED: &str = "job-started";

struct ServerState {
    version: String,
    client: reqwest::Client,
    state: Mutex<String>,
    current_job: Mutex<Option<Arc<Job>>>,
    log_path: PathBuf,
}

impl ServerState {
    fn state(&self) -> String {
        self.state.lock().expect("server state lock").clone()
    }

    fn set_state(&self, state: &str) {
        *self.state.lock().expect("server state lock") = state.to_string();
    }
}

/// Serve the legacy endpoint until the process exits.
pub async fn serve(config: &ServerConfig, version: &str) -> Result<()> {
    let cert = config.cert.as_ref().ok_or_else(|| {
        Error::Config("server.cert is required for the local endpoint".to_string())
    })?;
    let key = config.key.as_ref().ok_or_else(|| {
        Error::Config("server.key is required for the local endpoint".to_string())
    })?;

    let tls_config = load_tls_config(cert, key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let state = Arc::new(ServerState {
        version: version.to_string(),
        client: reqwest::Client::new(),
        state: Mutex::new(STATE_WAITING.to_string()),
        current_job: Mutex::new(None),
        log_path: foundry_agent_lib::eventlogger::default_log_path(),
    });

    let app = router(state);

    let address = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Agent {} listening on https://{}", version, address);

    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let service = TowerToHyperService::new(app);
                    if let Err(err) = ConnectionBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!("Connection from {} ended: {}", peer, err);
                    }
                }
                Err(err) => warn!("TLS handshake with {} failed: {}", peer, err),
            }
        });
    }
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/jobs", post(run))
        .route("/stop", post(stop))
        .route("/jobs/{job_id}/log", get(logs))
        .with_state(state)
}

async fn status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "state": state.state(),
        "version": state.version,
    }))
}

async fn run(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<JobRequest>,
) -> impl IntoResponse {
    if state.state() != STATE_WAITING {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"message": "a job is already running"})),
        );
    }

    state.set_state(STATE_RECEIVED);

    let job = match Job::new(JobOptions::new(request, state.client.clone())) {
        Ok(job) => job,
        Err(err) => {
            error!("Could not construct job: {}", err);
            state.set_state(STATE_WAITING);
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"message": err.to_string()})),
            );
        }
    };

    *state.current_job.lock().expect("server job lock") = Some(Arc::clone(&job));
    state.set_state(STATE_STARTED);

    let teardown_state = Arc::clone(&state);
    let on_teardown = move || {
        teardown_state.current_job.lock().expect("server job lock").take();
        teardown_state.set_state(STATE_WAITING);
    };

    tokio::spawn(async move {
        job.run(RunOptions {
            on_successful_teardown: Some(Box::new(on_teardown.clone())),
            on_failed_teardown: Some(Box::new(on_teardown)),
            ..Default::default()
        })
        .await;
    });

    (StatusCode::OK, Json(serde_json::json!({"message": "ok"})))
}

async fn stop(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let job = state.current_job.lock().expect("server job lock").clone();

    match job {
        Some(job) => {
            tokio::spawn(async move { job.stop().await });
            (StatusCode::OK, Json(serde_json::json!({"message": "stopping"})))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"message": "no job is running"})),
        ),
    }
}

async fn logs(
    State(state): State<Arc<ServerState>>,
    UrlPath(_job_id): UrlPath<String>,
) -> impl IntoResponse {
    match tokio::fs::read_to_string(&state.log_path).await {
        Ok(content) => (StatusCode::OK, [("content-type", "text/plain")], content),
        Err(_) => (StatusCode::NOT_FOUND, [("content-type", "text/plain")], String::new()),
    }
}

fn load_tls_config(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(cert)?))
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::Tls(format!("failed to read certificate {}: {e}", cert.display())))?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(std::fs::File::open(key)?))
        .map_err(|e| Error::Tls(format!("failed to read key {}: {e}", key.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", key.display())))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<ServerState> {
        Arc::new(ServerState {
            version: "0.0.7".to_string(),
            client: reqwest::Client::new(),
            state: Mutex::new(STATE_WAITING.to_string()),
            current_job: Mutex::new(None),
            log_path: std::env::temp_dir().join("nonexistent-test-log.json"),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_returns_200_with_state_and_version() {
        let app = router(test_state());

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "waiting for job");
        assert_eq!(json["version"], "0.0.7");
    }

    #[tokio::test]
    async fn second_job_is_rejected_with_422() {
        let state = test_state();
        state.set_state(STATE_STARTED);
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"job-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["message"], "a job is already running");
    }

    #[tokio::test]
    async fn stop_without_a_job_is_404() {
        let app = router(test_state());

        let response = app
            .oneshot(Request::builder().method("POST").uri("/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_log_is_404() {
        let app = router(test_state());

        let response = app
            .oneshot(Request::builder().uri("/jobs/job-1/log").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
