//! Agent-side state machine, synchronized with the hub.
//!
//! A sync loop POSTs `{state, job_id}` every few seconds and acts on the
//! returned action. Job dispatch, job stop and shutdown all flow through
//! here; state transitions are serialized through the sync loop and the
//! job's teardown hooks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use foundry_agent_lib::environment::HostEnvVar;
use foundry_agent_lib::executors::FileInjection;
use foundry_agent_lib::job::{Job, JobOptions, RunOptions};
use foundry_agent_lib::retry::retry_with_constant_wait;
use tracing::{error, info, warn};

use super::api_client::{AgentAction, AgentState, ApiClient, SyncRequest};

const JOB_FETCH_ATTEMPTS: usize = 10;
const JOB_FETCH_WAIT: Duration = Duration::from_secs(3);
const DISCONNECT_WAIT: Duration = Duration::from_secs(1);

/// Why the agent is exiting; exposed to the shutdown hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Requested,
    JobFinished,
    Idle,
    Interrupted,
    UnableToSync,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownReason::Requested => "requested",
            ShutdownReason::JobFinished => "job_finished",
            ShutdownReason::Idle => "idle",
            ShutdownReason::Interrupted => "interrupted",
            ShutdownReason::UnableToSync => "unable_to_sync",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct JobProcessorConfig {
    pub sync_interval: Duration,
    pub disconnect_retry_attempts: usize,
    pub shutdown_hook_path: Option<PathBuf>,
    pub disconnect_after_job: bool,

    /// Zero disables the idle watchdog.
    pub disconnect_after_idle_timeout: Duration,

    /// Give up and exit once syncs have been failing for this long.
    pub sync_error_threshold: Duration,

    pub env_vars: Vec<HostEnvVar>,
    pub file_injections: Vec<FileInjection>,
    pub fail_on_missing_files: bool,
    pub expose_kvm_device: bool,

    /// Exit the process at the end of shutdown. Disabled in tests, which
    /// assert on the recorded shutdown reason instead.
    pub exit_on_shutdown: bool,
}

impl Default for JobProcessorConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            disconnect_retry_attempts: 100,
            shutdown_hook_path: None,
            disconnect_after_job: false,
            disconnect_after_idle_timeout: Duration::ZERO,
            sync_error_threshold: Duration::from_secs(600),
            env_vars: Vec::new(),
            file_injections: Vec::new(),
            fail_on_missing_files: false,
            expose_kvm_device: false,
            exit_on_shutdown: true,
        }
    }
}

struct ProcessorState {
    state: AgentState,
    current_job_id: String,
    current_job: Option<Arc<Job>>,
    last_state_change: Instant,
    last_successful_sync: Instant,
    stop_sync: bool,
    shutdown_reason: Option<ShutdownReason>,
}

pub struct JobProcessor {
    api: ApiClient,
    client: reqwest::Client,
    config: JobProcessorConfig,
    state: Mutex<ProcessorState>,
    shutdown_started: AtomicBool,
}

impl JobProcessor {
    /// Start the processor: spawns the sync loop and the signal handler.
    pub fn start(
        api: ApiClient,
        client: reqwest::Client,
        config: JobProcessorConfig,
    ) -> Arc<JobProcessor> {
        let processor = Arc::new(JobProcessor {
            api,
            client,
            config,
            state: Mutex::new(ProcessorState {
                state: AgentState::WaitingForJobs,
                current_job_id: String::new(),
                current_job: None,
                last_state_change: Instant::now(),
                last_successful_sync: Instant::now(),
                stop_sync: false,
                shutdown_reason: None,
            }),
            shutdown_started: AtomicBool::new(false),
        });

        let sync_processor = Arc::clone(&processor);
        tokio::spawn(async move { sync_processor.sync_loop().await });

        let signal_processor = Arc::clone(&processor);
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_processor.shutdown(ShutdownReason::Interrupted, 0).await;
        });

        processor
    }

    pub fn state(&self) -> AgentState {
        self.state.lock().expect("processor state lock").state
    }

    pub fn current_job_id(&self) -> String {
        self.state.lock().expect("processor state lock").current_job_id.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.state.lock().expect("processor state lock").shutdown_reason
    }

    fn set_state(&self, new_state: AgentState) {
        let mut state = self.state.lock().expect("processor state lock");
        info!("Agent state: {} -> {}", state.state, new_state);
        state.state = new_state;
        state.last_state_change = Instant::now();
    }

    async fn sync_loop(self: &Arc<Self>) {
        loop {
            if self.state.lock().expect("processor state lock").stop_sync {
                break;
            }

            self.sync().await;
            tokio::time::sleep(self.config.sync_interval).await;
        }
    }

    async fn sync(self: &Arc<Self>) {
        self.shutdown_if_idle().await;

        let request = {
            let state = self.state.lock().expect("processor state lock");
            if state.stop_sync {
                return;
            }
            SyncRequest { state: state.state, job_id: state.current_job_id.clone() }
        };

        match self.api.sync(&request).await {
            Ok(response) => {
                self.state.lock().expect("processor state lock").last_successful_sync =
                    Instant::now();
                self.process_sync_response(response.action, response.job_id).await;
            }
            Err(err) => self.handle_sync_error(err).await,
        }
    }

    async fn process_sync_response(self: &Arc<Self>, action: AgentAction, job_id: String) {
        match action {
            AgentAction::Continue => {}

            AgentAction::RunJob => {
                let processor = Arc::clone(self);
                tokio::spawn(async move { processor.run_job(job_id).await });
            }

            AgentAction::StopJob => {
                let processor = Arc::clone(self);
                tokio::spawn(async move { processor.stop_job(job_id).await });
            }

            AgentAction::WaitForJobs => self.wait_for_jobs(),

            AgentAction::Shutdown => {
                info!("Agent shutdown requested by the hub");
                self.shutdown(ShutdownReason::Requested, 0).await;
            }

            AgentAction::Unknown => {
                warn!("Ignoring unknown action from the hub");
            }
        }
    }

    async fn handle_sync_error(&self, err: crate::error::Error) {
        error!("[SYNC ERR] Failed to sync with the hub: {}", err);

        let failing_for = {
            let state = self.state.lock().expect("processor state lock");
            state.last_successful_sync.elapsed()
        };

        if failing_for > self.config.sync_error_threshold {
            error!(
                "Unable to sync with the hub for over {:?}.",
                self.config.sync_error_threshold
            );
            self.shutdown(ShutdownReason::UnableToSync, 1).await;
        }
    }

    async fn shutdown_if_idle(self: &Arc<Self>) {
        if self.config.disconnect_after_idle_timeout.is_zero() {
            return;
        }

        let idle_for = {
            let state = self.state.lock().expect("processor state lock");
            if state.state != AgentState::WaitingForJobs {
                return;
            }
            state.last_state_change.elapsed()
        };

        if idle_for > self.config.disconnect_after_idle_timeout {
            info!("Agent has been idle for the past {:?}.", idle_for);
            self.shutdown(ShutdownReason::Idle, 0).await;
        }
    }

    async fn run_job(self: Arc<Self>, job_id: String) {
        // At most one job at a time; the hub re-sends run-job until the
        // state change is observed.
        {
            let state = self.state.lock().expect("processor state lock");
            if state.current_job.is_some() || state.state == AgentState::StartingJob {
                warn!("Ignoring run-job for {}, a job is already active", job_id);
                return;
            }
        }

        self.state.lock().expect("processor state lock").current_job_id = job_id.clone();
        self.set_state(AgentState::StartingJob);

        let request = match self.get_job_with_retries(&job_id).await {
            Ok(request) => request,
            Err(err) => {
                error!("Could not get job {}: {}", job_id, err);
                self.set_state(AgentState::FailedToFetchJob);
                return;
            }
        };

        let mut options = JobOptions::new(request, self.client.clone());
        options.expose_kvm_device = self.config.expose_kvm_device;
        options.file_injections = self.config.file_injections.clone();
        options.fail_on_missing_files = self.config.fail_on_missing_files;

        let job = match Job::new(options) {
            Ok(job) => job,
            Err(err) => {
                error!("Could not construct job {}: {}", job_id, err);
                self.set_state(AgentState::FailedToConstructJob);
                return;
            }
        };

        self.state.lock().expect("processor state lock").current_job = Some(Arc::clone(&job));
        self.set_state(AgentState::RunningJob);

        let on_success = {
            let processor = Arc::clone(&self);
            Box::new(move || processor.handle_teardown(true)) as Box<dyn FnOnce() + Send>
        };
        let on_failure = {
            let processor = Arc::clone(&self);
            Box::new(move || processor.handle_teardown(false)) as Box<dyn FnOnce() + Send>
        };

        job.run(RunOptions {
            env_vars: self.config.env_vars.clone(),
            on_successful_teardown: Some(on_success),
            on_failed_teardown: Some(on_failure),
        })
        .await;
    }

    /// Runs on the job task once teardown completed (or its callbacks
    /// failed). Shutdown is asynchronous, so it is spawned off.
    fn handle_teardown(self: Arc<Self>, success: bool) {
        match (success, self.config.disconnect_after_job) {
            (true, true) => {
                tokio::spawn(async move {
                    self.shutdown(ShutdownReason::JobFinished, 0).await;
                });
            }
            (true, false) => self.set_state(AgentState::FinishedJob),
            (false, true) => {
                tokio::spawn(async move {
                    self.shutdown(ShutdownReason::JobFinished, 1).await;
                });
            }
            (false, false) => self.set_state(AgentState::FailedToSendCallback),
        }
    }

    async fn get_job_with_retries(
        &self,
        job_id: &str,
    ) -> crate::error::Result<foundry_agent_lib::api::JobRequest> {
        retry_with_constant_wait("Get job", JOB_FETCH_ATTEMPTS, JOB_FETCH_WAIT, || {
            self.api.get_job(job_id)
        })
        .await
    }

    async fn stop_job(self: Arc<Self>, job_id: String) {
        let job = {
            let mut state = self.state.lock().expect("processor state lock");
            state.current_job_id = job_id;
            state.current_job.clone()
        };

        self.set_state(AgentState::StoppingJob);

        match job {
            Some(job) => job.stop().await,
            None => warn!("Received stop-job with no job running"),
        }
    }

    fn wait_for_jobs(&self) {
        {
            let mut state = self.state.lock().expect("processor state lock");
            state.current_job_id = String::new();
            state.current_job = None;
        }
        self.set_state(AgentState::WaitingForJobs);
    }

    /// Disconnect, run the shutdown hook and exit. Safe to call from
    /// multiple tasks; only the first caller proceeds.
    pub async fn shutdown(&self, reason: ShutdownReason, code: i32) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock().expect("processor state lock");
            state.stop_sync = true;
            state.shutdown_reason = Some(reason);
        }

        self.disconnect().await;
        self.execute_shutdown_hook(reason).await;

        info!("Agent shutting down due to: {}", reason);

        if self.config.exit_on_shutdown {
            std::process::exit(code);
        }
    }

    async fn disconnect(&self) {
        info!("Disconnecting the agent from the hub");

        let result = retry_with_constant_wait(
            "Disconnect",
            self.config.disconnect_retry_attempts,
            DISCONNECT_WAIT,
            || self.api.disconnect(),
        )
        .await;

        match result {
            Ok(()) => info!("Disconnected."),
            Err(err) => error!(
                "Failed to disconnect from the hub even after {} tries: {}",
                self.config.disconnect_retry_attempts, err
            ),
        }
    }

    async fn execute_shutdown_hook(&self, reason: ShutdownReason) {
        let Some(hook_path) = self.config.shutdown_hook_path.as_ref() else {
            return;
        };

        info!("Executing shutdown hook from {}", hook_path.display());

        let output = tokio::process::Command::new("bash")
            .arg(hook_path)
            .env("SEMAPHORE_AGENT_SHUTDOWN_REASON", reason.to_string())
            .output()
            .await;

        match output {
            Ok(output) => {
                info!("Output: {}", String::from_utf8_lossy(&output.stdout));
                if !output.status.success() {
                    error!(
                        "Shutdown hook failed: {}",
                        String::from_utf8_lossy(&output.stderr)
                    );
                }
            }
            Err(err) => error!("Error executing shutdown hook: {}", err),
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
