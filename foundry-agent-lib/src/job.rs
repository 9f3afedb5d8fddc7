//! Running one job: phases, callbacks, cleanup.
//!
//! A job runs as five ordered phases: prologue (environment + files),
//! commands, epilogues, teardown (final event, log flush, callbacks) and
//! cleanup. A failing prologue skips straight to teardown; a failing
//! command stops the command loop but never the epilogue; an external
//! stop turns the final result into `stopped`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info};

use crate::api::{Command, JobRequest};
use crate::environment::HostEnvVar;
use crate::eventlogger::{JobResult, Logger, LoggerError};
use crate::executors::{
    CommandOptions, ComposeExecutor, ComposeExecutorOptions, Executor, FileInjection,
    ShellExecutor,
};
use crate::retry::retry_with_constant_wait;

const CALLBACK_RETRY_ATTEMPTS: usize = 5;
const CALLBACK_RETRY_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("logger error: {0}")]
    Logger(#[from] LoggerError),

    #[error("executor error: {0}")]
    Executor(#[from] crate::executors::ComposeError),
}

pub struct JobOptions {
    pub request: JobRequest,
    pub client: reqwest::Client,
    pub expose_kvm_device: bool,
    pub file_injections: Vec<FileInjection>,
    pub fail_on_missing_files: bool,

    /// Test hook: bypass the request's logger descriptor.
    pub logger: Option<Arc<Logger>>,
}

impl JobOptions {
    pub fn new(request: JobRequest, client: reqwest::Client) -> JobOptions {
        JobOptions {
            request,
            client,
            expose_kvm_device: false,
            file_injections: Vec::new(),
            fail_on_missing_files: false,
            logger: None,
        }
    }
}

/// Hooks fired after teardown, used by the job processor to advance its
/// state machine.
#[derive(Default)]
pub struct RunOptions {
    pub env_vars: Vec<HostEnvVar>,
    pub on_successful_teardown: Option<Box<dyn FnOnce() + Send>>,
    pub on_failed_teardown: Option<Box<dyn FnOnce() + Send>>,
}

pub struct Job {
    pub request: JobRequest,
    client: reqwest::Client,
    executor: Arc<dyn Executor>,
    logger: Arc<Logger>,
    stopped: AtomicBool,
}

impl Job {
    pub fn new(options: JobOptions) -> Result<Arc<Job>, JobError> {
        let logger = match options.logger {
            Some(logger) => logger,
            None => Arc::new(Logger::create(options.client.clone(), &options.request.logger)?),
        };

        let executor: Arc<dyn Executor> = if options.request.compose.is_some() {
            Arc::new(ComposeExecutor::new(
                &options.request,
                Arc::clone(&logger),
                ComposeExecutorOptions {
                    expose_kvm_device: options.expose_kvm_device,
                    file_injections: options.file_injections.clone(),
                    fail_on_missing_files: options.fail_on_missing_files,
                },
            )?)
        } else {
            Arc::new(ShellExecutor::new(Arc::clone(&logger)))
        };

        Ok(Arc::new(Job {
            request: options.request,
            client: options.client,
            executor,
            logger,
            stopped: AtomicBool::new(false),
        }))
    }

    pub async fn run(&self, options: RunOptions) {
        info!("Job {} started", self.request.id);
        self.logger.log_job_started().await;

        let mut result = JobResult::Failed;

        if self.run_prologue(&options.env_vars).await {
            result = self.run_commands().await;

            if self.run_epilogues(result).await {
                result = JobResult::Failed;
            }
        }

        if self.is_stopped() {
            result = JobResult::Stopped;
        }

        self.teardown(result, options.on_successful_teardown, options.on_failed_teardown).await;
        self.cleanup().await;
    }

    /// Stop the job: the executor closes its shell, so the in-flight
    /// command returns promptly with a non-zero exit code.
    pub async fn stop(&self) {
        info!("Stopping job {}", self.request.id);
        self.stopped.store(true, Ordering::SeqCst);
        self.executor.stop().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn run_prologue(&self, host_env_vars: &[HostEnvVar]) -> bool {
        if self.executor.prepare().await != 0 {
            error!("Executor failed to prepare");
            return false;
        }

        if self.executor.start().await != 0 {
            error!("Executor failed to start");
            return false;
        }

        if self.executor.export_env_vars(&self.request.env_vars, host_env_vars).await != 0 {
            error!("Failed to export env vars");
            return false;
        }

        if self.executor.inject_files(&self.request.files).await != 0 {
            error!("Failed to inject files");
            return false;
        }

        true
    }

    async fn run_commands(&self) -> JobResult {
        for command in &self.request.commands {
            if self.is_stopped() {
                return JobResult::Failed;
            }

            let exit_code = self.run_command(command).await;
            if exit_code != 0 {
                return JobResult::Failed;
            }
        }

        JobResult::Passed
    }

    /// Run the matching conditional epilogue, then the unconditional one.
    /// A failing epilogue command marks the job failed but the remaining
    /// epilogue commands still run. Returns whether anything failed.
    async fn run_epilogues(&self, result: JobResult) -> bool {
        let conditional = match result {
            JobResult::Passed => &self.request.epilogue_on_pass_commands,
            _ => &self.request.epilogue_on_fail_commands,
        };

        let mut any_failed = false;
        for command in conditional.iter().chain(&self.request.epilogue_always_commands) {
            if self.run_command(command).await != 0 {
                any_failed = true;
            }
        }

        any_failed
    }

    async fn run_command(&self, command: &Command) -> i32 {
        self.executor
            .run_command(CommandOptions {
                command: command.directive.clone(),
                silent: false,
                alias: command.alias.clone(),
                warning: command.warning.clone(),
            })
            .await
    }

    async fn teardown(
        &self,
        result: JobResult,
        on_successful_teardown: Option<Box<dyn FnOnce() + Send>>,
        on_failed_teardown: Option<Box<dyn FnOnce() + Send>>,
    ) {
        self.logger.log_job_finished(result).await;
        info!("Job {} finished with result {}", self.request.id, result);

        // Closing the logger flushes the remaining events upstream.
        if let Err(err) = self.logger.close().await {
            error!("Error closing logger: {}", err);
        }

        let callbacks_ok = self.send_callback(&self.request.callbacks.finished, result).await
            && self.send_callback(&self.request.callbacks.teardown_finished, result).await;

        if callbacks_ok {
            info!("Teardown finished for job {}", self.request.id);
            if let Some(hook) = on_successful_teardown {
                hook();
            }
        } else {
            error!("Teardown callbacks failed for job {}", self.request.id);
            if let Some(hook) = on_failed_teardown {
                hook();
            }
        }
    }

    async fn send_callback(&self, url: &str, result: JobResult) -> bool {
        if url.is_empty() {
            return true;
        }

        let client = self.client.clone();
        let payload = serde_json::json!({ "result": result });

        let outcome = retry_with_constant_wait(
            "Send callback",
            CALLBACK_RETRY_ATTEMPTS,
            CALLBACK_RETRY_WAIT,
            || async {
                let response = client.post(url).json(&payload).send().await?;
                response.error_for_status()?;
                Ok::<(), reqwest::Error>(())
            },
        )
        .await;

        match outcome {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to send callback to {}: {}", url, err);
                false
            }
        }
    }

    async fn cleanup(&self) {
        self.executor.cleanup().await;
        self.executor.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Command;
    use crate::eventlogger::JobEvent;

    fn command(directive: &str) -> Command {
        Command { directive: directive.to_string(), alias: String::new(), warning: String::new() }
    }

    fn job_with_memory_logger(
        request: JobRequest,
    ) -> (Arc<Job>, crate::eventlogger::MemoryBackend) {
        let (logger, events) = Logger::memory();
        let mut options = JobOptions::new(request, reqwest::Client::new());
        options.logger = Some(Arc::new(logger));
        (Job::new(options).unwrap(), events)
    }

    fn events_for_directive<'a>(
        events: &'a [JobEvent],
        wanted: &str,
    ) -> Vec<&'a JobEvent> {
        events
            .iter()
            .filter(|event| match event {
                JobEvent::CommandStarted { directive, .. } => directive == wanted,
                JobEvent::CommandFinished { directive, .. } => directive == wanted,
                _ => false,
            })
            .collect()
    }

    fn finished_result(events: &[JobEvent]) -> Option<JobResult> {
        events.iter().find_map(|event| match event {
            JobEvent::JobFinished { result, .. } => Some(*result),
            _ => None,
        })
    }

    fn output_concat(events: &[JobEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                JobEvent::CommandOutput { output, .. } => Some(output.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn passing_job_emits_events_in_order() {
        let request = JobRequest {
            id: "job-passed".into(),
            commands: vec![command("echo hello")],
            ..Default::default()
        };

        let (job, backend) = job_with_memory_logger(request);
        job.run(RunOptions::default()).await;

        let events = backend.events();
        assert!(matches!(events.first(), Some(JobEvent::JobStarted { .. })));
        assert_eq!(finished_result(&events), Some(JobResult::Passed));

        // Exactly one job_started and one job_finished.
        let started = events.iter().filter(|e| matches!(e, JobEvent::JobStarted { .. })).count();
        let finished = events.iter().filter(|e| matches!(e, JobEvent::JobFinished { .. })).count();
        assert_eq!((started, finished), (1, 1));

        // started precedes finished for the user command, and the output
        // shows up in between.
        let echo_events = events_for_directive(&events, "echo hello");
        assert_eq!(echo_events.len(), 2);
        assert!(matches!(echo_events[0], JobEvent::CommandStarted { .. }));
        match echo_events[1] {
            JobEvent::CommandFinished { exit_code, started_at, finished_at, .. } => {
                assert_eq!(*exit_code, 0);
                assert!(finished_at >= started_at);
            }
            other => panic!("expected command_finished, got {other:?}"),
        }
        assert!(output_concat(&events).contains("hello"));
    }

    #[tokio::test]
    async fn failing_command_skips_the_rest_and_picks_the_fail_epilogue() {
        let request = JobRequest {
            id: "job-failed".into(),
            commands: vec![command("echo A"), command("false"), command("echo B")],
            epilogue_on_pass_commands: vec![command("echo epilogue-on-pass")],
            epilogue_on_fail_commands: vec![command("echo epilogue-on-fail")],
            epilogue_always_commands: vec![command("echo epilogue-always")],
            ..Default::default()
        };

        let (job, backend) = job_with_memory_logger(request);
        job.run(RunOptions::default()).await;

        let events = backend.events();
        assert_eq!(finished_result(&events), Some(JobResult::Failed));

        let output = output_concat(&events);
        assert!(output.contains('A'));
        assert!(output.contains("epilogue-on-fail"));
        assert!(output.contains("epilogue-always"));
        assert!(!output.contains("epilogue-on-pass"));

        // `echo B` never ran.
        assert!(events_for_directive(&events, "echo B").is_empty());
        assert_eq!(events_for_directive(&events, "false").len(), 2);
    }

    #[tokio::test]
    async fn epilogue_failure_fails_a_passing_job() {
        let request = JobRequest {
            id: "job-epilogue-fails".into(),
            commands: vec![command("echo ok")],
            epilogue_on_pass_commands: vec![command("false"), command("echo still-runs")],
            ..Default::default()
        };

        let (job, backend) = job_with_memory_logger(request);
        job.run(RunOptions::default()).await;

        let events = backend.events();
        assert_eq!(finished_result(&events), Some(JobResult::Failed));

        // The failing epilogue command did not stop the remaining ones.
        assert!(output_concat(&events).contains("still-runs"));
    }

    #[tokio::test]
    async fn stopped_job_finishes_promptly_with_result_stopped() {
        let request = JobRequest {
            id: "job-stopped".into(),
            commands: vec![command("sleep 300")],
            ..Default::default()
        };

        let (job, backend) = job_with_memory_logger(request);

        let stopper = Arc::clone(&job);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stopper.stop().await;
        });

        let started = std::time::Instant::now();
        job.run(RunOptions::default()).await;

        assert!(started.elapsed() < Duration::from_secs(10));

        let events = backend.events();
        assert_eq!(finished_result(&events), Some(JobResult::Stopped));

        let sleep_events = events_for_directive(&events, "sleep 300");
        match sleep_events.last() {
            Some(JobEvent::CommandFinished { exit_code, .. }) => assert_ne!(*exit_code, 0),
            other => panic!("expected command_finished for sleep, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_hooks_fire() {
        let request = JobRequest {
            id: "job-hooks".into(),
            commands: vec![command("echo done")],
            ..Default::default()
        };

        let (job, _) = job_with_memory_logger(request);

        let succeeded = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&succeeded);
        job.run(RunOptions {
            on_successful_teardown: Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            ..Default::default()
        })
        .await;

        assert!(succeeded.load(Ordering::SeqCst));
    }
}
