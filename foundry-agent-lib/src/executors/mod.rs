//! Job executors.
//!
//! An executor prepares the execution environment, runs commands in it and
//! tears it down. The shell executor runs directly on the host; the
//! compose executor runs inside the main container of a docker-compose
//! composition. Both emit the same job events, so the rest of the agent
//! does not care which one is active.

mod aws;
mod compose_executor;
mod compose_manifest;
mod shell_executor;
mod ssh_jump_point;

pub use compose_executor::{ComposeError, ComposeExecutor, ComposeExecutorOptions};
pub use compose_manifest::construct_compose_manifest;
pub use shell_executor::ShellExecutor;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::{EnvVar, File};
use crate::environment::HostEnvVar;
use crate::eventlogger::Logger;
use crate::process::Process;
use crate::shell::Shell;

/// A host file made available to jobs, configured at the agent level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInjection {
    pub host_path: String,
    pub destination: String,
}

impl FileInjection {
    pub fn check_file_exists(&self) -> std::io::Result<()> {
        std::fs::metadata(&self.host_path).map(|_| ())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub command: String,
    pub silent: bool,
    pub alias: String,
    pub warning: String,
}

impl CommandOptions {
    /// A command that runs without emitting any job events.
    pub fn silent(command: impl Into<String>) -> CommandOptions {
        CommandOptions { command: command.into(), silent: true, ..Default::default() }
    }
}

/// Common executor contract. Every phase returns an exit code; non-zero
/// short-circuits later command phases but never the epilogue.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Set up the host side: directories, manifests, host commands.
    async fn prepare(&self) -> i32;

    /// Bring up the stateful shell (and containers, if any).
    async fn start(&self) -> i32;

    /// Export the job's environment into the running shell.
    async fn export_env_vars(&self, env_vars: &[EnvVar], host_env_vars: &[HostEnvVar]) -> i32;

    /// Place the job's files at their destinations.
    async fn inject_files(&self, files: &[File]) -> i32;

    /// Run one command in the stateful shell.
    async fn run_command(&self, options: CommandOptions) -> i32;

    /// Close the shell, interrupting any in-flight command.
    async fn stop(&self) -> i32;

    /// Remove per-job artifacts.
    async fn cleanup(&self) -> i32;
}

/// Shared command-running path: frame the command through a [`Process`],
/// forward its output to the logger, and emit started/finished events
/// unless the command is silent.
pub(crate) async fn run_command_in_shell(
    shell: &Shell,
    logger: &Arc<Logger>,
    options: CommandOptions,
) -> i32 {
    let directive =
        if options.alias.is_empty() { options.command.clone() } else { options.alias.clone() };

    if !options.silent {
        logger.log_command_started(&directive).await;

        if !options.alias.is_empty() {
            logger.log_command_output(&format!("Running: {}\n", options.command)).await;
        }

        if !options.warning.is_empty() {
            logger.log_command_output(&format!("Warning: {}\n", options.warning)).await;
        }
    }

    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();
    let mut process = Process::new(&options.command, shell, move |output| {
        let _ = output_tx.send(output);
    });

    let forwarder = {
        let logger = Arc::clone(logger);
        let silent = options.silent;
        tokio::spawn(async move {
            while let Some(output) = output_rx.recv().await {
                if !silent {
                    logger.log_command_output(&output).await;
                }
            }
        })
    };

    process.run().await;

    let exit_code = process.exit_code;
    let started_at = process.started_at;
    let finished_at = process.finished_at;

    // Dropping the process drops the output sender, letting the forwarder
    // drain and finish before command_finished is written.
    drop(process);
    let _ = forwarder.await;

    if !options.silent {
        logger.log_command_finished(&directive, exit_code, started_at, finished_at).await;
    }

    exit_code
}

/// `dirname` for destinations that may be `~`-anchored, computed host-side
/// so the shell only ever sees the final string.
pub(crate) fn parent_dir(destination: &str) -> String {
    match destination.rfind('/') {
        Some(0) => "/".to_string(),
        Some(index) => destination[..index].to_string(),
        None => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_command_options() {
        let options = CommandOptions::silent("echo hi");
        assert!(options.silent);
        assert_eq!(options.command, "echo hi");
        assert!(options.alias.is_empty());
    }

    #[test]
    fn parent_dir_handles_tilde_and_absolute_paths() {
        assert_eq!(parent_dir("~/a/b.txt"), "~/a");
        assert_eq!(parent_dir("/etc/motd"), "/etc");
        assert_eq!(parent_dir("/motd"), "/");
        assert_eq!(parent_dir("plain.txt"), ".");
    }

    #[test]
    fn file_injection_existence_check() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let present = FileInjection {
            host_path: file.path().to_string_lossy().into_owned(),
            destination: "/tmp/dest".into(),
        };
        assert!(present.check_file_exists().is_ok());

        let missing = FileInjection {
            host_path: "/nonexistent/definitely/missing".into(),
            destination: "/tmp/dest".into(),
        };
        assert!(missing.check_file_exists().is_err());
    }
}
