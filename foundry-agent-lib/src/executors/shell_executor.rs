//! Executor that runs commands in a stateful shell directly on the host.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::error;

use super::{parent_dir, run_command_in_shell, CommandOptions, Executor};
use crate::api::{EnvVar, File};
use crate::environment::{Environment, HostEnvVar};
use crate::eventlogger::Logger;
use crate::shell::Shell;

pub struct ShellExecutor {
    logger: Arc<Logger>,
    storage_dir: PathBuf,
    shell: Mutex<Option<Shell>>,
}

impl ShellExecutor {
    pub fn new(logger: Arc<Logger>) -> ShellExecutor {
        ShellExecutor {
            logger,
            storage_dir: std::env::temp_dir(),
            shell: Mutex::new(None),
        }
    }

    async fn shell(&self) -> Option<Shell> {
        self.shell.lock().await.clone()
    }

    async fn run(&self, options: CommandOptions) -> i32 {
        match self.shell().await {
            Some(shell) => run_command_in_shell(&shell, &self.logger, options).await,
            None => {
                error!("Cannot run command, the shell is not started");
                1
            }
        }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn prepare(&self) -> i32 {
        match std::fs::create_dir_all(&self.storage_dir) {
            Ok(()) => 0,
            Err(err) => {
                error!("Failed to create storage directory: {}", err);
                1
            }
        }
    }

    async fn start(&self) -> i32 {
        match Shell::start(&self.storage_dir).await {
            Ok(shell) => {
                *self.shell.lock().await = Some(shell);
                0
            }
            Err(err) => {
                error!("Failed to start stateful shell: {}", err);
                self.logger.log_command_output("Failed to start the shell session\n").await;
                self.logger.log_command_output(&format!("{err}\n")).await;
                1
            }
        }
    }

    async fn export_env_vars(&self, env_vars: &[EnvVar], host_env_vars: &[HostEnvVar]) -> i32 {
        let directive = "Exporting environment variables";
        let started_at = chrono::Utc::now().timestamp();

        self.logger.log_command_started(directive).await;

        let environment = match Environment::create(env_vars, host_env_vars) {
            Ok(environment) => environment,
            Err(err) => {
                error!("Error creating environment: {}", err);
                self.logger.log_command_output(&format!("{err}\n")).await;
                self.logger
                    .log_command_finished(
                        directive,
                        1,
                        started_at,
                        chrono::Utc::now().timestamp(),
                    )
                    .await;
                return 1;
            }
        };

        let env_file = self.storage_dir.join(".env");
        let export_result = {
            let logger = &self.logger;
            let mut exported = Vec::new();
            let result = environment.to_file(&env_file, Some(|name: &str| {
                exported.push(name.to_string());
            }));
            for name in exported {
                logger.log_command_output(&format!("Exporting {name}\n")).await;
            }
            result
        };

        let exit_code = if export_result.is_err() {
            255
        } else {
            self.run(CommandOptions::silent(format!("source {}", env_file.display()))).await
        };

        self.logger
            .log_command_finished(directive, exit_code, started_at, chrono::Utc::now().timestamp())
            .await;

        exit_code
    }

    async fn inject_files(&self, files: &[File]) -> i32 {
        let directive = "Injecting Files";
        let started_at = chrono::Utc::now().timestamp();
        let mut exit_code = 0;

        self.logger.log_command_started(directive).await;

        for file in files {
            let destination = file.destination();
            self.logger
                .log_command_output(&format!(
                    "Injecting {} with file mode {}\n",
                    destination, file.mode
                ))
                .await;

            let content = match file.decode() {
                Ok(content) => content,
                Err(_) => {
                    self.logger
                        .log_command_output("Failed to decode the content of the file.\n")
                        .await;
                    exit_code = 1;
                    break;
                }
            };

            let staging_path = self.storage_dir.join("file");
            if let Err(err) = std::fs::write(&staging_path, &content) {
                self.logger.log_command_output(&format!("{err}\n")).await;
                exit_code = 255;
                break;
            }

            let command = format!("mkdir -p {}", parent_dir(&destination));
            exit_code = self.run(CommandOptions::silent(command)).await;
            if exit_code != 0 {
                self.logger
                    .log_command_output(&format!(
                        "Failed to create destination path {destination}\n"
                    ))
                    .await;
                break;
            }

            let command = format!("cp {} {}", staging_path.display(), destination);
            exit_code = self.run(CommandOptions::silent(command)).await;
            if exit_code != 0 {
                self.logger
                    .log_command_output(&format!(
                        "Failed to move to destination path {} {destination}\n",
                        staging_path.display()
                    ))
                    .await;
                break;
            }

            let command = format!("chmod {} {}", file.mode, destination);
            exit_code = self.run(CommandOptions::silent(command)).await;
            if exit_code != 0 {
                self.logger
                    .log_command_output(&format!("Failed to set file mode to {}\n", file.mode))
                    .await;
                break;
            }
        }

        self.logger
            .log_command_finished(directive, exit_code, started_at, chrono::Utc::now().timestamp())
            .await;

        exit_code
    }

    async fn run_command(&self, options: CommandOptions) -> i32 {
        self.run(options).await
    }

    async fn stop(&self) -> i32 {
        if let Some(shell) = self.shell().await {
            if let Err(err) = shell.close() {
                error!("Process killing procedure returned an error: {}", err);
                return 0;
            }
        }
        0
    }

    async fn cleanup(&self) -> i32 {
        let _ = std::fs::remove_file(self.storage_dir.join(".env"));
        let _ = std::fs::remove_file(self.storage_dir.join("file"));
        let _ = std::fs::remove_file(self.storage_dir.join("current-agent-cmd"));
        0
    }
}
