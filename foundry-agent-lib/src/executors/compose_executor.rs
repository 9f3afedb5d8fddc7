//! Executor that runs the job inside the main container of a
//! docker-compose composition.
//!
//! The host side prepares the manifest, registry credentials and an SSH
//! jump point; the stateful shell is then opened *inside* the main
//! container via `docker-compose run`, so every subsequent phase behaves
//! exactly like the shell executor, just containerized.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

use super::aws;
use super::compose_manifest::construct_compose_manifest;
use super::ssh_jump_point::{
    inject_entries_to_authorized_keys, jump_point_script, set_up_ssh_jump_point,
};
use super::{parent_dir, run_command_in_shell, CommandOptions, Executor, FileInjection};
use crate::api::{Compose, EnvVar, File, ImagePullCredentials, ImagePullStrategy, JobRequest};
use crate::environment::{Environment, HostEnvVar};
use crate::eventlogger::Logger;
use crate::shell::Shell;

const DOCKERHUB_LOGIN_CMD: &str =
    "echo $DOCKERHUB_PASSWORD | docker login --username $DOCKERHUB_USERNAME --password-stdin";

const GENERIC_DOCKER_LOGIN_CMD: &str =
    "docker login -u \"$DOCKER_USERNAME\" -p \"$DOCKER_PASSWORD\" $DOCKER_URL";

const GCR_LOGIN_CMD: &str =
    "cat /tmp/gcr/keyfile.json | docker login -u _json_key --password-stdin https://$GCR_HOSTNAME";

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("compose block has no containers")]
    NoContainers,
}

#[derive(Debug, Clone, Default)]
pub struct ComposeExecutorOptions {
    pub expose_kvm_device: bool,
    pub file_injections: Vec<FileInjection>,
    pub fail_on_missing_files: bool,
}

pub struct ComposeExecutor {
    logger: Arc<Logger>,
    compose: Compose,
    ssh_public_keys: Vec<String>,
    options: ComposeExecutorOptions,
    manifest_path: PathBuf,
    tmp_directory: PathBuf,
    main_container: String,
    shell: Mutex<Option<Shell>>,
}

impl ComposeExecutor {
    pub fn new(
        request: &JobRequest,
        logger: Arc<Logger>,
        options: ComposeExecutorOptions,
    ) -> Result<ComposeExecutor, ComposeError> {
        let compose = request.compose.clone().unwrap_or_default();
        let main_container = compose
            .containers
            .first()
            .map(|container| container.name.clone())
            .ok_or(ComposeError::NoContainers)?;

        Ok(ComposeExecutor {
            logger,
            compose,
            ssh_public_keys: request.ssh_public_keys.clone(),
            options,
            manifest_path: std::env::temp_dir().join("docker-compose.yml"),
            tmp_directory: std::env::temp_dir().join("agent-temp-directory"),
            main_container,
            shell: Mutex::new(None),
        })
    }

    async fn shell(&self) -> Option<Shell> {
        self.shell.lock().await.clone()
    }

    async fn run(&self, options: CommandOptions) -> i32 {
        match self.shell().await {
            Some(shell) => run_command_in_shell(&shell, &self.logger, options).await,
            None => {
                error!("Cannot run command, the container shell is not started");
                1
            }
        }
    }

    async fn execute_host_commands(&self) -> Result<(), std::io::Error> {
        for command in &self.compose.host_setup_commands {
            debug!("Executing host command: {}", command.directive);

            let output = tokio::process::Command::new("bash")
                .arg("-c")
                .arg(&command.directive)
                .output()
                .await?;

            debug!("{}", String::from_utf8_lossy(&output.stdout));

            if !output.status.success() {
                return Err(std::io::Error::other(format!(
                    "host command '{}' failed: {}",
                    command.directive,
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }

        Ok(())
    }

    fn find_valid_files_to_inject(&self) -> Result<Vec<FileInjection>, std::io::Error> {
        let mut valid = Vec::new();

        for injection in &self.options.file_injections {
            match injection.check_file_exists() {
                Ok(()) => valid.push(injection.clone()),
                Err(err) if self.options.fail_on_missing_files => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        "Error injecting file {} - ignoring it: {}",
                        injection.host_path,
                        err
                    );
                }
            }
        }

        Ok(valid)
    }

    fn set_up_ssh_jump_point(&self) -> i32 {
        if let Err(err) = inject_entries_to_authorized_keys(&self.ssh_public_keys) {
            error!("Failed to inject authorized keys: {}", err);
            return 1;
        }

        if let Err(err) = set_up_ssh_jump_point(&jump_point_script(&self.main_container)) {
            error!("Failed to set up SSH jump point: {}", err);
            return 1;
        }

        0
    }

    async fn inject_image_pull_secrets(&self) -> i32 {
        if self.compose.image_pull_credentials.is_empty() {
            return 0;
        }

        let directive = "Setting up image pull credentials";
        let started_at = chrono::Utc::now().timestamp();
        let mut exit_code = 0;

        self.logger.log_command_started(directive).await;

        for credentials in &self.compose.image_pull_credentials {
            match credentials.strategy() {
                Ok(ImagePullStrategy::DockerHub) => {
                    self.logger.log_command_output("Setting up credentials for DockerHub\n").await;
                    exit_code = self.login_with_env_vars(credentials, DOCKERHUB_LOGIN_CMD).await;
                }
                Ok(ImagePullStrategy::GenericDocker) => {
                    self.logger.log_command_output("Setting up credentials for Docker\n").await;
                    exit_code =
                        self.login_with_env_vars(credentials, GENERIC_DOCKER_LOGIN_CMD).await;
                }
                Ok(ImagePullStrategy::Ecr) => {
                    exit_code = self.login_to_ecr(credentials).await;
                }
                Ok(ImagePullStrategy::Gcr) => {
                    exit_code = self.login_to_gcr(credentials).await;
                }
                Err(err) => {
                    self.logger
                        .log_command_output(&format!(
                            "Failed to resolve docker login strategy: {err}\n"
                        ))
                        .await;
                    exit_code = 1;
                }
            }

            if exit_code != 0 {
                break;
            }
        }

        self.logger
            .log_command_finished(directive, exit_code, started_at, chrono::Utc::now().timestamp())
            .await;

        exit_code
    }

    async fn login_with_env_vars(
        &self,
        credentials: &ImagePullCredentials,
        login_cmd: &str,
    ) -> i32 {
        let envs = match credentials.to_cmd_env_vars() {
            Ok(envs) => envs,
            Err(err) => {
                self.logger.log_command_output(&format!("{err}\n")).await;
                return 1;
            }
        };

        self.logger.log_command_output(&format!("{login_cmd}\n")).await;
        self.run_host_login_command(login_cmd, &envs).await
    }

    async fn login_to_ecr(&self, credentials: &ImagePullCredentials) -> i32 {
        self.logger.log_command_output("Setting up credentials for ECR\n").await;

        let envs = match credentials.to_cmd_env_vars() {
            Ok(envs) => envs,
            Err(err) => {
                self.logger
                    .log_command_output(&format!("Error preparing environment variables: {err}\n"))
                    .await;
                return 1;
            }
        };

        let login_cmd = match aws::ecr_login_cmd(&envs).await {
            Ok(login_cmd) => login_cmd,
            Err(err) => {
                self.logger
                    .log_command_output(&format!(
                        "Failed to determine docker login command: {err}\n"
                    ))
                    .await;
                return 1;
            }
        };

        self.logger.log_command_output(&format!("{login_cmd}\n")).await;
        self.run_host_login_command(&login_cmd, &envs).await
    }

    async fn login_to_gcr(&self, credentials: &ImagePullCredentials) -> i32 {
        self.logger.log_command_output("Setting up credentials for GCR\n").await;

        // The keyfile lands on the host before the login command reads it.
        for file in &credentials.files {
            let content = match file.decode() {
                Ok(content) => content,
                Err(_) => {
                    self.logger
                        .log_command_output("Failed to decode the content of the file.\n")
                        .await;
                    return 1;
                }
            };

            let destination = file.destination();
            if let Err(err) = std::fs::create_dir_all(parent_dir(&destination)) {
                self.logger
                    .log_command_output(&format!(
                        "Failed to create destination path {destination}: {err}\n"
                    ))
                    .await;
                return 1;
            }

            if let Err(err) = std::fs::write(&destination, &content) {
                self.logger.log_command_output(&format!("{err}\n")).await;
                return 1;
            }
        }

        let envs = match credentials.to_cmd_env_vars() {
            Ok(envs) => envs,
            Err(err) => {
                self.logger.log_command_output(&format!("{err}\n")).await;
                return 1;
            }
        };

        self.logger.log_command_output(&format!("{GCR_LOGIN_CMD}\n")).await;
        self.run_host_login_command(GCR_LOGIN_CMD, &envs).await
    }

    /// Run a login command on the host, with the credential env vars laid
    /// over the agent's own environment, streaming its combined output
    /// into the job log.
    async fn run_host_login_command(&self, command: &str, envs: &[String]) -> i32 {
        let output = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(command)
            .envs(aws::parse_env_pairs(envs))
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                self.logger.log_command_output(&format!("{err}\n")).await;
                return 1;
            }
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        for line in String::from_utf8_lossy(&combined).lines() {
            self.logger.log_command_output(&format!("{line}\n")).await;
        }

        if output.status.success() {
            0
        } else {
            1
        }
    }

    /// docker-compose always pulls on `pull`, even when images are local.
    /// `run <main> true` only pulls what is missing, so it doubles as the
    /// pre-pull step.
    async fn pull_docker_images(&self) -> i32 {
        let directive = "Pulling docker images...";
        let started_at = chrono::Utc::now().timestamp();

        self.logger.log_command_started(directive).await;

        let args: Vec<String> = vec![
            "--ansi".into(),
            "never".into(),
            "-f".into(),
            self.manifest_path.display().to_string(),
            "run".into(),
            "--rm".into(),
            self.main_container.clone(),
            "true".into(),
        ];

        let exit_code = match self.stream_command_under_pty("docker-compose", &args).await {
            Ok(exit_code) => exit_code,
            Err(err) => {
                error!("Failed to initialize docker pull: {}", err);
                1
            }
        };

        debug!("Docker pull finished. Exit code: {}", exit_code);

        self.logger
            .log_command_finished(directive, exit_code, started_at, chrono::Utc::now().timestamp())
            .await;

        exit_code
    }

    /// Run a one-shot command under a PTY, forwarding each output line to
    /// the job log. Returns the command's exit code.
    async fn stream_command_under_pty(
        &self,
        executable: &str,
        args: &[String],
    ) -> Result<i32, std::io::Error> {
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let (code_tx, code_rx) = oneshot::channel::<i32>();

        let executable = executable.to_string();
        let args = args.to_vec();

        tokio::task::spawn_blocking(move || {
            let pty = match native_pty_system().openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                Ok(pty) => pty,
                Err(_) => {
                    let _ = code_tx.send(1);
                    return;
                }
            };

            let mut command = CommandBuilder::new(&executable);
            command.args(&args);

            let mut child = match pty.slave.spawn_command(command) {
                Ok(child) => child,
                Err(_) => {
                    let _ = code_tx.send(1);
                    return;
                }
            };
            drop(pty.slave);

            if let Ok(reader) = pty.master.try_clone_reader() {
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let _ = line_tx.send(line.clone());
                        }
                    }
                }
            }
            drop(line_tx);

            let exit_code = child.wait().map(|status| status.exit_code() as i32).unwrap_or(1);
            let _ = code_tx.send(exit_code);
        });

        while let Some(line) = line_rx.recv().await {
            self.logger.log_command_output(&line).await;
        }

        Ok(code_rx.await.unwrap_or(1))
    }

    async fn start_bash_session(&self) -> i32 {
        let directive = "Starting the docker image...";
        let started_at = chrono::Utc::now().timestamp();
        let mut exit_code = 0;

        self.logger.log_command_started(directive).await;
        self.logger.log_command_output("Starting a new bash session.\n").await;

        let args: Vec<String> = vec![
            "--ansi".into(),
            "never".into(),
            "-f".into(),
            self.manifest_path.display().to_string(),
            "run".into(),
            "--rm".into(),
            "--name".into(),
            self.main_container.clone(),
            "-v".into(),
            "/var/run/docker.sock:/var/run/docker.sock".into(),
            "-v".into(),
            format!("{0}:{0}:ro", self.tmp_directory.display()),
            self.main_container.clone(),
            "bash".into(),
        ];

        match Shell::start_from_exec_and_args("docker-compose", &args, &self.tmp_directory).await {
            Ok(shell) => {
                *self.shell.lock().await = Some(shell);
            }
            Err(err) => {
                error!("Failed to start stateful shell: {}", err);
                self.logger.log_command_output("Failed to start the docker image\n").await;
                self.logger.log_command_output(&format!("{err}\n")).await;
                exit_code = 1;
            }
        }

        self.logger
            .log_command_finished(directive, exit_code, started_at, chrono::Utc::now().timestamp())
            .await;

        exit_code
    }
}

#[async_trait]
impl Executor for ComposeExecutor {
    async fn prepare(&self) -> i32 {
        if let Err(err) = std::fs::create_dir_all(&self.tmp_directory) {
            error!("Failed to create temp directory: {}", err);
            return 1;
        }

        if let Err(err) = self.execute_host_commands().await {
            error!("Host setup commands failed: {}", err);
            return 1;
        }

        let files_to_inject = match self.find_valid_files_to_inject() {
            Ok(files) => files,
            Err(err) => {
                error!("Error injecting files: {}", err);
                return 1;
            }
        };

        let manifest = construct_compose_manifest(
            &self.compose,
            self.options.expose_kvm_device,
            &files_to_inject,
            &self.tmp_directory,
        );
        debug!("Compose manifest:\n{}", manifest);

        if let Err(err) = std::fs::write(&self.manifest_path, manifest) {
            error!("Error writing docker compose manifest file: {}", err);
            return 1;
        }

        self.set_up_ssh_jump_point()
    }

    async fn start(&self) -> i32 {
        let exit_code = self.inject_image_pull_secrets().await;
        if exit_code != 0 {
            error!("Failed to set up image pull credentials");
            return exit_code;
        }

        let exit_code = self.pull_docker_images().await;
        if exit_code != 0 {
            error!("Failed to pull images");
            return exit_code;
        }

        self.start_bash_session().await
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

        let env_file = self.tmp_directory.join(".env");
        let mut exported = Vec::new();
        let export_result =
            environment.to_file(&env_file, Some(|name: &str| exported.push(name.to_string())));
        for name in exported {
            self.logger.log_command_output(&format!("Exporting {name}\n")).await;
        }

        let mut exit_code = if export_result.is_err() { 255 } else { 0 };

        if exit_code == 0 {
            exit_code = self
                .run(CommandOptions::silent(format!("source {}", env_file.display())))
                .await;
        }

        // Interactive SSH sessions into the container get the job's
        // environment too.
        if exit_code == 0 {
            exit_code = self
                .run(CommandOptions::silent(format!(
                    "echo 'source {}' >> ~/.bash_profile",
                    env_file.display()
                )))
                .await;
        }

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

            // Staged into the bind-mounted temp directory, then copied
            // into place from inside the container.
            let staging_path = self.tmp_directory.join("file");
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
        debug!("Starting the process killing procedure");

        if let Some(shell) = self.shell().await {
            if let Err(err) = shell.close() {
                error!("Process killing procedure returned an error: {}", err);
                return 0;
            }
        }

        debug!("Process killing finished without errors");
        0
    }

    async fn cleanup(&self) -> i32 {
        let _ = std::fs::remove_file(&self.manifest_path);
        0
    }
}
