//! One command execution inside a running [`Shell`].
//!
//! The shell's output is a single continuous stream shared with its own
//! chatter, so each command is framed with start/end markers. The marker
//! lines are prefixed with an SOH byte (`\x01`), which user code
//! effectively never prints, so locating a potential marker is a
//! single-byte scan. The end marker carries the command's exit status.
//!
//! Markers are generated fresh for every command: a stale marker replayed
//! by a misbehaving command must not match.

use std::path::PathBuf;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::bytes::Regex;
use tracing::{debug, error};

use crate::output_buffer::OutputBuffer;
use crate::shell::{Shell, ShellError};

/// Marker lines start with SOH.
const MARKER_HEADER: u8 = 0x01;

/// Once the buffered tail is this much longer than the end marker without
/// matching, it cannot be our marker and is safe to flush.
const END_MARKER_SLACK: usize = 10;

fn random_magic_mark() -> String {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    format!("fnd-{nonce}")
}

/// Runs exactly one user directive and recovers its output and exit code.
pub struct Process {
    command: String,
    shell: Shell,

    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: i32,

    start_mark: String,
    end_mark: String,
    command_end_regex: Regex,
    cmd_file_path: PathBuf,
    input_buffer: Vec<u8>,
    output_buffer: OutputBuffer,
    on_output: Box<dyn FnMut(String) + Send + Sync>,
}

impl Process {
    pub fn new<F>(command: &str, shell: &Shell, on_output: F) -> Process
    where
        F: FnMut(String) + Send + Sync + 'static,
    {
        let start_mark = format!("{}-start", random_magic_mark());
        let end_mark = format!("{}-end", random_magic_mark());

        // The marks are alphanumeric plus dashes, nothing to escape.
        let command_end_regex =
            Regex::new(&format!(r"{end_mark} (\d+)[\r\n]+")).expect("end marker regex");

        Process {
            command: command.to_string(),
            shell: shell.clone(),
            started_at: 0,
            finished_at: 0,
            exit_code: 1,
            start_mark,
            end_mark,
            command_end_regex,
            cmd_file_path: shell.storage_path().join("current-agent-cmd"),
            input_buffer: Vec::new(),
            output_buffer: OutputBuffer::new(),
            on_output: Box::new(on_output),
        }
    }

    /// Run the command to completion. The exit code is left at 1 when the
    /// shell dies mid-command or the end marker cannot be parsed.
    pub async fn run(&mut self) {
        self.started_at = chrono::Utc::now().timestamp();

        if let Err(err) = self.load_command().await {
            error!("Error writing command file: {}", err);
            self.finished_at = chrono::Utc::now().timestamp();
            return;
        }

        let instruction = self.construct_shell_instruction();
        if let Err(err) = self.shell.write(&instruction).await {
            error!("Error writing instruction: {}", err);
            self.finished_at = chrono::Utc::now().timestamp();
            return;
        }

        let _ = self.scan().await;
        self.finished_at = chrono::Utc::now().timestamp();
    }

    /// The instruction sent to the shell:
    ///
    /// 1. print the start marker
    /// 2. source the command file
    /// 3. save the original exit status
    /// 4. print the end marker with the exit status
    /// 5. return the original exit status to the caller
    fn construct_shell_instruction(&self) -> String {
        format!(
            "echo -e \"\\001 {}\"; source {}; AGENT_CMD_RESULT=$?; \
             echo -e \"\\001 {} $AGENT_CMD_RESULT\"; echo \"exit $AGENT_CMD_RESULT\" | sh",
            self.start_mark,
            self.cmd_file_path.display(),
            self.end_mark,
        )
    }

    /// Multi-line commands do not survive the single-line marker scheme,
    /// so the command is persisted to a file and sourced.
    async fn load_command(&self) -> std::io::Result<()> {
        tokio::fs::write(&self.cmd_file_path, &self.command).await
    }

    async fn read(&mut self) -> Result<(), ShellError> {
        let chunk = self.shell.read().await?;
        self.input_buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn wait_for_start_marker(&mut self) -> Result<(), ShellError> {
        debug!("Waiting for start marker {}", self.start_mark);

        let needle = format!("{}\r\n", self.start_mark);
        loop {
            self.read().await?;

            if let Some(index) = find_subslice(&self.input_buffer, needle.as_bytes()) {
                // Everything up to and including the marker is shell
                // chatter, not command output.
                self.input_buffer.drain(..index + needle.len());
                debug!("Start marker found {}", self.start_mark);
                return Ok(());
            }
        }
    }

    fn end_marker_header_index(&self) -> Option<usize> {
        self.input_buffer.iter().position(|&b| b == MARKER_HEADER)
    }

    async fn scan(&mut self) -> Result<(), ShellError> {
        debug!("Scan started");

        self.wait_for_start_marker().await?;

        let exit_code;
        loop {
            if let Some(index) = self.end_marker_header_index() {
                if index > 0 {
                    // Everything before the SOH is user output.
                    self.flush_input_till(index);
                }

                if let Some(captures) = self.command_end_regex.captures(&self.input_buffer) {
                    exit_code = String::from_utf8_lossy(&captures[1]).into_owned();
                    debug!("End marker detected. Exit code: {}", exit_code);
                    break;
                }

                // The buffered tail has outgrown the end marker without
                // matching it, so it is not our marker.
                if self.input_buffer.len() >= self.end_mark.len() + END_MARKER_SLACK {
                    self.flush_input_all();
                }
            } else {
                self.flush_input_all();
            }

            self.stream_to_output();

            if let Err(err) = self.read().await {
                // The most likely cause is that the shell process died,
                // e.g. the command ran `exit 1`.
                self.flush_output_buffer().await;
                return Err(err);
            }
        }

        self.flush_output_buffer().await;

        match exit_code.parse::<i32>() {
            Ok(code) => self.exit_code = code,
            Err(err) => {
                error!("Error while parsing exit code '{}': {}", exit_code, err);
            }
        }

        Ok(())
    }

    fn flush_input_all(&mut self) {
        self.flush_input_till(self.input_buffer.len());
    }

    fn flush_input_till(&mut self, index: usize) {
        if index == 0 {
            return;
        }

        let data: Vec<u8> = self.input_buffer.drain(..index).collect();
        self.output_buffer.append(&data);
    }

    fn stream_to_output(&mut self) {
        while let Some(data) = self.output_buffer.flush() {
            (self.on_output)(String::from_utf8_lossy(&data).into_owned());
        }
    }

    async fn flush_output_buffer(&mut self) {
        while !self.output_buffer.is_empty() {
            self.stream_to_output();

            if !self.output_buffer.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    async fn start_shell(dir: &std::path::Path) -> Shell {
        Shell::start(dir).await.expect("shell should start")
    }

    async fn run(shell: &Shell, command: &str) -> (String, i32) {
        let output = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&output);

        let mut process = Process::new(command, shell, move |data| {
            sink.lock().unwrap().push_str(&data);
        });
        process.run().await;

        let collected = output.lock().unwrap().clone();
        (collected, process.exit_code)
    }

    #[tokio::test]
    async fn echo_command_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let shell = start_shell(dir.path()).await;

        let (output, exit_code) = run(&shell, "echo hello").await;
        assert!(output.contains("hello"), "output was {output:?}");
        assert_eq!(exit_code, 0);

        shell.close().unwrap();
    }

    #[tokio::test]
    async fn failing_command_reports_its_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let shell = start_shell(dir.path()).await;

        let (_, exit_code) = run(&shell, "false").await;
        assert_eq!(exit_code, 1);

        let (_, exit_code) = run(&shell, "bash -c 'exit 42'").await;
        assert_eq!(exit_code, 42);

        shell.close().unwrap();
    }

    #[tokio::test]
    async fn shell_state_persists_between_commands() {
        let dir = tempfile::tempdir().unwrap();
        let shell = start_shell(dir.path()).await;

        let (_, exit_code) = run(&shell, "export AGENT_TEST_VALUE=persisted").await;
        assert_eq!(exit_code, 0);

        let (output, exit_code) = run(&shell, "echo $AGENT_TEST_VALUE").await;
        assert_eq!(exit_code, 0);
        assert!(output.contains("persisted"), "output was {output:?}");

        shell.close().unwrap();
    }

    #[tokio::test]
    async fn multiline_commands_run_as_one_unit() {
        let dir = tempfile::tempdir().unwrap();
        let shell = start_shell(dir.path()).await;

        let (output, exit_code) = run(&shell, "echo one\necho two").await;
        assert_eq!(exit_code, 0);
        assert!(output.contains("one"), "output was {output:?}");
        assert!(output.contains("two"), "output was {output:?}");

        shell.close().unwrap();
    }

    #[tokio::test]
    async fn utf8_output_survives() {
        let dir = tempfile::tempdir().unwrap();
        let shell = start_shell(dir.path()).await;

        let (output, exit_code) = run(&shell, "echo 特特特").await;
        assert_eq!(exit_code, 0);
        assert!(output.contains("特特特"), "output was {output:?}");

        shell.close().unwrap();
    }

    #[tokio::test]
    async fn closing_the_shell_interrupts_a_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let shell = start_shell(dir.path()).await;

        let closer = shell.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            closer.close().unwrap();
        });

        let started = std::time::Instant::now();
        let (_, exit_code) = run(&shell, "sleep 60").await;

        assert_ne!(exit_code, 0);
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.await.unwrap();
    }
}
