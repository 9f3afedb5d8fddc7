//! A long-lived interactive shell behind a PTY.
//!
//! The shell is spawned once per job and stays alive across commands so
//! that state (exported vars, cwd, shell options) persists. Reads and
//! writes race against an exit signal that fires when the boot process
//! dies abruptly (`exit 1`, `set -e`, an external kill), so callers never
//! hang on a dead shell.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("shell closed")]
    Closed,

    #[error("failed to start shell: {0}")]
    StartFailed(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ShellError> = std::result::Result<T, E>;

/// Default shell executable and arguments: a login shell, so the job sees
/// the same environment an SSH session would.
pub fn executable() -> &'static str {
    "bash"
}

pub fn args() -> Vec<String> {
    vec!["--login".to_string()]
}

struct ShellInner {
    chunks: Mutex<mpsc::Receiver<Vec<u8>>>,
    writer: StdMutex<Option<Box<dyn Write + Send>>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    exit_signal: watch::Receiver<Option<String>>,
    closed: AtomicBool,
    storage_path: PathBuf,
}

/// Handle to a running shell. Cheap to clone; all clones refer to the same
/// underlying PTY and boot process.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

impl Shell {
    /// Start the default login shell.
    pub async fn start(storage_path: &Path) -> Result<Shell> {
        Shell::start_from_exec_and_args(executable(), &args(), storage_path).await
    }

    /// Start an arbitrary executable as the stateful shell. Used by the
    /// compose executor to open a shell inside the main container.
    pub async fn start_from_exec_and_args(
        executable: &str,
        args: &[String],
        storage_path: &Path,
    ) -> Result<Shell> {
        debug!("Starting stateful shell: {} {:?}", executable, args);

        let pty = native_pty_system()
            .openpty(PtySize { rows: 24, cols: 80, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| ShellError::Pty(e.to_string()))?;

        let mut command = CommandBuilder::new(executable);
        command.args(args);
        if let Ok(cwd) = std::env::current_dir() {
            command.cwd(cwd);
        }

        let mut child = pty
            .slave
            .spawn_command(command)
            .map_err(|e| ShellError::Pty(e.to_string()))?;
        drop(pty.slave);

        let killer = child.clone_killer();
        let reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| ShellError::Pty(e.to_string()))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| ShellError::Pty(e.to_string()))?;

        let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<u8>>(64);
        std::thread::spawn(move || pump_reader(reader, chunk_tx));

        let (exit_tx, exit_rx) = watch::channel(None);
        std::thread::spawn(move || {
            let message = match child.wait() {
                Ok(status) => format!("exit status {}", status.exit_code()),
                Err(err) => err.to_string(),
            };
            debug!("Shell boot process finished: {}", message);
            let _ = exit_tx.send(Some(message));
        });

        let shell = Shell {
            inner: Arc::new(ShellInner {
                chunks: Mutex::new(chunk_rx),
                writer: StdMutex::new(Some(writer)),
                killer: StdMutex::new(killer),
                master: StdMutex::new(Some(pty.master)),
                exit_signal: exit_rx,
                closed: AtomicBool::new(false),
                storage_path: storage_path.to_path_buf(),
            }),
        };

        shell.silence_prompt_and_disable_echo().await?;

        Ok(shell)
    }

    /// Scratch directory for per-command artifacts. For the compose
    /// executor this is the directory bind-mounted into the container.
    pub fn storage_path(&self) -> &Path {
        &self.inner.storage_path
    }

    /// Quiescence handshake: disable the prompt and terminal echo, then
    /// write a readiness nonce and discard output until the shell echoes
    /// it back on a line of its own.
    async fn silence_prompt_and_disable_echo(&self) -> Result<()> {
        let ready_mark: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(31)
            .map(char::from)
            .collect();

        self.write("export PS1=''").await?;
        self.write("stty -echo").await?;
        self.write("echo stty `stty -g` > /tmp/restore-tty").await?;
        self.write("cd ~").await?;
        self.write(&format!("echo '{ready_mark}'")).await?;

        // Until `stty -echo` takes effect the terminal echoes the setup
        // commands back, including the line that writes the nonce. A line
        // that carries the nonce but no `echo` is the shell itself
        // printing it: the shell is ready.
        debug!("Waiting for shell initialization");

        let mut pending = Vec::new();
        loop {
            let chunk = self.read().await?;
            pending.extend_from_slice(&chunk);

            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\r', '\n']);

                debug!("(tty) {}", line);

                if line.contains("executable file not found") {
                    return Err(ShellError::StartFailed(line.to_string()));
                }

                if !line.contains("echo") && line.contains(&ready_mark) {
                    return Ok(());
                }
            }
        }
    }

    /// Read the next chunk of PTY output. Returns [`ShellError::Closed`]
    /// once the shell has died and its output is drained.
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut chunks = self.inner.chunks.lock().await;
        let mut exit_signal = self.inner.exit_signal.clone();

        tokio::select! {
            biased;

            chunk = chunks.recv() => chunk.ok_or(ShellError::Closed),
            _ = exit_signal.changed() => Err(ShellError::Closed),
        }
    }

    /// Send one instruction line to the shell.
    pub async fn write(&self, instruction: &str) -> Result<()> {
        debug!("Sending instruction: {}", instruction);

        let data = format!("{instruction}\n");
        let inner = Arc::clone(&self.inner);
        let mut exit_signal = self.inner.exit_signal.clone();

        let write_task = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = inner.writer.lock().expect("shell writer lock");
            match guard.as_mut() {
                Some(writer) => {
                    writer.write_all(data.as_bytes())?;
                    writer.flush()?;
                    Ok(())
                }
                None => Err(ShellError::Closed),
            }
        });

        tokio::select! {
            result = write_task => result.map_err(|_| ShellError::Closed)?,
            _ = exit_signal.changed() => Err(ShellError::Closed),
        }
    }

    /// Tear down the PTY and kill the boot process. Idempotent; a process
    /// that already exited is not an error. Closing the PTY is also how a
    /// running command gets terminated: the shell receives SIGHUP on its
    /// controlling terminal.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Closing shell");

        if let Err(err) = self.inner.killer.lock().expect("shell killer lock").kill() {
            // Raced with normal termination.
            debug!("Shell kill returned: {}", err);
        }

        drop(self.inner.writer.lock().expect("shell writer lock").take());
        drop(self.inner.master.lock().expect("shell master lock").take());

        Ok(())
    }

    /// Whether the boot process has terminated.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.exit_signal.borrow().is_some()
    }
}

fn pump_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) => {
                // EIO is the normal way a PTY reports that the child side
                // is gone.
                debug!("PTY reader finished: {}", err);
                break;
            }
        }
    }
}

impl Drop for ShellInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(err) = self.killer.lock().expect("shell killer lock").kill() {
                debug!("Shell kill on drop returned: {}", err);
            }
        }
    }
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .field("storage_path", &self.inner.storage_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let shell = Shell::start(dir.path()).await.unwrap();
        assert!(!shell.is_closed());
        shell.close().unwrap();
    }

    #[tokio::test]
    async fn read_fails_after_shell_exits() {
        let dir = tempfile::tempdir().unwrap();
        let shell = Shell::start(dir.path()).await.unwrap();

        shell.write("exit 1").await.unwrap();

        // Drain whatever is buffered; eventually the exit must surface.
        let mut closed = false;
        for _ in 0..100 {
            if shell.read().await.is_err() {
                closed = true;
                break;
            }
        }
        assert!(closed, "expected a shell-closed error after exit");
        shell.close().unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let shell = Shell::start(dir.path()).await.unwrap();
        shell.close().unwrap();
        shell.close().unwrap();
    }
}
