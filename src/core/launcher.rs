//! Unified claude CLI launcher for all orchestrators.
//!
//! Builds the argv for the underlying claude executable, resolves the
//! executable location, and spawns child processes with piped stdio.
//! Three launch shapes are supported: interactive, one-shot print, and
//! append-system-prompt.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::MpmError;

/// Claude launch modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Plain interactive session.
    Interactive,
    /// One-shot print mode (`--print`).
    Print,
    /// Interactive with the framework appended as system prompt.
    SystemPrompt,
}

/// Options for a single launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Session id passed as `--session-id`.
    pub session_id: Option<String>,
    /// System prompt content (SystemPrompt mode).
    pub system_prompt: Option<String>,
    /// Extra argv entries appended after the mode flags.
    pub extra_args: Vec<String>,
    /// Input text for Print mode.
    pub input_text: Option<String>,
    /// Send `input_text` through stdin instead of argv.
    pub use_stdin: bool,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
}

/// Captured output of a one-shot run.
#[derive(Debug, Clone, Default)]
pub struct OneshotOutput {
    /// Captured stdout (possibly partial after a timeout).
    pub stdout: String,
    /// Captured stderr (possibly partial after a timeout).
    pub stderr: String,
    /// Child exit code; `-1` after a kill-on-timeout.
    pub returncode: i32,
}

impl OneshotOutput {
    /// Whether the run completed with exit code 0.
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Centralized claude CLI launcher.
#[derive(Debug, Clone)]
pub struct ClaudeLauncher {
    model: String,
    skip_permissions: bool,
    claude_path: PathBuf,
}

impl ClaudeLauncher {
    /// Create a launcher, resolving the claude executable.
    ///
    /// # Errors
    ///
    /// Returns [`MpmError::ClaudeNotFound`] when no executable exists at
    /// the well-known locations or on `$PATH`.
    pub fn new(model: impl Into<String>, skip_permissions: bool) -> Result<Self, MpmError> {
        let claude_path = find_claude_executable().ok_or(MpmError::ClaudeNotFound)?;
        log::debug!("Found claude at: {}", claude_path.display());

        Ok(Self {
            model: model.into(),
            skip_permissions,
            claude_path,
        })
    }

    /// Create a launcher around an explicit executable path (used by tests
    /// and by deployments with a pinned binary).
    pub fn with_executable(
        model: impl Into<String>,
        skip_permissions: bool,
        claude_path: PathBuf,
    ) -> Self {
        Self {
            model: model.into(),
            skip_permissions,
            claude_path,
        }
    }

    /// Resolved path of the claude executable.
    pub fn claude_path(&self) -> &PathBuf {
        &self.claude_path
    }

    /// Model the launcher was configured with.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the argv for a launch, excluding the executable itself.
    pub fn build_command(&self, mode: LaunchMode, opts: &LaunchOptions) -> Vec<String> {
        let mut cmd = vec!["--model".to_string(), self.model.clone()];

        if self.skip_permissions {
            cmd.push("--dangerously-skip-permissions".to_string());
        }

        if let Some(session_id) = &opts.session_id {
            cmd.push("--session-id".to_string());
            cmd.push(session_id.clone());
        }

        match mode {
            LaunchMode::Print => cmd.push("--print".to_string()),
            LaunchMode::SystemPrompt => {
                if let Some(system_prompt) = &opts.system_prompt {
                    cmd.push("--append-system-prompt".to_string());
                    cmd.push(system_prompt.clone());
                }
            }
            LaunchMode::Interactive => {}
        }

        cmd.extend(opts.extra_args.iter().cloned());
        cmd
    }

    /// Spawn a claude child process.
    ///
    /// All three stdio streams are piped. In Print mode the input text is
    /// appended to argv unless `use_stdin` is set, in which case the
    /// caller is expected to write it to the returned child's stdin.
    pub fn launch(&self, mode: LaunchMode, opts: &LaunchOptions) -> Result<Child, MpmError> {
        let mut argv = self.build_command(mode, opts);

        let mut stdin_payload = None;
        if mode == LaunchMode::Print {
            if let Some(input) = &opts.input_text {
                if opts.use_stdin {
                    stdin_payload = Some(input.clone());
                } else {
                    argv.push(input.clone());
                }
            }
        }

        log::info!("Launching claude in {mode:?} mode");
        log::debug!("Built command: {} {}", self.claude_path.display(), argv.join(" "));

        let mut command = Command::new(&self.claude_path);
        command
            .args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;

        if let Some(payload) = stdin_payload {
            // Hand the write to a background task so launch() stays
            // non-blocking; the pipe is closed when the write finishes.
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                        log::warn!("Failed to write claude stdin: {err}");
                    }
                    let _ = stdin.shutdown().await;
                });
            }
        }

        Ok(child)
    }

    /// Spawn an interactive claude session inheriting the caller's stdio.
    pub fn launch_interactive(&self, opts: &LaunchOptions) -> Result<Child, MpmError> {
        let argv = self.build_command(LaunchMode::Interactive, opts);
        log::info!("Launching claude in Interactive mode");

        let mut command = Command::new(&self.claude_path);
        command.args(&argv);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }

        Ok(command.spawn()?)
    }

    /// Spawn an interactive claude session with the framework appended as
    /// system prompt, inheriting the caller's stdio.
    pub fn launch_with_system_prompt(
        &self,
        system_prompt: &str,
        session_id: Option<&str>,
    ) -> Result<Child, MpmError> {
        let opts = LaunchOptions {
            session_id: session_id.map(str::to_string),
            system_prompt: Some(system_prompt.to_string()),
            ..LaunchOptions::default()
        };
        let argv = self.build_command(LaunchMode::SystemPrompt, &opts);
        log::info!("Launching claude in SystemPrompt mode");

        Ok(Command::new(&self.claude_path).args(&argv).spawn()?)
    }

    /// Run a one-shot print-mode invocation and wait for it.
    ///
    /// On timeout the child is killed and the partial output is returned
    /// with `returncode == -1`.
    pub async fn launch_oneshot(
        &self,
        message: &str,
        session_id: Option<&str>,
        use_stdin: bool,
        timeout: Duration,
    ) -> Result<OneshotOutput, MpmError> {
        let opts = LaunchOptions {
            session_id: session_id.map(str::to_string),
            input_text: Some(message.to_string()),
            use_stdin,
            ..LaunchOptions::default()
        };
        self.launch_oneshot_with(opts, timeout).await
    }

    /// One-shot variant taking full [`LaunchOptions`] (extra argv entries,
    /// working directory).
    pub async fn launch_oneshot_with(
        &self,
        opts: LaunchOptions,
        timeout: Duration,
    ) -> Result<OneshotOutput, MpmError> {
        let start = Instant::now();
        let mut child = self.launch(LaunchMode::Print, &opts)?;

        // Drain both pipes concurrently so a chatty child cannot deadlock
        // against a full pipe buffer.
        let stdout_task = spawn_reader(child.stdout.take());
        let stderr_task = spawn_reader(child.stderr.take());

        let status = tokio::time::timeout(timeout, child.wait()).await;

        match status {
            Ok(status) => {
                let status = status?;
                Ok(OneshotOutput {
                    stdout: stdout_task.await.unwrap_or_default(),
                    stderr: stderr_task.await.unwrap_or_default(),
                    returncode: status.code().unwrap_or(-1),
                })
            }
            Err(_) => {
                log::error!(
                    "claude one-shot timed out after {:.1}s, killing child",
                    start.elapsed().as_secs_f64()
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                Ok(OneshotOutput {
                    stdout: stdout_task.await.unwrap_or_default(),
                    stderr: stderr_task.await.unwrap_or_default(),
                    returncode: -1,
                })
            }
        }
    }
}

/// Read an optional child pipe to completion on a background task.
fn spawn_reader<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf).await;
        }
        buf
    })
}

/// Locate the claude executable: well-known absolute paths first, then
/// every `$PATH` entry.
fn find_claude_executable() -> Option<PathBuf> {
    let home = std::env::var("HOME").unwrap_or_default();
    let well_known = [
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
        PathBuf::from(&home).join(".local/bin/claude"),
    ];

    for candidate in well_known {
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join("claude");
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}
