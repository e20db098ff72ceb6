//! Direct orchestrator.
//!
//! Primes claude with the framework through a one-shot `--print` call,
//! then hands the terminal to an interactive session that continues the
//! primed conversation (via `--continue <file>` when claude reports the
//! conversation file, or a shared `--session-id` otherwise). Ticket
//! extraction in interactive mode is best-effort from the priming
//! response only.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::launcher::{ClaudeLauncher, LaunchOptions};
use crate::error::MpmError;
use crate::orchestration::base::{
    default_prompts_dir, parse_conversation_file, snapshot_prompt, Orchestrator, OrchestratorCore,
};

/// Orchestrator that injects the framework with a priming one-shot.
pub struct DirectOrchestrator {
    core: OrchestratorCore,
    launcher: ClaudeLauncher,
    pm_timeout: Duration,
    /// Whether the framework has been injected this session. Kept
    /// in-process on purpose: a filesystem sentinel would be ambiguous
    /// across concurrent sessions.
    framework_injected: bool,
}

impl DirectOrchestrator {
    /// Create the orchestrator.
    pub fn new(core: OrchestratorCore, launcher: ClaudeLauncher, pm_timeout: Duration) -> Self {
        Self {
            core,
            launcher,
            pm_timeout,
            framework_injected: false,
        }
    }

    /// Whether the priming step has already run.
    pub fn framework_injected(&self) -> bool {
        self.framework_injected
    }
}

#[async_trait]
impl Orchestrator for DirectOrchestrator {
    async fn run_interactive(&mut self) -> Result<(), MpmError> {
        println!("Claude MPM Interactive Session");
        println!("Framework will be injected on first interaction");
        println!("{}", "-".repeat(50));

        let mut framework = self.core.get_framework_instructions().await;
        framework.push_str(
            "\n\nNOTE: This is the claude-mpm framework. Please acknowledge you've received \
             these instructions and then we can begin our session.\n",
        );

        snapshot_prompt(&default_prompts_dir(), &framework);

        let session_id = Uuid::new_v4().to_string();
        log::info!("Starting Claude with framework injection (session: {session_id})");

        println!("\nInjecting framework instructions...");
        let output = self
            .launcher
            .launch_oneshot(&framework, Some(&session_id), true, self.pm_timeout)
            .await?;

        if !output.success() {
            println!("Error injecting framework: {}", output.stderr.trim());
            self.core.cleanup().await;
            return Ok(());
        }
        self.framework_injected = true;

        println!("\nFramework injected. Claude's response:");
        println!("{}", "-".repeat(50));
        println!("{}", output.stdout);
        println!("{}", "-".repeat(50));

        self.core.log_interaction("framework_response", output.stdout.clone());
        for line in output.stdout.lines() {
            self.core.ticket_extractor.extract_from_line(line);
        }

        // Continue the primed conversation interactively.
        let conversation_file = parse_conversation_file(&output.stderr)
            .filter(|file| std::path::Path::new(file).exists());

        let opts = match &conversation_file {
            Some(file) => {
                println!("\nStarting interactive session...");
                println!("Continuing conversation from: {file}");
                LaunchOptions {
                    extra_args: vec!["--continue".to_string(), file.clone()],
                    ..LaunchOptions::default()
                }
            }
            None => {
                println!("\nStarting interactive session...");
                println!("Using session ID: {session_id}");
                LaunchOptions {
                    session_id: Some(session_id.clone()),
                    ..LaunchOptions::default()
                }
            }
        };

        let mut child = self.launcher.launch_interactive(&opts)?;
        let status = child.wait().await?;
        log::info!("Claude exited with code: {:?}", status.code());

        self.core.cleanup().await;
        Ok(())
    }

    async fn run_non_interactive(&mut self, user_input: &str) -> Result<(), MpmError> {
        let framework = self.core.get_framework_instructions().await;
        let full_message = format!("{framework}\n\nUser: {user_input}");
        self.core.log_interaction("input", user_input);

        let output = self
            .launcher
            .launch_oneshot(&full_message, None, true, self.pm_timeout)
            .await?;

        if output.success() {
            self.framework_injected = true;
            println!("{}", output.stdout);
            self.core.log_interaction("output", output.stdout.clone());

            for line in output.stdout.lines() {
                let tickets = self.core.ticket_extractor.extract_from_line(line);
                for ticket in &tickets {
                    log::info!("Extracted ticket: {} - {}", ticket.ticket_type, ticket.title);
                }
            }
        } else if output.returncode == -1 {
            println!(
                "Error: claude timed out after {:.1}s (partial output: {})",
                self.pm_timeout.as_secs_f64(),
                !output.stdout.is_empty()
            );
        } else {
            println!("Error: {}", output.stderr.trim());
        }

        self.core.cleanup().await;
        Ok(())
    }

    fn core(&self) -> &OrchestratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OrchestratorCore {
        &mut self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::framework_loader::FrameworkLoader;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_non_interactive_marks_framework_injected_on_success() {
        let tmp = TempDir::new().unwrap();
        let loader = FrameworkLoader::new(Some(tmp.path().to_path_buf()), None);
        let mut core = OrchestratorCore::new("DirectOrchestrator", loader, None);
        core.set_sessions_dir(tmp.path().join("sessions"));

        // /bin/true exits 0 and ignores the arguments.
        let launcher = ClaudeLauncher::with_executable("opus", true, PathBuf::from("/bin/true"));
        let mut orchestrator = DirectOrchestrator::new(core, launcher, Duration::from_secs(5));

        assert!(!orchestrator.framework_injected());
        orchestrator.run_non_interactive("hello").await.unwrap();
        assert!(orchestrator.framework_injected());
    }
}
