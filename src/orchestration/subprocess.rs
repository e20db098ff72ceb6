//! Subprocess orchestrator: real subprocesses for agent delegations.
//!
//! Mirrors claude's built-in Task tool for non-interactive runs. The PM
//! one-shot produces a delegation plan; each detected delegation is run
//! as its own claude subprocess through a bounded worker pool, and the
//! results are aggregated into a Task-tool-styled summary.
//!
//! The interactive variant is best-effort: delegations are detected at
//! turn boundaries and fanned out between turns, so mid-turn Task-tool
//! calls inside claude itself are not intercepted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::core::launcher::{ClaudeLauncher, LaunchOptions};
use crate::core::socketio_pool::emit_hook_event;
use crate::error::MpmError;
use crate::hooks::client::HookServiceClient;
use crate::orchestration::agent_delegator::{display_agent_name, Delegation, DelegationSource};
use crate::orchestration::base::{parse_conversation_file, Orchestrator, OrchestratorCore};
use crate::orchestration::todo_hijacker::TodoHijacker;
use crate::skills::manager::SkillManager;

/// Completion state of one agent subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// The subprocess exited cleanly.
    Completed,
    /// The subprocess failed, timed out, or could not be spawned.
    Failed,
}

/// Outcome of one agent subprocess.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Canonical agent name.
    pub agent: String,
    /// Task the agent ran (after any hook rewrite).
    pub task: String,
    /// Agent response, or the error text on failure.
    pub response: String,
    /// Wall-clock execution time in seconds.
    pub execution_time: f64,
    /// Rough token estimate: `(|prompt| + |response|) / 4`.
    pub tokens: usize,
    /// Completion state.
    pub status: AgentStatus,
}

/// Everything one agent invocation needs, detached from the orchestrator
/// so it can run on the worker pool.
struct AgentInvocation {
    launcher: ClaudeLauncher,
    hook_client: Option<HookServiceClient>,
    agent: String,
    task: String,
    agent_definition: String,
    timeout: Duration,
}

impl AgentInvocation {
    /// Run the agent subprocess end to end: pre-delegation hook, one-shot
    /// execution, post-delegation hook. Returns the result plus any
    /// tickets the post hook extracted.
    async fn run(mut self) -> (AgentResult, Vec<Value>) {
        let start = Instant::now();

        if let Some(hook_client) = &self.hook_client {
            log::info!("Calling pre-delegation hook for {}", self.agent);
            let results = hook_client
                .execute_pre_delegation_hook(&self.agent, json!({"task": self.task}))
                .await;
            if let Some(task) = task_rewrite(&results) {
                log::info!(
                    "Task modified by hook: {}",
                    task.chars().take(50).collect::<String>()
                );
                self.task = task;
            }
        }

        let prompt = create_agent_prompt(&self.agent, &self.agent_definition, &self.task);
        let token_estimate = prompt.len() / 4;
        log::info!(
            "Running subprocess for {} ({token_estimate} est. tokens)",
            self.agent
        );

        let output = self
            .launcher
            .launch_oneshot(&prompt, None, true, self.timeout)
            .await;

        let execution_time = start.elapsed().as_secs_f64();

        match output {
            Ok(output) if output.returncode == 0 => {
                let response = output.stdout.trim().to_string();
                let tokens = (prompt.len() + response.len()) / 4;

                let mut hook_tickets = Vec::new();
                if let Some(hook_client) = &self.hook_client {
                    log::info!("Calling post-delegation hook for {}", self.agent);
                    let results = hook_client
                        .execute_post_delegation_hook(
                            &self.agent,
                            json!({
                                "task": self.task,
                                "response": response,
                                "execution_time": execution_time,
                                "tokens": tokens,
                            }),
                        )
                        .await;
                    hook_tickets = HookServiceClient::get_extracted_tickets(&results);
                    if !hook_tickets.is_empty() {
                        log::info!("Extracted {} tickets from hooks", hook_tickets.len());
                    }
                }

                (
                    AgentResult {
                        agent: self.agent,
                        task: self.task,
                        response,
                        execution_time,
                        tokens,
                        status: AgentStatus::Completed,
                    },
                    hook_tickets,
                )
            }
            Ok(output) if output.returncode == -1 => {
                let message = format!("Subprocess timed out after {execution_time:.1}s");
                log::error!("{} {message}", self.agent);
                (self.failed(message, execution_time, token_estimate), Vec::new())
            }
            Ok(output) => {
                let message = format!("Subprocess failed: {}", output.stderr.trim());
                log::error!("{} subprocess error: {message}", self.agent);
                (self.failed(message, execution_time, token_estimate), Vec::new())
            }
            Err(err) => {
                let message = format!("Subprocess error: {err}");
                log::error!("{} {message}", self.agent);
                (self.failed(message, execution_time, token_estimate), Vec::new())
            }
        }
    }

    fn failed(&self, message: String, execution_time: f64, tokens: usize) -> AgentResult {
        AgentResult {
            agent: self.agent.clone(),
            task: self.task.clone(),
            response: message,
            execution_time,
            tokens,
            status: AgentStatus::Failed,
        }
    }
}

/// Task rewrite requested by `pre_delegation` hooks. First writer wins.
fn task_rewrite(results: &[crate::hooks::client::HookResult]) -> Option<String> {
    results.iter().find_map(|r| {
        if !r.modified {
            return None;
        }
        r.data
            .as_ref()
            .and_then(|d| d.get("task"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

/// Build the prompt for an agent subprocess.
fn create_agent_prompt(agent: &str, agent_definition: &str, task: &str) -> String {
    let display = display_agent_name(agent);
    format!(
        "You are the {display} Agent in the Claude PM Framework.\n\n\
         {agent_definition}\n\n\
         ## Current Task\n\
         {task}\n\n\
         ## Response Format\n\
         Provide a clear, structured response that:\n\
         1. Confirms your role as {display} Agent\n\
         2. Completes the requested task\n\
         3. Reports any issues or blockers\n\
         4. Summarizes deliverables\n\n\
         Remember: You are an autonomous agent. Complete the task independently and report results."
    )
}

/// Delegation-format instruction appended to the PM framework.
const DELEGATION_FORMAT_INSTRUCTION: &str = "\n\
## Delegation Format\n\
When delegating tasks, use this exact format:\n\
**[Agent Name]**: [Task description]\n\n\
Example:\n\
**Engineer**: Create a function that calculates factorial\n\
**QA**: Write tests for the factorial function\n";

/// Orchestrator that spawns a real subprocess per detected delegation.
pub struct SubprocessOrchestrator {
    core: OrchestratorCore,
    launcher: ClaudeLauncher,
    skill_manager: Option<SkillManager>,
    todo_hijacker: Option<TodoHijacker>,
    todo_rx: Option<mpsc::Receiver<Delegation>>,
    interactive_mode: bool,
    max_parallel_agents: usize,
    pm_timeout: Duration,
    agent_timeout: Duration,
}

impl SubprocessOrchestrator {
    /// Create the orchestrator.
    ///
    /// `enable_todo_hijacking` wires a [`TodoHijacker`] whose delegations
    /// are drained after the PM turn; `interactive_mode` switches
    /// [`run_interactive`](Orchestrator::run_interactive) to the
    /// turn-loop variant.
    pub fn new(
        core: OrchestratorCore,
        launcher: ClaudeLauncher,
        skill_manager: Option<SkillManager>,
        enable_todo_hijacking: bool,
        todo_dir: Option<std::path::PathBuf>,
        interactive_mode: bool,
        max_parallel_agents: usize,
        pm_timeout: Duration,
        agent_timeout: Duration,
    ) -> Result<Self, MpmError> {
        let (todo_hijacker, todo_rx) = if enable_todo_hijacking {
            let (tx, rx) = mpsc::channel(256);
            let hijacker = TodoHijacker::new(todo_dir, tx)?;
            log::info!("TODO hijacking enabled");
            (Some(hijacker), Some(rx))
        } else {
            (None, None)
        };

        Ok(Self {
            core,
            launcher,
            skill_manager,
            todo_hijacker,
            todo_rx,
            interactive_mode,
            max_parallel_agents,
            pm_timeout,
            agent_timeout,
        })
    }

    /// Resolve (and optionally skill-enhance) the definition text for an
    /// agent.
    fn agent_definition(&self, agent: &str) -> String {
        let definition = self
            .core
            .framework_loader
            .agent_definition_for(agent)
            .unwrap_or_default()
            .to_string();

        match &self.skill_manager {
            Some(manager) => manager.enhance_agent_prompt(agent, &definition, false),
            None => definition,
        }
    }

    fn invocation(&self, delegation: &Delegation) -> AgentInvocation {
        AgentInvocation {
            launcher: self.launcher.clone(),
            hook_client: self.core.hook_client.clone(),
            agent: delegation.agent.clone(),
            task: delegation.task.clone(),
            agent_definition: self.agent_definition(&delegation.agent),
            timeout: self.agent_timeout,
        }
    }

    /// Run delegations through the bounded worker pool and collect the
    /// results in completion order.
    pub async fn run_parallel_tasks(&mut self, delegations: Vec<Delegation>) -> Vec<AgentResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_agents.max(1)));
        let mut join_set = JoinSet::new();

        for delegation in &delegations {
            let invocation = self.invocation(delegation);
            let semaphore = Arc::clone(&semaphore);
            emit_hook_event(
                "/hook",
                "agent_delegation_start",
                json!({"agent": delegation.agent, "task": delegation.task})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            );
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                invocation.run().await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((result, hook_tickets)) => {
                    for ticket in &hook_tickets {
                        self.core.ticket_extractor.add_ticket_value(ticket);
                    }
                    self.core
                        .log_interaction(format!("{}_response", result.agent), result.response.clone());
                    emit_hook_event(
                        "/hook",
                        "agent_delegation_complete",
                        json!({
                            "agent": result.agent,
                            "status": if result.status == AgentStatus::Completed { "completed" } else { "failed" },
                            "execution_time": result.execution_time,
                            "tokens": result.tokens,
                        })
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                    );
                    results.push(result);
                }
                Err(err) => log::error!("Agent task panicked: {err}"),
            }
        }
        results
    }

    /// Format subprocess results in claude's Task-tool style.
    pub fn format_results(results: &[AgentResult]) -> String {
        let mut output = Vec::new();

        for result in results {
            let icon = if result.status == AgentStatus::Completed {
                "⏺"
            } else {
                "❌"
            };
            let task_prefix: String = result.task.chars().take(50).collect();
            let tokens_k = result.tokens as f64 / 1000.0;

            output.push(format!("{icon} Task({task_prefix}...)"));
            output.push(format!(
                "  ⎿  Done (0 tool uses · {tokens_k:.1}k tokens · {:.1}s)",
                result.execution_time
            ));
            output.push(String::new());
        }

        output.push("## Agent Responses\n".to_string());
        for result in results {
            output.push(format!("### {} Agent", display_agent_name(&result.agent)));
            output.push(result.response.clone());
            output.push(String::new());
        }

        output.join("\n")
    }

    /// Drain delegations the hijacker produced so far.
    fn drain_todo_delegations(&mut self) -> Vec<Delegation> {
        let mut delegations = Vec::new();
        if let Some(rx) = &mut self.todo_rx {
            while let Ok(delegation) = rx.try_recv() {
                delegations.push(delegation);
            }
        }
        delegations
    }

    /// Extract tickets from the PM output and every agent response, and
    /// notify the `ticket_extraction` hook per line.
    async fn extract_session_tickets(&mut self, pm_response: &str, results: &[AgentResult]) {
        let mut combined = pm_response.to_string();
        for result in results {
            combined.push('\n');
            combined.push_str(&result.response);
        }

        for line in combined.lines() {
            let tickets = self.core.ticket_extractor.extract_from_line(line);
            for ticket in &tickets {
                log::info!("Extracted ticket: {} - {}", ticket.ticket_type, ticket.title);
            }
            if let Some(hook_client) = &self.core.hook_client {
                let _ = hook_client
                    .execute_ticket_extraction_hook(json!({
                        "line": line,
                        "tickets_found": tickets.len(),
                    }))
                    .await;
            }
        }
    }

    /// One PM-then-fan-out pass over a block of user input.
    async fn orchestrate_turn(&mut self, pm_response: &str) {
        let mut delegations = self.core.agent_delegator.detect_delegations(pm_response);

        if self.todo_hijacker.is_some() {
            // Let late TODO files settle before draining.
            tokio::time::sleep(Duration::from_millis(500)).await;
            let todo_delegations = self.drain_todo_delegations();
            if !todo_delegations.is_empty() {
                println!(
                    "\nDetected {} TODO-based delegations",
                    todo_delegations.len()
                );
                delegations.extend(todo_delegations);
            }
        }

        let results = if delegations.is_empty() {
            println!("\nNo delegations detected in PM response.");
            Vec::new()
        } else {
            println!(
                "\nDetected {} delegations. Running subprocesses...\n",
                delegations.len()
            );
            let results = self.run_parallel_tasks(delegations.clone()).await;
            println!("{}", Self::format_results(&results));
            results
        };

        // Completed TODO delegations must never re-emit.
        if let Some(hijacker) = &self.todo_hijacker {
            for delegation in delegations
                .iter()
                .filter(|d| d.source == DelegationSource::TodoHijacker)
            {
                hijacker.mark_delegation_completed(delegation);
            }
        }

        self.extract_session_tickets(pm_response, &results).await;
    }
}

#[async_trait]
impl Orchestrator for SubprocessOrchestrator {
    async fn run_interactive(&mut self) -> Result<(), MpmError> {
        if self.interactive_mode {
            return self.run_interactive_turn_loop().await;
        }

        println!("Claude MPM v{} - Interactive Session (Subprocess Mode)", crate::VERSION);
        println!("Starting Claude with subprocess orchestration...");
        println!("{}", "-".repeat(50));
        println!("\nNote: in plain interactive mode delegations are handled by claude");
        println!("itself. For subprocess control, use: claude-mpm --subprocess -i 'your prompt'");
        println!("{}", "-".repeat(50));

        let mut child = self.launcher.launch_interactive(&LaunchOptions::default())?;
        let status = child.wait().await?;
        log::info!("Claude exited with code: {:?}", status.code());

        self.core.cleanup().await;
        Ok(())
    }

    async fn run_non_interactive(&mut self, user_input: &str) -> Result<(), MpmError> {
        if let Some(hijacker) = &self.todo_hijacker {
            if let Err(err) = hijacker.start_monitoring() {
                log::warn!("TODO hijacker failed to start: {err}");
            }
        }

        if let Some(hook_client) = &self.core.hook_client {
            log::info!("Calling submit hook for user input");
            let _ = hook_client
                .execute_submit_hook(user_input, json!({"session_type": "subprocess"}))
                .await;
        }

        emit_hook_event(
            "/hook",
            "session_start",
            json!({"session_type": "subprocess"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        );

        let mut framework = self.core.framework_loader.minimal_framework_instructions();
        framework.push_str(DELEGATION_FORMAT_INSTRUCTION);
        let full_message = format!("{framework}\n\nUser: {user_input}");

        self.core.log_interaction("input", user_input);
        log::info!("Running PM with user input");

        let output = self
            .launcher
            .launch_oneshot(&full_message, None, true, self.pm_timeout)
            .await?;

        if output.returncode != 0 {
            if output.returncode == -1 {
                println!(
                    "Error: PM run timed out after {:.1}s (partial output: {})",
                    self.pm_timeout.as_secs_f64(),
                    !output.stdout.is_empty()
                );
            } else {
                println!("Error: {}", output.stderr.trim());
            }
            if let Some(hijacker) = &self.todo_hijacker {
                hijacker.stop_monitoring();
            }
            self.core.cleanup().await;
            return Ok(());
        }

        let pm_response = output.stdout;
        println!("PM Response:");
        println!("{}", "-".repeat(50));
        println!("{pm_response}");
        println!("{}", "-".repeat(50));
        self.core.log_interaction("pm_response", pm_response.clone());

        self.orchestrate_turn(&pm_response).await;

        if let Some(hijacker) = &self.todo_hijacker {
            hijacker.stop_monitoring();
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

impl SubprocessOrchestrator {
    /// Interactive turn loop: each user line runs as a one-shot, and
    /// delegations detected in the response are fanned out between turns.
    async fn run_interactive_turn_loop(&mut self) -> Result<(), MpmError> {
        println!("Claude MPM v{} - Interactive Subprocess Session", crate::VERSION);
        println!("Type 'exit' or 'quit' to end session");
        println!("{}", "-".repeat(50));

        let framework = self.core.get_framework_instructions().await;
        let mut first_interaction = true;
        let mut conversation_file: Option<String> = None;

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            print!("\nYou: ");
            use std::io::Write as _;
            let _ = std::io::stdout().flush();

            let Ok(Some(line)) = lines.next_line().await else {
                break;
            };
            let user_input = line.trim().to_string();
            if user_input.is_empty() {
                continue;
            }
            if user_input.eq_ignore_ascii_case("exit") || user_input.eq_ignore_ascii_case("quit") {
                break;
            }

            let full_message = if first_interaction {
                first_interaction = false;
                format!("{framework}\n\nUser: {user_input}")
            } else {
                user_input.clone()
            };
            self.core.log_interaction("input", user_input);

            let opts = LaunchOptions {
                input_text: Some(full_message),
                use_stdin: true,
                extra_args: conversation_file
                    .as_ref()
                    .map(|file| vec!["--continue".to_string(), file.clone()])
                    .unwrap_or_default(),
                ..LaunchOptions::default()
            };
            let output = self.launcher.launch_oneshot_with(opts, self.pm_timeout).await?;

            if output.returncode != 0 {
                println!("Error: {}", output.stderr.trim());
                continue;
            }

            let response = output.stdout;
            println!("\nClaude: {response}");
            self.core.log_interaction("output", response.clone());

            if let Some(file) = parse_conversation_file(&output.stderr) {
                conversation_file = Some(file);
            }

            self.orchestrate_turn(&response).await;
        }

        println!("\nSession ended");
        self.core.cleanup().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(agent: &str, status: AgentStatus) -> AgentResult {
        AgentResult {
            agent: agent.to_string(),
            task: "Implement login endpoint".to_string(),
            response: "Implemented /login. TODO: Add rate limiting.".to_string(),
            execution_time: 1.5,
            tokens: 1200,
            status,
        }
    }

    #[test]
    fn test_create_agent_prompt_contract() {
        let prompt = create_agent_prompt("engineer", "# Engineer Agent\nRules.", "Use JWT instead");

        assert!(prompt.starts_with("You are the Engineer Agent in the Claude PM Framework."));
        assert!(prompt.contains("# Engineer Agent\nRules."));
        assert!(prompt.contains("## Current Task\nUse JWT instead"));
        assert!(prompt.contains("## Response Format"));
        assert!(prompt.contains("Confirms your role as Engineer Agent"));
        assert!(prompt.ends_with("Complete the task independently and report results."));
    }

    #[test]
    fn test_format_results_task_tool_style() {
        let formatted = SubprocessOrchestrator::format_results(&[
            result("engineer", AgentStatus::Completed),
            result("qa", AgentStatus::Failed),
        ]);

        assert!(formatted.contains("⏺ Task(Implement login endpoint...)"));
        assert!(formatted.contains("❌ Task(Implement login endpoint...)"));
        assert!(formatted.contains("1.2k tokens"));
        assert!(formatted.contains("1.5s"));
        assert!(formatted.contains("### Engineer Agent"));
        assert!(formatted.contains("### QA Agent"));
    }

    #[test]
    fn test_formatted_results_redetect_delegations() {
        // The detector finds the same agents in the formatted summary's
        // response sections.
        let formatted = SubprocessOrchestrator::format_results(&[AgentResult {
            agent: "engineer".to_string(),
            task: "a".to_string(),
            response: "**QA**: Write unit tests for login".to_string(),
            execution_time: 0.1,
            tokens: 10,
            status: AgentStatus::Completed,
        }]);

        let mut delegator = crate::orchestration::agent_delegator::AgentDelegator::new();
        let redetected = delegator.detect_delegations(&formatted);
        assert!(redetected
            .iter()
            .any(|d| d.agent == "qa" && d.task == "Write unit tests for login"));
    }

    #[test]
    fn test_delegation_format_instruction_parses_back() {
        let mut delegator = crate::orchestration::agent_delegator::AgentDelegator::new();
        let delegations = delegator.detect_delegations(DELEGATION_FORMAT_INSTRUCTION);
        // The instruction's own example delegations are valid.
        assert!(delegations.iter().any(|d| d.agent == "engineer"));
        assert!(delegations.iter().any(|d| d.agent == "qa"));
    }

    #[test]
    fn test_task_rewrite_first_writer_wins() {
        use crate::hooks::client::HookResult;

        let results = vec![
            HookResult {
                success: true,
                modified: false,
                data: Some(json!({"task": "ignored"}).as_object().unwrap().clone()),
                ..HookResult::default()
            },
            HookResult {
                success: true,
                modified: true,
                data: Some(json!({"task": "Use JWT instead"}).as_object().unwrap().clone()),
                ..HookResult::default()
            },
            HookResult {
                success: true,
                modified: true,
                data: Some(json!({"task": "second writer"}).as_object().unwrap().clone()),
                ..HookResult::default()
            },
        ];

        assert_eq!(task_rewrite(&results).as_deref(), Some("Use JWT instead"));

        // The rewritten task lands in the Current Task section.
        let prompt = create_agent_prompt("engineer", "", &task_rewrite(&results).unwrap());
        assert!(prompt.contains("## Current Task\nUse JWT instead"));
    }

    #[test]
    fn test_parse_conversation_file() {
        assert_eq!(
            parse_conversation_file("Conversation saved to: /tmp/conv.json\n"),
            Some("/tmp/conv.json".to_string())
        );
        assert_eq!(
            parse_conversation_file("saved to /var/x.json"),
            Some("/var/x.json".to_string())
        );
        assert_eq!(parse_conversation_file("nothing here"), None);
    }

    /// Stub claude executable: answers as PM or as an agent depending on
    /// the prompt it receives on stdin.
    #[cfg(unix)]
    fn stub_claude(dir: &std::path::Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("claude-stub.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             input=$(cat)\n\
             case \"$input\" in\n\
               *\"You are the Engineer Agent\"*) printf 'Implemented /login. TODO: Add rate limiting.\\n' ;;\n\
               *\"You are the QA Agent\"*) printf 'Wrote 4 tests. BUG: password-logging in debug mode.\\n' ;;\n\
               *) printf '**Engineer**: Implement login endpoint\\n\\n**QA**: Write unit tests for login\\n' ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_interactive_end_to_end_with_stub_cli() {
        let tmp = tempfile::TempDir::new().unwrap();
        let loader = crate::core::framework_loader::FrameworkLoader::new(
            Some(tmp.path().to_path_buf()),
            None,
        );
        let mut core = OrchestratorCore::new("SubprocessOrchestrator", loader, None);
        core.set_sessions_dir(tmp.path().join("sessions"));

        let launcher = ClaudeLauncher::with_executable("opus", true, stub_claude(tmp.path()));
        let mut orchestrator = SubprocessOrchestrator::new(
            core,
            launcher,
            None,
            false,
            None,
            false,
            3,
            Duration::from_secs(10),
            Duration::from_secs(10),
        )
        .unwrap();

        orchestrator
            .run_non_interactive("Implement login and write tests.")
            .await
            .unwrap();

        // One task ticket from the Engineer run, one bug from the QA run.
        let summary = orchestrator.core().ticket_summary();
        assert_eq!(summary.get("task"), Some(&1));
        assert_eq!(summary.get("bug"), Some(&1));
        assert_eq!(orchestrator.core().ticket_extractor.len(), 2);

        let delegations = orchestrator.core().delegation_summary();
        assert_eq!(delegations.get("engineer"), Some(&1));
        assert_eq!(delegations.get("qa"), Some(&1));

        // The session log captured the run.
        let sessions: Vec<_> = std::fs::read_dir(tmp.path().join("sessions"))
            .unwrap()
            .collect();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_run_parallel_tasks_collects_failures_without_cancelling() {
        // /bin/false exits 1 for every agent; each delegation must yield a
        // failed AgentResult rather than aborting the batch.
        let tmp = tempfile::TempDir::new().unwrap();
        let loader =
            crate::core::framework_loader::FrameworkLoader::new(Some(tmp.path().to_path_buf()), None);
        let core = OrchestratorCore::new("SubprocessOrchestrator", loader, None);
        let launcher = ClaudeLauncher::with_executable(
            "opus",
            true,
            std::path::PathBuf::from("/bin/false"),
        );
        let mut orchestrator = SubprocessOrchestrator::new(
            core,
            launcher,
            None,
            false,
            None,
            false,
            3,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();

        let delegations = vec![
            Delegation {
                agent: "engineer".to_string(),
                task: "Implement login endpoint".to_string(),
                source: DelegationSource::DetectorMarkdown,
                confidence: 1.0,
                timestamp: Utc::now(),
                priority: None,
                labels: None,
                todo_id: None,
                ticket_type: None,
                format: Some("markdown".to_string()),
            },
            Delegation {
                agent: "qa".to_string(),
                task: "Write unit tests for login".to_string(),
                source: DelegationSource::DetectorMarkdown,
                confidence: 1.0,
                timestamp: Utc::now(),
                priority: None,
                labels: None,
                todo_id: None,
                ticket_type: None,
                format: Some("markdown".to_string()),
            },
        ];

        let results = orchestrator.run_parallel_tasks(delegations).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == AgentStatus::Failed));
        let mut agents: Vec<&str> = results.iter().map(|r| r.agent.as_str()).collect();
        agents.sort_unstable();
        assert_eq!(agents, vec!["engineer", "qa"]);
    }
}
