//! Shared orchestrator state and the strategy trait.
//!
//! Every orchestration strategy owns an [`OrchestratorCore`]: the
//! framework loader, ticket extractor, delegation detector, optional hook
//! client, optional ticket store, and the per-session state. Cleanup
//! persists the session log, pushes extracted tickets to the external
//! store, and fires the `submit` hook with aggregate stats; none of
//! these steps may fail the session.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::framework_loader::FrameworkLoader;
use crate::error::MpmError;
use crate::hooks::client::HookServiceClient;
use crate::orchestration::agent_delegator::{AgentDelegator, Delegation};
use crate::orchestration::ticket_extractor::{Ticket, TicketExtractor};

/// External ticket store interface. Ticket persistence lives outside the
/// core; unavailable stores are logged and skipped.
pub trait TicketStore: Send + Sync {
    /// Persist one ticket and return its id.
    fn create_ticket(
        &self,
        title: &str,
        ticket_type: &str,
        description: &str,
        source: &str,
    ) -> Result<String, MpmError>;
}

/// One logged session interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Interaction kind (e.g. `input`, `pm_response`, `engineer_response`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Interaction content.
    pub content: String,
    /// When the interaction was logged.
    pub timestamp: DateTime<Utc>,
}

/// Result of processing one output line.
#[derive(Debug, Default)]
pub struct LineOutcome {
    /// Tickets extracted from the line.
    pub tickets: Vec<Ticket>,
    /// Delegations detected on the line.
    pub delegations: Vec<Delegation>,
}

/// Shared state and behavior for every orchestrator strategy.
pub struct OrchestratorCore {
    /// Framework instruction loader.
    pub framework_loader: FrameworkLoader,
    /// Ticket extractor collecting session tickets.
    pub ticket_extractor: TicketExtractor,
    /// Delegation detector collecting session delegations.
    pub agent_delegator: AgentDelegator,
    /// Hook service client, when the hook service is reachable.
    pub hook_client: Option<HookServiceClient>,
    /// External ticket store, when configured.
    pub ticket_store: Option<Arc<dyn TicketStore>>,
    /// Session start time.
    pub session_start: DateTime<Utc>,
    /// Append-only interaction log.
    pub interactions: Vec<Interaction>,
    /// Whether cleanup should push tickets to the store.
    pub ticket_creation_enabled: bool,
    orchestrator_name: &'static str,
    sessions_dir: PathBuf,
}

impl OrchestratorCore {
    /// Create the shared core for a named strategy.
    pub fn new(
        orchestrator_name: &'static str,
        framework_loader: FrameworkLoader,
        hook_client: Option<HookServiceClient>,
    ) -> Self {
        Self {
            framework_loader,
            ticket_extractor: TicketExtractor::new(),
            agent_delegator: AgentDelegator::new(),
            hook_client,
            ticket_store: None,
            session_start: Utc::now(),
            interactions: Vec::new(),
            ticket_creation_enabled: true,
            orchestrator_name,
            sessions_dir: default_sessions_dir(),
        }
    }

    /// Strategy name recorded in the session log.
    pub fn orchestrator_name(&self) -> &'static str {
        self.orchestrator_name
    }

    /// Override the session log directory (used by tests).
    pub fn set_sessions_dir(&mut self, dir: PathBuf) {
        self.sessions_dir = dir;
    }

    /// Append an interaction to the session log.
    pub fn log_interaction(&mut self, kind: impl Into<String>, content: impl Into<String>) {
        self.interactions.push(Interaction {
            kind: kind.into(),
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    /// Process one line of claude output: extract tickets, detect
    /// delegations, and notify the `ticket_extraction` hook.
    pub async fn process_output_line(&mut self, line: &str) -> LineOutcome {
        let tickets = self.ticket_extractor.extract_from_line(line);
        for ticket in &tickets {
            log::info!("Extracted ticket: {} - {}", ticket.ticket_type, ticket.title);
        }

        let delegations = self.agent_delegator.extract_delegations(line);
        for delegation in &delegations {
            log::info!(
                "Detected delegation to {}: {}",
                delegation.agent,
                delegation.task
            );
        }

        if let Some(hook_client) = &self.hook_client {
            // Observability only; hook failures are already swallowed by
            // the client.
            let _ = hook_client
                .execute_ticket_extraction_hook(json!({
                    "line": line,
                    "tickets_found": tickets.len(),
                    "delegations_found": delegations.len(),
                }))
                .await;
        }

        LineOutcome {
            tickets,
            delegations,
        }
    }

    /// Framework instructions, optionally rewritten by a `pre_delegation`
    /// hook running with `agent_type = "system"`.
    pub async fn get_framework_instructions(&self) -> String {
        let mut framework = self.framework_loader.get_framework_instructions();

        if let Some(hook_client) = &self.hook_client {
            let preview: String = framework.chars().take(1000).collect();
            let results = hook_client
                .execute_pre_delegation_hook(
                    "system",
                    json!({
                        "prompt": "Framework initialization",
                        "agent_type": "system",
                        "framework_content": preview,
                    }),
                )
                .await;
            if let Some(rewritten) = results.iter().find_map(|r| r.modified_prompt.clone()) {
                log::info!("Framework modified by pre-delegation hook");
                framework = rewritten;
            }
        }

        framework
    }

    /// Persist the session log as JSON.
    ///
    /// The per-timestamp file name plus exclusive creation prevents
    /// collisions between concurrent sessions.
    pub fn save_session_log(&self) -> Result<PathBuf, MpmError> {
        std::fs::create_dir_all(&self.sessions_dir)?;

        let timestamp = self.session_start.format("%Y%m%d_%H%M%S");
        let log_file = self.sessions_dir.join(format!("session_{timestamp}.json"));

        let session_data = json!({
            "orchestrator": self.orchestrator_name,
            "session_start": self.session_start.to_rfc3339(),
            "session_end": Utc::now().to_rfc3339(),
            "interactions": self.interactions,
            "tickets_extracted": self.ticket_extractor.all_tickets(),
        });

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&log_file)
            .map_err(|err| MpmError::SessionLog(format!("{}: {err}", log_file.display())))?;
        file.write_all(serde_json::to_string_pretty(&session_data)?.as_bytes())
            .map_err(|err| MpmError::SessionLog(err.to_string()))?;

        log::info!("Session log saved to: {}", log_file.display());
        Ok(log_file)
    }

    /// Push every collected ticket to the external store.
    ///
    /// Per-ticket failures are logged; the session continues.
    pub fn create_tickets(&self) {
        if !self.ticket_creation_enabled {
            log::info!("Ticket creation disabled");
            return;
        }

        let tickets = self.ticket_extractor.all_tickets();
        if tickets.is_empty() {
            log::info!("No tickets to create");
            return;
        }

        let Some(store) = &self.ticket_store else {
            log::warn!("Ticket store not available, skipping ticket creation");
            return;
        };

        let mut created = 0;
        for ticket in tickets {
            match store.create_ticket(
                &ticket.title,
                &ticket.ticket_type,
                ticket.description.as_deref().unwrap_or(""),
                "claude-mpm",
            ) {
                Ok(id) => {
                    created += 1;
                    log::info!("Created ticket: {id} - {}", ticket.title);
                }
                Err(err) => {
                    log::error!("Failed to create ticket '{}': {err}", ticket.title);
                }
            }
        }

        log::info!("Created {created}/{} tickets", tickets.len());
    }

    /// Finalize the session: persist the log, create tickets, and report
    /// aggregate stats via the `submit` hook. No step failure propagates.
    pub async fn cleanup(&mut self) {
        if let Err(err) = self.save_session_log() {
            log::error!("Failed to save session log: {err}");
        }

        self.create_tickets();

        if let Some(hook_client) = &self.hook_client {
            let duration = (Utc::now() - self.session_start)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
            let _ = hook_client
                .execute_submit_hook(
                    "session complete",
                    json!({
                        "session_type": self.orchestrator_name,
                        "duration": duration,
                        "tickets_created": self.ticket_extractor.len(),
                    }),
                )
                .await;
        }
    }

    /// Ticket counts by type for the session summary.
    pub fn ticket_summary(&self) -> HashMap<String, usize> {
        self.ticket_extractor.summary()
    }

    /// Delegation counts by agent for the session summary.
    pub fn delegation_summary(&self) -> HashMap<String, usize> {
        self.agent_delegator.delegation_summary()
    }
}

/// An orchestration strategy.
#[async_trait]
pub trait Orchestrator: Send {
    /// Run an interactive session.
    async fn run_interactive(&mut self) -> Result<(), MpmError>;

    /// Run a non-interactive session over the given input.
    async fn run_non_interactive(&mut self, user_input: &str) -> Result<(), MpmError>;

    /// Shared core, for summaries and cleanup.
    fn core(&self) -> &OrchestratorCore;

    /// Mutable shared core.
    fn core_mut(&mut self) -> &mut OrchestratorCore;

    /// Finalize the session. Defaults to the core cleanup.
    async fn cleanup(&mut self) {
        self.core_mut().cleanup().await;
    }
}

/// Default session log directory: `~/.claude-mpm/sessions`.
fn default_sessions_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".claude-mpm").join("sessions")
}

/// Default prompt snapshot directory: `~/.claude-mpm/prompts`.
pub fn default_prompts_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".claude-mpm").join("prompts")
}

/// Parse the conversation-file path claude may report on stderr.
pub fn parse_conversation_file(stderr: &str) -> Option<String> {
    static CONVERSATION_FILE_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| {
            regex::Regex::new(r"(?i)(?:conversation saved to|saved to)[:\s]+([^\s]+)").unwrap()
        });
    CONVERSATION_FILE_RE
        .captures(stderr)
        .map(|caps| caps[1].trim().to_string())
}

/// Write a prompt snapshot for debugging; failures only log.
pub fn snapshot_prompt(prompts_dir: &std::path::Path, content: &str) {
    if let Err(err) = std::fs::create_dir_all(prompts_dir) {
        log::debug!("Could not create prompts dir: {err}");
        return;
    }
    let path = prompts_dir.join(format!("prompt_{}.txt", Utc::now().format("%Y%m%d_%H%M%S")));
    match std::fs::write(&path, content) {
        Ok(()) => log::info!("Prompt snapshot saved to: {}", path.display()),
        Err(err) => log::debug!("Could not write prompt snapshot: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn core() -> (OrchestratorCore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let loader = FrameworkLoader::new(Some(tmp.path().to_path_buf()), None);
        let mut core = OrchestratorCore::new("TestOrchestrator", loader, None);
        core.set_sessions_dir(tmp.path().join("sessions"));
        (core, tmp)
    }

    #[derive(Default)]
    struct RecordingStore {
        created: Mutex<Vec<(String, String)>>,
    }

    impl TicketStore for RecordingStore {
        fn create_ticket(
            &self,
            title: &str,
            ticket_type: &str,
            _description: &str,
            _source: &str,
        ) -> Result<String, MpmError> {
            self.created
                .lock()
                .push((title.to_string(), ticket_type.to_string()));
            Ok(format!("TCK-{}", self.created.lock().len()))
        }
    }

    #[test]
    fn test_log_interaction_is_append_only_and_ordered() {
        let (mut core, _tmp) = core();
        core.log_interaction("input", "first");
        core.log_interaction("output", "second");

        assert_eq!(core.interactions.len(), 2);
        assert_eq!(core.interactions[0].content, "first");
        assert_eq!(core.interactions[1].content, "second");
        assert!(core.interactions[0].timestamp <= core.interactions[1].timestamp);
    }

    #[tokio::test]
    async fn test_process_output_line_extracts_both_kinds() {
        let (mut core, _tmp) = core();
        let outcome = core
            .process_output_line("TODO: add rate limiting")
            .await;
        assert_eq!(outcome.tickets.len(), 1);
        assert!(outcome.delegations.is_empty());

        let outcome = core
            .process_output_line("Delegate to Engineer: implement login")
            .await;
        assert!(outcome.tickets.is_empty());
        assert_eq!(outcome.delegations.len(), 1);
        assert_eq!(outcome.delegations[0].agent, "engineer");
    }

    #[tokio::test]
    async fn test_hookless_core_matches_empty_hook_results() {
        // Hook-service failure must leave session state identical to the
        // hook returning []. A core with no hook client is the reference.
        let (mut with_none, _tmp1) = core();
        with_none.process_output_line("TODO: a thing").await;

        let (mut with_dead_hook, _tmp2) = core();
        with_dead_hook.hook_client = Some(HookServiceClient::new("http://127.0.0.1:1"));
        with_dead_hook.process_output_line("TODO: a thing").await;

        assert_eq!(
            with_none.ticket_extractor.len(),
            with_dead_hook.ticket_extractor.len()
        );
        assert_eq!(with_none.ticket_summary(), with_dead_hook.ticket_summary());
    }

    #[test]
    fn test_save_session_log_writes_expected_shape() {
        let (mut core, _tmp) = core();
        core.log_interaction("input", "hello");
        core.ticket_extractor.extract_from_line("TODO: persist me");

        let path = core.save_session_log().unwrap();
        let content: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(content["orchestrator"], "TestOrchestrator");
        assert_eq!(content["interactions"].as_array().unwrap().len(), 1);
        assert_eq!(content["tickets_extracted"].as_array().unwrap().len(), 1);
        assert!(content["session_end"].is_string());
    }

    #[test]
    fn test_save_session_log_refuses_to_overwrite() {
        let (core, _tmp) = core();
        core.save_session_log().unwrap();
        // Same session_start means the same file name: exclusive creation
        // must reject the second write.
        assert!(core.save_session_log().is_err());
    }

    #[test]
    fn test_create_tickets_uses_store() {
        let (mut core, _tmp) = core();
        core.ticket_extractor
            .extract_from_text("TODO: Add rate limiting\nBUG: password-logging in debug mode");
        let store = Arc::new(RecordingStore::default());
        core.ticket_store = Some(store.clone());

        core.create_tickets();

        let created = store.created.lock();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].0, "Add rate limiting");
        assert_eq!(created[1].1, "bug");
    }

    #[test]
    fn test_create_tickets_disabled() {
        let (mut core, _tmp) = core();
        core.ticket_extractor.extract_from_line("TODO: skip me");
        core.ticket_creation_enabled = false;
        let store = Arc::new(RecordingStore::default());
        core.ticket_store = Some(store.clone());

        core.create_tickets();
        assert!(store.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_never_fails() {
        let (mut core, _tmp) = core();
        // Point the sessions dir at an unwritable location.
        core.set_sessions_dir(PathBuf::from("/proc/definitely/not/writable"));
        core.ticket_extractor.extract_from_line("TODO: survive");
        core.cleanup().await;
    }
}
