//! Orchestrator selection from configuration flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::framework_loader::FrameworkLoader;
use crate::core::launcher::ClaudeLauncher;
use crate::error::MpmError;
use crate::hooks::client::HookServiceClient;
use crate::orchestration::base::{Orchestrator, OrchestratorCore, TicketStore};
use crate::orchestration::direct::DirectOrchestrator;
use crate::orchestration::subprocess::SubprocessOrchestrator;
use crate::orchestration::system_prompt::SystemPromptOrchestrator;
use crate::skills::manager::SkillManager;

/// Configuration consumed by the factory.
#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Explicit framework tree path; auto-detected when `None`.
    pub framework_path: Option<PathBuf>,
    /// Custom agent-definition directory.
    pub agents_dir: Option<PathBuf>,
    /// Model passed to the claude CLI.
    pub model: String,
    /// Whether to pass `--dangerously-skip-permissions`.
    pub skip_permissions: bool,
    /// Select the subprocess strategy.
    pub subprocess: bool,
    /// Select the subprocess strategy in interactive mode.
    pub interactive_subprocess: bool,
    /// Inject the framework via `--append-system-prompt` (default).
    pub use_system_prompt: bool,
    /// Enable the TODO hijacker on the subprocess strategy.
    pub enable_todo_hijacking: bool,
    /// Override of the TODO inbox directory.
    pub todo_dir: Option<PathBuf>,
    /// Disable ticket creation at cleanup.
    pub no_tickets: bool,
    /// Talk to the hook service when it is healthy.
    pub enable_hooks: bool,
    /// Explicit hook service URL; environment/default otherwise.
    pub hooks_url: Option<String>,
    /// Fan-out worker pool size.
    pub max_parallel_agents: usize,
    /// PM one-shot timeout in seconds.
    pub pm_timeout_secs: u64,
    /// Per-agent one-shot timeout in seconds.
    pub agent_timeout_secs: u64,
    /// External ticket store handle.
    pub ticket_store: Option<Arc<dyn TicketStore>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            framework_path: None,
            agents_dir: None,
            model: "opus".to_string(),
            skip_permissions: true,
            subprocess: false,
            interactive_subprocess: false,
            use_system_prompt: true,
            enable_todo_hijacking: false,
            todo_dir: None,
            no_tickets: false,
            enable_hooks: true,
            hooks_url: None,
            max_parallel_agents: 3,
            pm_timeout_secs: 30,
            agent_timeout_secs: 60,
            ticket_store: None,
        }
    }
}

impl std::fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("model", &self.model)
            .field("subprocess", &self.subprocess)
            .field("interactive_subprocess", &self.interactive_subprocess)
            .field("use_system_prompt", &self.use_system_prompt)
            .field("enable_todo_hijacking", &self.enable_todo_hijacking)
            .field("no_tickets", &self.no_tickets)
            .field("enable_hooks", &self.enable_hooks)
            .field("max_parallel_agents", &self.max_parallel_agents)
            .finish_non_exhaustive()
    }
}

/// Builds orchestrators from configuration.
pub struct OrchestratorFactory;

impl OrchestratorFactory {
    /// Create the orchestrator selected by the configuration flags.
    ///
    /// Selection order: `interactive_subprocess`, then `subprocess`, then
    /// `use_system_prompt` (the default), then the direct strategy.
    pub async fn create_orchestrator(
        config: OrchestratorConfig,
    ) -> Result<Box<dyn Orchestrator>, MpmError> {
        let launcher = ClaudeLauncher::new(config.model.clone(), config.skip_permissions)?;
        let framework_loader =
            FrameworkLoader::new(config.framework_path.clone(), config.agents_dir.clone());

        let hook_client = if config.enable_hooks {
            Self::probe_hook_client(config.hooks_url.as_deref()).await
        } else {
            None
        };

        let name = Self::strategy_name(&config);

        let mut core = OrchestratorCore::new(name, framework_loader, hook_client);
        core.ticket_creation_enabled = !config.no_tickets;
        core.ticket_store = config.ticket_store.clone();

        let pm_timeout = Duration::from_secs(config.pm_timeout_secs);
        let agent_timeout = Duration::from_secs(config.agent_timeout_secs);

        if config.interactive_subprocess || config.subprocess {
            let skill_manager = Self::build_skill_manager(&core);
            let orchestrator = SubprocessOrchestrator::new(
                core,
                launcher,
                skill_manager,
                config.enable_todo_hijacking,
                config.todo_dir.clone(),
                config.interactive_subprocess,
                config.max_parallel_agents,
                pm_timeout,
                agent_timeout,
            )?;
            return Ok(Box::new(orchestrator));
        }

        if config.use_system_prompt {
            return Ok(Box::new(SystemPromptOrchestrator::new(
                core, launcher, pm_timeout,
            )));
        }

        Ok(Box::new(DirectOrchestrator::new(core, launcher, pm_timeout)))
    }

    /// Which strategy the flags select.
    pub fn strategy_name(config: &OrchestratorConfig) -> &'static str {
        if config.interactive_subprocess || config.subprocess {
            "SubprocessOrchestrator"
        } else if config.use_system_prompt {
            "SystemPromptOrchestrator"
        } else {
            "DirectOrchestrator"
        }
    }

    /// Skills live inside the framework tree; without one there is
    /// nothing to load.
    fn build_skill_manager(core: &OrchestratorCore) -> Option<SkillManager> {
        let framework_path = core.framework_loader.framework_path()?;
        let base = framework_path.join("src").join("claude_mpm");
        Some(SkillManager::new(
            Some(base.join("skills").join("bundled")),
            Some(base.join("agents").join("templates")),
        ))
    }

    /// Probe the hook service; an unhealthy service disables hooks.
    async fn probe_hook_client(hooks_url: Option<&str>) -> Option<HookServiceClient> {
        let client = match hooks_url {
            Some(url) => HookServiceClient::new(url),
            None => HookServiceClient::from_env(),
        };

        let health = client.health_check().await;
        if health.get("status").and_then(serde_json::Value::as_str) == Some("healthy") {
            log::info!(
                "Connected to hook service with {} hooks",
                health
                    .get("hook_count")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0)
            );
            Some(client)
        } else {
            log::warn!("Hook service not healthy, disabling hooks");
            None
        }
    }
}
