//! Framework instruction loading and preparation.
//!
//! Builds the single "framework instructions" string injected into the
//! claude CLI from three sources: the bundled framework template tree,
//! optional working-directory override files (`INSTRUCTIONS.md`, legacy
//! `CLAUDE.md`), and a tiered agent-definition tree (framework
//! templates > main directory, overlaid by user and project agent
//! directories). When no framework tree is found a compact built-in
//! fallback is used.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// Marker subdirectory identifying a framework root.
const FRAMEWORK_MARKER: &str = "src/claude_mpm/agents";

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!-- FRAMEWORK_VERSION: (\d+) -->").unwrap());
static LAST_MODIFIED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!-- LAST_MODIFIED: ([^>]+) -->").unwrap());

/// Compact fallback framework used when no framework tree is found.
const MINIMAL_FRAMEWORK: &str = "\
# Claude PM Framework Instructions

You are operating within a Claude PM Framework deployment.

## Role
You are a multi-agent orchestrator. Your primary responsibilities:
- Delegate tasks to specialized agents via Task Tool
- Coordinate multi-agent workflows
- Extract TODO/BUG/FEATURE items for ticket creation
- NEVER perform direct implementation work

## Core Agents
- Documentation Agent - Documentation tasks
- Engineer Agent - Code implementation
- QA Agent - Testing and validation
- Research Agent - Investigation and analysis
- Version Control Agent - Git operations

## Important Rules
1. Always delegate work via Task Tool
2. Provide comprehensive context to agents
3. Track all TODO/BUG/FEATURE items
4. Maintain project visibility

---
";

/// Loaded framework content.
#[derive(Debug, Default)]
struct FrameworkContent {
    framework_instructions: String,
    working_instructions: String,
    agents: BTreeMap<String, String>,
    /// Agent names per tier, in load order: system, then user, then
    /// project. A later tier overrides a same-named agent.
    hierarchy: BTreeMap<&'static str, Vec<String>>,
    loaded: bool,
}

/// Loads and prepares framework instructions for injection.
#[derive(Debug)]
pub struct FrameworkLoader {
    framework_path: Option<PathBuf>,
    /// Framework version parsed from `INSTRUCTIONS.md`, when present.
    pub version: Option<String>,
    /// Last-modified marker parsed from `INSTRUCTIONS.md`, when present.
    pub last_modified: Option<String>,
    content: FrameworkContent,
}

impl FrameworkLoader {
    /// Create a loader.
    ///
    /// `framework_path` overrides auto-detection; `agents_dir` overrides
    /// the agent-definition directory inside the framework tree. User and
    /// project agent tiers come from `~/.claude-mpm/agents` and
    /// `./.claude-mpm/agents`.
    pub fn new(framework_path: Option<PathBuf>, agents_dir: Option<PathBuf>) -> Self {
        let user_agents_dir = std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".claude-mpm").join("agents"));
        let project_agents_dir = std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".claude-mpm").join("agents"));
        Self::with_tier_dirs(framework_path, agents_dir, user_agents_dir, project_agents_dir)
    }

    /// Create a loader with explicit user/project tier directories.
    pub fn with_tier_dirs(
        framework_path: Option<PathBuf>,
        agents_dir: Option<PathBuf>,
        user_agents_dir: Option<PathBuf>,
        project_agents_dir: Option<PathBuf>,
    ) -> Self {
        let framework_path = framework_path.or_else(detect_framework_path);
        let mut loader = Self {
            framework_path,
            version: None,
            last_modified: None,
            content: FrameworkContent::default(),
        };
        loader.load(agents_dir, user_agents_dir, project_agents_dir);
        loader
    }

    /// Path of the detected framework tree, if any.
    pub fn framework_path(&self) -> Option<&Path> {
        self.framework_path.as_deref()
    }

    /// Whether a framework tree was found and loaded.
    pub fn is_loaded(&self) -> bool {
        self.content.loaded
    }

    fn load(
        &mut self,
        agents_dir: Option<PathBuf>,
        user_agents_dir: Option<PathBuf>,
        project_agents_dir: Option<PathBuf>,
    ) {
        self.load_working_instructions();

        let Some(framework_path) = self.framework_path.clone() else {
            log::warn!("Framework not found, will use minimal instructions");
            return;
        };

        let instructions_path = framework_path.join(FRAMEWORK_MARKER).join("INSTRUCTIONS.md");
        if let Some(content) = try_load_file(&instructions_path, "framework INSTRUCTIONS.md") {
            if let Some(caps) = VERSION_RE.captures(&content) {
                self.version = Some(caps[1].to_string());
                log::info!("Framework version: {}", &caps[1]);
            }
            if let Some(caps) = LAST_MODIFIED_RE.captures(&content) {
                self.last_modified = Some(caps[1].trim().to_string());
            }
            self.content.framework_instructions = content;
            self.content.loaded = true;
        }

        let main_dir = framework_path.join(FRAMEWORK_MARKER);
        let templates_dir = main_dir.join("templates");

        let chosen_dir = if let Some(dir) = agents_dir.filter(|d| d.exists()) {
            log::info!("Using custom agents directory: {}", dir.display());
            Some(dir)
        } else if dir_has_markdown(&templates_dir) {
            log::info!("Using agents from templates directory: {}", templates_dir.display());
            Some(templates_dir.clone())
        } else if dir_has_markdown(&main_dir) {
            log::info!("Using agents from main directory: {}", main_dir.display());
            Some(main_dir.clone())
        } else {
            None
        };

        if let Some(dir) = chosen_dir {
            self.content.loaded = true;
            self.load_agents_from(&dir, "system");

            // Templates carry no base agent; fall back to the main tree.
            if dir == templates_dir && !self.content.agents.contains_key("base_agent") {
                let base_agent = main_dir.join("base_agent.md");
                if base_agent.exists() {
                    self.load_agent_file(&base_agent, "system");
                }
            }
        }

        // Per-user and per-project agents override same-named framework
        // agents.
        if let Some(dir) = user_agents_dir {
            self.load_agents_from(&dir, "user");
        }
        if let Some(dir) = project_agents_dir {
            self.load_agents_from(&dir, "project");
        }
    }

    fn load_working_instructions(&mut self) {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let working_instructions = cwd.join("INSTRUCTIONS.md");
        let working_claude = cwd.join("CLAUDE.md");

        if working_instructions.exists() {
            if let Some(content) =
                try_load_file(&working_instructions, "working directory INSTRUCTIONS.md")
            {
                self.content.working_instructions = content;
            }
        } else if working_claude.exists() {
            if let Some(content) =
                try_load_file(&working_claude, "working directory CLAUDE.md (legacy)")
            {
                self.content.working_instructions = content;
            }
        }
    }

    fn load_agents_from(&mut self, dir: &Path, tier: &'static str) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();
        for path in paths {
            self.load_agent_file(&path, tier);
        }
    }

    fn load_agent_file(&mut self, path: &Path, tier: &'static str) {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            return;
        };
        if stem.eq_ignore_ascii_case("readme") {
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => {
                log::debug!("Loaded {tier} agent: {stem}");
                self.content.agents.insert(stem.to_string(), content);
                self.content
                    .hierarchy
                    .entry(tier)
                    .or_default()
                    .push(stem.to_string());
            }
            Err(err) => log::error!("Failed to load agent {}: {err}", path.display()),
        }
    }

    /// The full framework instructions ready for injection.
    pub fn get_framework_instructions(&self) -> String {
        if self.content.loaded || !self.content.working_instructions.is_empty() {
            self.format_full_framework()
        } else {
            MINIMAL_FRAMEWORK.to_string()
        }
    }

    /// The compact minimal framework used by the non-interactive
    /// strategies, regardless of whether a full framework tree exists.
    pub fn minimal_framework_instructions(&self) -> String {
        MINIMAL_FRAMEWORK.to_string()
    }

    fn format_full_framework(&self) -> String {
        if !self.content.framework_instructions.is_empty() {
            let mut instructions = self.content.framework_instructions.clone();
            if !self.content.working_instructions.is_empty() {
                instructions.push_str(&format!(
                    "\n\n## Working Directory Instructions\n{}\n",
                    self.content.working_instructions
                ));
            }
            return instructions;
        }

        // No INSTRUCTIONS.md: generate a framework from the agent tree.
        let mut instructions = String::from(
            "# Claude MPM Framework Instructions\n\n\
             You are operating within the Claude Multi-Agent Project Manager (MPM) framework.\n\n\
             ## Core Role\n\
             You are a multi-agent orchestrator. Your primary responsibilities are:\n\
             - Delegate all implementation work to specialized agents via Task Tool\n\
             - Coordinate multi-agent workflows and cross-agent collaboration\n\
             - Extract and track TODO/BUG/FEATURE items for ticket creation\n\
             - Maintain project visibility and strategic oversight\n\
             - NEVER perform direct implementation work yourself\n\n",
        );

        if !self.content.working_instructions.is_empty() {
            instructions.push_str(&format!(
                "## Working Directory Instructions\n{}\n\n",
                self.content.working_instructions
            ));
        }

        if !self.content.agents.is_empty() {
            instructions.push_str("## Available Agents\n\n");
            instructions
                .push_str("You have the following specialized agents available for delegation:\n\n");
            for name in self.content.agents.keys() {
                let clean = name.replace(['-', '_'], " ");
                instructions.push_str(&format!("- **{clean}**: Available for specialized tasks\n"));
            }
            instructions.push_str("\n### Agent Details\n\n");
            for (name, content) in &self.content.agents {
                instructions.push_str(&format!("#### {}\n{content}\n\n", name.replace(['-', '_'], " ")));
            }
        }

        instructions.push_str(
            "## Ticket Extraction Patterns\n\
             Extract tickets from these patterns:\n\
             - TODO: [description]\n\
             - BUG: [description]\n\
             - FEATURE: [description]\n\
             - ISSUE: [description]\n\
             - FIXME: [description]\n\n---\n",
        );

        instructions
    }

    /// Names of all loaded agent definitions.
    pub fn agent_list(&self) -> Vec<String> {
        self.content.agents.keys().cloned().collect()
    }

    /// Agent names per tier. Definitions from later tiers (user, then
    /// project) override same-named system agents.
    pub fn agent_hierarchy(&self) -> BTreeMap<&'static str, Vec<String>> {
        let mut hierarchy = BTreeMap::new();
        for tier in ["project", "user", "system"] {
            hierarchy.insert(
                tier,
                self.content.hierarchy.get(tier).cloned().unwrap_or_default(),
            );
        }
        hierarchy
    }

    /// Raw definition text of one agent, by file stem.
    pub fn agent_definition(&self, name: &str) -> Option<&str> {
        self.content.agents.get(name).map(String::as_str)
    }

    /// Definition text for a display-style agent name
    /// (e.g. "Data Engineer" resolves the `data_engineer_agent` stem).
    pub fn agent_definition_for(&self, agent: &str) -> Option<&str> {
        let key = format!("{}_agent", agent.to_lowercase().replace([' ', '-'], "_"));
        self.agent_definition(&key)
            .or_else(|| self.agent_definition(&agent.to_lowercase().replace([' ', '-'], "_")))
    }
}

/// Walk up from the executable (then cwd) looking for a framework root.
fn detect_framework_path() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Ok(exe) = std::env::current_exe() {
        candidates.extend(exe.ancestors().skip(1).map(Path::to_path_buf));
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.clone());
        candidates.push(cwd.join("claude-mpm"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join("Projects").join("claude-mpm"));
    }

    for candidate in candidates {
        if candidate.join(FRAMEWORK_MARKER).exists() {
            log::info!("Found framework at: {}", candidate.display());
            return Some(candidate);
        }
    }

    None
}

fn dir_has_markdown(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.path().extension().is_some_and(|ext| ext == "md"))
}

fn try_load_file(path: &Path, file_type: &str) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            log::info!("Loaded {file_type} from: {}", path.display());
            Some(content)
        }
        Err(err) => {
            if path.exists() {
                log::error!("Failed to load {file_type}: {err}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn framework_tree(dir: &TempDir) -> PathBuf {
        let root = dir.path().to_path_buf();
        let agents = root.join(FRAMEWORK_MARKER);
        std::fs::create_dir_all(agents.join("templates")).unwrap();
        std::fs::write(
            agents.join("INSTRUCTIONS.md"),
            "<!-- FRAMEWORK_VERSION: 0012 -->\n<!-- LAST_MODIFIED: 2025-07-01T00:00:00Z -->\n# PM Rules\nDelegate everything.\n",
        )
        .unwrap();
        std::fs::write(
            agents.join("templates").join("engineer_agent.md"),
            "# Engineer Agent\nImplements code.\n",
        )
        .unwrap();
        std::fs::write(
            agents.join("templates").join("qa_agent.md"),
            "# QA Agent\nWrites tests.\n",
        )
        .unwrap();
        std::fs::write(agents.join("templates").join("README.md"), "ignore me").unwrap();
        std::fs::write(agents.join("base_agent.md"), "# Base Agent\nShared rules.\n").unwrap();
        root
    }

    fn loader_without_tiers(root: PathBuf, agents_dir: Option<PathBuf>) -> FrameworkLoader {
        FrameworkLoader::with_tier_dirs(Some(root), agents_dir, None, None)
    }

    #[test]
    fn test_loads_instructions_and_metadata() {
        let dir = TempDir::new().unwrap();
        let root = framework_tree(&dir);
        let loader = loader_without_tiers(root, None);

        assert!(loader.is_loaded());
        assert_eq!(loader.version.as_deref(), Some("0012"));
        assert_eq!(loader.last_modified.as_deref(), Some("2025-07-01T00:00:00Z"));

        let instructions = loader.get_framework_instructions();
        assert!(instructions.contains("# PM Rules"));
    }

    #[test]
    fn test_prefers_templates_and_falls_back_to_base_agent() {
        let dir = TempDir::new().unwrap();
        let root = framework_tree(&dir);
        let loader = loader_without_tiers(root, None);

        let mut agents = loader.agent_list();
        agents.sort();
        assert_eq!(agents, vec!["base_agent", "engineer_agent", "qa_agent"]);
    }

    #[test]
    fn test_readme_is_skipped() {
        let dir = TempDir::new().unwrap();
        let root = framework_tree(&dir);
        let loader = loader_without_tiers(root, None);
        assert!(loader.agent_definition("README").is_none());
    }

    #[test]
    fn test_agent_definition_for_display_name() {
        let dir = TempDir::new().unwrap();
        let root = framework_tree(&dir);
        let loader = loader_without_tiers(root, None);

        assert!(loader.agent_definition_for("Engineer").is_some());
        assert!(loader.agent_definition_for("engineer").is_some());
        assert!(loader.agent_definition_for("Nonexistent").is_none());
    }

    #[test]
    fn test_minimal_framework_when_nothing_found() {
        let dir = TempDir::new().unwrap();
        let loader = FrameworkLoader::new(Some(dir.path().to_path_buf()), None);

        assert!(!loader.is_loaded());
        let instructions = loader.get_framework_instructions();
        assert!(instructions.contains("Claude PM Framework Instructions"));
        assert!(instructions.contains("NEVER perform direct implementation work"));
    }

    #[test]
    fn test_project_tier_overrides_user_and_system() {
        let dir = TempDir::new().unwrap();
        let root = framework_tree(&dir);

        let user_dir = dir.path().join("user_agents");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(user_dir.join("engineer_agent.md"), "# Engineer Agent\nUser copy.\n")
            .unwrap();

        let project_dir = dir.path().join("project_agents");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(
            project_dir.join("engineer_agent.md"),
            "# Engineer Agent\nProject copy.\n",
        )
        .unwrap();

        let loader = FrameworkLoader::with_tier_dirs(
            Some(root),
            None,
            Some(user_dir),
            Some(project_dir),
        );

        let definition = loader.agent_definition("engineer_agent").unwrap();
        assert!(definition.contains("Project copy"));

        let hierarchy = loader.agent_hierarchy();
        assert!(hierarchy["system"].contains(&"engineer_agent".to_string()));
        assert!(hierarchy["user"].contains(&"engineer_agent".to_string()));
        assert!(hierarchy["project"].contains(&"engineer_agent".to_string()));
    }

    #[test]
    fn test_custom_agents_dir_override() {
        let dir = TempDir::new().unwrap();
        let root = framework_tree(&dir);
        let custom = dir.path().join("custom_agents");
        std::fs::create_dir_all(&custom).unwrap();
        std::fs::write(custom.join("security_agent.md"), "# Security Agent\n").unwrap();

        let loader = loader_without_tiers(root, Some(custom));
        assert_eq!(loader.agent_list(), vec!["security_agent"]);
    }
}
