//! Skill manager: merging skills onto agent prompts.
//!
//! Maps agents to skills via per-agent JSON templates (`agent_id` or
//! `agent_type` plus a `skills` array) and exposes the prompt-enhance
//! operation that appends a delimited skills section to an agent's base
//! prompt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::skills::registry::{Skill, SkillsRegistry};

/// Default user-specific mapping file: `.claude-mpm/skills_config.json`
/// under the working directory.
fn default_mapping_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".claude-mpm")
        .join("skills_config.json")
}

/// Manages skills and their integration with agents.
pub struct SkillManager {
    registry: SkillsRegistry,
    agent_skill_mapping: HashMap<String, Vec<String>>,
}

impl SkillManager {
    /// Create a manager.
    ///
    /// `templates_dir` is scanned for per-agent JSON templates carrying a
    /// `skills` field; `bundled_skills_dir` seeds the registry's bundled
    /// tier.
    pub fn new(bundled_skills_dir: Option<PathBuf>, templates_dir: Option<PathBuf>) -> Self {
        let registry = SkillsRegistry::new(bundled_skills_dir);
        let mut manager = Self {
            registry,
            agent_skill_mapping: HashMap::new(),
        };
        if let Some(dir) = templates_dir {
            manager.load_agent_mappings(&dir);
        }
        manager.load_mappings_from_config(None);
        manager
    }

    /// Build a manager around an existing registry (used by tests).
    pub fn with_registry(registry: SkillsRegistry) -> Self {
        Self {
            registry,
            agent_skill_mapping: HashMap::new(),
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &SkillsRegistry {
        &self.registry
    }

    /// Load agent→skills mappings from JSON templates in a directory.
    pub fn load_agent_mappings(&mut self, templates_dir: &Path) {
        let Ok(entries) = std::fs::read_dir(templates_dir) else {
            log::warn!(
                "Agent templates directory not found: {}",
                templates_dir.display()
            );
            return;
        };

        let mut mapped = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }

            let parsed: Result<Value, _> = std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()));

            match parsed {
                Ok(agent_data) => {
                    let agent_id = agent_data
                        .get("agent_id")
                        .or_else(|| agent_data.get("agent_type"))
                        .and_then(Value::as_str);
                    let Some(agent_id) = agent_id else { continue };

                    let skills: Vec<String> = agent_data
                        .get("skills")
                        .and_then(Value::as_array)
                        .map(|arr| {
                            arr.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();

                    if !skills.is_empty() {
                        log::debug!("Agent '{agent_id}' mapped to {} skills", skills.len());
                        self.agent_skill_mapping.insert(agent_id.to_string(), skills);
                        mapped += 1;
                    }
                }
                Err(err) => {
                    log::error!("Error loading agent mapping from {}: {err}", path.display());
                }
            }
        }

        if mapped > 0 {
            log::info!("Loaded skill mappings for {mapped} agents");
        }
    }

    /// All skills for an agent: explicitly mapped skills first, then any
    /// registry skill applicable to the agent type.
    pub fn get_agent_skills(&self, agent_type: &str) -> Vec<&Skill> {
        let mut skills: Vec<&Skill> = Vec::new();

        for name in self.agent_skill_mapping.get(agent_type).into_iter().flatten() {
            match self.registry.get_skill(name) {
                Some(skill) => skills.push(skill),
                None => log::warn!("Skill '{name}' referenced by agent '{agent_type}' not found"),
            }
        }

        for skill in self.registry.get_skills_for_agent(agent_type) {
            if !skills.iter().any(|s| s.name == skill.name) {
                skills.push(skill);
            }
        }

        skills
    }

    /// Append an `## 🎯 Available Skills` section to a base prompt.
    ///
    /// With `include_all` the whole registry is appended regardless of
    /// mapping. A prompt with no applicable skills is returned unchanged.
    pub fn enhance_agent_prompt(
        &self,
        agent_type: &str,
        base_prompt: &str,
        include_all: bool,
    ) -> String {
        let skills = if include_all {
            self.registry.list_skills(None)
        } else {
            self.get_agent_skills(agent_type)
        };

        if skills.is_empty() {
            return base_prompt.to_string();
        }

        let delimiter = "=".repeat(80);
        let mut section = format!("\n\n{delimiter}\n## 🎯 Available Skills\n\n");
        section.push_str(&format!(
            "You have access to {} specialized skills:\n\n",
            skills.len()
        ));

        for skill in &skills {
            section.push_str(&format!("### 📚 {}\n\n", title_case(&skill.name)));
            section.push_str(&format!("**Source:** {}\n", skill.source));
            if !skill.description.is_empty() {
                section.push_str(&format!("**Description:** {}\n", skill.description));
            }
            section.push_str("\n```\n");
            section.push_str(&skill.content);
            section.push_str("\n```\n\n");
        }
        section.push_str(&delimiter);
        section.push('\n');

        format!("{base_prompt}{section}")
    }

    /// All agent-to-skill mappings.
    pub fn list_agent_skill_mappings(&self) -> &HashMap<String, Vec<String>> {
        &self.agent_skill_mapping
    }

    /// Add a skill to an agent's mapping. Fails when the skill does not
    /// exist in the registry.
    pub fn add_skill_to_agent(&mut self, agent_type: &str, skill_name: &str) -> bool {
        if self.registry.get_skill(skill_name).is_none() {
            log::error!("Cannot add skill '{skill_name}': skill not found");
            return false;
        }

        let skills = self
            .agent_skill_mapping
            .entry(agent_type.to_string())
            .or_default();
        if !skills.iter().any(|s| s == skill_name) {
            skills.push(skill_name.to_string());
            log::info!("Added skill '{skill_name}' to agent '{agent_type}'");
        }
        true
    }

    /// Remove a skill from an agent's mapping.
    pub fn remove_skill_from_agent(&mut self, agent_type: &str, skill_name: &str) -> bool {
        let Some(skills) = self.agent_skill_mapping.get_mut(agent_type) else {
            return false;
        };
        let before = skills.len();
        skills.retain(|s| s != skill_name);
        let removed = skills.len() != before;
        if removed {
            log::info!("Removed skill '{skill_name}' from agent '{agent_type}'");
        }
        removed
    }

    /// Infer which agents should carry a skill from its name and content.
    pub fn infer_agents_for_skill(&self, skill: &Skill) -> Vec<String> {
        let haystack = format!(
            "{} {}",
            skill.name.to_lowercase(),
            skill.content.to_lowercase()
        );
        let mut agents: Vec<String> = Vec::new();
        {
            let mut add = |names: &[&str]| {
                for name in names {
                    if !agents.iter().any(|a| a == name) {
                        agents.push((*name).to_string());
                    }
                }
            };

            if ["docker", "kubernetes", "deploy", "devops"]
                .iter()
                .any(|tag| haystack.contains(tag))
            {
                add(&["ops"]);
            }
            if ["test", "qa", "quality", "assert"]
                .iter()
                .any(|tag| haystack.contains(tag))
            {
                add(&["qa"]);
            }
            if ["documentation", "docs", "api doc", "readme"]
                .iter()
                .any(|tag| haystack.contains(tag))
            {
                add(&["documentation"]);
            }
            if ["security", "auth", "vulnerability"]
                .iter()
                .any(|tag| haystack.contains(tag))
            {
                add(&["security"]);
            }
            if ["database", "sql", "schema", "etl"]
                .iter()
                .any(|tag| haystack.contains(tag))
            {
                add(&["data-engineer"]);
            }
        }
        if agents.is_empty() {
            agents.push("engineer".to_string());
        }

        agents
    }

    /// Save the current mappings to the config file.
    pub fn save_mappings_to_config(&self, config_path: Option<PathBuf>) -> std::io::Result<()> {
        let config_path = config_path.unwrap_or_else(default_mapping_path);
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&self.agent_skill_mapping)
            .unwrap_or_else(|_| "{}".to_string());
        std::fs::write(&config_path, body)?;
        log::info!("Saved skill mappings to {}", config_path.display());
        Ok(())
    }

    /// Merge mappings from the config file into the current mapping.
    pub fn load_mappings_from_config(&mut self, config_path: Option<PathBuf>) {
        let config_path = config_path.unwrap_or_else(default_mapping_path);
        let Ok(raw) = std::fs::read_to_string(&config_path) else {
            log::debug!("No skill mappings config found at {}", config_path.display());
            return;
        };

        match serde_json::from_str::<HashMap<String, Vec<String>>>(&raw) {
            Ok(loaded) => {
                for (agent_id, skills) in loaded {
                    let existing = self.agent_skill_mapping.entry(agent_id).or_default();
                    for skill in skills {
                        if !existing.iter().any(|s| *s == skill) {
                            existing.push(skill);
                        }
                    }
                }
                log::info!("Loaded skill mappings from {}", config_path.display());
            }
            Err(err) => {
                log::error!(
                    "Error loading skill mappings from {}: {err}",
                    config_path.display()
                );
            }
        }
    }

    /// Reload skills and agent mappings from disk.
    pub fn reload(&mut self, templates_dir: Option<&Path>) {
        self.registry.reload();
        self.agent_skill_mapping.clear();
        if let Some(dir) = templates_dir {
            self.load_agent_mappings(dir);
        }
        self.load_mappings_from_config(None);
    }
}

fn title_case(name: &str) -> String {
    name.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_with(skills: &[(&str, &str)]) -> (SkillsRegistry, TempDir) {
        let tmp = TempDir::new().unwrap();
        let bundled = tmp.path().join("bundled");
        std::fs::create_dir_all(&bundled).unwrap();
        for (name, content) in skills {
            std::fs::write(bundled.join(format!("{name}.md")), content).unwrap();
        }
        (
            SkillsRegistry::with_tiers(Some(bundled), None, None),
            tmp,
        )
    }

    #[test]
    fn test_enhance_agent_prompt_appends_section() {
        let (registry, _tmp) = registry_with(&[("unit-testing", "# Unit Testing\n\nWrite fast tests.")]);
        let manager = SkillManager::with_registry(registry);

        let enhanced = manager.enhance_agent_prompt("qa", "Base prompt.", false);
        assert!(enhanced.starts_with("Base prompt."));
        assert!(enhanced.contains("## 🎯 Available Skills"));
        assert!(enhanced.contains("### 📚 Unit Testing"));
        assert!(enhanced.contains("**Source:** bundled"));
        assert!(enhanced.contains("Write fast tests."));
    }

    #[test]
    fn test_enhance_agent_prompt_no_skills_is_identity() {
        let (registry, _tmp) = registry_with(&[]);
        let manager = SkillManager::with_registry(registry);
        assert_eq!(
            manager.enhance_agent_prompt("qa", "Base prompt.", false),
            "Base prompt."
        );
    }

    #[test]
    fn test_mapped_skills_come_first_without_duplicates() {
        let (registry, _tmp) = registry_with(&[
            ("alpha", "# Alpha\n\na"),
            ("beta", "# Beta\n\nb"),
        ]);
        let mut manager = SkillManager::with_registry(registry);
        assert!(manager.add_skill_to_agent("engineer", "beta"));

        let skills = manager.get_agent_skills("engineer");
        assert_eq!(skills[0].name, "beta");
        // beta appears once even though it also matches the unrestricted
        // registry scan.
        assert_eq!(skills.iter().filter(|s| s.name == "beta").count(), 1);
    }

    #[test]
    fn test_add_unknown_skill_fails() {
        let (registry, _tmp) = registry_with(&[]);
        let mut manager = SkillManager::with_registry(registry);
        assert!(!manager.add_skill_to_agent("engineer", "nope"));
    }

    #[test]
    fn test_remove_skill_from_agent() {
        let (registry, _tmp) = registry_with(&[("alpha", "# Alpha\n\na")]);
        let mut manager = SkillManager::with_registry(registry);
        manager.add_skill_to_agent("engineer", "alpha");

        assert!(manager.remove_skill_from_agent("engineer", "alpha"));
        assert!(!manager.remove_skill_from_agent("engineer", "alpha"));
        assert!(!manager.remove_skill_from_agent("qa", "alpha"));
    }

    #[test]
    fn test_load_agent_mappings_from_templates() {
        let (registry, tmp) = registry_with(&[("alpha", "# Alpha\n\na")]);
        let templates = tmp.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(
            templates.join("engineer.json"),
            r#"{"agent_id": "engineer", "skills": ["alpha"]}"#,
        )
        .unwrap();
        std::fs::write(templates.join("broken.json"), "{oops").unwrap();

        let mut manager = SkillManager::with_registry(registry);
        manager.load_agent_mappings(&templates);

        assert_eq!(
            manager.list_agent_skill_mappings().get("engineer"),
            Some(&vec!["alpha".to_string()])
        );
    }

    #[test]
    fn test_save_and_load_mappings_roundtrip() {
        let (registry, tmp) = registry_with(&[("alpha", "# Alpha\n\na")]);
        let mut manager = SkillManager::with_registry(registry);
        manager.add_skill_to_agent("engineer", "alpha");

        let config = tmp.path().join("skills_config.json");
        manager.save_mappings_to_config(Some(config.clone())).unwrap();

        let (registry2, _tmp2) = registry_with(&[("alpha", "# Alpha\n\na")]);
        let mut manager2 = SkillManager::with_registry(registry2);
        manager2.load_mappings_from_config(Some(config));

        assert_eq!(
            manager2.list_agent_skill_mappings().get("engineer"),
            Some(&vec!["alpha".to_string()])
        );
    }

    #[test]
    fn test_infer_agents_for_skill() {
        let (registry, _tmp) = registry_with(&[("docker-deploys", "# Docker\n\nDeploy with docker.")]);
        let manager = SkillManager::with_registry(registry);
        let skill = manager.registry().get_skill("docker-deploys").unwrap();
        assert!(manager.infer_agents_for_skill(skill).contains(&"ops".to_string()));
    }
}
