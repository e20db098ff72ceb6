//! Skills registry: named markdown skills across three tiers.
//!
//! Skills are markdown files loaded from three tiers (bundled, user
//! `~/.claude/skills`, and project `./.claude/skills`), where a later
//! tier overrides an earlier one with the same file name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A skill that can be merged onto agent prompts.
#[derive(Debug, Clone)]
pub struct Skill {
    /// Skill name (file stem).
    pub name: String,
    /// Path the skill was loaded from.
    pub path: PathBuf,
    /// Full markdown body.
    pub content: String,
    /// Tier the skill came from: `bundled`, `user`, or `project`.
    pub source: String,
    /// Short description: the first non-heading paragraph, ≤ 200 chars.
    pub description: String,
    /// Agent types the skill applies to. Empty means every agent.
    pub agent_types: Vec<String>,
}

/// Registry of skills across all tiers.
#[derive(Debug, Default)]
pub struct SkillsRegistry {
    bundled_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    skills: BTreeMap<String, Skill>,
}

impl SkillsRegistry {
    /// Create a registry with the default user and project tiers and an
    /// optional bundled tier.
    pub fn new(bundled_dir: Option<PathBuf>) -> Self {
        let home = std::env::var("HOME").ok().map(PathBuf::from);
        let user_dir = home.map(|h| h.join(".claude").join("skills"));
        let project_dir = std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(".claude").join("skills"));

        let mut registry = Self {
            bundled_dir,
            user_dir,
            project_dir,
            skills: BTreeMap::new(),
        };
        registry.reload();
        registry
    }

    /// Create a registry with explicit tier directories (used by tests).
    pub fn with_tiers(
        bundled_dir: Option<PathBuf>,
        user_dir: Option<PathBuf>,
        project_dir: Option<PathBuf>,
    ) -> Self {
        let mut registry = Self {
            bundled_dir,
            user_dir,
            project_dir,
            skills: BTreeMap::new(),
        };
        registry.reload();
        registry
    }

    /// Reload every tier from disk.
    pub fn reload(&mut self) {
        self.skills.clear();
        if let Some(dir) = self.bundled_dir.clone() {
            self.load_tier(&dir, "bundled");
        }
        if let Some(dir) = self.user_dir.clone() {
            self.load_tier(&dir, "user");
        }
        if let Some(dir) = self.project_dir.clone() {
            self.load_tier(&dir, "project");
        }
        log::info!("Skills registry loaded with {} skills", self.skills.len());
    }

    fn load_tier(&mut self, dir: &Path, source: &str) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            log::debug!("{source} skills directory not found, skipping");
            return;
        };

        let mut count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    if self.skills.contains_key(name) {
                        log::debug!("{source} skill '{name}' overrides earlier version");
                    }
                    let description = extract_description(&content);
                    self.skills.insert(
                        name.to_string(),
                        Skill {
                            name: name.to_string(),
                            path,
                            content,
                            source: source.to_string(),
                            description,
                            agent_types: Vec::new(),
                        },
                    );
                    count += 1;
                }
                Err(err) => log::error!("Error loading {source} skill {}: {err}", path.display()),
            }
        }

        if count > 0 {
            log::info!("Loaded {count} {source} skills");
        }
    }

    /// Look up a skill by name.
    pub fn get_skill(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    /// All skills, optionally filtered by source tier.
    pub fn list_skills(&self, source: Option<&str>) -> Vec<&Skill> {
        self.skills
            .values()
            .filter(|s| source.is_none_or(|src| s.source == src))
            .collect()
    }

    /// Skills applicable to an agent type: a skill applies when its
    /// `agent_types` is empty or contains the type.
    pub fn get_skills_for_agent(&self, agent_type: &str) -> Vec<&Skill> {
        self.skills
            .values()
            .filter(|s| s.agent_types.is_empty() || s.agent_types.iter().any(|t| t == agent_type))
            .collect()
    }

    /// Number of loaded skills.
    pub fn len(&self) -> usize {
        self.skills.len()
    }

    /// Whether no skills are loaded.
    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }
}

/// First non-heading paragraph of the content, capped at 200 chars.
fn extract_description(content: &str) -> String {
    let mut description_lines: Vec<&str> = Vec::new();

    for (idx, line) in content.trim().lines().enumerate() {
        let line = line.trim();
        if idx == 0 && line.starts_with('#') {
            continue;
        }
        if line.is_empty() {
            if description_lines.is_empty() {
                continue;
            }
            break;
        }
        if line.starts_with('#') {
            break;
        }
        description_lines.push(line);
    }

    let description = description_lines.join(" ");
    description.chars().take(200).collect()
}
