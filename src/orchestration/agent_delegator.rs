//! Agent delegation detection in PM output.
//!
//! Parses agent-spawn requests out of free-form model output. Two primary
//! surface forms are recognized:
//!
//! ```text
//! **Engineer**: Implement the login endpoint
//! Task(Investigate flaky CI)
//! ```
//!
//! plus a handful of line-oriented phrasings (`Delegate to X: ...`,
//! `Task for X: ...`, `X Agent should: ...`). Agent names are normalized
//! through an alias table into a closed canonical set.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::orchestration::todo_transformer;

/// Canonical agent names after alias resolution.
pub const CANONICAL_AGENTS: &[&str] = &[
    "documentation",
    "engineer",
    "qa",
    "research",
    "security",
    "ops",
    "version-control",
    "data-engineer",
];

/// Where a delegation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DelegationSource {
    /// `**Agent**: task` markdown block in PM output.
    DetectorMarkdown,
    /// `Task(description)` task-tool form in PM output.
    DetectorTasktool,
    /// Line-oriented phrasing (`Delegate to X: ...`, `Ask X to: ...`).
    DetectorLine,
    /// Produced by the TODO hijacker from a filesystem TODO item.
    TodoHijacker,
    /// Produced from an explicit PM ticket.
    PmTicket,
}

/// A request to spawn an agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    /// Normalized canonical agent name (see [`CANONICAL_AGENTS`]).
    pub agent: String,
    /// Task text for the agent. Non-empty after trimming.
    pub task: String,
    /// Which component produced this delegation.
    pub source: DelegationSource,
    /// Confidence in the agent assignment, in `[0, 1]`.
    pub confidence: f64,
    /// When the delegation was produced.
    pub timestamp: DateTime<Utc>,
    /// Priority carried over from the originating TODO, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Labels/tags carried over from the originating TODO, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    /// ID of the originating TODO item (hijacker-sourced delegations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_id: Option<String>,
    /// Type of the originating ticket (pm-ticket delegations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_type: Option<String>,
    /// Surface form the delegation was parsed from (`markdown`,
    /// `task_tool`, or a line-pattern name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Delegation {
    /// Build a detector-sourced delegation with the given surface form.
    fn detected(agent: String, task: String, source: DelegationSource, confidence: f64, format: &str) -> Self {
        Self {
            agent,
            task,
            source,
            confidence,
            timestamp: Utc::now(),
            priority: None,
            labels: None,
            todo_id: None,
            ticket_type: None,
            format: Some(format.to_string()),
        }
    }
}

/// Header of a markdown-form delegation: `**Name**:` with an optional
/// trailing " Agent" folded out of the captured name.
static MARKDOWN_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*\n]+?)(?:\s+[Aa]gent)?\*\*:").unwrap());

/// Task-tool form: `Task(description)`, single line.
static TASK_TOOL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Task\(([^)]+)\)").unwrap());

/// Line-oriented delegation phrasings: (pattern, pattern name).
static LINE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)Delegate to (\w+):\s*(.+)").unwrap(), "explicit"),
        (Regex::new(r"(?i)→\s*(\w+) Agent:\s*(.+)").unwrap(), "arrow"),
        (Regex::new(r"(?i)Task for (\w+):\s*(.+)").unwrap(), "task_for"),
        (Regex::new(r"(?i)(\w+) Agent should:\s*(.+)").unwrap(), "should"),
        (Regex::new(r"(?i)Ask (\w+) to:\s*(.+)").unwrap(), "ask"),
    ]
});

/// Detects and records agent delegations in model output.
#[derive(Debug, Default)]
pub struct AgentDelegator {
    delegated: Vec<Delegation>,
}

impl AgentDelegator {
    /// Create a new delegator with no recorded delegations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect block-form delegation requests in a PM response.
    ///
    /// Recognizes the markdown form (`**Agent**: task`, task text running
    /// until a blank line or the next bold block) and the task-tool form
    /// (`Task(description)` with the agent inferred from keywords).
    pub fn detect_delegations(&mut self, response: &str) -> Vec<Delegation> {
        let mut delegations = Vec::new();

        for caps in MARKDOWN_HEADER_RE.captures_iter(response) {
            let whole = caps.get(0).unwrap();
            let name = caps.get(1).map_or("", |m| m.as_str()).trim();
            let task = markdown_task_slice(&response[whole.end()..]);
            if name.is_empty() || task.is_empty() {
                continue;
            }

            delegations.push(Delegation::detected(
                normalize_agent_name(name),
                task,
                DelegationSource::DetectorMarkdown,
                1.0,
                "markdown",
            ));
        }

        for caps in TASK_TOOL_RE.captures_iter(response) {
            let task = caps.get(1).map_or("", |m| m.as_str()).trim().to_string();
            if task.is_empty() {
                continue;
            }
            let agent = self.suggest_agent_for_task(&task);
            delegations.push(Delegation::detected(
                agent,
                task,
                DelegationSource::DetectorTasktool,
                0.8,
                "task_tool",
            ));
        }

        log::debug!("Detected {} delegations", delegations.len());
        self.delegated.extend(delegations.iter().cloned());
        delegations
    }

    /// Detect line-oriented delegation phrasings in text.
    ///
    /// The first matching pattern per line wins.
    pub fn extract_delegations(&mut self, text: &str) -> Vec<Delegation> {
        let mut delegations = Vec::new();

        for line in text.lines() {
            for (pattern, pattern_name) in LINE_PATTERNS.iter() {
                if let Some(caps) = pattern.captures(line) {
                    let agent = normalize_agent_name(caps.get(1).map_or("", |m| m.as_str()));
                    let task = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
                    if task.is_empty() {
                        break;
                    }
                    delegations.push(Delegation::detected(
                        agent,
                        task,
                        DelegationSource::DetectorLine,
                        1.0,
                        pattern_name,
                    ));
                    break;
                }
            }
        }

        self.delegated.extend(delegations.iter().cloned());
        delegations
    }

    /// Suggest a canonical agent for a task using the keyword table.
    ///
    /// Defaults to `engineer` when no keyword hits.
    pub fn suggest_agent_for_task(&self, task: &str) -> String {
        let (agent, _confidence) = todo_transformer::determine_agent(task);
        agent
    }

    /// Format a Task-tool delegation block for injection into a prompt.
    pub fn format_task_tool_delegation(&self, agent: &str, task: &str, context: &str) -> String {
        let today = Utc::now().format("%Y-%m-%d");
        format!(
            "**{} Agent**: {task}\n\n\
             TEMPORAL CONTEXT: Today is {today}.\n\n\
             **Task**: {task}\n\n\
             **Context**: {context}\n\n\
             **Expected Results**: Completed task with deliverables",
            display_agent_name(agent),
        )
    }

    /// All delegations recorded so far, in detection order.
    pub fn all_delegations(&self) -> &[Delegation] {
        &self.delegated
    }

    /// Count of recorded delegations per agent.
    pub fn delegation_summary(&self) -> HashMap<String, usize> {
        let mut summary = HashMap::new();
        for delegation in &self.delegated {
            *summary.entry(delegation.agent.clone()).or_insert(0) += 1;
        }
        summary
    }

    /// Drop all recorded delegations.
    pub fn clear(&mut self) {
        self.delegated.clear();
    }
}

/// Slice the task text of a markdown-form delegation out of the text
/// following its header: everything up to a blank line, the next bold
/// block, or end of input.
fn markdown_task_slice(rest: &str) -> String {
    let end = ["\n\n", "\n**"]
        .iter()
        .filter_map(|terminator| rest.find(terminator))
        .min()
        .unwrap_or(rest.len());
    rest[..end].trim().to_string()
}

/// Normalize an agent name to its canonical form.
///
/// Case-insensitive; known aliases resolve to canonical names, anything
/// else is lowercased with internal whitespace hyphenated.
pub fn normalize_agent_name(name: &str) -> String {
    static ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
        HashMap::from([
            ("doc", "documentation"),
            ("docs", "documentation"),
            ("documenter", "documentation"),
            ("eng", "engineer"),
            ("dev", "engineer"),
            ("developer", "engineer"),
            ("test", "qa"),
            ("testing", "qa"),
            ("quality", "qa"),
            ("researcher", "research"),
            ("investigate", "research"),
            ("devops", "ops"),
            ("operations", "ops"),
            ("sec", "security"),
            ("git", "version-control"),
            ("vcs", "version-control"),
            ("versioner", "version-control"),
            ("version control", "version-control"),
            ("data", "data-engineer"),
            ("database", "data-engineer"),
            ("data engineer", "data-engineer"),
        ])
    });

    let lowered = name.trim().to_lowercase();
    if let Some(canonical) = ALIASES.get(lowered.as_str()) {
        (*canonical).to_string()
    } else {
        lowered.split_whitespace().collect::<Vec<_>>().join("-")
    }
}

/// Human-facing display name for a canonical agent
/// (e.g. `data-engineer` → "Data Engineer", `qa` → "QA").
pub fn display_agent_name(canonical: &str) -> String {
    match canonical {
        "qa" => "QA".to_string(),
        other => other
            .split(['-', '_', ' '])
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_markdown_and_task_tool_forms() {
        let mut delegator = AgentDelegator::new();
        let text = "**Documentation Agent**: Update README\nTask(Investigate flaky CI)";
        let delegations = delegator.detect_delegations(text);

        assert_eq!(delegations.len(), 2);
        assert_eq!(delegations[0].agent, "documentation");
        assert_eq!(delegations[0].task, "Update README");
        assert_eq!(delegations[0].source, DelegationSource::DetectorMarkdown);
        assert_eq!(delegations[1].agent, "research");
        assert_eq!(delegations[1].task, "Investigate flaky CI");
        assert_eq!(delegations[1].source, DelegationSource::DetectorTasktool);
    }

    #[test]
    fn test_markdown_task_runs_until_blank_line() {
        let mut delegator = AgentDelegator::new();
        let text = "**Engineer**: Implement login endpoint\nwith JWT support\n\nUnrelated text";
        let delegations = delegator.detect_delegations(text);

        assert_eq!(delegations.len(), 1);
        assert_eq!(
            delegations[0].task,
            "Implement login endpoint\nwith JWT support"
        );
    }

    #[test]
    fn test_adjacent_bold_blocks_both_detected() {
        let mut delegator = AgentDelegator::new();
        let text = "**Engineer**: Implement login endpoint\n**QA**: Write unit tests for login\n";
        let delegations = delegator.detect_delegations(text);

        assert_eq!(delegations.len(), 2);
        assert_eq!(delegations[0].agent, "engineer");
        assert_eq!(delegations[1].agent, "qa");
        assert_eq!(delegations[1].task, "Write unit tests for login");
    }

    #[test]
    fn test_detector_roundtrip_on_formatted_summary() {
        // Running the detector over its own formatted output re-detects
        // the same (agent, task) pair.
        let mut delegator = AgentDelegator::new();
        let formatted = delegator.format_task_tool_delegation("engineer", "Implement login", "");
        let redetected = delegator.detect_delegations(&formatted);

        assert!(redetected
            .iter()
            .any(|d| d.agent == "engineer" && d.task.starts_with("Implement login")));
    }

    #[test]
    fn test_line_patterns() {
        let mut delegator = AgentDelegator::new();
        let text = "Delegate to QA: verify the fix\nAsk docs to: refresh the changelog";
        let delegations = delegator.extract_delegations(text);

        assert_eq!(delegations.len(), 2);
        assert_eq!(delegations[0].agent, "qa");
        assert_eq!(delegations[0].format.as_deref(), Some("explicit"));
        assert_eq!(delegations[1].agent, "documentation");
        assert_eq!(delegations[1].format.as_deref(), Some("ask"));
    }

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(normalize_agent_name("Docs"), "documentation");
        assert_eq!(normalize_agent_name("dev"), "engineer");
        assert_eq!(normalize_agent_name("Testing"), "qa");
        assert_eq!(normalize_agent_name("DevOps"), "ops");
        assert_eq!(normalize_agent_name("git"), "version-control");
        assert_eq!(normalize_agent_name("Version Control"), "version-control");
        assert_eq!(normalize_agent_name("Data Engineer"), "data-engineer");
    }

    #[test]
    fn test_normalize_is_idempotent_on_canonical_names() {
        for canonical in CANONICAL_AGENTS {
            assert_eq!(normalize_agent_name(canonical), *canonical);
        }
    }

    #[test]
    fn test_detected_agents_are_canonical() {
        let mut delegator = AgentDelegator::new();
        let text = "**Engineer**: build it\n\n**Version Control Agent**: tag the release\n\nTask(test the build)";
        for delegation in delegator.detect_delegations(text) {
            assert!(
                CANONICAL_AGENTS.contains(&delegation.agent.as_str()),
                "{} not canonical",
                delegation.agent
            );
            assert!(!delegation.task.trim().is_empty());
        }
    }

    #[test]
    fn test_suggest_agent_defaults_to_engineer() {
        let delegator = AgentDelegator::new();
        assert_eq!(delegator.suggest_agent_for_task("zzzz qqqq"), "engineer");
    }

    #[test]
    fn test_display_agent_name() {
        assert_eq!(display_agent_name("qa"), "QA");
        assert_eq!(display_agent_name("engineer"), "Engineer");
        assert_eq!(display_agent_name("data-engineer"), "Data Engineer");
        assert_eq!(display_agent_name("version-control"), "Version Control");
    }

    #[test]
    fn test_delegation_summary() {
        let mut delegator = AgentDelegator::new();
        delegator.detect_delegations("**Engineer**: a\n\n**Engineer**: b\n\n**QA**: c\n");

        let summary = delegator.delegation_summary();
        assert_eq!(summary.get("engineer"), Some(&2));
        assert_eq!(summary.get("qa"), Some(&1));
    }
}
