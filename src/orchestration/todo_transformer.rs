//! TODO-to-delegation transformation.
//!
//! Maps a single TODO item to an agent delegation using a weighted keyword
//! match over a per-agent keyword table. Multi-word keywords require an
//! exact phrase match; single-word keywords require a word-boundary match.
//! Low-confidence matches are dropped.

use std::collections::HashMap;

use chrono::Utc;
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestration::agent_delegator::{Delegation, DelegationSource};
use crate::orchestration::ticket_extractor::Ticket;

/// Keyword table entry for one agent type.
struct AgentKeywords {
    keywords: &'static [&'static str],
    /// Canonical agent name the keywords map to.
    agent: &'static str,
    /// Declared priority, 1..10. Scales the normalized score and breaks ties.
    priority: u32,
}

/// Static agent keyword table.
static AGENT_KEYWORDS: &[AgentKeywords] = &[
    AgentKeywords {
        keywords: &[
            "code", "implement", "function", "class", "api", "develop", "create", "build",
            "write", "script", "algorithm", "refactor", "optimize code", "debug", "fix bug",
        ],
        agent: "engineer",
        priority: 8,
    },
    AgentKeywords {
        keywords: &[
            "unit test", "unit tests", "integration test", "test", "testing", "validate",
            "verify", "check", "quality", "qa", "coverage", "pytest", "assertion", "mock",
            "fixture",
        ],
        agent: "qa",
        priority: 9,
    },
    AgentKeywords {
        keywords: &[
            "api documentation", "document", "docs", "readme", "changelog", "comment",
            "docstring", "documentation", "guide", "tutorial", "explain", "description",
            "wiki", "manual",
        ],
        agent: "documentation",
        priority: 9,
    },
    AgentKeywords {
        keywords: &[
            "research", "investigate", "analyze", "study", "explore", "find out", "look into",
            "understand", "learn", "compare", "evaluate", "assess", "review",
        ],
        agent: "research",
        priority: 5,
    },
    AgentKeywords {
        keywords: &[
            "security", "vulnerability", "auth", "authorization", "authentication", "encrypt",
            "decrypt", "permission", "access control", "token", "password", "secure",
        ],
        agent: "security",
        priority: 9,
    },
    AgentKeywords {
        keywords: &[
            "deploy", "deployment", "ci/cd", "pipeline", "docker", "kubernetes", "container",
            "infrastructure", "devops", "build", "release", "publish", "package",
        ],
        agent: "ops",
        priority: 4,
    },
    AgentKeywords {
        keywords: &[
            "git branch", "git", "branch", "merge", "commit", "version", "tag", "release",
            "cherry-pick", "rebase", "pull request", "github", "gitlab",
        ],
        agent: "version-control",
        priority: 7,
    },
    AgentKeywords {
        keywords: &[
            "database", "data", "sql", "query", "migration", "schema", "table", "index",
            "api integration", "openai", "claude api", "data pipeline", "etl", "analytics",
            "redis", "mongodb",
        ],
        agent: "data-engineer",
        priority: 7,
    },
];

/// A TODO item read from the filesystem inbox.
///
/// Field names are loose on purpose: different writers use different keys
/// for the same concept (`content`/`task`/`description`, `labels`/`tags`).
/// Unknown fields are preserved in `extra` for hook pass-through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TodoItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl TodoItem {
    /// Whether this item is finished and should be skipped.
    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed") || self.done == Some(true)
    }

    /// Task text: `content | task | description | title+body`, first hit wins.
    pub fn task_content(&self) -> Option<String> {
        if let Some(content) = non_empty(&self.content) {
            return Some(content);
        }
        if let Some(task) = non_empty(&self.task) {
            return Some(task);
        }
        if let Some(description) = non_empty(&self.description) {
            return Some(description);
        }
        let title = self.title.as_deref().unwrap_or("");
        let body = self.body.as_deref().unwrap_or("");
        let combined = format!("{title}\n{body}").trim().to_string();
        if combined.is_empty() {
            None
        } else {
            Some(combined)
        }
    }

    /// Stable identifier for processed-set tracking.
    ///
    /// Uses the explicit `id` when present, otherwise derives one from an
    /// MD5 of the content joined with the creation timestamp string.
    pub fn todo_id(&self) -> String {
        if let Some(id) = &self.id {
            return match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
        }

        let content = self
            .content
            .as_deref()
            .or(self.task.as_deref())
            .unwrap_or("");
        let timestamp = self
            .created_at
            .as_deref()
            .or(self.timestamp.as_deref())
            .unwrap_or("");
        let mut hasher = Md5::new();
        hasher.update(content.as_bytes());
        format!("{:x}_{timestamp}", hasher.finalize())
    }
}

fn non_empty(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pick the best agent for a task by keyword scoring.
///
/// Returns the canonical agent name and a confidence in `[0, 1]`.
/// Falls back to `("engineer", 0.3)` when no keyword matches.
pub fn determine_agent(task_content: &str) -> (String, f64) {
    let task_lower = task_content.to_lowercase();

    struct Score<'a> {
        agent: &'a str,
        priority: u32,
        normalized: f64,
        matched: Vec<&'a str>,
    }

    let mut scores: Vec<Score<'_>> = Vec::new();

    for entry in AGENT_KEYWORDS {
        let mut weighted = 0.0_f64;
        let mut matched = Vec::new();

        // Longer keywords first so phrases win over their component words.
        let mut keywords: Vec<&str> = entry.keywords.to_vec();
        keywords.sort_by_key(|k| std::cmp::Reverse(k.len()));

        for keyword in keywords {
            if keyword.contains(' ') {
                if task_lower.contains(keyword) {
                    weighted += keyword.split_whitespace().count() as f64 * 0.5 + 1.0;
                    matched.push(keyword);
                }
            } else if word_boundary_match(&task_lower, keyword) {
                weighted += 1.0;
                matched.push(keyword);
            }
        }

        if weighted > 0.0 && !matched.is_empty() {
            // Roughly three matched keywords mean high confidence; the
            // declared priority scales the result.
            let normalized = matched.len() as f64 / 3.0 * (f64::from(entry.priority) / 10.0);
            scores.push(Score {
                agent: entry.agent,
                priority: entry.priority,
                normalized,
                matched,
            });
        }
    }

    scores.sort_by(|a, b| {
        b.normalized
            .partial_cmp(&a.normalized)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.priority.cmp(&a.priority))
    });

    if let Some(best) = scores.first() {
        log::debug!("Matched '{}' with keywords: {:?}", best.agent, best.matched);
        (best.agent.to_string(), best.normalized.min(1.0))
    } else {
        ("engineer".to_string(), 0.3)
    }
}

fn word_boundary_match(haystack: &str, keyword: &str) -> bool {
    static CACHE: Lazy<dashmap::DashMap<String, Regex>> = Lazy::new(dashmap::DashMap::new);

    if let Some(re) = CACHE.get(keyword) {
        return re.is_match(haystack);
    }
    let re = Regex::new(&format!(r"\b{}\b", regex::escape(keyword)))
        .expect("escaped keyword is a valid regex");
    let matched = re.is_match(haystack);
    CACHE.insert(keyword.to_string(), re);
    matched
}

/// Transforms TODO items into agent delegations.
#[derive(Debug, Default, Clone)]
pub struct TodoTransformer;

impl TodoTransformer {
    /// Create a new transformer.
    pub fn new() -> Self {
        Self
    }

    /// Transform a TODO item into a delegation.
    ///
    /// Returns `None` for completed items, items with no task content,
    /// and matches below the 0.1 confidence cut-off.
    pub fn transform_todo(&self, todo: &TodoItem) -> Option<Delegation> {
        if todo.is_completed() {
            log::debug!("Skipping completed TODO");
            return None;
        }

        let task_content = todo.task_content()?;
        let (agent, confidence) = determine_agent(&task_content);

        if confidence < 0.1 {
            log::debug!(
                "Low confidence ({confidence:.2}) for task: {}",
                truncate(&task_content, 50)
            );
            return None;
        }

        Some(Delegation {
            agent,
            task: task_content,
            source: DelegationSource::TodoHijacker,
            confidence,
            timestamp: Utc::now(),
            priority: todo.priority.clone(),
            labels: todo.labels.clone().or_else(|| todo.tags.clone()),
            todo_id: Some(todo.todo_id()),
            ticket_type: None,
            format: None,
        })
    }

    /// Transform an extracted PM ticket into a delegation.
    ///
    /// The ticket type picks the agent when it maps cleanly
    /// (confidence 0.8); otherwise keyword scoring decides.
    pub fn transform_pm_ticket(&self, ticket: &Ticket) -> Delegation {
        let mut task_content = ticket.title.clone();
        if let Some(description) = &ticket.description {
            task_content.push('\n');
            task_content.push_str(description);
        }

        let type_mapping: &[(&str, &str)] = &[
            ("feature", "engineer"),
            ("bug", "engineer"),
            ("test", "qa"),
            ("docs", "documentation"),
            ("research", "research"),
            ("security", "security"),
            ("deployment", "ops"),
            ("infrastructure", "ops"),
            ("data", "data-engineer"),
        ];

        let ticket_type = ticket.ticket_type.to_lowercase();
        let typed_agent = type_mapping
            .iter()
            .find(|(key, _)| ticket_type.contains(key))
            .map(|(_, agent)| (*agent).to_string());

        let (agent, confidence) = match typed_agent {
            Some(agent) => (agent, 0.8),
            None => determine_agent(&task_content),
        };

        Delegation {
            agent,
            task: task_content,
            source: DelegationSource::PmTicket,
            confidence,
            timestamp: Utc::now(),
            priority: None,
            labels: None,
            todo_id: None,
            ticket_type: Some(ticket.ticket_type.clone()),
            format: None,
        }
    }

    /// Transform a batch of TODOs, ordered by (priority, confidence)
    /// descending.
    pub fn batch_transform(&self, todos: &[TodoItem]) -> Vec<Delegation> {
        let mut delegations: Vec<Delegation> =
            todos.iter().filter_map(|t| self.transform_todo(t)).collect();

        delegations.sort_by(|a, b| {
            priority_rank(b.priority.as_deref())
                .cmp(&priority_rank(a.priority.as_deref()))
                .then(
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        delegations
    }
}

fn priority_rank(priority: Option<&str>) -> u8 {
    match priority {
        Some("high") => 7,
        Some("medium") | None => 5,
        Some("low") => 3,
        Some(_) => 5,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todo(content: &str) -> TodoItem {
        TodoItem {
            content: Some(content.to_string()),
            ..TodoItem::default()
        }
    }

    #[test]
    fn test_unit_test_todo_goes_to_qa() {
        let transformer = TodoTransformer::new();
        let delegation = transformer
            .transform_todo(&todo("write unit tests for login"))
            .unwrap();

        assert_eq!(delegation.agent, "qa");
        assert!(delegation.confidence >= 0.1);
        assert_eq!(delegation.source, DelegationSource::TodoHijacker);
        assert!(delegation.todo_id.is_some());
    }

    #[test]
    fn test_completed_todo_is_dropped() {
        let transformer = TodoTransformer::new();
        let mut item = todo("write unit tests");
        item.status = Some("completed".to_string());
        assert!(transformer.transform_todo(&item).is_none());

        let mut item = todo("write unit tests");
        item.done = Some(true);
        assert!(transformer.transform_todo(&item).is_none());
    }

    #[test]
    fn test_empty_content_is_dropped() {
        let transformer = TodoTransformer::new();
        assert!(transformer.transform_todo(&TodoItem::default()).is_none());
        assert!(transformer.transform_todo(&todo("   ")).is_none());
    }

    #[test]
    fn test_title_and_body_fallback() {
        let transformer = TodoTransformer::new();
        let item = TodoItem {
            title: Some("Deploy the service".to_string()),
            body: Some("use the docker pipeline".to_string()),
            ..TodoItem::default()
        };
        let delegation = transformer.transform_todo(&item).unwrap();
        assert_eq!(delegation.agent, "ops");
        assert!(delegation.task.contains("Deploy the service"));
    }

    #[test]
    fn test_multiword_phrase_outranks_single_word() {
        // "unit test" (qa phrase) should not be claimed by engineer's
        // "write" alone.
        let (agent, confidence) = determine_agent("add integration test coverage for the api");
        assert_eq!(agent, "qa");
        assert!(confidence > 0.1);
    }

    #[test]
    fn test_no_keyword_match_defaults_to_engineer() {
        let (agent, confidence) = determine_agent("zzzz qqqq xxxx");
        assert_eq!(agent, "engineer");
        assert!((confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_confidence_is_capped_at_one() {
        let (_, confidence) = determine_agent(
            "test testing validate verify check quality qa coverage pytest assertion mock fixture",
        );
        assert!((confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_word_boundary_prevents_substring_hits() {
        // "testify" must not match the single-word keyword "test".
        let (agent, _) = determine_agent("integrate the testify assertions library");
        assert_ne!(agent, "qa");
    }

    #[test]
    fn test_todo_id_prefers_explicit_id() {
        let item: TodoItem =
            serde_json::from_value(json!({"id": "t1", "content": "write unit tests"})).unwrap();
        assert_eq!(item.todo_id(), "t1");

        let item: TodoItem =
            serde_json::from_value(json!({"id": 42, "content": "write unit tests"})).unwrap();
        assert_eq!(item.todo_id(), "42");
    }

    #[test]
    fn test_derived_todo_id_is_stable() {
        let a = todo("same content");
        let b = todo("same content");
        assert_eq!(a.todo_id(), b.todo_id());
        assert_ne!(a.todo_id(), todo("other content").todo_id());
    }

    #[test]
    fn test_priority_and_labels_carried_over() {
        let item: TodoItem = serde_json::from_value(json!({
            "content": "implement caching",
            "priority": "high",
            "tags": ["performance"]
        }))
        .unwrap();
        let delegation = TodoTransformer::new().transform_todo(&item).unwrap();

        assert_eq!(delegation.priority.as_deref(), Some("high"));
        assert_eq!(delegation.labels.as_deref(), Some(&["performance".to_string()][..]));
    }

    #[test]
    fn test_transform_pm_ticket_type_mapping() {
        let transformer = TodoTransformer::new();
        let ticket = Ticket {
            ticket_type: "bug".to_string(),
            title: "password-logging in debug mode".to_string(),
            label: "bug".to_string(),
            raw_line: String::new(),
            extracted_at: Utc::now(),
            description: None,
        };

        let delegation = transformer.transform_pm_ticket(&ticket);
        assert_eq!(delegation.agent, "engineer");
        assert!((delegation.confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(delegation.source, DelegationSource::PmTicket);
        assert_eq!(delegation.ticket_type.as_deref(), Some("bug"));
    }

    #[test]
    fn test_batch_transform_orders_by_priority_then_confidence() {
        let transformer = TodoTransformer::new();
        let low: TodoItem =
            serde_json::from_value(json!({"content": "write unit tests", "priority": "low"}))
                .unwrap();
        let high: TodoItem =
            serde_json::from_value(json!({"content": "implement the api", "priority": "high"}))
                .unwrap();

        let delegations = transformer.batch_transform(&[low, high]);
        assert_eq!(delegations.len(), 2);
        assert_eq!(delegations[0].priority.as_deref(), Some("high"));
    }
}
