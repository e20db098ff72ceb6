//! Ticket extraction from agent output.
//!
//! Scans free-form text line by line for ticket-worthy patterns
//! (`TODO:`, `BUG:`, `FEATURE:`, `FIXME:`, `ISSUE:`, `TASK:`,
//! `ENHANCEMENT:`) and turns each hit into a structured [`Ticket`] with a
//! cleaned title. Tickets can also be injected from hook results via
//! [`TicketExtractor::add_ticket_value`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ticket pattern table: (compiled pattern, ticket type, label).
static PATTERNS: Lazy<Vec<(Regex, &'static str, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)TODO:\s*(.+)").unwrap(), "task", "todo"),
        (Regex::new(r"(?i)TASK:\s*(.+)").unwrap(), "task", "task"),
        (Regex::new(r"(?i)BUG:\s*(.+)").unwrap(), "bug", "bug"),
        (Regex::new(r"(?i)FIXME:\s*(.+)").unwrap(), "bug", "fixme"),
        (Regex::new(r"(?i)FEATURE:\s*(.+)").unwrap(), "feature", "feature"),
        (Regex::new(r"(?i)ISSUE:\s*(.+)").unwrap(), "issue", "issue"),
        (
            Regex::new(r"(?i)ENHANCEMENT:\s*(.+)").unwrap(),
            "enhancement",
            "enhancement",
        ),
    ]
});

/// An extracted work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    /// Ticket type: one of `task`, `bug`, `feature`, `issue`, `enhancement`.
    #[serde(rename = "type")]
    pub ticket_type: String,
    /// Cleaned title (non-empty, no surrounding whitespace or quotes).
    pub title: String,
    /// The raw pattern label that matched (e.g. `todo`, `fixme`).
    pub label: String,
    /// The full line the ticket was extracted from.
    #[serde(default)]
    pub raw_line: String,
    /// Extraction timestamp.
    pub extracted_at: DateTime<Utc>,
    /// Optional longer description (hook-injected tickets may carry one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Extracts ticket-worthy patterns from agent output.
#[derive(Debug, Default)]
pub struct TicketExtractor {
    extracted: Vec<Ticket>,
}

impl TicketExtractor {
    /// Create a new extractor with no collected tickets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract tickets from a single line of output.
    ///
    /// Every matching pattern on the line yields one ticket, provided the
    /// cleaned title is non-empty. Extracted tickets are also recorded on
    /// the extractor for the session summary.
    pub fn extract_from_line(&mut self, line: &str) -> Vec<Ticket> {
        let mut tickets = Vec::new();

        for (pattern, ticket_type, label) in PATTERNS.iter() {
            if let Some(caps) = pattern.captures(line) {
                let title = clean_title(caps.get(1).map_or("", |m| m.as_str()));
                if title.is_empty() {
                    continue;
                }

                let ticket = Ticket {
                    ticket_type: (*ticket_type).to_string(),
                    title,
                    label: (*label).to_string(),
                    raw_line: line.to_string(),
                    extracted_at: Utc::now(),
                    description: None,
                };
                log::debug!("Extracted {}: {}", ticket.ticket_type, ticket.title);
                tickets.push(ticket.clone());
                self.extracted.push(ticket);
            }
        }

        tickets
    }

    /// Extract tickets from multi-line text.
    ///
    /// Equivalent to running [`extract_from_line`](Self::extract_from_line)
    /// over every line of the input.
    pub fn extract_from_text(&mut self, text: &str) -> Vec<Ticket> {
        let mut tickets = Vec::new();
        for line in text.lines() {
            tickets.extend(self.extract_from_line(line));
        }
        tickets
    }

    /// Add a fully-formed ticket (e.g. carried over from another extractor).
    pub fn add_ticket(&mut self, ticket: Ticket) {
        self.extracted.push(ticket);
    }

    /// Add a ticket from an untyped hook result value.
    ///
    /// Entries missing `type` or `title` are rejected with a warning.
    /// A missing `extracted_at` is filled with the current time and a
    /// missing `label` defaults to the ticket type.
    ///
    /// Returns `true` if the ticket was accepted.
    pub fn add_ticket_value(&mut self, value: &Value) -> bool {
        let ticket_type = value.get("type").and_then(Value::as_str);
        let title = value.get("title").and_then(Value::as_str);

        let (ticket_type, title) = match (ticket_type, title) {
            (Some(t), Some(title)) if !title.is_empty() => (t, title),
            _ => {
                log::warn!("Skipping invalid ticket: {value}");
                return false;
            }
        };

        let extracted_at = value
            .get("extracted_at")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        let label = value
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or(ticket_type)
            .to_string();

        let ticket = Ticket {
            ticket_type: ticket_type.to_string(),
            title: title.to_string(),
            label,
            raw_line: value
                .get("raw_line")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            extracted_at,
            description: value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        log::debug!("Added ticket from hook: {} - {}", ticket.ticket_type, ticket.title);
        self.extracted.push(ticket);
        true
    }

    /// All tickets collected so far, in extraction order.
    pub fn all_tickets(&self) -> &[Ticket] {
        &self.extracted
    }

    /// Number of collected tickets.
    pub fn len(&self) -> usize {
        self.extracted.len()
    }

    /// Whether no tickets have been collected.
    pub fn is_empty(&self) -> bool {
        self.extracted.is_empty()
    }

    /// Drop all collected tickets.
    pub fn clear(&mut self) {
        self.extracted.clear();
    }

    /// Count of collected tickets per ticket type.
    pub fn summary(&self) -> HashMap<String, usize> {
        let mut summary = HashMap::new();
        for ticket in &self.extracted {
            *summary.entry(ticket.ticket_type.clone()).or_insert(0) += 1;
        }
        summary
    }
}

/// Clean a raw ticket title: strip trailing punctuation, unwrap matching
/// quotes, and collapse internal whitespace.
fn clean_title(raw: &str) -> String {
    let mut title = raw.trim().trim_end_matches(['.', ',', ';', ':']);

    let bytes = title.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            title = &title[1..title.len() - 1];
        }
    }

    title.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_todo_with_quotes_and_punctuation() {
        let mut extractor = TicketExtractor::new();
        let tickets = extractor.extract_from_line("TODO: 'refactor auth.py'.");

        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].ticket_type, "task");
        assert_eq!(tickets[0].title, "refactor auth.py");
        assert_eq!(tickets[0].label, "todo");
        assert_eq!(tickets[0].raw_line, "TODO: 'refactor auth.py'.");
    }

    #[test]
    fn test_extract_is_case_insensitive() {
        let mut extractor = TicketExtractor::new();
        let tickets = extractor.extract_from_line("todo: lowercase works");
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].title, "lowercase works");
    }

    #[test]
    fn test_extract_bug_and_fixme_both_map_to_bug() {
        let mut extractor = TicketExtractor::new();
        let bug = extractor.extract_from_line("BUG: password-logging in debug mode");
        let fixme = extractor.extract_from_line("FIXME: flaky retry loop");

        assert_eq!(bug[0].ticket_type, "bug");
        assert_eq!(bug[0].label, "bug");
        assert_eq!(fixme[0].ticket_type, "bug");
        assert_eq!(fixme[0].label, "fixme");
    }

    #[test]
    fn test_empty_title_is_not_a_ticket() {
        let mut extractor = TicketExtractor::new();
        assert!(extractor.extract_from_line("TODO:   ").is_empty());
        assert!(extractor.extract_from_line("TODO: ...").is_empty());
        assert!(extractor.all_tickets().is_empty());
    }

    #[test]
    fn test_title_whitespace_is_collapsed() {
        let mut extractor = TicketExtractor::new();
        let tickets = extractor.extract_from_line("TASK: add    rate   limiting");
        assert_eq!(tickets[0].title, "add rate limiting");
    }

    #[test]
    fn test_extract_from_text_equals_linewise_union() {
        let text = "Implemented /login. TODO: Add rate limiting.\nAll good.\nBUG: token leak\n";

        let mut by_text = TicketExtractor::new();
        let from_text = by_text.extract_from_text(text);

        let mut by_line = TicketExtractor::new();
        let mut from_lines = Vec::new();
        for line in text.lines() {
            from_lines.extend(by_line.extract_from_line(line));
        }

        let titles = |ts: &[Ticket]| {
            ts.iter()
                .map(|t| (t.ticket_type.clone(), t.title.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(titles(&from_text), titles(&from_lines));
        assert_eq!(from_text.len(), 2);
    }

    #[test]
    fn test_title_invariants() {
        let mut extractor = TicketExtractor::new();
        extractor.extract_from_text(
            "TODO: \"quoted title\"\nFEATURE:   spaced   out  ;\nISSUE: plain",
        );

        for ticket in extractor.all_tickets() {
            assert!(!ticket.title.is_empty());
            assert!(!ticket.title.contains('\n'));
            assert_eq!(ticket.title, ticket.title.trim());
            let first = ticket.title.chars().next().unwrap();
            assert!(first != '"' && first != '\'');
        }
    }

    #[test]
    fn test_summary_counts_by_type() {
        let mut extractor = TicketExtractor::new();
        extractor.extract_from_text("TODO: a\nTASK: b\nBUG: c");

        let summary = extractor.summary();
        assert_eq!(summary.get("task"), Some(&2));
        assert_eq!(summary.get("bug"), Some(&1));
    }

    #[test]
    fn test_add_ticket_value_fills_defaults() {
        let mut extractor = TicketExtractor::new();
        assert!(extractor.add_ticket_value(&json!({"type": "bug", "title": "hook bug"})));

        let ticket = &extractor.all_tickets()[0];
        assert_eq!(ticket.label, "bug");
        assert_eq!(ticket.ticket_type, "bug");
    }

    #[test]
    fn test_add_ticket_value_rejects_missing_fields() {
        let mut extractor = TicketExtractor::new();
        assert!(!extractor.add_ticket_value(&json!({"title": "no type"})));
        assert!(!extractor.add_ticket_value(&json!({"type": "bug"})));
        assert!(!extractor.add_ticket_value(&json!({"type": "bug", "title": ""})));
        assert!(extractor.is_empty());
    }

    #[test]
    fn test_mismatched_quotes_are_kept() {
        let mut extractor = TicketExtractor::new();
        let tickets = extractor.extract_from_line("TODO: \"mismatched'");
        assert_eq!(tickets[0].title, "\"mismatched'");
    }
}
