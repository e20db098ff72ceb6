//! # Claude MPM
//!
//! Multi-agent project manager orchestrating claude CLI sessions.
//!
//! A user prompt goes to a "PM" invocation of the claude CLI; the PM's
//! response names specialized agents (Engineer, QA, Documentation,
//! Research, Security, Ops, Version Control, Data Engineer) and the work
//! each should do. The orchestrator spawns those agents as independent
//! subprocesses in parallel, collects their outputs, extracts tracked
//! items (TODO/BUG/FEATURE tickets and delegations), and streams
//! lifecycle events to any attached Socket.IO observers.

pub mod cli;
pub mod core;
pub mod error;
pub mod hooks;
pub mod orchestration;
pub mod skills;

pub use error::MpmError;
pub use orchestration::agent_delegator::{AgentDelegator, Delegation, DelegationSource};
pub use orchestration::base::{Orchestrator, OrchestratorCore, TicketStore};
pub use orchestration::factory::{OrchestratorConfig, OrchestratorFactory};
pub use orchestration::subprocess::{AgentResult, AgentStatus, SubprocessOrchestrator};
pub use orchestration::ticket_extractor::{Ticket, TicketExtractor};
pub use orchestration::todo_hijacker::TodoHijacker;
pub use orchestration::todo_transformer::{TodoItem, TodoTransformer};

/// Library version.
pub const VERSION: &str = "0.5.0";
