//! Error types for the claude-mpm orchestrator.
//!
//! One enum per failure domain keeps the propagation policy auditable:
//! observability-facing operations (hooks, event emission, ticket creation,
//! session logging, skills loading) are enveloped at their call sites and
//! never abort a session; only launcher and orchestrator bookkeeping errors
//! reach the driver.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for orchestrator operations.
#[derive(Debug, Error)]
pub enum MpmError {
    /// The claude executable could not be located.
    #[error("claude executable not found (checked well-known paths and $PATH)")]
    ClaudeNotFound,

    /// Filesystem or subprocess I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A claude subprocess exited with a non-zero status.
    #[error("subprocess failed with exit code {code}: {stderr}")]
    Subprocess {
        /// Exit code reported by the child.
        code: i32,
        /// Captured stderr of the child.
        stderr: String,
    },

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {elapsed:.1}s (partial output: {partial_output})")]
    Timeout {
        /// Human-readable name of the operation that timed out.
        operation: String,
        /// Seconds elapsed before the deadline fired.
        elapsed: f64,
        /// Whether partial stdout/stderr was captured.
        partial_output: bool,
    },

    /// A JSON document on disk could not be parsed.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// Serialization of an internal record failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Session log persistence failed.
    #[error("session log error: {0}")]
    SessionLog(String),

    /// The filesystem watcher could not be created or attached.
    #[error("filesystem watcher error: {0}")]
    Watcher(String),

    /// The external hook service misbehaved.
    #[error("hook service error: {0}")]
    Hook(String),

    /// The external ticket store rejected a ticket.
    #[error("ticket store error: {0}")]
    TicketStore(String),
}

impl From<notify::Error> for MpmError {
    fn from(err: notify::Error) -> Self {
        MpmError::Watcher(err.to_string())
    }
}
