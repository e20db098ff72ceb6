//! TODO hijacking: turning filesystem TODO files into agent delegations.
//!
//! Watches a directory of JSON TODO files (one file may hold a single
//! object, an object with a `todos` or `items` key, or a bare array).
//! New or modified files are parsed, unprocessed items are transformed
//! into delegations, and each delegation is pushed onto a bounded channel
//! for the orchestrator to drain. At most one delegation is ever emitted
//! per distinct TODO id.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::MpmError;
use crate::orchestration::agent_delegator::Delegation;
use crate::orchestration::todo_transformer::{TodoItem, TodoTransformer};

/// Modification events within this window per path are ignored.
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Settle delay after a file creation before the first parse.
const CREATE_SETTLE: Duration = Duration::from_millis(100);

/// Cap on the processed-ID set. Past this the oldest ids are evicted.
const PROCESSED_IDS_CAP: usize = 100_000;

/// Insertion-ordered set of processed TODO ids with an eviction cap.
#[derive(Debug, Default)]
struct ProcessedIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl ProcessedIds {
    /// Insert an id. Returns `false` if it was already present.
    fn insert(&mut self, id: String) -> bool {
        if !self.set.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > PROCESSED_IDS_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }

    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }
}

/// State shared with the watcher callback thread.
struct HijackerInner {
    todo_dir: PathBuf,
    transformer: TodoTransformer,
    processed: Mutex<ProcessedIds>,
    last_processed: DashMap<PathBuf, Instant>,
    delegation_tx: mpsc::Sender<Delegation>,
}

impl HijackerInner {
    /// Handle a raw filesystem event from the watcher thread.
    fn handle_event(&self, event: &Event) {
        let created = matches!(event.kind, EventKind::Create(_));
        let modified = matches!(event.kind, EventKind::Modify(_));
        if !created && !modified {
            return;
        }

        for path in &event.paths {
            if !is_todo_file(path) {
                continue;
            }

            if modified {
                let now = Instant::now();
                if let Some(last) = self.last_processed.get(path) {
                    if now.duration_since(*last) < DEBOUNCE_WINDOW {
                        continue;
                    }
                }
                self.last_processed.insert(path.clone(), now);
                log::debug!("TODO file modified: {}", path.display());
            } else {
                log::debug!("TODO file created: {}", path.display());
                // Let the writer finish before the first parse.
                std::thread::sleep(CREATE_SETTLE);
            }

            self.process_todo_file(path);
        }
    }

    /// Parse one TODO file and emit delegations for unprocessed items.
    ///
    /// Parse failures are logged and skipped; they never take down the
    /// watcher.
    fn process_todo_file(&self, path: &Path) {
        let todos = match load_todo_file(path) {
            Ok(todos) => todos,
            Err(err) => {
                log::error!("Error processing TODO file {}: {err}", path.display());
                return;
            }
        };

        if todos.is_empty() {
            log::debug!("No actionable TODOs found in {}", path.display());
            return;
        }

        log::info!("Processing {} TODOs from {}", todos.len(), path.display());

        for todo in &todos {
            let todo_id = todo.todo_id();
            if self.processed.lock().contains(&todo_id) {
                continue;
            }

            if let Some(delegation) = self.transformer.transform_todo(todo) {
                if !self.processed.lock().insert(todo_id) {
                    continue;
                }

                log::info!(
                    "Created delegation: {} - {}",
                    delegation.agent,
                    delegation.task.chars().take(50).collect::<String>()
                );

                match self.delegation_tx.try_send(delegation) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(d)) => {
                        log::warn!("Delegation channel full, dropping TODO delegation for {}", d.agent);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::warn!("Delegation channel closed, dropping TODO delegation");
                    }
                }
            }
        }
    }
}

/// Watches the TODO inbox and converts TODO items into delegations.
///
/// Delegations are delivered over the channel passed at construction;
/// they can also be pulled on demand with
/// [`get_pending_delegations`](Self::get_pending_delegations).
pub struct TodoHijacker {
    inner: Arc<HijackerInner>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl TodoHijacker {
    /// Create a hijacker over the given TODO directory.
    ///
    /// Defaults to `~/.claude/todos`; the directory is created if missing.
    /// Produced delegations are sent on `delegation_tx`.
    pub fn new(
        todo_dir: Option<PathBuf>,
        delegation_tx: mpsc::Sender<Delegation>,
    ) -> Result<Self, MpmError> {
        let todo_dir = todo_dir.unwrap_or_else(default_todo_dir);
        std::fs::create_dir_all(&todo_dir)?;

        log::info!("TodoHijacker initialized, monitoring: {}", todo_dir.display());

        Ok(Self {
            inner: Arc::new(HijackerInner {
                todo_dir,
                transformer: TodoTransformer::new(),
                processed: Mutex::new(ProcessedIds::default()),
                last_processed: DashMap::new(),
                delegation_tx,
            }),
            watcher: Mutex::new(None),
        })
    }

    /// Directory being monitored.
    pub fn todo_dir(&self) -> &Path {
        &self.inner.todo_dir
    }

    /// Start monitoring the TODO directory.
    ///
    /// Scans existing files once, then subscribes to create/modify events.
    /// Calling this while already monitoring is a no-op.
    pub fn start_monitoring(&self) -> Result<(), MpmError> {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            log::warn!("Monitoring already active");
            return Ok(());
        }

        self.scan_existing_todos();

        let inner = Arc::clone(&self.inner);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => inner.handle_event(&event),
                Err(err) => log::warn!("Filesystem watcher error: {err}"),
            }
        })?;
        watcher.watch(&self.inner.todo_dir, RecursiveMode::Recursive)?;
        *guard = Some(watcher);

        log::info!("Started monitoring TODO directory");
        Ok(())
    }

    /// Stop monitoring. Safe to call when not monitoring.
    pub fn stop_monitoring(&self) {
        let mut guard = self.watcher.lock();
        if guard.take().is_some() {
            log::info!("Stopped monitoring TODO directory");
        }
    }

    /// Whether the watcher is currently attached.
    pub fn is_monitoring(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Re-scan the inbox and return delegations for TODOs whose ids have
    /// not been processed yet. Does not mark anything processed.
    pub fn get_pending_delegations(&self) -> Vec<Delegation> {
        let mut delegations = Vec::new();

        for path in self.todo_files() {
            let todos = match load_todo_file(&path) {
                Ok(todos) => todos,
                Err(err) => {
                    log::error!("Error getting pending delegations: {err}");
                    continue;
                }
            };

            for todo in &todos {
                if self.inner.processed.lock().contains(&todo.todo_id()) {
                    continue;
                }
                if let Some(delegation) = self.inner.transformer.transform_todo(todo) {
                    delegations.push(delegation);
                }
            }
        }

        delegations
    }

    /// Mark a delegation's originating TODO as processed so it is never
    /// re-emitted.
    pub fn mark_delegation_completed(&self, delegation: &Delegation) {
        if let Some(todo_id) = &delegation.todo_id {
            self.inner.processed.lock().insert(todo_id.clone());
        }
    }

    /// Process any existing TODO files once.
    fn scan_existing_todos(&self) {
        let files = self.todo_files();
        log::info!("Found {} existing TODO files", files.len());
        for path in files {
            self.inner.process_todo_file(&path);
        }
    }

    fn todo_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.inner.todo_dir) else {
            return files;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        files
    }
}

impl Drop for TodoHijacker {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

/// Default TODO inbox location: `~/.claude/todos`.
fn default_todo_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".claude").join("todos")
}

/// A watchable TODO file is a `.json` file whose path mentions `todos`.
fn is_todo_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path.to_string_lossy().contains("todos")
}

/// Load and flatten one TODO file into actionable items.
///
/// Accepted shapes: `{"todos": [...]}`, `{"items": [...]}`, a single TODO
/// object, or a top-level array. Completed items and items without task
/// content are filtered out.
fn load_todo_file(path: &Path) -> Result<Vec<TodoItem>, MpmError> {
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| MpmError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let raw_items: Vec<Value> = match value {
        Value::Object(ref map) => {
            if let Some(Value::Array(todos)) = map.get("todos") {
                todos.clone()
            } else if let Some(Value::Array(items)) = map.get("items") {
                items.clone()
            } else if map.contains_key("content") || map.contains_key("task") {
                vec![value]
            } else {
                Vec::new()
            }
        }
        Value::Array(items) => items,
        _ => Vec::new(),
    };

    let mut todos = Vec::new();
    for item in raw_items {
        let Ok(todo) = serde_json::from_value::<TodoItem>(item) else {
            continue;
        };
        if todo.is_completed() {
            continue;
        }
        if todo.content.is_none() && todo.task.is_none() {
            continue;
        }
        todos.push(todo);
    }

    Ok(todos)
}
