//! Socket.IO connection pool with circuit breaker and micro-batching.
//!
//! Ships lifecycle events (hook invocations, agent starts/stops, ticket
//! extractions, errors) to any attached Socket.IO observer without ever
//! blocking the orchestrator's main path. [`SocketIoConnectionPool::emit_event`]
//! only enqueues under a lock and returns; a dedicated batching task on a
//! pool-owned runtime wakes every 50 ms, drains up to 10 events, groups
//! them by namespace, and flushes each group over one pooled client.
//!
//! A three-state circuit breaker (closed → open → half-open) gates every
//! flush so a dead server costs one failed connect per recovery window
//! instead of one per batch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use serde_json::{json, Map, Value};
use tokio::runtime::{Builder, Runtime};

/// Ports probed when `CLAUDE_MPM_SOCKETIO_PORT` is unset.
const COMMON_PORTS: &[u16] = &[8765, 8080, 8081, 8082, 8083, 8084, 8085];

/// Default port when no server is detected.
const DEFAULT_PORT: u16 = 8765;

/// Probe timeout per port during server detection.
const PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// Timeout for a client's initial connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum events drained per batch window.
const MAX_BATCH_SIZE: usize = 10;

/// Cap on the batch queue; oldest events are dropped past this.
const BATCH_QUEUE_CAP: usize = 10_000;

/// Auth token sent with every connection.
const AUTH_TOKEN: &str = "dev-token";

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; flushes are rejected until the recovery timeout passes.
    Open,
    /// Testing whether the service recovered; one flush is allowed.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase wire/stat name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker for event-stream failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given threshold and recovery timeout.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a flush may proceed. An OPEN breaker flips to HALF_OPEN
    /// once the recovery timeout has elapsed.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .is_some_and(|at| at.elapsed() > self.recovery_timeout);
                if recovered {
                    self.state = CircuitState::HalfOpen;
                    log::info!("Circuit breaker transitioning to HALF_OPEN for testing");
                }
                recovered
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a successful flush.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                log::info!("Circuit breaker CLOSED - service recovered");
            }
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed flush.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                log::warn!("Circuit breaker OPEN - test failed");
            }
            CircuitState::Closed if self.failure_count >= self.failure_threshold => {
                self.state = CircuitState::Open;
                log::error!(
                    "Circuit breaker OPEN - {} consecutive failures",
                    self.failure_count
                );
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Batch events and connection bookkeeping
// ---------------------------------------------------------------------------

/// An event waiting in the batch queue.
#[derive(Debug, Clone)]
pub struct BatchEvent {
    /// Socket.IO namespace the event belongs to.
    pub namespace: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub data: Map<String, Value>,
    /// Enqueue timestamp, attached to the emitted payload.
    pub timestamp: DateTime<Utc>,
}

/// Per-connection statistics.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the connection was created.
    pub created_at: DateTime<Utc>,
    /// Last time the connection served a batch.
    pub last_used: DateTime<Utc>,
    /// Events successfully emitted over this connection.
    pub events_sent: u64,
    /// Total errors observed.
    pub errors: u64,
    /// Errors since the last successful emit.
    pub consecutive_errors: u64,
    /// Whether the client connected successfully.
    pub is_connected: bool,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_used: now,
            events_sent: 0,
            errors: 0,
            consecutive_errors: 0,
            is_connected: false,
        }
    }
}

/// A pooled client. rust_socketio binds the namespace at build time, so
/// each client is tagged with the namespace it serves and is only reused
/// for batches targeting that namespace.
struct PooledClient {
    id: String,
    namespace: String,
    client: Client,
}

/// Interior pool state behind one mutex. Hold times must stay short:
/// nothing under this lock performs I/O.
struct PoolState {
    available: VecDeque<PooledClient>,
    active_ids: Vec<String>,
    stats: HashMap<String, ConnectionStats>,
    batch_queue: VecDeque<BatchEvent>,
    breaker: CircuitBreaker,
    server_url: Option<String>,
    server_port: Option<u16>,
    overflow_dropped: u64,
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

/// Connection pool for Socket.IO clients with circuit breaker and
/// micro-batching.
pub struct SocketIoConnectionPool {
    max_connections: usize,
    batch_window: Duration,
    state: Mutex<PoolState>,
    running: AtomicBool,
    conn_counter: AtomicU64,
    /// Background runtime driving the batcher and client I/O.
    runtime: Runtime,
}

impl SocketIoConnectionPool {
    /// Create a pool. Call [`start`](Self::start) before emitting.
    pub fn new(max_connections: usize, batch_window: Duration) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mpm-socketio-pool")
            .enable_all()
            .build()
            .expect("failed to create Socket.IO pool runtime");

        Self {
            max_connections,
            batch_window,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                active_ids: Vec::new(),
                stats: HashMap::new(),
                batch_queue: VecDeque::new(),
                breaker: CircuitBreaker::default(),
                server_url: None,
                server_port: None,
                overflow_dropped: 0,
            }),
            running: AtomicBool::new(false),
            conn_counter: AtomicU64::new(0),
            runtime,
        }
    }

    /// Start the pool: detect the server and launch the batch processor.
    pub fn start(&'static self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (url, port) = detect_server();
        {
            let mut state = self.state.lock();
            state.server_url = Some(url);
            state.server_port = Some(port);
        }

        self.runtime.spawn(self.batch_processor());

        log::info!(
            "Socket.IO connection pool started (max_connections={}, batch_window={}ms)",
            self.max_connections,
            self.batch_window.as_millis()
        );
    }

    /// Stop the pool and disconnect every client.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let clients: Vec<PooledClient> = {
            let mut state = self.state.lock();
            state.active_ids.clear();
            state.stats.clear();
            state.batch_queue.clear();
            state.available.drain(..).collect()
        };

        for pooled in clients {
            self.runtime.spawn(async move {
                if let Err(err) = pooled.client.disconnect().await {
                    log::debug!("Error closing connection {}: {err}", pooled.id);
                }
            });
        }

        log::info!("Socket.IO connection pool stopped");
    }

    /// Whether the pool has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enqueue an event for batched emission. Never blocks on the network;
    /// the only cost is one short mutex acquisition.
    pub fn emit_event(&self, namespace: &str, event: &str, data: Map<String, Value>) {
        if !self.is_running() {
            return;
        }

        let batch_event = BatchEvent {
            namespace: namespace.to_string(),
            event: event.to_string(),
            data,
            timestamp: Utc::now(),
        };

        let mut state = self.state.lock();
        if state.batch_queue.len() >= BATCH_QUEUE_CAP {
            state.batch_queue.pop_front();
            state.overflow_dropped += 1;
            if state.overflow_dropped == 1 || state.overflow_dropped % 1000 == 0 {
                log::warn!(
                    "Batch queue overflow, dropped {} oldest events",
                    state.overflow_dropped
                );
            }
        }
        state.batch_queue.push_back(batch_event);
    }

    /// Snapshot of pool statistics.
    pub fn get_stats(&self) -> Map<String, Value> {
        let state = self.state.lock();
        let mut stats = Map::new();
        stats.insert("max_connections".into(), json!(self.max_connections));
        stats.insert("available_connections".into(), json!(state.available.len()));
        stats.insert("active_connections".into(), json!(state.active_ids.len()));
        stats.insert(
            "total_events_sent".into(),
            json!(state.stats.values().map(|s| s.events_sent).sum::<u64>()),
        );
        stats.insert(
            "total_errors".into(),
            json!(state.stats.values().map(|s| s.errors).sum::<u64>()),
        );
        stats.insert("circuit_state".into(), json!(state.breaker.state().as_str()));
        stats.insert("circuit_failures".into(), json!(state.breaker.failure_count()));
        stats.insert("batch_queue_size".into(), json!(state.batch_queue.len()));
        stats.insert("server_url".into(), json!(state.server_url));
        stats.insert("server_port".into(), json!(state.server_port));
        stats.insert("running".into(), json!(self.is_running()));
        stats
    }

    /// The batch processor: wakes every window, drains up to
    /// [`MAX_BATCH_SIZE`] events, and flushes them grouped by namespace.
    async fn batch_processor(&'static self) {
        log::debug!("Batch processor started");
        let mut interval = tokio::time::interval(self.batch_window);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.is_running() {
            interval.tick().await;

            let (batch, allowed) = {
                let mut state = self.state.lock();
                let take = state.batch_queue.len().min(MAX_BATCH_SIZE);
                let batch: Vec<BatchEvent> = state.batch_queue.drain(..take).collect();
                let allowed = if batch.is_empty() {
                    true
                } else {
                    state.breaker.can_execute()
                };
                (batch, allowed)
            };

            if batch.is_empty() {
                continue;
            }
            if !allowed {
                log::debug!("Circuit breaker OPEN - dropping batch of {} events", batch.len());
                continue;
            }

            // Group by namespace, preserving per-namespace enqueue order.
            let mut groups: Vec<(String, Vec<BatchEvent>)> = Vec::new();
            for event in batch {
                match groups.iter_mut().find(|(ns, _)| *ns == event.namespace) {
                    Some((_, events)) => events.push(event),
                    None => groups.push((event.namespace.clone(), vec![event])),
                }
            }

            for (namespace, events) in groups {
                let count = events.len();
                let success = self.emit_batch_to_namespace(&namespace, events).await;
                let mut state = self.state.lock();
                if success {
                    state.breaker.record_success();
                    log::debug!("Emitted batch of {count} events to {namespace}");
                } else {
                    state.breaker.record_failure();
                }
            }
        }

        log::debug!("Batch processor stopped");
    }

    /// Flush one namespace group over a pooled client.
    async fn emit_batch_to_namespace(&self, namespace: &str, events: Vec<BatchEvent>) -> bool {
        let Some(pooled) = self.checkout_client(namespace).await else {
            return false;
        };

        let batch_id = format!("batch_{}", Utc::now().timestamp_millis());
        let mut success = true;

        for event in &events {
            let mut payload = event.data.clone();
            payload.insert("timestamp".into(), json!(event.timestamp.to_rfc3339()));
            payload.insert("batch_id".into(), json!(batch_id.clone()));

            if let Err(err) = pooled.client.emit(event.event.clone(), Value::Object(payload)).await {
                log::error!("Failed to emit batch to {namespace}: {err}");
                success = false;
                break;
            }
        }

        {
            let mut state = self.state.lock();
            if let Some(stats) = state.stats.get_mut(&pooled.id) {
                stats.last_used = Utc::now();
                if success {
                    stats.events_sent += events.len() as u64;
                    stats.consecutive_errors = 0;
                } else {
                    stats.errors += 1;
                    stats.consecutive_errors += 1;
                }
            }
        }

        self.return_client(pooled);
        success
    }

    /// Check out a client for the namespace, creating one lazily up to
    /// the connection cap. Connection establishment happens outside the
    /// pool lock.
    async fn checkout_client(&self, namespace: &str) -> Option<PooledClient> {
        let (server_url, conn_id) = {
            let mut state = self.state.lock();
            let server_url = state.server_url.clone()?;

            if let Some(idx) = state.available.iter().position(|c| c.namespace == namespace) {
                let pooled = state.available.remove(idx).expect("index in bounds");
                state.active_ids.push(pooled.id.clone());
                return Some(pooled);
            }

            let in_use = state.available.len() + state.active_ids.len();
            if in_use >= self.max_connections {
                log::warn!("Socket.IO connection pool exhausted");
                return None;
            }

            let conn_id = format!(
                "pool_{}_{}",
                self.conn_counter.fetch_add(1, Ordering::Relaxed),
                Utc::now().timestamp()
            );
            state.active_ids.push(conn_id.clone());
            state.stats.insert(conn_id.clone(), ConnectionStats::default());
            (server_url, conn_id)
        };

        match connect_client(&server_url, namespace).await {
            Ok(client) => {
                let mut state = self.state.lock();
                if let Some(stats) = state.stats.get_mut(&conn_id) {
                    stats.is_connected = true;
                }
                Some(PooledClient {
                    id: conn_id,
                    namespace: namespace.to_string(),
                    client,
                })
            }
            Err(err) => {
                log::debug!("Client connection failed: {err}");
                let mut state = self.state.lock();
                state.active_ids.retain(|id| id != &conn_id);
                if let Some(stats) = state.stats.get_mut(&conn_id) {
                    stats.errors += 1;
                    stats.consecutive_errors += 1;
                }
                None
            }
        }
    }

    /// Return a client to the pool, or disconnect it in the background
    /// when the available deque is full.
    fn return_client(&self, pooled: PooledClient) {
        let excess = {
            let mut state = self.state.lock();
            state.active_ids.retain(|id| id != &pooled.id);
            if state.available.len() < self.max_connections {
                state.available.push_back(pooled);
                None
            } else {
                Some(pooled)
            }
        };

        if let Some(pooled) = excess {
            self.runtime.spawn(async move {
                if let Err(err) = pooled.client.disconnect().await {
                    log::debug!("Error closing excess connection {}: {err}", pooled.id);
                }
            });
        }
    }
}

/// Connect one auto-reconnecting client bound to a namespace.
async fn connect_client(server_url: &str, namespace: &str) -> Result<Client, String> {
    let builder = ClientBuilder::new(server_url)
        .namespace(namespace)
        .auth(json!({"token": AUTH_TOKEN}))
        .reconnect(true)
        .reconnect_on_disconnect(true)
        .max_reconnect_attempts(3)
        .reconnect_delay(500, 2000)
        .on("error", |payload, _| {
            async move { log::debug!("Socket.IO client error: {payload:?}") }.boxed()
        });

    match tokio::time::timeout(CONNECT_TIMEOUT, builder.connect()).await {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("Socket.IO connection timeout".to_string()),
    }
}

/// Resolve the Socket.IO server endpoint.
///
/// Order: `CLAUDE_MPM_SOCKETIO_PORT`, then a quick TCP probe over the
/// well-known ports, then the default port.
fn detect_server() -> (String, u16) {
    if let Ok(env_port) = std::env::var("CLAUDE_MPM_SOCKETIO_PORT") {
        if let Ok(port) = env_port.parse::<u16>() {
            log::debug!("Using Socket.IO server from environment: port {port}");
            return (format!("http://localhost:{port}"), port);
        }
    }

    for &port in COMMON_PORTS {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        if std::net::TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok() {
            log::debug!("Detected Socket.IO server on port {port}");
            return (format!("http://localhost:{port}"), port);
        }
    }

    log::debug!("Using default Socket.IO server: port {DEFAULT_PORT}");
    (format!("http://localhost:{DEFAULT_PORT}"), DEFAULT_PORT)
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

static CONNECTION_POOL: OnceLock<SocketIoConnectionPool> = OnceLock::new();

/// Get or lazily start the process-wide connection pool.
pub fn get_connection_pool() -> &'static SocketIoConnectionPool {
    let pool = CONNECTION_POOL.get_or_init(|| SocketIoConnectionPool::new(5, Duration::from_millis(50)));
    pool.start();
    pool
}

/// Stop the process-wide connection pool, if it was started.
pub fn stop_connection_pool() {
    if let Some(pool) = CONNECTION_POOL.get() {
        pool.stop();
    }
}

/// Emit a lifecycle event through the process-wide pool.
pub fn emit_hook_event(namespace: &str, event: &str, data: Map<String, Value>) {
    get_connection_pool().emit_event(namespace, event, data);
}
