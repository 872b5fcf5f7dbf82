//! In-memory plugin doubles.
//!
//! [`FakeSpawner`] stands in for [`ProcessSpawner`](crate::worker::ProcessSpawner)
//! so the supervisor can be exercised without starting subprocesses. Each
//! spawn produces a [`FakeProcess`] (liveness and kill counting) and a
//! [`FakeWorker`] (records every RPC and follows a [`FakeBehavior`]).

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::PluginSettings;
use crate::supervisor::ConnectionRefresher;
use crate::worker::protocol::{
    PluginMessage, PluginMessageType, SetAllConnectionConfigsRequest,
    SetConnectionConfigRequest, SetConnectionConfigsResponse, SupportedOperations,
    UpdateConnectionConfigsRequest,
};
use crate::worker::{
    Handshake, MessageStream, PluginClient, SpawnedWorker, WorkerError, WorkerProcess,
    WorkerResult, WorkerSpawner,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Behavior
// ============================================================================

/// A scripted message on a fake message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeMessage {
    SchemaUpdated(String),
    Unknown(String),
    /// A line that fails to decode.
    Malformed,
}

/// How a fake plugin responds.
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    pub ops: SupportedOperations,
    /// `get_supported_operations` fails.
    pub ops_query_fails: bool,
    /// Connections reported in `failed_connections`.
    pub refuse: HashSet<String>,
    /// Config handoff fails outright.
    pub fail_config: bool,
    /// `update_connection_configs` fails outright.
    pub fail_update: bool,
    /// Spawn fails with this message.
    pub spawn_error: Option<String>,
    /// Spawn never completes.
    pub hang: bool,
    /// Delay before spawn completes.
    pub spawn_delay: Duration,
    /// `establish_message_stream` reports not implemented.
    pub stream_not_implemented: bool,
    /// Messages played on each stream, filtered by connection.
    pub messages: Vec<FakeMessage>,
    /// Keep streams open after the script instead of closing them.
    pub hold_streams_open: bool,
}

impl FakeBehavior {
    /// Multiplexing worker with live update and message streams.
    pub fn multiplexing() -> Self {
        Self {
            ops: SupportedOperations {
                multiple_connections: true,
                live_config_update: true,
                cache_stream: false,
                message_stream: true,
            },
            ..Default::default()
        }
    }

    /// Worker that predates every optional operation.
    pub fn legacy() -> Self {
        Self::default()
    }

    /// Multiplexing worker that must be restarted on change.
    pub fn multiplexing_without_live_update() -> Self {
        let mut behavior = Self::multiplexing();
        behavior.ops.live_config_update = false;
        behavior
    }
}

// ============================================================================
// Process
// ============================================================================

/// Shared-state process handle.
#[derive(Debug, Clone)]
pub struct FakeProcess {
    pid: u32,
    alive: Arc<AtomicBool>,
    kills: Arc<AtomicUsize>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            alive: Arc::new(AtomicBool::new(true)),
            kills: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn pid_value(&self) -> u32 {
        self.pid
    }

    /// Simulate the process dying on its own.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl WorkerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        self.is_running()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Every RPC a fake worker received.
#[derive(Debug, Clone, Default)]
pub struct FakeCalls {
    pub supported_operations: usize,
    pub set_all: Vec<SetAllConnectionConfigsRequest>,
    pub set_single: Vec<SetConnectionConfigRequest>,
    pub updates: Vec<UpdateConnectionConfigsRequest>,
    pub streams: Vec<String>,
}

/// In-memory plugin worker.
#[derive(Debug)]
pub struct FakeWorker {
    kind: String,
    pid: u32,
    behavior: FakeBehavior,
    calls: Mutex<FakeCalls>,
}

impl FakeWorker {
    pub fn new(kind: &str, pid: u32, behavior: FakeBehavior) -> Self {
        Self {
            kind: kind.to_string(),
            pid,
            behavior,
            calls: Mutex::new(FakeCalls::default()),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn calls(&self) -> FakeCalls {
        lock(&self.calls).clone()
    }

    fn refused<'a>(&self, names: impl Iterator<Item = &'a String>) -> HashMap<String, String> {
        names
            .filter(|name| self.behavior.refuse.contains(*name))
            .map(|name| (name.clone(), format!("connection {} refused", name)))
            .collect()
    }
}

#[async_trait]
impl PluginClient for FakeWorker {
    async fn get_supported_operations(&self) -> WorkerResult<SupportedOperations> {
        lock(&self.calls).supported_operations += 1;
        if self.behavior.ops_query_fails {
            return Err(WorkerError::MethodNotFound(
                "plugin.get_supported_operations".to_string(),
            ));
        }
        Ok(self.behavior.ops)
    }

    async fn set_all_connection_configs(
        &self,
        request: SetAllConnectionConfigsRequest,
    ) -> WorkerResult<SetConnectionConfigsResponse> {
        let failed_connections = self.refused(request.configs.iter().map(|c| &c.name));
        lock(&self.calls).set_all.push(request);
        if self.behavior.fail_config {
            return Err(WorkerError::remote("CONFIG_ERROR", "bad config"));
        }
        Ok(SetConnectionConfigsResponse { failed_connections })
    }

    async fn set_connection_config(&self, request: SetConnectionConfigRequest) -> WorkerResult<()> {
        let refused = self.behavior.refuse.contains(&request.connection);
        let name = request.connection.clone();
        lock(&self.calls).set_single.push(request);
        if self.behavior.fail_config || refused {
            return Err(WorkerError::ConnectionConfigFailed(name));
        }
        Ok(())
    }

    async fn update_connection_configs(
        &self,
        request: UpdateConnectionConfigsRequest,
    ) -> WorkerResult<SetConnectionConfigsResponse> {
        let failed_connections = self.refused(
            request
                .added
                .iter()
                .chain(request.changed.iter())
                .map(|c| &c.name),
        );
        lock(&self.calls).updates.push(request);
        if self.behavior.fail_update {
            return Err(WorkerError::remote("UPDATE_ERROR", "update rejected"));
        }
        Ok(SetConnectionConfigsResponse { failed_connections })
    }

    async fn establish_message_stream(
        &self,
        connection: &str,
    ) -> WorkerResult<Box<dyn MessageStream>> {
        lock(&self.calls).streams.push(connection.to_string());
        if self.behavior.stream_not_implemented {
            return Err(WorkerError::NotImplemented(
                "plugin.establish_message_stream".to_string(),
            ));
        }
        let script = self
            .behavior
            .messages
            .iter()
            .filter(|m| match m {
                FakeMessage::SchemaUpdated(c) | FakeMessage::Unknown(c) => c == connection,
                FakeMessage::Malformed => true,
            })
            .cloned()
            .collect();
        Ok(Box::new(FakeStream::new(script, self.behavior.hold_streams_open)))
    }
}

/// Message stream that plays a fixed script.
#[derive(Debug)]
pub struct FakeStream {
    script: VecDeque<FakeMessage>,
    hold_open: bool,
}

impl FakeStream {
    pub fn new(script: Vec<FakeMessage>, hold_open: bool) -> Self {
        Self {
            script: script.into(),
            hold_open,
        }
    }
}

#[async_trait]
impl MessageStream for FakeStream {
    async fn recv(&mut self) -> WorkerResult<PluginMessage> {
        match self.script.pop_front() {
            Some(FakeMessage::SchemaUpdated(connection)) => Ok(PluginMessage {
                message_type: PluginMessageType::SchemaUpdated,
                connection,
            }),
            Some(FakeMessage::Unknown(connection)) => Ok(PluginMessage {
                message_type: PluginMessageType::Unknown,
                connection,
            }),
            Some(FakeMessage::Malformed) => {
                serde_json::from_str::<PluginMessage>("{not json").map_err(WorkerError::from)
            }
            None if self.hold_open => std::future::pending().await,
            None => Err(WorkerError::StreamClosed),
        }
    }
}

// ============================================================================
// Spawner
// ============================================================================

/// A worker started by [`FakeSpawner`].
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub kind: String,
    pub process: FakeProcess,
    pub worker: Arc<FakeWorker>,
}

/// Spawner that produces in-memory workers.
#[derive(Debug)]
pub struct FakeSpawner {
    default_behavior: FakeBehavior,
    behaviors: Mutex<HashMap<String, FakeBehavior>>,
    next_pid: AtomicU32,
    attempts: AtomicUsize,
    spawned: Mutex<Vec<SpawnRecord>>,
    attempted: Notify,
}

impl FakeSpawner {
    /// Every kind follows `default_behavior` unless overridden.
    pub fn new(default_behavior: FakeBehavior) -> Self {
        Self {
            default_behavior,
            behaviors: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
            attempts: AtomicUsize::new(0),
            spawned: Mutex::new(Vec::new()),
            attempted: Notify::new(),
        }
    }

    pub fn with_behavior(self, kind: &str, behavior: FakeBehavior) -> Self {
        self.set_behavior(kind, behavior);
        self
    }

    /// Change the behavior of future spawns of `kind`.
    pub fn set_behavior(&self, kind: &str, behavior: FakeBehavior) {
        lock(&self.behaviors).insert(kind.to_string(), behavior);
    }

    fn behavior_for(&self, kind: &str) -> FakeBehavior {
        lock(&self.behaviors)
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone())
    }

    /// Spawn calls made, including failed and hanging ones.
    pub fn spawn_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful spawns of `kind`.
    pub fn spawn_count(&self, kind: &str) -> usize {
        lock(&self.spawned).iter().filter(|r| r.kind == kind).count()
    }

    pub fn spawned(&self, kind: &str) -> Vec<SpawnRecord> {
        lock(&self.spawned)
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn all_spawned(&self) -> Vec<SpawnRecord> {
        lock(&self.spawned).clone()
    }

    /// Processes of `kind` that are still running.
    pub fn live_count(&self, kind: &str) -> usize {
        self.spawned(kind)
            .iter()
            .filter(|r| r.process.is_running())
            .count()
    }

    /// Wait until a spawn call has been made.
    pub async fn wait_for_attempt(&self) {
        self.attempted.notified().await;
    }
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new(FakeBehavior::multiplexing())
    }
}

#[async_trait]
impl WorkerSpawner for FakeSpawner {
    async fn spawn(&self, kind: &str, _plugin: &PluginSettings) -> WorkerResult<SpawnedWorker> {
        let behavior = self.behavior_for(kind);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempted.notify_one();

        if !behavior.spawn_delay.is_zero() {
            tokio::time::sleep(behavior.spawn_delay).await;
        }
        if behavior.hang {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &behavior.spawn_error {
            return Err(WorkerError::SpawnFailed(io::Error::new(
                io::ErrorKind::NotFound,
                message.clone(),
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = FakeProcess::new(pid);
        let worker = Arc::new(FakeWorker::new(kind, pid, behavior));
        lock(&self.spawned).push(SpawnRecord {
            kind: kind.to_string(),
            process: process.clone(),
            worker: worker.clone(),
        });

        Ok(SpawnedWorker {
            process: Box::new(process),
            client: worker,
            handshake: Handshake::new(format!("127.0.0.1:{}", 20000 + pid)),
            checksum: String::new(),
        })
    }
}

// ============================================================================
// Refresher
// ============================================================================

/// Records schema refresh requests.
#[derive(Debug, Default)]
pub struct RecordingRefresher {
    refreshed: Mutex<Vec<String>>,
    notify: Notify,
}

impl RecordingRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refreshed(&self) -> Vec<String> {
        lock(&self.refreshed).clone()
    }

    /// Wait until at least `count` refreshes were recorded, or `timeout`.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<String> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if lock(&self.refreshed).len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.refreshed()
    }
}

#[async_trait]
impl ConnectionRefresher for RecordingRefresher {
    async fn refresh_connection_schema(&self, connection: &str) {
        lock(&self.refreshed).push(connection.to_string());
        self.notify.notify_waiters();
    }
}
