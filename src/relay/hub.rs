use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use super::messages::{ObserverEvent, WorkerCommand, WorkerEvent, format_progress, to_frame};
use super::models::{JobStatus, JobUpdate, NewSnapshot, SessionStatus};
use super::store::JobStore;
use crate::errors::{RelayError, StoreError};

/// Default number of log lines kept per session for replay.
pub const DEFAULT_LOG_BUFFER: usize = 2000;

/// Outbound half of a socket. Each socket has a writer task draining the
/// receiving end, so sends never block.
pub type Outbound = mpsc::UnboundedSender<String>;

/// The tracked worker socket of a session.
#[derive(Debug, Clone)]
pub struct WorkerConnection {
    pub id: u64,
    tx: Outbound,
}

impl WorkerConnection {
    pub fn new(id: u64, tx: Outbound) -> Self {
        Self { id, tx }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Observable part of a session, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub worker_connected: bool,
    pub output_location: Option<String>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Connecting,
            worker_connected: false,
            output_location: None,
            error: None,
            cancelled: false,
        }
    }
}

/// Result of a successful `wait_for_completion`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub output_location: Option<String>,
    pub cancelled: bool,
    pub note: Option<String>,
}

struct Session {
    worker: Option<WorkerConnection>,
    logs: VecDeque<String>,
    state: watch::Sender<SessionState>,
}

impl Session {
    fn new() -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            worker: None,
            logs: VecDeque::new(),
            state,
        }
    }
}

/// Routes messages between one worker and many observers per job.
///
/// Lock order is sessions before observers. No map guard is held across an
/// `.await`.
pub struct RelayHub {
    sessions: DashMap<i64, Session>,
    observers: DashMap<i64, HashMap<u64, Outbound>>,
    store: Arc<dyn JobStore>,
    log_buffer: usize,
    next_id: AtomicU64,
}

impl RelayHub {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_log_buffer(store, DEFAULT_LOG_BUFFER)
    }

    pub fn with_log_buffer(store: Arc<dyn JobStore>, log_buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            observers: DashMap::new(),
            store,
            log_buffer: log_buffer.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a worker or observer connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Create a fresh session in `connecting`, replacing any existing one.
    pub fn register_session(&self, job_id: i64) {
        if self.sessions.insert(job_id, Session::new()).is_some() {
            tracing::debug!(job_id, "Replaced existing relay session");
        }
        tracing::debug!(job_id, "Registered relay session");
    }

    pub fn session_state(&self, job_id: i64) -> Option<SessionState> {
        self.sessions
            .get(&job_id)
            .map(|s| s.state.borrow().clone())
    }

    pub fn has_session(&self, job_id: i64) -> bool {
        self.sessions.contains_key(&job_id)
    }

    /// Snapshot of the buffered log frames, oldest first.
    pub fn buffered_logs(&self, job_id: i64) -> Vec<String> {
        self.sessions
            .get(&job_id)
            .map(|s| s.logs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close the worker connection and forget the session. Idempotent.
    pub fn cleanup(&self, job_id: i64) {
        if self.sessions.remove(&job_id).is_some() {
            tracing::debug!(job_id, "Cleaned up relay session");
        }
    }

    // ── Worker side ──────────────────────────────────────────────────

    pub fn attach_worker(&self, job_id: i64, connection: WorkerConnection) {
        let mut session = self.sessions.entry(job_id).or_insert_with(|| {
            tracing::warn!(job_id, "Worker connected without a registered session");
            Session::new()
        });
        if let Some(previous) = &session.worker {
            tracing::warn!(
                job_id,
                previous = previous.id,
                current = connection.id,
                "Second worker connection replaces the tracked one"
            );
        }
        let connection_id = connection.id;
        session.worker = Some(connection);
        session.state.send_modify(|s| s.worker_connected = true);
        tracing::info!(job_id, connection_id, "Worker connected");
    }

    /// Forget the worker if `connection_id` is still the tracked one. A
    /// generating session fails; any other status is left alone.
    pub fn worker_disconnected(&self, job_id: i64, connection_id: u64) {
        let Some(mut session) = self.sessions.get_mut(&job_id) else {
            return;
        };
        if session.worker.as_ref().map(|w| w.id) != Some(connection_id) {
            tracing::debug!(job_id, connection_id, "Stale worker disconnect ignored");
            return;
        }
        session.worker = None;
        session.state.send_modify(|s| {
            s.worker_connected = false;
            if s.status == SessionStatus::Generating {
                s.status = SessionStatus::Failed;
                s.error = Some("Worker disconnected unexpectedly".to_string());
            }
        });
        tracing::info!(job_id, connection_id, "Worker disconnected");
    }

    /// Deliver the `generate` command. True iff the session has an open worker
    /// connection and the frame was queued.
    pub fn send_command(&self, job_id: i64, instruction: &str) -> bool {
        let Some(session) = self.sessions.get(&job_id) else {
            return false;
        };
        let Some(worker) = session.worker.as_ref().filter(|w| w.is_open()) else {
            return false;
        };
        let command = WorkerCommand::Generate {
            job_id,
            instruction: instruction.to_string(),
        };
        let Some(frame) = to_frame(&command) else {
            return false;
        };
        if worker.tx.send(frame).is_err() {
            return false;
        }
        session.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = SessionStatus::Generating;
            true
        });
        true
    }

    /// Apply one worker event: update session state, persist through the job
    /// store where needed, and fan out to observers.
    pub async fn handle_worker_event(&self, job_id: i64, event: WorkerEvent) {
        match event {
            WorkerEvent::Log { message, level } => {
                self.append_log(job_id, ObserverEvent::log(job_id, message, level));
            }
            WorkerEvent::Progress {
                message,
                stage,
                percent,
            } => {
                let line = format_progress(&message, stage.as_deref(), percent);
                self.append_log(job_id, ObserverEvent::log(job_id, line, None));
            }
            WorkerEvent::Ready { output_location } => {
                // A late `ready` after the command went out only carries the hint.
                self.update_state(job_id, |s| {
                    if s.status == SessionStatus::Connecting {
                        s.status = SessionStatus::Ready;
                    }
                    if output_location.is_some() {
                        s.output_location = output_location;
                    }
                });
            }
            WorkerEvent::IterationProgress {
                iteration,
                file_state,
                instruction,
                metadata,
                snapshot_kind,
            } => {
                let update = JobUpdate {
                    current_iteration: Some(iteration),
                    ..Default::default()
                };
                if let Err(e) = self.store.update_job(job_id, update).await {
                    tracing::warn!(job_id, iteration, error = %e, "Failed to record iteration");
                }
                if let Some(file_state) = file_state {
                    let snapshot = NewSnapshot {
                        job_id,
                        iteration,
                        kind: snapshot_kind.unwrap_or_default(),
                        file_state,
                        instruction: instruction.clone(),
                        metadata: metadata.clone().unwrap_or(serde_json::Value::Null),
                    };
                    if let Err(e) = self.store.create_snapshot(snapshot).await {
                        tracing::warn!(job_id, iteration, error = %e, "Failed to persist snapshot");
                    }
                }
                self.broadcast_to_observers(
                    job_id,
                    &ObserverEvent::IterationProgress {
                        job_id,
                        iteration,
                        instruction,
                        metadata,
                        timestamp: super::messages::timestamp(),
                    },
                );
            }
            WorkerEvent::Paused { reason } => {
                if self.is_settled(job_id) {
                    return;
                }
                self.record_status(job_id, JobUpdate::status(JobStatus::Paused))
                    .await;
                self.broadcast_to_observers(
                    job_id,
                    &ObserverEvent::status(job_id, JobStatus::Paused, reason),
                );
            }
            WorkerEvent::Resumed => {
                if self.is_settled(job_id) {
                    return;
                }
                self.record_status(job_id, JobUpdate::status(JobStatus::Generating))
                    .await;
                self.broadcast_to_observers(
                    job_id,
                    &ObserverEvent::status(job_id, JobStatus::Generating, None),
                );
            }
            WorkerEvent::Cancelled { reason } => {
                if self.is_settled(job_id) {
                    return;
                }
                let note = match reason {
                    Some(reason) => format!("Cancelled: {}", reason),
                    None => "Cancelled by worker".to_string(),
                };
                self.record_status(
                    job_id,
                    JobUpdate {
                        status: Some(JobStatus::Completed),
                        error: Some(note.clone()),
                        ..Default::default()
                    },
                )
                .await;
                self.update_state(job_id, |s| {
                    s.status = SessionStatus::Completed;
                    s.cancelled = true;
                    s.error = Some(note.clone());
                });
                self.broadcast_to_observers(
                    job_id,
                    &ObserverEvent::status(job_id, JobStatus::Completed, Some(note)),
                );
            }
            WorkerEvent::Completed {
                output_location,
                summary,
            } => {
                if let Some(summary) = &summary {
                    tracing::info!(job_id, summary = %summary, "Worker reported completion");
                }
                self.update_state(job_id, |s| {
                    s.status = SessionStatus::Completed;
                    if output_location.is_some() {
                        s.output_location = output_location;
                    }
                });
            }
            WorkerEvent::Error { message } => {
                tracing::warn!(job_id, error = %message, "Worker reported error");
                self.update_state(job_id, |s| {
                    s.status = SessionStatus::Failed;
                    s.error = Some(message);
                });
            }
            WorkerEvent::Unknown => {
                tracing::debug!(job_id, "Ignoring unknown worker event kind");
            }
        }
    }

    /// True when the session already reached `completed` or `failed`. Events
    /// of one worker connection are applied in order, so a check followed by
    /// a store write cannot interleave with another terminal event.
    fn is_settled(&self, job_id: i64) -> bool {
        let settled = self
            .sessions
            .get(&job_id)
            .is_some_and(|s| s.state.borrow().status.is_terminal());
        if settled {
            tracing::debug!(job_id, "Status event after terminal state dropped");
        }
        settled
    }

    /// Apply a state change unless the session is already terminal.
    fn update_state(&self, job_id: i64, f: impl FnOnce(&mut SessionState)) {
        let Some(session) = self.sessions.get(&job_id) else {
            tracing::debug!(job_id, "Worker event for unknown session dropped");
            return;
        };
        session.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                tracing::debug!(job_id, status = %s.status, "Session already terminal");
                return false;
            }
            f(s);
            true
        });
    }

    async fn record_status(&self, job_id: i64, update: JobUpdate) {
        if let Err(e) = self.store.update_job(job_id, update).await {
            match e.downcast_ref::<StoreError>() {
                Some(StoreError::InvalidTransition { .. }) => {
                    tracing::debug!(job_id, error = %e, "Status change ignored")
                }
                _ => tracing::warn!(job_id, error = %e, "Failed to update job status"),
            }
        }
    }

    /// Append to the bounded buffer and fan out under the session guard, so
    /// an observer joining concurrently sees each line exactly once.
    fn append_log(&self, job_id: i64, event: ObserverEvent) {
        let Some(frame) = to_frame(&event) else {
            return;
        };
        match self.sessions.get_mut(&job_id) {
            Some(mut session) => {
                if session.logs.len() >= self.log_buffer {
                    session.logs.pop_front();
                }
                session.logs.push_back(frame.clone());
                self.fan_out(job_id, &frame);
            }
            None => self.fan_out(job_id, &frame),
        }
    }

    // ── Observer side ────────────────────────────────────────────────

    /// Register an observer and replay buffered logs to it. Returns the
    /// observer id used for `detach_observer`.
    pub fn attach_observer(&self, job_id: i64, tx: Outbound) -> u64 {
        let observer_id = self.next_connection_id();
        match self.sessions.get(&job_id) {
            Some(session) => {
                for line in session.logs.iter() {
                    let _ = tx.send(line.clone());
                }
                self.observers
                    .entry(job_id)
                    .or_default()
                    .insert(observer_id, tx);
            }
            None => {
                self.observers
                    .entry(job_id)
                    .or_default()
                    .insert(observer_id, tx);
            }
        }
        tracing::debug!(job_id, observer_id, "Observer attached");
        observer_id
    }

    pub fn detach_observer(&self, job_id: i64, observer_id: u64) {
        let emptied = match self.observers.get_mut(&job_id) {
            Some(mut set) => {
                set.remove(&observer_id);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            self.observers.remove_if(&job_id, |_, set| set.is_empty());
        }
        tracing::debug!(job_id, observer_id, "Observer detached");
    }

    pub fn observer_count(&self, job_id: i64) -> usize {
        self.observers.get(&job_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn broadcast_to_observers(&self, job_id: i64, event: &ObserverEvent) {
        if let Some(frame) = to_frame(event) {
            self.fan_out(job_id, &frame);
        }
    }

    fn fan_out(&self, job_id: i64, frame: &str) {
        if let Some(set) = self.observers.get(&job_id) {
            for tx in set.values() {
                // Closed observers are pruned by their own disconnect.
                let _ = tx.send(frame.to_string());
            }
        }
    }

    // ── Waits ────────────────────────────────────────────────────────

    fn subscribe(&self, job_id: i64) -> Result<watch::Receiver<SessionState>, RelayError> {
        self.sessions
            .get(&job_id)
            .map(|s| s.state.subscribe())
            .ok_or(RelayError::SessionNotFound { job_id })
    }

    /// Resolve once a worker connection is open for the session.
    pub async fn wait_for_ready(&self, job_id: i64, timeout: Duration) -> Result<(), RelayError> {
        let mut rx = self.subscribe(job_id)?;
        let wait = async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    if state.worker_connected || state.status == SessionStatus::Completed {
                        return Ok(());
                    }
                    if state.status == SessionStatus::Failed {
                        return Err(RelayError::WorkerFailed {
                            job_id,
                            message: state
                                .error
                                .clone()
                                .unwrap_or_else(|| "Worker failed before ready".to_string()),
                        });
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(RelayError::SessionClosed { job_id });
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RelayError::ReadyTimeout {
                job_id,
                timeout_secs: timeout.as_secs(),
            })?
    }

    /// Resolve once the session reaches `completed` (Ok) or `failed` (Err).
    pub async fn wait_for_completion(
        &self,
        job_id: i64,
        timeout: Duration,
    ) -> Result<Completion, RelayError> {
        let mut rx = self.subscribe(job_id)?;
        let wait = async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    match state.status {
                        SessionStatus::Completed => {
                            return Ok(Completion {
                                output_location: state.output_location.clone(),
                                cancelled: state.cancelled,
                                note: state.error.clone(),
                            });
                        }
                        SessionStatus::Failed => {
                            return Err(RelayError::WorkerFailed {
                                job_id,
                                message: state
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| "Worker failed".to_string()),
                            });
                        }
                        _ => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(RelayError::SessionClosed { job_id });
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RelayError::CompletionTimeout {
                job_id,
                timeout_secs: timeout.as_secs(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::db::{DbHandle, JobDb};
    use crate::relay::models::NewJob;
    use serde_json::{Value, json};
    use std::time::Instant;

    async fn setup() -> (Arc<RelayHub>, DbHandle, i64) {
        let db = DbHandle::new(JobDb::new_in_memory().unwrap());
        let job = db
            .create_job(NewJob {
                owner_id: "owner".into(),
                instruction: "build a todo app".into(),
                session_id: None,
            })
            .await
            .unwrap();
        db.update_job(job.id, JobUpdate::status(JobStatus::Generating))
            .await
            .unwrap();
        let hub = Arc::new(RelayHub::new(Arc::new(db.clone())));
        (hub, db, job.id)
    }

    fn connect_worker(hub: &RelayHub, job_id: i64) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.next_connection_id();
        hub.attach_worker(job_id, WorkerConnection::new(id, tx));
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn log(message: &str) -> WorkerEvent {
        WorkerEvent::Log {
            message: message.into(),
            level: None,
        }
    }

    #[tokio::test]
    async fn test_send_command_before_worker_connects_is_false() {
        let (hub, _db, job_id) = setup().await;
        assert!(!hub.send_command(job_id, "go"));
        hub.register_session(job_id);
        assert!(!hub.send_command(job_id, "go"));
        assert_eq!(
            hub.session_state(job_id).unwrap().status,
            SessionStatus::Connecting
        );
    }

    #[tokio::test]
    async fn test_send_command_delivers_generate_frame() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (_id, mut worker_rx) = connect_worker(&hub, job_id);

        assert!(hub.send_command(job_id, "build a todo app"));
        let frames = drain(&mut worker_rx);
        assert_eq!(
            frames,
            vec![json!({"kind": "generate", "jobId": job_id, "instruction": "build a todo app"})]
        );
        assert_eq!(
            hub.session_state(job_id).unwrap().status,
            SessionStatus::Generating
        );
    }

    #[tokio::test]
    async fn test_send_command_to_closed_connection_is_false() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (_id, worker_rx) = connect_worker(&hub, job_id);
        drop(worker_rx);
        assert!(!hub.send_command(job_id, "go"));
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out_not_before() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let started = Instant::now();
        let err = hub
            .wait_for_ready(job_id, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(matches!(err, RelayError::ReadyTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_ready_unblocks_on_worker_connect() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait_for_ready(job_id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (_id, _rx) = connect_worker(&hub, job_id);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_ready_without_session() {
        let (hub, _db, job_id) = setup().await;
        let err = hub
            .wait_for_ready(job_id, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_wait_rejects_when_session_removed() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait_for_ready(job_id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.cleanup(job_id);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_late_observer_gets_history_then_live() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        connect_worker(&hub, job_id);

        hub.handle_worker_event(job_id, log("one")).await;
        hub.handle_worker_event(job_id, log("two")).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_observer(job_id, tx);
        hub.handle_worker_event(job_id, log("three")).await;

        let messages: Vec<String> = drain(&mut rx)
            .iter()
            .map(|v| v["message"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_has_no_gap_or_duplicate() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);

        let producer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    hub.handle_worker_event(job_id, log(&i.to_string())).await;
                    if i % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_observer(job_id, tx);
        producer.await.unwrap();

        let seen: Vec<i64> = drain(&mut rx)
            .iter()
            .map(|v| v["message"].as_str().unwrap().parse().unwrap())
            .collect();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_log_buffer_drops_oldest() {
        let (_hub, db, job_id) = setup().await;
        let hub = RelayHub::with_log_buffer(Arc::new(db), 3);
        hub.register_session(job_id);
        for i in 0..5 {
            hub.handle_worker_event(job_id, log(&format!("line {}", i))).await;
        }
        let lines: Vec<Value> = hub
            .buffered_logs(job_id)
            .iter()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["message"], "line 2");
        assert_eq!(lines[2]["message"], "line 4");
    }

    #[tokio::test]
    async fn test_progress_becomes_formatted_log() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_observer(job_id, tx);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Progress {
                message: "Installing".into(),
                stage: Some("deps".into()),
                percent: Some(40.0),
            },
        )
        .await;
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["kind"], "log");
        assert_eq!(frames[0]["message"], "[deps] Installing (40%)");
        assert_eq!(hub.buffered_logs(job_id).len(), 1);
    }

    #[tokio::test]
    async fn test_detaching_all_observers_leaves_session_alone() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        let (_wid, _worker_rx) = connect_worker(&hub, job_id);
        assert!(hub.send_command(job_id, "go"));

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let o1 = hub.attach_observer(job_id, tx1);
        let o2 = hub.attach_observer(job_id, tx2);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::IterationProgress {
                iteration: 1,
                file_state: Some(json!({"a": 1})),
                instruction: None,
                metadata: None,
                snapshot_kind: None,
            },
        )
        .await;

        hub.detach_observer(job_id, o1);
        hub.detach_observer(job_id, o2);
        assert_eq!(hub.observer_count(job_id), 0);

        let state = hub.session_state(job_id).unwrap();
        assert_eq!(state.status, SessionStatus::Generating);
        assert!(state.worker_connected);
        assert!(hub.send_command(job_id, "again"));
        assert_eq!(db.list_snapshots_for_job(job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_iteration_progress_persists_snapshot_and_counter() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_observer(job_id, tx);

        for iteration in [1, 2, 2] {
            hub.handle_worker_event(
                job_id,
                WorkerEvent::IterationProgress {
                    iteration,
                    file_state: Some(json!({"iteration": iteration})),
                    instruction: Some("refine".into()),
                    metadata: Some(json!({"tokens": 5})),
                    snapshot_kind: None,
                },
            )
            .await;
        }

        // Duplicate iteration is rejected by the store but still broadcast.
        let snapshots = db.list_snapshots_for_job(job_id).await.unwrap();
        assert_eq!(
            snapshots.iter().map(|s| s.iteration).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(db.get_job(job_id).await.unwrap().unwrap().current_iteration, 2);
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f["kind"] == "iteration_progress"));
    }

    #[tokio::test]
    async fn test_iteration_without_file_state_skips_snapshot() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::IterationProgress {
                iteration: 4,
                file_state: None,
                instruction: None,
                metadata: None,
                snapshot_kind: None,
            },
        )
        .await;
        assert!(db.list_snapshots_for_job(job_id).await.unwrap().is_empty());
        assert_eq!(db.get_job(job_id).await.unwrap().unwrap().current_iteration, 4);
    }

    #[tokio::test]
    async fn test_pause_resume_updates_store_and_broadcasts() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_observer(job_id, tx);

        hub.handle_worker_event(job_id, WorkerEvent::Paused { reason: None })
            .await;
        assert_eq!(
            db.get_job(job_id).await.unwrap().unwrap().status,
            JobStatus::Paused
        );
        hub.handle_worker_event(job_id, WorkerEvent::Resumed).await;
        assert_eq!(
            db.get_job(job_id).await.unwrap().unwrap().status,
            JobStatus::Generating
        );

        let statuses: Vec<Value> = drain(&mut rx).iter().map(|f| f["status"].clone()).collect();
        assert_eq!(statuses, vec![json!("paused"), json!("generating")]);
    }

    #[tokio::test]
    async fn test_cancelled_completes_job_and_unblocks_wait() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Cancelled {
                reason: Some("user abort".into()),
            },
        )
        .await;

        let job = db.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.error.as_deref(), Some("Cancelled: user abort"));

        let done = hub
            .wait_for_completion(job_id, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(done.cancelled);
        assert_eq!(done.note.as_deref(), Some("Cancelled: user abort"));
    }

    #[tokio::test]
    async fn test_completed_is_not_broadcast() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_observer(job_id, tx);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Completed {
                output_location: Some("/workspace/out".into()),
                summary: Some("done".into()),
            },
        )
        .await;
        assert!(drain(&mut rx).is_empty());
        let done = hub
            .wait_for_completion(job_id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(done.output_location.as_deref(), Some("/workspace/out"));
        assert!(!done.cancelled);
    }

    #[tokio::test]
    async fn test_ready_hint_kept_when_completion_has_no_location() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Ready {
                output_location: Some("/hint".into()),
            },
        )
        .await;
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Completed {
                output_location: None,
                summary: None,
            },
        )
        .await;
        let done = hub
            .wait_for_completion(job_id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(done.output_location.as_deref(), Some("/hint"));
    }

    #[tokio::test]
    async fn test_worker_error_fails_completion_wait() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Error {
                message: "npm install failed".into(),
            },
        )
        .await;
        let err = hub
            .wait_for_completion(job_id, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "npm install failed");
    }

    #[tokio::test]
    async fn test_disconnect_while_generating_fails_session() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (wid, _rx) = connect_worker(&hub, job_id);
        assert!(hub.send_command(job_id, "go"));

        hub.worker_disconnected(job_id, wid);
        let state = hub.session_state(job_id).unwrap();
        assert_eq!(state.status, SessionStatus::Failed);
        assert_eq!(
            state.error.as_deref(),
            Some("Worker disconnected unexpectedly")
        );
        assert!(!state.worker_connected);
    }

    #[tokio::test]
    async fn test_late_ready_keeps_generating_so_disconnect_still_fails() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (wid, _rx) = connect_worker(&hub, job_id);
        assert!(hub.send_command(job_id, "go"));

        hub.handle_worker_event(
            job_id,
            WorkerEvent::Ready {
                output_location: Some("/workspace/out".into()),
            },
        )
        .await;
        let state = hub.session_state(job_id).unwrap();
        assert_eq!(state.status, SessionStatus::Generating);
        assert_eq!(state.output_location.as_deref(), Some("/workspace/out"));

        hub.worker_disconnected(job_id, wid);
        let err = hub
            .wait_for_completion(job_id, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::WorkerFailed { .. }));
        assert_eq!(err.to_string(), "Worker disconnected unexpectedly");
    }

    #[tokio::test]
    async fn test_ready_before_command_moves_to_ready() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(job_id, WorkerEvent::Ready { output_location: None })
            .await;
        assert_eq!(
            hub.session_state(job_id).unwrap().status,
            SessionStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_cancel_after_error_leaves_store_to_failure_path() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach_observer(job_id, tx);

        hub.handle_worker_event(
            job_id,
            WorkerEvent::Error {
                message: "npm install failed".into(),
            },
        )
        .await;
        hub.handle_worker_event(job_id, WorkerEvent::Cancelled { reason: None })
            .await;

        let job = db.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Generating);
        assert!(job.error.is_none());
        let state = hub.session_state(job_id).unwrap();
        assert_eq!(state.status, SessionStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("npm install failed"));
        assert!(!state.cancelled);
        assert!(drain(&mut rx).is_empty());

        // The failure path can still record the real error.
        let failed = db
            .update_job(job_id, JobUpdate::failed("npm install failed"))
            .await
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("npm install failed"));
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_completion() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Completed {
                output_location: Some("/workspace/out".into()),
                summary: None,
            },
        )
        .await;
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Cancelled {
                reason: Some("too late".into()),
            },
        )
        .await;

        assert_eq!(
            db.get_job(job_id).await.unwrap().unwrap().status,
            JobStatus::Generating
        );
        let done = hub
            .wait_for_completion(job_id, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!done.cancelled);
        assert!(done.note.is_none());
        assert_eq!(done.output_location.as_deref(), Some("/workspace/out"));

        let job = db
            .update_job(job_id, JobUpdate::completed(done.output_location))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_pause_after_failure_is_dropped() {
        let (hub, db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Error {
                message: "boom".into(),
            },
        )
        .await;
        hub.handle_worker_event(job_id, WorkerEvent::Paused { reason: None })
            .await;
        assert_eq!(
            db.get_job(job_id).await.unwrap().unwrap().status,
            JobStatus::Generating
        );
    }

    #[tokio::test]
    async fn test_disconnect_after_completion_has_no_effect() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (wid, _rx) = connect_worker(&hub, job_id);
        assert!(hub.send_command(job_id, "go"));
        hub.handle_worker_event(
            job_id,
            WorkerEvent::Completed {
                output_location: None,
                summary: None,
            },
        )
        .await;
        hub.worker_disconnected(job_id, wid);
        let state = hub.session_state(job_id).unwrap();
        assert_eq!(state.status, SessionStatus::Completed);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_stale_disconnect_does_not_clear_replacement() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (first, _rx1) = connect_worker(&hub, job_id);
        let (_second, mut rx2) = connect_worker(&hub, job_id);

        hub.worker_disconnected(job_id, first);
        assert!(hub.session_state(job_id).unwrap().worker_connected);
        assert!(hub.send_command(job_id, "go"));
        assert_eq!(drain(&mut rx2).len(), 1);
    }

    #[tokio::test]
    async fn test_attach_worker_without_session_creates_one() {
        let (hub, _db, job_id) = setup().await;
        connect_worker(&hub, job_id);
        assert!(hub.has_session(job_id));
    }

    #[tokio::test]
    async fn test_cleanup_closes_worker_and_is_idempotent() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        let (_wid, mut rx) = connect_worker(&hub, job_id);
        hub.cleanup(job_id);
        hub.cleanup(job_id);
        assert!(!hub.has_session(job_id));
        // Sender dropped with the session.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let (hub, _db, job_id) = setup().await;
        hub.register_session(job_id);
        hub.handle_worker_event(job_id, WorkerEvent::Unknown).await;
        assert_eq!(hub.session_state(job_id).unwrap(), SessionState::default());
    }
}
