use std::sync::Arc;

use dashmap::DashMap;

use super::hub::{Outbound, RelayHub};
use super::identity::IdentityValidator;
use super::messages::{ConsoleReply, ConsoleRequest, to_frame};
use super::models::{Identity, NewJob};
use super::orchestrator::Orchestrator;
use super::store::JobStore;

/// State of one console connection. Owned by its socket task.
pub struct ConsoleConnection {
    tx: Outbound,
    identity: Option<Identity>,
    joined: Option<Joined>,
}

struct Joined {
    session_id: String,
    job_id: i64,
    observer_id: u64,
}

impl ConsoleConnection {
    pub fn new(tx: Outbound) -> Self {
        Self {
            tx,
            identity: None,
            joined: None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }

    pub fn joined_job(&self) -> Option<i64> {
        self.joined.as_ref().map(|j| j.job_id)
    }

    fn reply(&self, reply: &ConsoleReply) {
        if let Some(frame) = to_frame(reply) {
            let _ = self.tx.send(frame);
        }
    }
}

/// Legacy console protocol: authenticate, then join or start sessions that
/// map onto jobs.
pub struct SessionBridge {
    /// session id → job id, independent of connections.
    sessions: DashMap<String, i64>,
    hub: Arc<RelayHub>,
    store: Arc<dyn JobStore>,
    orchestrator: Arc<Orchestrator>,
    identity: Arc<dyn IdentityValidator>,
}

impl SessionBridge {
    pub fn new(orchestrator: Arc<Orchestrator>, identity: Arc<dyn IdentityValidator>) -> Self {
        Self {
            sessions: DashMap::new(),
            hub: Arc::clone(orchestrator.hub()),
            store: Arc::clone(orchestrator.store()),
            orchestrator,
            identity,
        }
    }

    pub fn bind_session(&self, session_id: &str, job_id: i64) {
        self.sessions.insert(session_id.to_string(), job_id);
    }

    /// Look up the job for a session, falling back to the store on a miss.
    pub async fn resolve_session(&self, session_id: &str) -> Option<i64> {
        if let Some(job_id) = self.sessions.get(session_id).map(|e| *e) {
            return Some(job_id);
        }
        match self.store.find_job_by_session(session_id).await {
            Ok(Some(job)) => {
                self.bind_session(session_id, job.id);
                Some(job.id)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Session lookup failed");
                None
            }
        }
    }

    /// Handle one client text frame. Replies go out on the connection's
    /// channel.
    pub async fn handle_frame(&self, conn: &mut ConsoleConnection, text: &str) {
        let request = match serde_json::from_str::<ConsoleRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed console frame");
                conn.reply(&ConsoleReply::error("Invalid message"));
                return;
            }
        };

        match request {
            ConsoleRequest::Authenticate { token } => self.authenticate(conn, &token).await,
            ConsoleRequest::Unknown => conn.reply(&ConsoleReply::error("Unknown message type")),
            _ if conn.identity.is_none() => {
                conn.reply(&ConsoleReply::error("Not authenticated"));
            }
            ConsoleRequest::JoinSession { session_id } => self.join(conn, session_id).await,
            ConsoleRequest::LeaveSession => self.leave(conn),
            ConsoleRequest::StartGeneration {
                session_id,
                instruction,
            } => self.start_generation(conn, session_id, instruction).await,
        }
    }

    async fn authenticate(&self, conn: &mut ConsoleConnection, token: &str) {
        match self.identity.validate(token).await {
            Some(identity) => {
                tracing::info!(user_id = %identity.id, "Console client authenticated");
                let user_id = identity.id.clone();
                conn.identity = Some(identity);
                conn.reply(&ConsoleReply::Authenticated { user_id });
            }
            None => conn.reply(&ConsoleReply::error("Invalid token")),
        }
    }

    async fn join(&self, conn: &mut ConsoleConnection, session_id: String) {
        let Some(job_id) = self.resolve_session(&session_id).await else {
            conn.reply(&ConsoleReply::error(format!("Unknown session {}", session_id)));
            return;
        };
        let job = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                conn.reply(&ConsoleReply::error(format!("Job {} not found", job_id)));
                return;
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to load job for console join");
                conn.reply(&ConsoleReply::error("Failed to load job"));
                return;
            }
        };
        if conn.user_id() != Some(job.owner_id.as_str()) {
            conn.reply(&ConsoleReply::error("Access denied"));
            return;
        }
        self.attach(conn, session_id, job_id, |session_id| {
            ConsoleReply::SessionJoined { session_id, job_id }
        });
    }

    fn leave(&self, conn: &mut ConsoleConnection) {
        match self.detach(conn) {
            Some(session_id) => conn.reply(&ConsoleReply::SessionLeft { session_id }),
            None => conn.reply(&ConsoleReply::error("Not in a session")),
        }
    }

    async fn start_generation(
        &self,
        conn: &mut ConsoleConnection,
        session_id: Option<String>,
        instruction: String,
    ) {
        if instruction.trim().is_empty() {
            conn.reply(&ConsoleReply::error("Instruction must not be empty"));
            return;
        }
        let Some(owner_id) = conn.user_id().map(str::to_string) else {
            return;
        };
        // A session id already in use can only be reused by its owner.
        if let Some(requested) = &session_id
            && let Some(job_id) = self.resolve_session(requested).await
        {
            match self.store.get_job(job_id).await {
                Ok(Some(job)) if job.owner_id != owner_id => {
                    tracing::warn!(session_id = %requested, job_id, "Session owned by another user");
                    conn.reply(&ConsoleReply::error("Access denied"));
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Failed to load job for session reuse");
                    conn.reply(&ConsoleReply::error("Failed to load job"));
                    return;
                }
            }
        }
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let new = NewJob {
            owner_id,
            instruction,
            session_id: Some(session_id.clone()),
        };
        let job = match self.orchestrator.submit(new).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Console generation failed to start");
                conn.reply(&ConsoleReply::error(format!("Failed to start generation: {}", e)));
                return;
            }
        };
        self.bind_session(&session_id, job.id);
        let job_id = job.id;
        self.attach(conn, session_id, job_id, |session_id| {
            ConsoleReply::GenerationStarted { session_id, job_id }
        });
    }

    /// Reply first, then subscribe, so the reply precedes any replayed log.
    fn attach(
        &self,
        conn: &mut ConsoleConnection,
        session_id: String,
        job_id: i64,
        reply: impl FnOnce(String) -> ConsoleReply,
    ) {
        self.detach(conn);
        conn.reply(&reply(session_id.clone()));
        let observer_id = self.hub.attach_observer(job_id, conn.tx.clone());
        conn.joined = Some(Joined {
            session_id,
            job_id,
            observer_id,
        });
    }

    fn detach(&self, conn: &mut ConsoleConnection) -> Option<String> {
        let joined = conn.joined.take()?;
        self.hub.detach_observer(joined.job_id, joined.observer_id);
        Some(joined.session_id)
    }

    /// Release the connection's subscription when its socket closes.
    pub fn disconnect(&self, conn: &mut ConsoleConnection) {
        self.detach(conn);
    }
}
