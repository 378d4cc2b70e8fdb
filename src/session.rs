//! Component B: the in-memory session table.
//!
//! A `Session` is the live, per-connection counterpart of a persistent
//! `AgentIdentity` (component A). The table is guarded by a single
//! `tokio::sync::Mutex` so multi-step operations -- "detach the previous
//! session for this agent, then connect the new one" -- observe a
//! consistent view, matching §5's serialized-interface requirement.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use hub_session::{AgentId, SessionId};

use crate::identity::{IdentityStore, StatsUpdate};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("auth token did not resolve to an identity")]
    InvalidToken,
    #[error("neither an auth token nor a display name was supplied")]
    MissingIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Disconnected,
}

/// A sink for frames destined for one connected client. Kept as a plain
/// sender rather than the socket itself, the way the transport-vs-session
/// split is described in §9 ("cyclic ownership... broken by keeping
/// connections owned by F and referenced by B via an indirection that can
/// be severed at disconnect"): dropping the table's copy of the sender, or
/// the receiver on F's side closing, severs the link without either side
/// needing a back-reference to the other.
pub type ConnectionHandle = mpsc::UnboundedSender<Message>;

#[derive(Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub connection: ConnectionHandle,
    pub joined_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub current_role: String,
    pub current_perspective: Option<String>,
    pub edits: u64,
    pub messages: u64,
    pub tasks: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum Counter {
    Edits,
    Messages,
    Tasks,
}

pub struct SessionTable {
    identity: Arc<IdentityStore>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionTable {
    pub fn new(identity: Arc<IdentityStore>) -> Self {
        Self {
            identity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an identity for the connection, detach any previous session
    /// of that identity, and register the new one (§4.B).
    pub async fn create(
        &self,
        session_id: SessionId,
        connection: ConnectionHandle,
        auth_token: Option<&str>,
        display_name: Option<&str>,
        role: &str,
    ) -> Result<Session, SessionError> {
        let identity = if let Some(token) = auth_token {
            self.identity
                .authenticate_by_token(token)
                .await
                .ok_or(SessionError::InvalidToken)?
        } else if let Some(name) = display_name {
            self.identity.get_or_create(name, role, None).await
        } else {
            return Err(SessionError::MissingIdentity);
        };

        let mut sessions = self.sessions.lock().await;

        let stale: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.agent_id == identity.agent_id)
            .map(|s| s.session_id.clone())
            .collect();
        for stale_id in stale {
            if let Some(stale_session) = sessions.remove(&stale_id) {
                self.roll_up(&stale_session).await;
                self.identity.disconnect(&stale_id).await;
            }
        }

        self.identity
            .connect(&identity.agent_id, session_id.clone())
            .await;

        let mut current_role = identity.current_role.clone();
        if role != current_role {
            self.identity
                .change_role(&identity.agent_id, role, Some(session_id.clone()))
                .await;
            current_role = role.to_string();
        }

        let session = Session {
            session_id: session_id.clone(),
            agent_id: identity.agent_id.clone(),
            connection,
            joined_at: Utc::now(),
            status: SessionStatus::Active,
            current_role,
            current_perspective: identity.current_perspective.clone(),
            edits: 0,
            messages: 0,
            tasks: 0,
        };

        sessions.insert(session_id, session.clone());
        Ok(session)
    }

    async fn roll_up(&self, session: &Session) {
        self.identity
            .update_stats(
                &session.agent_id,
                StatsUpdate {
                    total_edits: session.edits as i64,
                    total_messages: session.messages as i64,
                    total_tasks: session.tasks as i64,
                    ..Default::default()
                },
            )
            .await;
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Session> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn all(&self) -> Vec<Session> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn active(&self) -> Vec<Session> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect()
    }

    pub async fn by_role(&self, role: &str) -> Vec<Session> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.current_role == role)
            .cloned()
            .collect()
    }

    pub async fn by_perspective(&self, perspective: &str) -> Vec<Session> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.current_perspective.as_deref() == Some(perspective))
            .cloned()
            .collect()
    }

    pub async fn active_perspectives(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .filter_map(|s| s.current_perspective.clone())
            .filter(|p| seen.insert(p.clone()))
            .collect()
    }

    /// At most one entry per `agentId` (multiple sessions for the same
    /// agent collapse), per §4.B's invariant.
    pub async fn unique_active_agents(&self) -> Vec<AgentId> {
        let mut seen = std::collections::HashSet::new();
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .filter_map(|s| seen.insert(s.agent_id.clone()).then(|| s.agent_id.clone()))
            .collect()
    }

    /// Rolls counters into identity stats then disconnects the identity.
    pub async fn remove(&self, session_id: &SessionId) -> Option<Session> {
        let session = self.sessions.lock().await.remove(session_id)?;
        self.roll_up(&session).await;
        self.identity.disconnect(session_id).await;
        Some(session)
    }

    pub async fn set_status(&self, session_id: &SessionId, status: SessionStatus) {
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            session.status = status;
        }
    }

    pub async fn change_role(&self, session_id: &SessionId, new_role: &str) {
        let agent_id = {
            let mut sessions = self.sessions.lock().await;
            let session = match sessions.get_mut(session_id) {
                Some(s) => s,
                None => return,
            };
            session.current_role = new_role.to_string();
            session.agent_id.clone()
        };
        self.identity
            .change_role(&agent_id, new_role, Some(session_id.clone()))
            .await;
    }

    pub async fn change_perspective(
        &self,
        session_id: &SessionId,
        perspective: &str,
        reason: Option<String>,
    ) {
        let agent_id = {
            let mut sessions = self.sessions.lock().await;
            let session = match sessions.get_mut(session_id) {
                Some(s) => s,
                None => return,
            };
            session.current_perspective = Some(perspective.to_string());
            session.agent_id.clone()
        };
        self.identity
            .change_perspective(&agent_id, perspective, reason)
            .await;
    }

    pub async fn bump(&self, session_id: &SessionId, counter: Counter) {
        if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
            match counter {
                Counter::Edits => session.edits += 1,
                Counter::Messages => session.messages += 1,
                Counter::Tasks => session.tasks += 1,
            }
        }
    }
}
