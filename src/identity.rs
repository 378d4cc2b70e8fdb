//! Component A: the persistent identity registry.
//!
//! Three indexes (by `agentId`, `displayName`, `authToken`) are kept
//! consistent under a single `tokio::sync::Mutex` guarding the whole store,
//! matching §5's requirement that A present a serialized public interface:
//! rather than three independently-locked maps that could observe a
//! half-applied mutation, every method takes the one lock for its full
//! duration and persists before releasing it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hub_session::{AgentId, SessionId};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("display name {0:?} is already taken")]
    NameTaken(String),
    #[error("display name is required")]
    MissingDisplayName,
    #[error("persistence I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistence serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTransition {
    pub role: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveTransition {
    pub perspective: String,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityStats {
    pub total_sessions: u64,
    pub total_messages: u64,
    pub total_tasks: u64,
    pub total_edits: u64,
    pub diversity_score: f64,
    pub agreement_rate: f64,
    pub evidence_rate: f64,
}

impl Default for IdentityStats {
    fn default() -> Self {
        Self {
            total_sessions: 0,
            total_messages: 0,
            total_tasks: 0,
            total_edits: 0,
            diversity_score: 0.5,
            agreement_rate: 0.5,
            evidence_rate: 0.5,
        }
    }
}

/// Additive deltas for counters, absolute replacements for scores -- the
/// shape `SessionTable::remove` uses to roll per-session counters into an
/// identity, and a policy engine would use to publish freshly computed
/// scores.
#[derive(Debug, Clone, Default)]
pub struct StatsUpdate {
    pub total_sessions: i64,
    pub total_messages: i64,
    pub total_tasks: i64,
    pub total_edits: i64,
    pub diversity_score: Option<f64>,
    pub agreement_rate: Option<f64>,
    pub evidence_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: AgentId,
    pub display_name: String,
    pub auth_token: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub current_role: String,
    pub role_history: Vec<RoleTransition>,
    pub current_perspective: Option<String>,
    pub perspective_history: Vec<PerspectiveTransition>,
    pub stats: IdentityStats,
    pub current_session_id: Option<SessionId>,
    pub last_activity_time: Option<DateTime<Utc>>,
}

impl AgentIdentity {
    fn new(display_name: String, role: String) -> Self {
        let now = Utc::now();
        Self {
            agent_id: AgentId::new(),
            display_name,
            auth_token: hub_session::generate_secret(),
            first_seen: now,
            last_seen: now,
            current_role: role,
            role_history: Vec::new(),
            current_perspective: None,
            perspective_history: Vec::new(),
            stats: IdentityStats::default(),
            current_session_id: None,
            last_activity_time: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current_session_id.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    identities: Vec<AgentIdentity>,
}

struct Indexes {
    by_agent_id: HashMap<AgentId, AgentIdentity>,
    by_display_name: HashMap<String, AgentId>,
    by_auth_token: HashMap<String, AgentId>,
}

impl Indexes {
    fn empty() -> Self {
        Self {
            by_agent_id: HashMap::new(),
            by_display_name: HashMap::new(),
            by_auth_token: HashMap::new(),
        }
    }

    fn insert(&mut self, identity: AgentIdentity) {
        self.by_display_name
            .insert(identity.display_name.clone(), identity.agent_id.clone());
        self.by_auth_token
            .insert(identity.auth_token.clone(), identity.agent_id.clone());
        self.by_agent_id.insert(identity.agent_id.clone(), identity);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            identities: self.by_agent_id.values().cloned().collect(),
        }
    }
}

/// The persistent identity registry (component A).
pub struct IdentityStore {
    inner: Mutex<Indexes>,
    snapshot_path: PathBuf,
}

impl IdentityStore {
    /// Load from `snapshot_path` if present; a missing or corrupt file is
    /// logged and treated as an empty store (§4.A persistence).
    pub async fn load(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let indexes = match tokio::fs::read_to_string(&snapshot_path).await {
            Ok(raw) => match serde_json::from_str::<Snapshot>(&raw) {
                Ok(snap) => {
                    let mut idx = Indexes::empty();
                    for identity in snap.identities {
                        idx.insert(identity);
                    }
                    info!(count = idx.by_agent_id.len(), "loaded identity snapshot");
                    idx
                }
                Err(e) => {
                    warn!(error = %e, path = %snapshot_path.display(), "corrupt identity snapshot, starting empty");
                    Indexes::empty()
                }
            },
            Err(_) => {
                debug!(path = %snapshot_path.display(), "no identity snapshot found, starting empty");
                Indexes::empty()
            }
        };

        Self {
            inner: Mutex::new(indexes),
            snapshot_path,
        }
    }

    async fn persist(&self, idx: &Indexes) {
        let snapshot = idx.snapshot();
        let result: Result<(), IdentityError> = async {
            let json = serde_json::to_vec_pretty(&snapshot)?;
            let tmp_path = self.snapshot_path.with_extension("json.tmp");
            if let Some(parent) = self.snapshot_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp_path, json).await?;
            tokio::fs::rename(&tmp_path, &self.snapshot_path).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to persist identity snapshot; in-memory state remains authoritative");
        }
    }

    pub async fn register_new(
        &self,
        display_name: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<AgentIdentity, IdentityError> {
        let display_name = display_name.into();
        if display_name.trim().is_empty() {
            return Err(IdentityError::MissingDisplayName);
        }

        let mut idx = self.inner.lock().await;
        if idx.by_display_name.contains_key(&display_name) {
            return Err(IdentityError::NameTaken(display_name));
        }

        let identity = AgentIdentity::new(display_name, role.into());
        idx.insert(identity.clone());
        self.persist(&idx).await;
        Ok(identity)
    }

    /// Legacy path used by `forceNew` registration (§4.F, §9 open question):
    /// allows a duplicate `displayName` to coexist. Kept distinct from
    /// [`register_new`] so the uniqueness invariant is clearly scoped to the
    /// default path.
    pub async fn register_new_forced(
        &self,
        display_name: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<AgentIdentity, IdentityError> {
        let display_name = display_name.into();
        if display_name.trim().is_empty() {
            return Err(IdentityError::MissingDisplayName);
        }
        warn!(name = %display_name, "forceNew registration bypassing name-uniqueness invariant");

        let mut idx = self.inner.lock().await;
        let identity = AgentIdentity::new(display_name, role.into());
        idx.insert(identity.clone());
        self.persist(&idx).await;
        Ok(identity)
    }

    pub async fn authenticate_by_token(&self, token: &str) -> Option<AgentIdentity> {
        let mut idx = self.inner.lock().await;
        let agent_id = idx.by_auth_token.get(token).cloned()?;
        let identity = idx.by_agent_id.get_mut(&agent_id)?;
        identity.last_seen = Utc::now();
        let snapshot_value = identity.clone();
        self.persist(&idx).await;
        Some(snapshot_value)
    }

    pub async fn find_by_display_name(&self, name: &str) -> Option<AgentIdentity> {
        let idx = self.inner.lock().await;
        let agent_id = idx.by_display_name.get(name)?;
        idx.by_agent_id.get(agent_id).cloned()
    }

    pub async fn find_by_agent_id(&self, agent_id: &AgentId) -> Option<AgentIdentity> {
        let idx = self.inner.lock().await;
        idx.by_agent_id.get(agent_id).cloned()
    }

    pub async fn is_name_available(&self, name: &str) -> bool {
        let idx = self.inner.lock().await;
        !idx.by_display_name.contains_key(name)
    }

    /// `base2`..`base10`, then `base_new`, then `base_agent`, filtered to
    /// available names, truncated to `count` (§4.A).
    pub async fn suggest_names(&self, base: &str, count: usize) -> Vec<String> {
        let idx = self.inner.lock().await;
        let mut candidates: Vec<String> = (2..=10).map(|n| format!("{base}{n}")).collect();
        candidates.push(format!("{base}_new"));
        candidates.push(format!("{base}_agent"));

        candidates
            .into_iter()
            .filter(|name| !idx.by_display_name.contains_key(name))
            .take(count)
            .collect()
    }

    /// Resolution order (§4.A): valid token wins; else existing name is
    /// touched and returned; else a new identity is created.
    pub async fn get_or_create(
        &self,
        display_name: impl Into<String>,
        role: impl Into<String>,
        token: Option<&str>,
    ) -> AgentIdentity {
        let display_name = display_name.into();
        let role = role.into();

        if let Some(token) = token {
            if let Some(identity) = self.authenticate_by_token(token).await {
                return identity;
            }
        }

        let mut idx = self.inner.lock().await;
        if let Some(agent_id) = idx.by_display_name.get(&display_name).cloned() {
            let identity = idx.by_agent_id.get_mut(&agent_id).expect("index consistency");
            identity.last_seen = Utc::now();
            let result = identity.clone();
            self.persist(&idx).await;
            return result;
        }

        let identity = AgentIdentity::new(display_name, role);
        idx.insert(identity.clone());
        self.persist(&idx).await;
        identity
    }

    /// Detaches any previous session of the agent, marks it connected.
    pub async fn connect(&self, agent_id: &AgentId, session_id: SessionId) {
        let mut idx = self.inner.lock().await;
        if let Some(identity) = idx.by_agent_id.get_mut(agent_id) {
            identity.current_session_id = Some(session_id);
            identity.last_activity_time = Some(Utc::now());
            identity.stats.total_sessions += 1;
        }
        self.persist(&idx).await;
    }

    /// Idempotent: clears session linkage for whichever identity (if any)
    /// currently holds `session_id`.
    pub async fn disconnect(&self, session_id: &SessionId) {
        let mut idx = self.inner.lock().await;
        let target = idx
            .by_agent_id
            .values()
            .find(|id| id.current_session_id.as_ref() == Some(session_id))
            .map(|id| id.agent_id.clone());

        if let Some(agent_id) = target {
            if let Some(identity) = idx.by_agent_id.get_mut(&agent_id) {
                identity.current_session_id = None;
                identity.last_activity_time = None;
            }
            self.persist(&idx).await;
        }
    }

    pub async fn change_role(
        &self,
        agent_id: &AgentId,
        new_role: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> Option<String> {
        let new_role = new_role.into();
        let mut idx = self.inner.lock().await;
        let identity = idx.by_agent_id.get_mut(agent_id)?;
        let previous = identity.current_role.clone();
        identity.role_history.push(RoleTransition {
            role: previous.clone(),
            timestamp: Utc::now(),
            session_id,
        });
        identity.current_role = new_role;
        self.persist(&idx).await;
        Some(previous)
    }

    pub async fn change_perspective(
        &self,
        agent_id: &AgentId,
        new_perspective: impl Into<String>,
        reason: Option<String>,
    ) {
        let new_perspective = new_perspective.into();
        let mut idx = self.inner.lock().await;
        if let Some(identity) = idx.by_agent_id.get_mut(agent_id) {
            if let Some(previous) = identity.current_perspective.clone() {
                identity.perspective_history.push(PerspectiveTransition {
                    perspective: previous,
                    timestamp: Utc::now(),
                    reason,
                });
            }
            identity.current_perspective = Some(new_perspective);
        }
        self.persist(&idx).await;
    }

    pub async fn touch_activity(&self, agent_id: &AgentId) {
        let mut idx = self.inner.lock().await;
        if let Some(identity) = idx.by_agent_id.get_mut(agent_id) {
            if identity.is_connected() {
                identity.last_activity_time = Some(Utc::now());
            }
        }
        self.persist(&idx).await;
    }

    /// Disconnects every connected identity whose `lastActivityTime` is
    /// older than `now - timeout`. Returns the count disconnected.
    pub async fn cleanup_inactive(&self, timeout: chrono::Duration) -> u32 {
        let mut idx = self.inner.lock().await;
        let cutoff = Utc::now() - timeout;
        let stale: Vec<AgentId> = idx
            .by_agent_id
            .values()
            .filter(|id| {
                id.is_connected()
                    && id
                        .last_activity_time
                        .map(|t| t < cutoff)
                        .unwrap_or(false)
            })
            .map(|id| id.agent_id.clone())
            .collect();

        for agent_id in &stale {
            if let Some(identity) = idx.by_agent_id.get_mut(agent_id) {
                identity.current_session_id = None;
                identity.last_activity_time = None;
            }
        }

        if !stale.is_empty() {
            self.persist(&idx).await;
        }
        stale.len() as u32
    }

    pub async fn update_stats(&self, agent_id: &AgentId, delta: StatsUpdate) {
        let mut idx = self.inner.lock().await;
        if let Some(identity) = idx.by_agent_id.get_mut(agent_id) {
            identity.stats.total_sessions =
                (identity.stats.total_sessions as i64 + delta.total_sessions).max(0) as u64;
            identity.stats.total_messages =
                (identity.stats.total_messages as i64 + delta.total_messages).max(0) as u64;
            identity.stats.total_tasks =
                (identity.stats.total_tasks as i64 + delta.total_tasks).max(0) as u64;
            identity.stats.total_edits =
                (identity.stats.total_edits as i64 + delta.total_edits).max(0) as u64;
            if let Some(v) = delta.diversity_score {
                identity.stats.diversity_score = v;
            }
            if let Some(v) = delta.agreement_rate {
                identity.stats.agreement_rate = v;
            }
            if let Some(v) = delta.evidence_rate {
                identity.stats.evidence_rate = v;
            }
        }
        self.persist(&idx).await;
    }

    pub async fn total_count(&self) -> usize {
        self.inner.lock().await.by_agent_id.len()
    }

    pub async fn connected_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .by_agent_id
            .values()
            .filter(|id| id.is_connected())
            .count()
    }
}

/// Path `identities.json` lives at within a workspace data directory.
pub fn default_snapshot_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("identities.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    async fn store() -> (IdentityStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = default_snapshot_path(dir.path());
        (IdentityStore::load(path).await, dir)
    }

    #[tokio::test]
    async fn register_new_rejects_duplicate_name() {
        let (store, _dir) = store().await;
        store.register_new("alice", "researcher").await.unwrap();
        let err = store.register_new("alice", "researcher").await.unwrap_err();
        assert!(matches!(err, IdentityError::NameTaken(_)));
        assert_eq!(store.total_count().await, 1);
    }

    #[tokio::test]
    async fn authenticate_by_token_updates_last_seen() {
        let (store, _dir) = store().await;
        let identity = store.register_new("bob", "architect").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let found = store
            .authenticate_by_token(&identity.auth_token)
            .await
            .unwrap();
        assert_eq!(found.agent_id, identity.agent_id);
        assert!(found.last_seen > identity.first_seen || found.last_seen == identity.first_seen);
    }

    #[tokio::test]
    async fn authenticate_by_unknown_token_returns_none() {
        let (store, _dir) = store().await;
        assert!(store.authenticate_by_token("nope").await.is_none());
    }

    #[tokio::test]
    async fn suggest_names_ordering_and_filtering() {
        let (store, _dir) = store().await;
        store.register_new("alice", "r").await.unwrap();
        store.register_new("alice2", "r").await.unwrap();
        let suggestions = store.suggest_names("alice", 3).await;
        assert_eq!(suggestions, vec!["alice3", "alice4", "alice5"]);
    }

    #[tokio::test]
    async fn get_or_create_prefers_token_then_name_then_creates() {
        let (store, _dir) = store().await;
        let existing = store.register_new("carol", "qa").await.unwrap();

        let via_token = store
            .get_or_create("irrelevant", "qa", Some(&existing.auth_token))
            .await;
        assert_eq!(via_token.agent_id, existing.agent_id);

        let via_name = store.get_or_create("carol", "qa", None).await;
        assert_eq!(via_name.agent_id, existing.agent_id);

        let fresh = store.get_or_create("dave", "qa", None).await;
        assert_ne!(fresh.agent_id, existing.agent_id);
        assert_eq!(store.total_count().await, 2);
    }

    #[tokio::test]
    async fn connect_then_disconnect_clears_both_fields() {
        let (store, _dir) = store().await;
        let identity = store.register_new("erin", "qa").await.unwrap();
        let session_id = SessionId::new();
        store.connect(&identity.agent_id, session_id.clone()).await;

        let connected = store.find_by_agent_id(&identity.agent_id).await.unwrap();
        assert_eq!(connected.current_session_id, Some(session_id.clone()));
        assert!(connected.last_activity_time.is_some());
        assert_eq!(connected.stats.total_sessions, 1);

        store.disconnect(&session_id).await;
        let disconnected = store.find_by_agent_id(&identity.agent_id).await.unwrap();
        assert!(disconnected.current_session_id.is_none());
        assert!(disconnected.last_activity_time.is_none());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (store, _dir) = store().await;
        store.disconnect(&SessionId::new()).await;
    }

    #[tokio::test]
    async fn change_role_pushes_previous_role() {
        let (store, _dir) = store().await;
        let identity = store.register_new("frank", "researcher").await.unwrap();
        let previous = store
            .change_role(&identity.agent_id, "architect", None)
            .await
            .unwrap();
        assert_eq!(previous, "researcher");

        let updated = store.find_by_agent_id(&identity.agent_id).await.unwrap();
        assert_eq!(updated.current_role, "architect");
        assert_eq!(updated.role_history.len(), 1);
        assert_eq!(updated.role_history[0].role, "researcher");
    }

    #[tokio::test]
    async fn change_perspective_only_pushes_when_one_existed() {
        let (store, _dir) = store().await;
        let identity = store.register_new("gina", "researcher").await.unwrap();

        store
            .change_perspective(&identity.agent_id, "skeptic", None)
            .await;
        let first = store.find_by_agent_id(&identity.agent_id).await.unwrap();
        assert_eq!(first.current_perspective.as_deref(), Some("skeptic"));
        assert!(first.perspective_history.is_empty());

        store
            .change_perspective(&identity.agent_id, "optimist", Some("pivot".into()))
            .await;
        let second = store.find_by_agent_id(&identity.agent_id).await.unwrap();
        assert_eq!(second.perspective_history.len(), 1);
        assert_eq!(second.perspective_history[0].perspective, "skeptic");
    }

    #[tokio::test]
    async fn cleanup_inactive_disconnects_only_stale() {
        let (store, _dir) = store().await;
        let stale = store.register_new("stale", "r").await.unwrap();
        let fresh = store.register_new("fresh", "r").await.unwrap();

        store.connect(&stale.agent_id, SessionId::new()).await;
        store.connect(&fresh.agent_id, SessionId::new()).await;

        // Force the "stale" identity's activity far into the past.
        {
            let mut idx = store.inner.lock().await;
            if let Some(identity) = idx.by_agent_id.get_mut(&stale.agent_id) {
                identity.last_activity_time = Some(Utc::now() - chrono::Duration::minutes(10));
            }
        }

        let cleaned = store.cleanup_inactive(chrono::Duration::minutes(5)).await;
        assert_eq!(cleaned, 1);

        assert!(!store
            .find_by_agent_id(&stale.agent_id)
            .await
            .unwrap()
            .is_connected());
        assert!(store
            .find_by_agent_id(&fresh.agent_id)
            .await
            .unwrap()
            .is_connected());
    }

    #[tokio::test]
    async fn update_stats_adds_counters_and_replaces_scores() {
        let (store, _dir) = store().await;
        let identity = store.register_new("hank", "r").await.unwrap();

        store
            .update_stats(
                &identity.agent_id,
                StatsUpdate {
                    total_messages: 3,
                    total_edits: 1,
                    diversity_score: Some(0.8),
                    ..Default::default()
                },
            )
            .await;

        let updated = store.find_by_agent_id(&identity.agent_id).await.unwrap();
        assert_eq!(updated.stats.total_messages, 3);
        assert_eq!(updated.stats.total_edits, 1);
        assert_eq!(updated.stats.diversity_score, 0.8);
        assert_eq!(updated.stats.agreement_rate, 0.5);
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_history() {
        let dir = tempdir().unwrap();
        let path = default_snapshot_path(dir.path());
        let identity = {
            let store = IdentityStore::load(&path).await;
            let identity = store.register_new("ivy", "researcher").await.unwrap();
            store
                .change_role(&identity.agent_id, "architect", None)
                .await;
            store.find_by_agent_id(&identity.agent_id).await.unwrap()
        };

        let reloaded_store = IdentityStore::load(&path).await;
        let reloaded = reloaded_store
            .find_by_agent_id(&identity.agent_id)
            .await
            .unwrap();

        assert_eq!(reloaded.display_name, identity.display_name);
        assert_eq!(reloaded.role_history.len(), 1);
        assert_eq!(reloaded.first_seen, identity.first_seen);
    }

    #[tokio::test]
    async fn missing_snapshot_file_is_treated_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let store = IdentityStore::load(&path).await;
        assert_eq!(store.total_count().await, 0);
    }

    #[tokio::test]
    async fn corrupt_snapshot_file_is_treated_as_empty() {
        let dir = tempdir().unwrap();
        let path = default_snapshot_path(dir.path());
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = IdentityStore::load(&path).await;
        assert_eq!(store.total_count().await, 0);
    }
}
