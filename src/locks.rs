//! Component C: the atomic task-lock manager.
//!
//! A single `tokio::sync::Mutex<LockInner>` makes acquire/claim/release
//! atomic across locks and claims at once -- the race in §8 property 3
//! (two concurrent `acquireLock` calls for the same task resolve to exactly
//! one winner) falls out of holding one lock for the whole decision rather
//! than CAS-ing two independent maps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use hub_session::{AgentId, BroadcastBus, LockToken, TaskId};

/// Fixed lock lease (§4.C).
pub const LOCK_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Claimed,
    InProgress,
    Completed,
}

#[derive(Debug, Clone)]
struct TaskLock {
    holder: AgentId,
    token: LockToken,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TaskLock {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaim {
    pub task_id: TaskId,
    pub owner: AgentId,
    pub claimed_at: DateTime<Utc>,
    pub status: ClaimStatus,
}

#[derive(Debug, Clone)]
pub struct LockStatus {
    pub locked: bool,
    pub by: Option<AgentId>,
    pub expires_in_ms: Option<i64>,
}

/// Events emitted after the underlying state mutation completes (§4.C).
#[derive(Debug, Clone)]
pub enum LockEvent {
    LockAcquired { task_id: TaskId, agent_id: AgentId },
    LockReleased { task_id: TaskId },
    LockExpired { task_id: TaskId, agent_id: AgentId },
    TaskClaimed { task_id: TaskId, agent_id: AgentId },
    TaskStatusChanged { task_id: TaskId, status: ClaimStatus },
}

#[derive(Serialize, Deserialize)]
struct ClaimSnapshot {
    claims: Vec<TaskClaim>,
}

struct LockInner {
    locks: HashMap<TaskId, TaskLock>,
    claims: HashMap<TaskId, TaskClaim>,
}

pub struct TaskLockManager {
    inner: Mutex<LockInner>,
    events: BroadcastBus<LockEvent>,
    claims_path: PathBuf,
}

impl TaskLockManager {
    pub async fn load(claims_path: impl Into<PathBuf>) -> Self {
        let claims_path = claims_path.into();
        let claims = match tokio::fs::read_to_string(&claims_path).await {
            Ok(raw) => match serde_json::from_str::<ClaimSnapshot>(&raw) {
                Ok(snap) => snap
                    .claims
                    .into_iter()
                    .map(|c| (c.task_id.clone(), c))
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "corrupt task-claims snapshot, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            inner: Mutex::new(LockInner {
                locks: HashMap::new(),
                claims,
            }),
            events: BroadcastBus::new(256),
            claims_path,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    async fn persist_claims(&self, inner: &LockInner) {
        let snapshot = ClaimSnapshot {
            claims: inner.claims.values().cloned().collect(),
        };
        if let Ok(json) = serde_json::to_vec_pretty(&snapshot) {
            if let Some(parent) = self.claims_path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(e) = tokio::fs::write(&self.claims_path, json).await {
                warn!(error = %e, "failed to persist task claims snapshot");
            }
        }
    }

    /// Idempotent refresh for the same holder; `None` if held by another
    /// agent (§4.C protocol step 1).
    pub async fn acquire_lock(&self, task_id: &TaskId, agent_id: &AgentId) -> Option<LockToken> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if let Some(existing) = inner.locks.get(task_id) {
            if existing.is_live(now) {
                if existing.holder == *agent_id {
                    let token = existing.token.clone();
                    let expires_at = now + chrono::Duration::from_std(LOCK_TTL).unwrap();
                    inner.locks.get_mut(task_id).unwrap().expires_at = expires_at;
                    debug!(task = %task_id, agent = %agent_id, "lock refreshed");
                    return Some(token);
                }
                return None;
            }
        }

        let token = LockToken::new();
        inner.locks.insert(
            task_id.clone(),
            TaskLock {
                holder: agent_id.clone(),
                token: token.clone(),
                acquired_at: now,
                expires_at: now + chrono::Duration::from_std(LOCK_TTL).unwrap(),
            },
        );
        info!(task = %task_id, agent = %agent_id, "lock acquired");
        self.events.publish(LockEvent::LockAcquired {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
        });
        Some(token)
    }

    pub async fn release_lock(&self, task_id: &TaskId, token: &LockToken) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.locks.get(task_id) {
            Some(lock) if lock.token == *token => {
                inner.locks.remove(task_id);
                self.events.publish(LockEvent::LockReleased {
                    task_id: task_id.clone(),
                });
                true
            }
            _ => false,
        }
    }

    /// Succeeds iff a live lock is held by `agent_id` with a matching
    /// `token` and no non-completed claim already exists (§4.C step 3).
    pub async fn claim_task(&self, task_id: &TaskId, agent_id: &AgentId, token: &LockToken) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let lock_ok = matches!(
            inner.locks.get(task_id),
            Some(lock) if lock.is_live(now) && lock.holder == *agent_id && lock.token == *token
        );
        if !lock_ok {
            return false;
        }

        let claim_ok = !matches!(
            inner.claims.get(task_id),
            Some(claim) if claim.status != ClaimStatus::Completed
        );
        if !claim_ok {
            return false;
        }

        inner.claims.insert(
            task_id.clone(),
            TaskClaim {
                task_id: task_id.clone(),
                owner: agent_id.clone(),
                claimed_at: now,
                status: ClaimStatus::Claimed,
            },
        );
        inner.locks.remove(task_id);

        info!(task = %task_id, agent = %agent_id, "task claimed");
        self.events.publish(LockEvent::TaskClaimed {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
        });
        self.events.publish(LockEvent::LockReleased {
            task_id: task_id.clone(),
        });
        self.persist_claims(&inner).await;
        true
    }

    pub async fn is_available(&self, task_id: &TaskId) -> bool {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let no_live_lock = !matches!(inner.locks.get(task_id), Some(l) if l.is_live(now));
        let no_open_claim = !matches!(
            inner.claims.get(task_id),
            Some(c) if c.status != ClaimStatus::Completed
        );
        no_live_lock && no_open_claim
    }

    pub async fn owner(&self, task_id: &TaskId) -> Option<AgentId> {
        let inner = self.inner.lock().await;
        inner.claims.get(task_id).map(|c| c.owner.clone())
    }

    pub async fn lock_status(&self, task_id: &TaskId) -> LockStatus {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        match inner.locks.get(task_id) {
            Some(lock) if lock.is_live(now) => LockStatus {
                locked: true,
                by: Some(lock.holder.clone()),
                expires_in_ms: Some((lock.expires_at - now).num_milliseconds()),
            },
            _ => LockStatus {
                locked: false,
                by: None,
                expires_in_ms: None,
            },
        }
    }

    pub async fn agent_tasks(&self, agent_id: &AgentId) -> Vec<TaskClaim> {
        self.inner
            .lock()
            .await
            .claims
            .values()
            .filter(|c| c.owner == *agent_id)
            .cloned()
            .collect()
    }

    /// Only the current owner may advance status; `claimed -> in_progress ->
    /// completed`; completion restores availability (§4.C step 4).
    pub async fn update_status(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
        new_status: ClaimStatus,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let valid_transition = match inner.claims.get(task_id) {
            Some(claim) if claim.owner == *agent_id => matches!(
                (claim.status, new_status),
                (ClaimStatus::Claimed, ClaimStatus::InProgress)
                    | (ClaimStatus::InProgress, ClaimStatus::Completed)
                    | (ClaimStatus::Claimed, ClaimStatus::Completed)
            ),
            _ => false,
        };
        if !valid_transition {
            return false;
        }

        if let Some(claim) = inner.claims.get_mut(task_id) {
            claim.status = new_status;
        }
        self.events.publish(LockEvent::TaskStatusChanged {
            task_id: task_id.clone(),
            status: new_status,
        });
        self.persist_claims(&inner).await;
        true
    }

    /// Drops every lock whose lease has expired; emits `lock-expired` for
    /// each (sweeper, §4.G step 2).
    pub async fn sweep_expired(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let expired: Vec<(TaskId, AgentId)> = inner
            .locks
            .iter()
            .filter(|(_, lock)| !lock.is_live(now))
            .map(|(id, lock)| (id.clone(), lock.holder.clone()))
            .collect();

        for (task_id, _) in &expired {
            inner.locks.remove(task_id);
        }

        for (task_id, agent_id) in &expired {
            self.events.publish(LockEvent::LockExpired {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
            });
        }
        expired.len() as u32
    }
}

// `task-locks.json` is declared in §6's on-disk layout, but locks are
// ephemeral (§4.C: "never persisted"); `TaskLockManager` only ever persists
// `task-claims.json` via `default_claims_path` below.

pub fn default_claims_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("task-claims.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn manager() -> (TaskLockManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mgr = TaskLockManager::load(default_claims_path(dir.path())).await;
        (mgr, dir)
    }

    #[tokio::test]
    async fn second_agent_cannot_acquire_live_lock() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();
        let b = AgentId::new();

        let token_a = mgr.acquire_lock(&task, &a).await;
        assert!(token_a.is_some());

        let token_b = mgr.acquire_lock(&task, &b).await;
        assert!(token_b.is_none());
    }

    #[tokio::test]
    async fn same_agent_acquiring_twice_is_idempotent() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();

        let first = mgr.acquire_lock(&task, &a).await.unwrap();
        let second = mgr.acquire_lock(&task, &a).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn claim_requires_matching_live_lock() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();
        let b = AgentId::new();

        let token = mgr.acquire_lock(&task, &a).await.unwrap();
        assert!(!mgr.claim_task(&task, &b, &token).await);

        let wrong_token = LockToken::new();
        assert!(!mgr.claim_task(&task, &a, &wrong_token).await);

        assert!(mgr.claim_task(&task, &a, &token).await);
        assert_eq!(mgr.owner(&task).await, Some(a));
    }

    #[tokio::test]
    async fn claim_releases_lock_and_blocks_double_claim() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();

        let token = mgr.acquire_lock(&task, &a).await.unwrap();
        assert!(mgr.claim_task(&task, &a, &token).await);
        assert!(!mgr.is_available(&task).await);

        // Re-acquiring after the claim allocates a *new* token since the old
        // one was consumed by the claim.
        let new_token = mgr.acquire_lock(&task, &a).await.unwrap();
        assert_ne!(new_token, token);
        assert!(!mgr.claim_task(&task, &a, &new_token).await);
    }

    #[tokio::test]
    async fn completed_claim_restores_availability() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();
        let token = mgr.acquire_lock(&task, &a).await.unwrap();
        mgr.claim_task(&task, &a, &token).await;

        assert!(mgr.update_status(&task, &a, ClaimStatus::InProgress).await);
        assert!(mgr.update_status(&task, &a, ClaimStatus::Completed).await);
        assert!(mgr.is_available(&task).await);
    }

    #[tokio::test]
    async fn only_owner_may_update_status() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();
        let b = AgentId::new();
        let token = mgr.acquire_lock(&task, &a).await.unwrap();
        mgr.claim_task(&task, &a, &token).await;

        assert!(!mgr.update_status(&task, &b, ClaimStatus::InProgress).await);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();
        let token = mgr.acquire_lock(&task, &a).await.unwrap();
        mgr.claim_task(&task, &a, &token).await;

        assert!(!mgr.update_status(&task, &a, ClaimStatus::Claimed).await);
    }

    #[tokio::test]
    async fn sweep_expired_drops_and_emits() {
        let (mgr, _dir) = manager().await;
        let task = TaskId::from("T-1");
        let a = AgentId::new();
        mgr.acquire_lock(&task, &a).await;

        let mut events = mgr.subscribe();

        // Force expiry without waiting 5s in a test.
        {
            let mut inner = mgr.inner.lock().await;
            if let Some(lock) = inner.locks.get_mut(&task) {
                lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
            }
        }

        let swept = mgr.sweep_expired().await;
        assert_eq!(swept, 1);
        assert!(mgr.is_available(&task).await);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, LockEvent::LockExpired { .. }));
    }
}
