//! Component H: process-wide server state, wired once at start-up and
//! shared (via `Arc`) across every axum handler and sweeper task.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::discussion::DiscussionBoard;
use crate::error::HubResult;
use crate::fsnotify::FsNotifier;
use crate::identity::{self, IdentityStore};
use crate::locks::{self, TaskLockManager};
use crate::policy::{
    AntiEchoPolicy, ConflictResolver, DisabledAntiEchoPolicy, EditCoordinator,
    NoopConflictResolver, NoopEditCoordinator, PassthroughOrchestrator, TaskOrchestrator,
};
use crate::session::SessionTable;

/// Everything a connection handler or sweeper needs, injected explicitly
/// rather than reached for via ambient globals (§9's "this.sessions /
/// this.identityManager" redesign flag).
pub struct AppState {
    pub config: ServerConfig,
    pub identity: Arc<IdentityStore>,
    pub sessions: Arc<SessionTable>,
    pub locks: Arc<TaskLockManager>,
    pub fs_notifier: Arc<FsNotifier>,
    pub discussion: Arc<DiscussionBoard>,
    pub edit_coordinator: Arc<dyn EditCoordinator>,
    pub conflict_resolver: Arc<dyn ConflictResolver>,
    pub anti_echo: Arc<dyn AntiEchoPolicy>,
    pub orchestrator: Arc<dyn TaskOrchestrator>,
    pub shutdown: CancellationToken,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub async fn init(config: ServerConfig) -> HubResult<SharedState> {
        config.ensure_scaffold().await?;

        let identity = Arc::new(IdentityStore::load(identity::default_snapshot_path(&config.workspace_dir)).await);
        let sessions = Arc::new(SessionTable::new(Arc::clone(&identity)));
        let locks = Arc::new(TaskLockManager::load(locks::default_claims_path(&config.workspace_dir)).await);
        let fs_notifier = FsNotifier::new();
        let discussion = Arc::new(DiscussionBoard::new(crate::discussion::default_board_path(
            &config.workspace_dir,
        )));

        info!(
            port = config.port,
            workspace = %config.workspace_dir.display(),
            anti_echo = config.enable_anti_echo,
            "agent-hub state initialized"
        );

        Ok(Arc::new(Self {
            config,
            identity,
            sessions,
            locks,
            fs_notifier,
            discussion,
            edit_coordinator: Arc::new(NoopEditCoordinator),
            conflict_resolver: Arc::new(NoopConflictResolver),
            anti_echo: Arc::new(DisabledAntiEchoPolicy),
            orchestrator: Arc::new(PassthroughOrchestrator),
            shutdown: CancellationToken::new(),
            start_time: chrono::Utc::now(),
        }))
    }

    pub fn uptime_secs(&self) -> i64 {
        (chrono::Utc::now() - self.start_time).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_creates_scaffold_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.workspace_dir = dir.path().to_path_buf();

        let state = AppState::init(config).await.unwrap();
        for expected in ["tasks", "messages", "memory", "decisions"] {
            assert!(state.config.workspace_dir.join(expected).is_dir());
        }
        assert!(state.uptime_secs() >= 0);
    }
}
