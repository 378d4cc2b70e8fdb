//! `DISCUSSION_BOARD.md`: the append-only side-effect sink the hub writes
//! chat messages to (§1: "the on-disk discussion board markdown append is
//! a side-effect sink" -- the writer lives in the core, the file itself is
//! external state).

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use hub_session::AgentId;

/// Serializes writes to the board file (§5: "writes are serialized by the
/// hub"). A `tokio::sync::Mutex` rather than an `O_APPEND` open-per-write is
/// used so a single slow write can't interleave with a concurrent one even
/// on filesystems where `O_APPEND` isn't atomic for the write size involved.
pub struct DiscussionBoard {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl DiscussionBoard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn append(
        &self,
        display_name: &str,
        agent_id: &AgentId,
        role: &str,
        perspective: Option<&str>,
        text: &str,
    ) {
        let _guard = self.write_lock.lock().await;
        let timestamp = Utc::now().to_rfc3339();
        let perspective = perspective.unwrap_or("-");
        let entry = format!(
            "- **{timestamp}** `{agent_id}` {display_name} ({role} / {perspective}): {text}\n"
        );

        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "failed to create discussion board parent directory");
                return;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await;

        match file {
            Ok(mut file) => {
                if let Err(e) = file.write_all(entry.as_bytes()).await {
                    warn!(error = %e, "failed to append to discussion board");
                }
            }
            Err(e) => warn!(error = %e, path = %self.path.display(), "failed to open discussion board"),
        }
    }
}

pub fn default_board_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("DISCUSSION_BOARD.md")
}
