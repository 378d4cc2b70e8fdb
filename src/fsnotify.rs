//! Component D: the filesystem change notifier.
//!
//! Raw `notify` events are debounced per-path (generation-counted so a
//! burst of events within the debounce window collapses to one emission
//! carrying the most recent kind), routed to a typed notification by
//! basename, and fed into a priority queue drained on a fixed tick plus an
//! immediate wake-up for high-priority items.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify as TokioNotify};
use tracing::{debug, warn};

use hub_session::{AgentId, BroadcastBus};

const DEBOUNCE: Duration = Duration::from_millis(100);
const TICK: Duration = Duration::from_millis(100);
const BATCH_SIZE: usize = 5;
const CURSOR_STALE: chrono::Duration = chrono::Duration::seconds(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Add,
    Change,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    TaskBoardUpdated,
    DiscussionUpdated,
    NewMessage,
    FileChanged,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
}

/// Ordered so a max-heap pop yields highest priority first, and among equal
/// priorities the earliest timestamp first (§4.D: "sorted first by priority
/// descending, then by timestamp ascending").
#[derive(Debug, Clone)]
struct QueuedEntry(Notification);

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.timestamp == other.0.timestamp
    }
}
impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.timestamp.cmp(&self.0.timestamp))
    }
}

/// Basename ignore rules (§4.D step 1).
pub fn is_ignored(basename: &str) -> bool {
    basename.starts_with('.')
        || basename.ends_with('~')
        || basename.ends_with(".tmp")
        || basename.ends_with(".lock")
        || basename.contains("node_modules")
}

/// Typed basename routing (§4.D step 2).
pub fn route(path: &Path) -> (NotificationKind, Priority) {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name == "TASK_BOARD.md" {
        (NotificationKind::TaskBoardUpdated, Priority::Medium)
    } else if name == "DISCUSSION_BOARD.md" {
        (NotificationKind::DiscussionUpdated, Priority::High)
    } else if path
        .components()
        .any(|c| c.as_os_str() == "messages")
        && name.ends_with(".json")
    {
        (NotificationKind::NewMessage, Priority::High)
    } else {
        (NotificationKind::FileChanged, Priority::Low)
    }
}

struct DebounceState {
    generation: u64,
    kind: FsEventKind,
}

struct Cursor {
    line: u64,
    updated_at: DateTime<Utc>,
}

pub struct FsNotifier {
    bus: BroadcastBus<Notification>,
    pending: Mutex<HashMap<PathBuf, DebounceState>>,
    queue: Mutex<std::collections::BinaryHeap<QueuedEntry>>,
    wake: Arc<TokioNotify>,
    cursors: Mutex<HashMap<String, Cursor>>,
    /// Open-editor sets have no cross-field invariant with the rest of the
    /// notifier's state, unlike `pending`/`queue` -- a sharded map is safe
    /// here where it wouldn't be for A/B/C's serialized-interface contract.
    editors: DashMap<PathBuf, HashSet<AgentId>>,
    generation_counter: AtomicU64,
}

impl FsNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bus: BroadcastBus::new(1024),
            pending: Mutex::new(HashMap::new()),
            queue: Mutex::new(std::collections::BinaryHeap::new()),
            wake: Arc::new(TokioNotify::new()),
            cursors: Mutex::new(HashMap::new()),
            editors: DashMap::new(),
            generation_counter: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    /// Spawn a `notify` watcher over `paths` plus the consumer loop that
    /// drains the priority queue. Returns once watching has started; the
    /// watcher and consumer run for the lifetime of the returned guard.
    pub fn watch(self: &Arc<Self>, paths: Vec<PathBuf>) -> notify::Result<WatchGuard> {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;

        for path in &paths {
            if let Err(e) = watcher.watch(path, RecursiveMode::Recursive) {
                warn!(path = %path.display(), error = %e, "failed to watch path");
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_raw_event(event).await;
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_consumer().await;
        });

        Ok(WatchGuard { _watcher: watcher })
    }

    async fn handle_raw_event(self: &Arc<Self>, event: notify::Event) {
        let was_rename = matches!(event.kind, notify::EventKind::Modify(notify::event::ModifyKind::Name(_)));
        for path in event.paths {
            self.debounce(path, was_rename).await;
        }
    }

    async fn debounce(self: &Arc<Self>, path: PathBuf, was_rename: bool) {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();
        if is_ignored(&basename) {
            return;
        }

        let kind = if !path.exists() {
            FsEventKind::Remove
        } else if was_rename {
            FsEventKind::Add
        } else {
            FsEventKind::Change
        };

        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut pending = self.pending.lock().await;
            pending.insert(path.clone(), DebounceState { generation, kind });
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            this.fire_if_current(path, generation).await;
        });
    }

    async fn fire_if_current(self: &Arc<Self>, path: PathBuf, generation: u64) {
        let kind = {
            let mut pending = self.pending.lock().await;
            match pending.get(&path) {
                Some(state) if state.generation == generation => {
                    let kind = state.kind;
                    pending.remove(&path);
                    kind
                }
                _ => return,
            }
        };
        self.emit(&path, kind).await;
    }

    async fn emit(self: &Arc<Self>, path: &Path, kind: FsEventKind) {
        let (notification_kind, priority) = route(path);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string();

        let notification = Notification {
            kind: notification_kind,
            payload: json!({
                "kind": match kind {
                    FsEventKind::Add => "add",
                    FsEventKind::Change => "change",
                    FsEventKind::Remove => "remove",
                },
                "path": path.display().to_string(),
                "name": name,
            }),
            timestamp: Utc::now(),
            priority,
        };

        debug!(?notification_kind, ?priority, path = %path.display(), "fs event debounced");

        self.queue.lock().await.push(QueuedEntry(notification));
        if priority == Priority::High {
            self.wake.notify_one();
        }
    }

    async fn run_consumer(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.drain_batch().await;
        }
    }

    async fn drain_batch(&self) {
        let mut queue = self.queue.lock().await;
        let mut drained = Vec::with_capacity(BATCH_SIZE);
        for _ in 0..BATCH_SIZE {
            match queue.pop() {
                Some(entry) => drained.push(entry.0),
                None => break,
            }
        }
        drop(queue);
        for notification in drained {
            self.bus.publish(notification);
        }
    }

    /// Record an explicit cursor position, pruning anything older than the
    /// staleness window on read (§4.D: "Stale state").
    pub async fn set_cursor(&self, key: impl Into<String>, line: u64) {
        self.cursors.lock().await.insert(
            key.into(),
            Cursor {
                line,
                updated_at: Utc::now(),
            },
        );
    }

    pub async fn cursor(&self, key: &str) -> Option<u64> {
        let mut cursors = self.cursors.lock().await;
        let cutoff = Utc::now() - CURSOR_STALE;
        cursors.retain(|_, c| c.updated_at >= cutoff);
        cursors.get(key).map(|c| c.line)
    }

    pub async fn open_editor(&self, path: PathBuf, agent_id: AgentId) {
        self.editors.entry(path).or_default().insert(agent_id);
    }

    /// Removing the last editor clears the entry entirely (§4.D).
    pub async fn close_editor(&self, path: &Path, agent_id: &AgentId) {
        let mut clear = false;
        if let Some(mut set) = self.editors.get_mut(path) {
            set.remove(agent_id);
            clear = set.is_empty();
        }
        if clear {
            self.editors.remove(path);
        }
    }

    pub async fn editors_of(&self, path: &Path) -> Vec<AgentId> {
        self.editors
            .get(path)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct WatchGuard {
    _watcher: RecommendedWatcher,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_rules_cover_spec_list() {
        assert!(is_ignored(".hidden"));
        assert!(is_ignored("backup~"));
        assert!(is_ignored("draft.tmp"));
        assert!(is_ignored("session.lock"));
        assert!(is_ignored("project/node_modules/pkg.json"));
        assert!(!is_ignored("normal.rs"));
    }

    #[test]
    fn routing_matches_basename_table() {
        assert_eq!(
            route(Path::new("/ws/TASK_BOARD.md")).0,
            NotificationKind::TaskBoardUpdated
        );
        assert_eq!(
            route(Path::new("/ws/DISCUSSION_BOARD.md")).0,
            NotificationKind::DiscussionUpdated
        );
        assert_eq!(
            route(Path::new("/ws/messages/1.json")).0,
            NotificationKind::NewMessage
        );
        assert_eq!(
            route(Path::new("/ws/src/lib.rs")).0,
            NotificationKind::FileChanged
        );
    }

    #[test]
    fn priority_assignment_matches_spec() {
        assert_eq!(route(Path::new("DISCUSSION_BOARD.md")).1, Priority::High);
        assert_eq!(route(Path::new("messages/a.json")).1, Priority::High);
        assert_eq!(route(Path::new("TASK_BOARD.md")).1, Priority::Medium);
        assert_eq!(route(Path::new("notes.txt")).1, Priority::Low);
    }

    #[tokio::test]
    async fn burst_of_events_on_same_path_collapses_to_one_emission() {
        let notifier = FsNotifier::new();
        let mut rx = notifier.subscribe();
        let path = PathBuf::from("/tmp/agent-hub-test-file.txt");

        for _ in 0..5 {
            notifier.debounce(path.clone(), false).await;
        }

        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        notifier.drain_batch().await;

        let notification = rx.try_recv().expect("exactly one notification expected");
        assert_eq!(notification.kind, NotificationKind::FileChanged);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn priority_queue_orders_high_before_low_and_ties_by_timestamp() {
        let notifier = FsNotifier::new();
        let now = Utc::now();
        {
            let mut queue = notifier.queue.lock().await;
            queue.push(QueuedEntry(Notification {
                kind: NotificationKind::FileChanged,
                payload: json!({}),
                timestamp: now,
                priority: Priority::Low,
            }));
            queue.push(QueuedEntry(Notification {
                kind: NotificationKind::DiscussionUpdated,
                payload: json!({}),
                timestamp: now + chrono::Duration::milliseconds(5),
                priority: Priority::High,
            }));
            queue.push(QueuedEntry(Notification {
                kind: NotificationKind::NewMessage,
                payload: json!({}),
                timestamp: now,
                priority: Priority::High,
            }));
        }

        let mut rx = notifier.subscribe();
        notifier.drain_batch().await;

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        let third = rx.try_recv().unwrap();

        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.timestamp, now);
        assert_eq!(second.priority, Priority::High);
        assert_eq!(third.priority, Priority::Low);
    }

    #[tokio::test]
    async fn cursor_is_pruned_once_stale() {
        let notifier = FsNotifier::new();
        notifier.set_cursor("file-a", 10).await;
        assert_eq!(notifier.cursor("file-a").await, Some(10));

        {
            let mut cursors = notifier.cursors.lock().await;
            cursors.get_mut("file-a").unwrap().updated_at =
                Utc::now() - chrono::Duration::seconds(31);
        }
        assert_eq!(notifier.cursor("file-a").await, None);
    }

    #[tokio::test]
    async fn removing_last_editor_clears_entry() {
        let notifier = FsNotifier::new();
        let path = PathBuf::from("/ws/a.rs");
        let agent = AgentId::new();
        notifier.open_editor(path.clone(), agent.clone()).await;
        assert_eq!(notifier.editors_of(&path).await.len(), 1);

        notifier.close_editor(&path, &agent).await;
        assert!(notifier.editors_of(&path).await.is_empty());
        assert!(!notifier.editors.contains_key(&path));
    }
}
