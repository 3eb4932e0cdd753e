//! Filesystem change watcher for edits made outside explicit logging.
//!
//! ```text
//! notify callback ──► mpsc ──► worker: exclusion filter
//!                                  │
//!                                  ▼
//!                        Debouncer (per-path deadline, bounded)
//!                                  │ deadline passed
//!                                  ▼
//!                 classify vs snapshot ──► ChangeSink::record(draft)
//! ```
//!
//! The worker owns the debounce table. Shutdown drops every outstanding
//! deadline before the thread exits, so nothing fires after `disable`.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::documents::{ActionDraft, ActionStatus};
use crate::error::{HistoryError, Result};
use crate::storage::{is_document_file, METADATA_FILE};
use crate::validation::absolute_path;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_TIMER_CAPACITY: usize = 1000;

const IDLE_POLL: Duration = Duration::from_secs(60);
const EXCLUDED_COMPONENTS: &[&str] = &[".git", "node_modules", "tmp", "temp"];

/// Receives one action per classified change.
pub trait ChangeSink: Send + 'static {
    fn record(&self, draft: ActionDraft);
}

impl<F> ChangeSink for F
where
    F: Fn(ActionDraft) + Send + 'static,
{
    fn record(&self, draft: ActionDraft) {
        self(draft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Deleted,
    Modified,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Modified => "modified",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub debounce: Duration,
    pub timer_capacity: usize,
    /// Session storage and mirror roots; never observed.
    pub protected_roots: Vec<PathBuf>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            timer_capacity: DEFAULT_TIMER_CAPACITY,
            protected_roots: Vec::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Exclusions
// ═══════════════════════════════════════════════════════════════════════════════

/// Paths the watcher must never log, including its own document writes.
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    root: PathBuf,
    protected_roots: Vec<PathBuf>,
}

impl ExclusionRules {
    pub fn new(root: &Path, protected_roots: Vec<PathBuf>) -> Self {
        Self {
            root: root.to_path_buf(),
            protected_roots,
        }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.protected_roots.iter().any(|p| path.starts_with(p)) {
            return true;
        }

        // Components are checked relative to the root so a root that itself
        // lives under e.g. /tmp is still watchable.
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };

        let in_excluded_dir = relative.components().any(|c| match c {
            Component::Normal(name) => name
                .to_str()
                .map(|n| EXCLUDED_COMPONENTS.contains(&n))
                .unwrap_or(false),
            _ => false,
        });
        if in_excluded_dir {
            return true;
        }

        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return false,
        };
        is_document_file(name)
            || name == METADATA_FILE
            || name.ends_with(".log")
            || name.ends_with(".swp")
            || name.ends_with('~')
            || name.starts_with(".tmp")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Debouncing
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-path deadlines with a hard capacity.
///
/// Scheduling a new path at capacity evicts the least recently scheduled one.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    capacity: usize,
    timers: HashMap<PathBuf, (Instant, u64)>,
    sequence: u64,
}

impl Debouncer {
    pub fn new(delay: Duration, capacity: usize) -> Self {
        Self {
            delay,
            capacity: capacity.max(1),
            timers: HashMap::new(),
            sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.timers.contains_key(path)
    }

    /// (Re)starts the deadline for `path`. Returns the evicted path, if any.
    pub fn schedule(&mut self, path: PathBuf, now: Instant) -> Option<PathBuf> {
        self.sequence += 1;
        let deadline = now + self.delay;

        if let Some(timer) = self.timers.get_mut(&path) {
            *timer = (deadline, self.sequence);
            return None;
        }

        let mut evicted = None;
        if self.timers.len() >= self.capacity {
            let oldest = self
                .timers
                .iter()
                .min_by_key(|(_, (_, seq))| *seq)
                .map(|(p, _)| p.clone());
            if let Some(oldest) = oldest {
                self.timers.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.timers.insert(path, (deadline, self.sequence));
        evicted
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|(deadline, _)| *deadline).min()
    }

    /// Removes and returns every path whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut expired: Vec<(PathBuf, u64)> = self
            .timers
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(path, (_, seq))| (path.clone(), *seq))
            .collect();
        expired.sort_by_key(|(_, seq)| *seq);
        for (path, _) in &expired {
            self.timers.remove(path);
        }
        expired.into_iter().map(|(path, _)| path).collect()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Watcher
// ═══════════════════════════════════════════════════════════════════════════════

enum WatchMessage {
    Raw(PathBuf),
    Shutdown,
}

pub struct ChangeWatcher {
    root: PathBuf,
    sender: Sender<WatchMessage>,
    worker: Option<JoinHandle<()>>,
    subscription: Option<RecommendedWatcher>,
    snapshot: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ChangeWatcher {
    /// Snapshots `root` and subscribes to recursive change notifications.
    ///
    /// `root` and the protected roots are resolved to canonical absolute paths
    /// first so they compare equal to the paths notify reports.
    pub fn start(root: &Path, mut options: WatcherOptions, sink: impl ChangeSink) -> Result<Self> {
        let root = absolute_path(root);
        options.protected_roots = options
            .protected_roots
            .iter()
            .map(|p| absolute_path(p))
            .collect();
        let mut watcher = Self::spawn(&root, options, sink);

        let tx = watcher.sender.clone();
        let mut subscription = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths {
                    let _ = tx.send(WatchMessage::Raw(path));
                }
            }
        })
        .map_err(|e| HistoryError::Watcher(format!("creating watcher: {}", e)))?;

        subscription
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| HistoryError::Watcher(format!("watching {}: {}", root.display(), e)))?;
        watcher.subscription = Some(subscription);

        tracing::info!(root = %root.display(), "Change watcher enabled");
        Ok(watcher)
    }

    /// Builds the snapshot and worker without a notification subscription.
    fn spawn(root: &Path, options: WatcherOptions, sink: impl ChangeSink) -> Self {
        let rules = ExclusionRules::new(root, options.protected_roots.clone());
        let snapshot = Arc::new(Mutex::new(scan_files(root, &rules)));
        let (sender, receiver) = mpsc::channel::<WatchMessage>();

        let worker_root = root.to_path_buf();
        let worker_snapshot = Arc::clone(&snapshot);
        let worker = thread::spawn(move || {
            let mut debouncer = Debouncer::new(options.debounce, options.timer_capacity);
            loop {
                let timeout = debouncer
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                    .unwrap_or(IDLE_POLL);

                match receiver.recv_timeout(timeout) {
                    Ok(WatchMessage::Raw(path)) => {
                        if rules.is_excluded(&path) {
                            continue;
                        }
                        if let Some(evicted) = debouncer.schedule(path, Instant::now()) {
                            tracing::warn!(
                                path = %evicted.display(),
                                "Debounce table full; dropped pending change"
                            );
                        }
                    }
                    Ok(WatchMessage::Shutdown) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                for path in debouncer.take_expired(Instant::now()) {
                    let kind = match worker_snapshot.lock() {
                        Ok(mut snapshot) => classify(&mut snapshot, &path),
                        Err(_) => None,
                    };
                    if let Some(kind) = kind {
                        sink.record(change_action(&worker_root, &path, kind));
                    }
                }
            }
            debouncer.clear();
            tracing::debug!("Change watcher worker stopped");
        });

        Self {
            root: root.to_path_buf(),
            sender,
            worker: Some(worker),
            subscription: None,
            snapshot,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of files currently known to exist under the root.
    pub fn tracked_files(&self) -> usize {
        self.snapshot.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Feeds a raw notification for `path` into the debounce stage.
    pub fn observe(&self, path: impl Into<PathBuf>) {
        let _ = self.sender.send(WatchMessage::Raw(path.into()));
    }

    /// Cancels the subscription and every outstanding timer; clears the snapshot.
    pub fn disable(&mut self) {
        self.subscription.take();
        let _ = self.sender.send(WatchMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Change watcher worker panicked");
            }
            tracing::info!(root = %self.root.display(), "Change watcher disabled");
        }
        if let Ok(mut snapshot) = self.snapshot.lock() {
            snapshot.clear();
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.disable();
    }
}

fn scan_files(root: &Path, rules: &ExclusionRules) -> HashSet<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.path() == root || !rules.is_excluded(entry.path()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

fn classify(snapshot: &mut HashSet<PathBuf>, path: &Path) -> Option<ChangeKind> {
    let exists = path.is_file();
    let known = snapshot.contains(path);
    match (known, exists) {
        (false, true) => {
            snapshot.insert(path.to_path_buf());
            Some(ChangeKind::Created)
        }
        (true, false) => {
            snapshot.remove(path);
            Some(ChangeKind::Deleted)
        }
        (true, true) => Some(ChangeKind::Modified),
        // Created and removed inside one debounce window, or a directory.
        (false, false) => None,
    }
}

fn change_action(root: &Path, path: &Path, kind: ChangeKind) -> ActionDraft {
    let shown = path.strip_prefix(root).unwrap_or(path);
    ActionDraft::new(
        format!("File {}: {}", kind.as_str(), shown.display()),
        ActionStatus::Success,
    )
    .with_files(vec![path.display().to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SHORT: Duration = Duration::from_millis(40);
    const NOTIFY_DEBOUNCE: Duration = Duration::from_millis(150);

    fn options() -> WatcherOptions {
        WatcherOptions {
            debounce: SHORT,
            ..Default::default()
        }
    }

    fn collecting_watcher(root: &Path, options: WatcherOptions) -> (ChangeWatcher, mpsc::Receiver<ActionDraft>) {
        let (tx, rx) = mpsc::channel();
        let sink = move |draft: ActionDraft| {
            let _ = tx.send(draft);
        };
        (ChangeWatcher::spawn(root, options, sink), rx)
    }

    #[test]
    fn exclusion_rules_cover_internal_paths() {
        let root = Path::new("/tmp/project");
        let rules = ExclusionRules::new(root, vec![PathBuf::from("/tmp/project/.amazon-q-history")]);

        assert!(rules.is_excluded(Path::new("/tmp/project/.git/HEAD")));
        assert!(rules.is_excluded(Path::new("/tmp/project/web/node_modules/x/index.js")));
        assert!(rules.is_excluded(Path::new("/tmp/project/tmp/scratch.rs")));
        assert!(rules.is_excluded(Path::new("/tmp/project/server.log")));
        assert!(rules.is_excluded(Path::new("/tmp/project/notes/worklog.json")));
        assert!(rules.is_excluded(Path::new("/tmp/project/.amazon-q-history/sessions/a/goals.json")));
        assert!(rules.is_excluded(Path::new("/elsewhere/file.rs")));

        assert!(!rules.is_excluded(Path::new("/tmp/project/src/main.rs")));
    }

    #[test]
    fn debouncer_restarts_existing_timer_without_growing() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100), 10);
        let t0 = Instant::now();
        debouncer.schedule(PathBuf::from("a"), t0);
        debouncer.schedule(PathBuf::from("a"), t0 + Duration::from_millis(80));

        assert_eq!(debouncer.len(), 1);
        assert!(debouncer.take_expired(t0 + Duration::from_millis(120)).is_empty());
        assert_eq!(
            debouncer.take_expired(t0 + Duration::from_millis(180)),
            vec![PathBuf::from("a")]
        );
        assert!(debouncer.is_empty());
    }

    #[test]
    fn debouncer_evicts_oldest_at_capacity() {
        let mut debouncer = Debouncer::new(Duration::from_millis(100), 2);
        let t0 = Instant::now();
        assert_eq!(debouncer.schedule(PathBuf::from("a"), t0), None);
        assert_eq!(debouncer.schedule(PathBuf::from("b"), t0), None);
        assert_eq!(
            debouncer.schedule(PathBuf::from("c"), t0),
            Some(PathBuf::from("a"))
        );
        assert_eq!(debouncer.len(), 2);
        assert!(!debouncer.contains(Path::new("a")));
    }

    #[test]
    fn burst_of_notifications_for_deleted_file_yields_one_entry() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("main.rs");
        std::fs::write(&file, "fn main() {}").unwrap();

        let (mut watcher, rx) = collecting_watcher(temp.path(), options());
        assert_eq!(watcher.tracked_files(), 1);

        std::fs::remove_file(&file).unwrap();
        for _ in 0..5 {
            watcher.observe(&file);
        }

        let draft = rx.recv_timeout(Duration::from_secs(5)).expect("one entry");
        assert_eq!(draft.action, "File deleted: main.rs");
        assert_eq!(draft.files_changed, vec![file.display().to_string()]);
        assert!(rx.recv_timeout(SHORT * 5).is_err());
        assert_eq!(watcher.tracked_files(), 0);

        watcher.disable();
    }

    #[test]
    fn classifies_created_then_modified() {
        let temp = TempDir::new().unwrap();
        let (watcher, rx) = collecting_watcher(temp.path(), options());
        let file = temp.path().join("lib.rs");

        std::fs::write(&file, "a").unwrap();
        watcher.observe(&file);
        let created = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(created.action, "File created: lib.rs");

        std::fs::write(&file, "b").unwrap();
        watcher.observe(&file);
        let modified = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(modified.action, "File modified: lib.rs");
    }

    #[test]
    fn excluded_paths_never_produce_entries() {
        let temp = TempDir::new().unwrap();
        let storage = temp.path().join("store");
        std::fs::create_dir_all(temp.path().join(".git")).unwrap();
        std::fs::create_dir_all(&storage).unwrap();

        let (watcher, rx) = collecting_watcher(
            temp.path(),
            WatcherOptions {
                protected_roots: vec![storage.clone()],
                ..options()
            },
        );

        let paths = [
            temp.path().join(".git").join("index"),
            temp.path().join("history.json"),
            storage.join("notes.txt"),
        ];
        for path in &paths {
            std::fs::write(path, "x").unwrap();
            watcher.observe(path);
        }

        assert!(rx.recv_timeout(SHORT * 6).is_err());
    }

    #[test]
    fn disable_cancels_outstanding_timers() {
        let temp = TempDir::new().unwrap();
        let (mut watcher, rx) = collecting_watcher(
            temp.path(),
            WatcherOptions {
                debounce: Duration::from_millis(300),
                ..Default::default()
            },
        );
        let file = temp.path().join("pending.rs");
        std::fs::write(&file, "x").unwrap();
        watcher.observe(&file);
        watcher.disable();

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        assert_eq!(watcher.tracked_files(), 0);
    }

    fn started_watcher(root: &Path) -> (ChangeWatcher, mpsc::Receiver<ActionDraft>) {
        let (tx, rx) = mpsc::channel();
        let sink = move |draft: ActionDraft| {
            let _ = tx.send(draft);
        };
        let options = WatcherOptions {
            debounce: NOTIFY_DEBOUNCE,
            ..Default::default()
        };
        (ChangeWatcher::start(root, options, sink).unwrap(), rx)
    }

    #[test]
    fn notify_subscription_reports_create_then_delete_once_each() {
        let temp = TempDir::new().unwrap();
        let (mut watcher, rx) = started_watcher(temp.path());
        let file = watcher.root().join("added.rs");

        std::fs::write(&file, "fn added() {}").unwrap();
        let created = rx.recv_timeout(Duration::from_secs(5)).expect("created entry");
        assert_eq!(created.action, "File created: added.rs");
        assert!(rx.recv_timeout(NOTIFY_DEBOUNCE * 4).is_err());

        std::fs::remove_file(&file).unwrap();
        let deleted = rx.recv_timeout(Duration::from_secs(5)).expect("deleted entry");
        assert_eq!(deleted.action, "File deleted: added.rs");
        assert!(rx.recv_timeout(NOTIFY_DEBOUNCE * 4).is_err());

        watcher.disable();
    }

    #[test]
    fn relative_root_is_resolved_before_subscribing() {
        let temp = tempfile::Builder::new().tempdir_in(".").unwrap();
        let relative = PathBuf::from(temp.path().file_name().unwrap());
        let (watcher, rx) = started_watcher(&relative);
        assert!(watcher.root().is_absolute());

        std::fs::write(relative.join("main.rs"), "fn main() {}").unwrap();
        let created = rx.recv_timeout(Duration::from_secs(5)).expect("created entry");
        assert_eq!(created.action, "File created: main.rs");
    }
}
