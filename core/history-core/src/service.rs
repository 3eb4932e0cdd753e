//! HistoryService - the single owner of all long-lived tracking state.
//!
//! The service is:
//! - **Synchronous**: callers block until their queued writes complete
//! - **Self-contained**: the current session, pending hook operations and the
//!   change watcher live here rather than in process globals
//! - **Non-fatal**: every operation returns a `Result`; nothing exits the process
//!
//! ## Session discovery
//!
//! ```text
//! normal mode:     current ─► newest unexpired session for the project dir ─► NoActiveSession
//! presession mode: current ─► auto-restore latest (if configured)          ─► NoActiveSession
//! ```
//!
//! Only `initialize_session` and `context_reset` ever create a session.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use history_core::{HistoryService, StorageConfig};
//!
//! let service = HistoryService::new(&project_dir, StorageConfig::discover());
//! let session = service.initialize_session(Some("amazon-q"))?;
//! service.log_prompt("Add caching to the parser. It must stay thread-safe.")?;
//! ```

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backup::{BackupManager, RestoreReport, SessionListing};
use crate::config::{self, ConfigResolver, StorageMode};
use crate::context::ContextExtractor;
use crate::documents::{
    ActionDraft, ActionEntry, ActionStatus, Criterion, HistoryDocument, PromptEntry, Session,
    WorklogDocument,
};
use crate::error::{HistoryError, Result};
use crate::git::{self, GitLogQuery};
use crate::hooks::{HookCorrelator, HookEvent, HookInput};
use crate::queue::{QueueStats, WriteQueue};
use crate::session::{RetentionPolicy, SessionResolver};
use crate::storage::{StorageConfig, PROJECT_DIR_NAME};
use crate::validation::{
    absolute_path, validate_action_text, validate_agent_name, validate_path, validate_prompt_text,
};
use crate::watcher::{ChangeWatcher, WatcherOptions, DEFAULT_DEBOUNCE};
use crate::worklog::{Progress, ProgressReport, RecentContext, WorklogWriter};

pub const DEFAULT_RECENT_PROMPTS: usize = 5;
pub const DEFAULT_RECENT_ACTIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// No id given: the sessions available for restore.
    Listing { sessions: Vec<SessionListing> },
    Report(RestoreReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookOutcome {
    /// A `before` event was recorded as pending.
    Pending { operation_id: String },
    /// Entries written for an `after` or `stop` event.
    Recorded { entries: Vec<ActionEntry> },
    /// No active session, unknown event, or unmatched `after`.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchStatus {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    pub tracked_files: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub storage_mode: StorageMode,
    pub active_session: Option<String>,
    pub presession: bool,
    pub queue: QueueStats,
    pub pending_hooks: usize,
    pub watcher_enabled: bool,
}

pub struct HistoryService {
    project_dir: PathBuf,
    storage: StorageConfig,
    presession: bool,
    watcher_debounce: Duration,
    config: Mutex<ConfigResolver>,
    queue: Arc<WriteQueue>,
    writer: WorklogWriter,
    extractor: ContextExtractor,
    current: Mutex<Option<Session>>,
    hooks: Mutex<HookCorrelator>,
    watcher: Mutex<Option<ChangeWatcher>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HistoryService {
    /// Creates a service for `project_dir`. Loads the project config; no other I/O.
    ///
    /// The directory is made absolute and canonical once here, since change
    /// notifications always carry resolved absolute paths.
    pub fn new(project_dir: &Path, storage: StorageConfig) -> Self {
        let project_dir = absolute_path(project_dir);
        let queue = Arc::new(WriteQueue::new());
        Self {
            config: Mutex::new(ConfigResolver::load(&project_dir)),
            project_dir,
            storage,
            presession: false,
            watcher_debounce: DEFAULT_DEBOUNCE,
            writer: WorklogWriter::new(Arc::clone(&queue)),
            queue,
            extractor: ContextExtractor::new(),
            current: Mutex::new(None),
            hooks: Mutex::new(HookCorrelator::default()),
            watcher: Mutex::new(None),
        }
    }

    /// Presession mode never discovers or creates sessions implicitly.
    pub fn with_presession(mut self, presession: bool) -> Self {
        self.presession = presession;
        self
    }

    pub fn with_watcher_debounce(mut self, debounce: Duration) -> Self {
        self.watcher_debounce = debounce;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn config(&self) -> ConfigResolver {
        lock(&self.config).clone()
    }

    pub fn current_session(&self) -> Option<Session> {
        lock(&self.current).clone()
    }

    /// Fails with `ToolDisabled` when project policy blocks `tool`.
    pub fn check_tool(&self, tool: &str) -> Result<()> {
        if lock(&self.config).is_tool_allowed(tool) {
            Ok(())
        } else {
            Err(HistoryError::ToolDisabled(tool.to_string()))
        }
    }

    fn resolver(&self) -> SessionResolver {
        let config = self.config();
        SessionResolver::new(
            config.storage_path(self.storage.storage_root()),
            config.backup_path(self.storage.backup_root()),
            RetentionPolicy {
                ttl_hours: config.session_ttl_hours(),
                prefer_recent: config.prefer_recent_session(),
            },
            Arc::clone(&self.queue),
        )
    }

    fn set_current(&self, session: Session) -> Session {
        *lock(&self.current) = Some(session.clone());
        session
    }

    /// Current session, or an implicitly discovered one. Never creates.
    fn lookup_session(&self) -> Result<Option<Session>> {
        if let Some(session) = self.current_session() {
            return Ok(Some(session));
        }

        let resolver = self.resolver();
        let found = if self.presession {
            if !self.config().restore_latest() {
                return Ok(None);
            }
            match BackupManager::for_resolver(&resolver).auto_restore_latest(&resolver, &self.project_dir) {
                Ok(found) => found,
                Err(err) => {
                    tracing::warn!(code = err.code(), error = %err, "Automatic restore failed; staying in presession");
                    None
                }
            }
        } else {
            resolver.find_for_directory(&self.project_dir, Utc::now())
        };

        Ok(found.map(|session| {
            tracing::debug!(session_id = %session.id, "Activated existing session");
            self.set_current(session)
        }))
    }

    fn active_session(&self) -> Result<Session> {
        self.lookup_session()?.ok_or(HistoryError::NoActiveSession)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finds or creates the session for (project dir, agent) and makes it current.
    pub fn initialize_session(&self, agent: Option<&str>) -> Result<Session> {
        if let Some(agent) = agent {
            validate_agent_name(agent)?;
        }
        let session = self.resolver().resolve(&self.project_dir, agent)?;

        let previous = self.current_session().map(|s| s.id);
        if previous.as_deref() != Some(session.id.as_str()) {
            self.disable_watcher();
        }

        tracing::info!(session_id = %session.id, agent = %session.agent_name, "Session tracking initialized");
        Ok(self.set_current(session))
    }

    /// Records an assistant context reset. Creates a session when none exists.
    pub fn context_reset(&self, agent: Option<&str>) -> Result<Session> {
        let session = match self.lookup_session()? {
            Some(session) => session,
            None => return self.initialize_session(agent),
        };
        let updated = self.writer.record_context_reset(&session)?;
        tracing::info!(session_id = %updated.id, resets = updated.context_resets, "Context reset recorded");
        Ok(self.set_current(updated))
    }

    /// Deletes both copies of the current session. Blocked in project mode.
    pub fn clear_history(&self, confirm: bool) -> Result<Session> {
        if !confirm {
            return Err(HistoryError::Validation(
                "Must set confirm=true to clear history".to_string(),
            ));
        }
        let config = self.config();
        if !config.can_delete() {
            return Err(HistoryError::DeleteBlocked(
                config.storage_path(self.storage.storage_root()),
            ));
        }

        let session = self.active_session()?;
        self.disable_watcher();

        let primary = session.storage_path.clone();
        let mirror = session.backup_path.clone();
        self.queue.run(move || {
            for dir in [&primary, &mirror] {
                match fs_err::remove_dir_all(dir) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(HistoryError::io("removing session directory", err)),
                }
            }
            Ok(())
        })?;

        lock(&self.current).take();
        tracing::info!(session_id = %session.id, "Session history cleared");
        Ok(session)
    }

    /// Lists restorable sessions, or restores `session_id` from the mirror.
    pub fn restore_from_backup(&self, session_id: Option<&str>) -> Result<RestoreOutcome> {
        let manager = BackupManager::for_resolver(&self.resolver());
        match session_id {
            None => Ok(RestoreOutcome::Listing {
                sessions: manager.list_sessions(),
            }),
            Some(id) => manager.restore(id).map(RestoreOutcome::Report),
        }
    }

    /// Switches storage into the project tree and enables delete protection.
    pub fn init_project_storage(&self) -> Result<PathBuf> {
        let path = config::init_project_storage(&self.project_dir)?;
        *lock(&self.config) = ConfigResolver::load(&self.project_dir);
        tracing::info!(config = %path.display(), "Project storage initialized");
        Ok(path)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn log_prompt(&self, prompt: &str) -> Result<PromptEntry> {
        validate_prompt_text(prompt)?;
        let session = self.active_session()?;
        let context = self.extractor.extract(prompt);
        self.writer.log_prompt(&session, prompt.to_string(), context)
    }

    /// Logs an explicit action. File paths must fall inside the allowed roots.
    pub fn log_action(
        &self,
        action: &str,
        files_changed: &[String],
        status: ActionStatus,
    ) -> Result<ActionEntry> {
        validate_action_text(action)?;
        let allowed = self.config().allowed_paths();
        let files = files_changed
            .iter()
            .map(|f| validate_path(f, &self.project_dir, &allowed).map(|p| p.display().to_string()))
            .collect::<Result<Vec<String>>>()?;

        let session = self.active_session()?;
        self.writer
            .log_action(&session, ActionDraft::new(action, status).with_files(files))
    }

    pub fn mark_criteria_complete(&self, index: usize, notes: Option<String>) -> Result<Criterion> {
        let session = self.active_session()?;
        self.writer.mark_criteria_complete(&session, index, notes)
    }

    /// Imports recent commits of the project repository as success actions.
    pub fn import_git_commits(&self, query: &GitLogQuery) -> Result<Vec<ActionEntry>> {
        let session = self.active_session()?;
        let commits = git::read_commits(&self.project_dir, query)?;
        let entries = commits
            .iter()
            .map(|commit| self.writer.log_action(&session, commit.to_action()))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(session_id = %session.id, commits = entries.len(), "Git commits imported");
        Ok(entries)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Hooks
    // ─────────────────────────────────────────────────────────────────────────────

    /// Feeds one hook payload through the correlator.
    ///
    /// Without an active session the event is discarded and `Ignored` returned.
    pub fn process_hook(&self, input: &HookInput) -> Result<HookOutcome> {
        let Some(session) = self.lookup_session()? else {
            tracing::debug!(event = %input.hook_event_name, "Hook ignored; no active session");
            return Ok(HookOutcome::Ignored);
        };

        let now = Utc::now();
        let drafts = match input.to_event() {
            HookEvent::Before {
                tool_name,
                input,
                cwd,
            } => {
                let operation_id = lock(&self.hooks).before(&tool_name, input, cwd, now);
                return Ok(HookOutcome::Pending { operation_id });
            }
            HookEvent::After {
                tool_name,
                input,
                response,
            } => lock(&self.hooks)
                .after(&tool_name, input.as_ref(), response.as_ref(), now)
                .into_iter()
                .collect::<Vec<_>>(),
            HookEvent::Stop => lock(&self.hooks).stop(now),
            HookEvent::Unknown { event_name } => {
                tracing::debug!(event = %event_name, "Unhandled hook event");
                return Ok(HookOutcome::Ignored);
            }
        };

        if drafts.is_empty() {
            return Ok(HookOutcome::Ignored);
        }
        let entries = drafts
            .into_iter()
            .map(|draft| self.writer.log_action(&session, draft))
            .collect::<Result<Vec<_>>>()?;
        Ok(HookOutcome::Recorded { entries })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn get_history(&self) -> Result<HistoryDocument> {
        let session = self.active_session()?;
        Ok(self.writer.history(&session))
    }

    pub fn get_worklog(&self) -> Result<WorklogDocument> {
        let session = self.active_session()?;
        Ok(self.writer.worklog(&session))
    }

    pub fn check_progress(&self) -> Result<Progress> {
        let session = self.active_session()?;
        Ok(self.writer.progress(&session))
    }

    pub fn progress_report(&self) -> Result<ProgressReport> {
        let session = self.active_session()?;
        Ok(self.writer.progress_report(&session))
    }

    pub fn get_recent_context(&self, prompt_count: usize, action_count: usize) -> Result<RecentContext> {
        let session = self.active_session()?;
        Ok(self.writer.recent_context(&session, prompt_count, action_count))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Change watcher
    // ─────────────────────────────────────────────────────────────────────────────

    /// Enables or disables automatic change tracking for the current session.
    pub fn set_auto_tracking(&self, enabled: bool, watch_directory: Option<&str>) -> Result<WatchStatus> {
        if !enabled {
            self.disable_watcher();
            return Ok(self.watch_status());
        }

        let session = self.active_session()?;
        let root = match watch_directory {
            Some(dir) => validate_path(dir, &self.project_dir, &self.config().allowed_paths())?,
            None => self.project_dir.clone(),
        };
        self.disable_watcher();

        let resolver = self.resolver();
        let options = WatcherOptions {
            debounce: self.watcher_debounce,
            protected_roots: vec![
                resolver.storage_root().to_path_buf(),
                resolver.backup_root().to_path_buf(),
                self.project_dir.join(PROJECT_DIR_NAME),
            ],
            ..Default::default()
        };

        let writer = self.writer.clone();
        let sink = move |draft: ActionDraft| {
            if let Err(err) = writer.log_action(&session, draft) {
                tracing::warn!(session_id = %session.id, error = %err, "Failed to log observed change");
            }
        };
        let watcher = ChangeWatcher::start(&root, options, sink)?;
        *lock(&self.watcher) = Some(watcher);
        Ok(self.watch_status())
    }

    pub fn watch_status(&self) -> WatchStatus {
        match lock(&self.watcher).as_ref() {
            Some(watcher) => WatchStatus {
                enabled: true,
                directory: Some(watcher.root().to_path_buf()),
                tracked_files: watcher.tracked_files(),
            },
            None => WatchStatus {
                enabled: false,
                directory: None,
                tracked_files: 0,
            },
        }
    }

    fn disable_watcher(&self) {
        let watcher = lock(&self.watcher).take();
        if let Some(mut watcher) = watcher {
            watcher.disable();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Diagnostics
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            storage_mode: self.config().config().storage_mode,
            active_session: self.current_session().map(|s| s.id),
            presession: self.presession,
            queue: self.queue.stats(),
            pending_hooks: lock(&self.hooks).len(),
            watcher_enabled: lock(&self.watcher).is_some(),
        }
    }

    /// Stops the watcher, then drains and closes the write queue.
    pub fn shutdown(&self) {
        self.disable_watcher();
        self.queue.shutdown();
    }
}

impl Drop for HistoryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
