//! # history-core
//!
//! Session tracking for an AI coding-assistant CLI: prompts, actions and
//! derived goals per (working directory, agent), persisted twice (primary +
//! mirror) for recovery.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Background work runs on std threads.
//! - **One writer**: Every document mutation goes through the `WriteQueue`.
//! - **Graceful degradation**: Missing or corrupt documents read as empty defaults.
//! - **Whole-document snapshots**: Documents are rewritten in full, never appended to.
//! - **Explicit state**: `HistoryService` owns the current session, pending hook
//!   operations and the change watcher.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use history_core::{HistoryService, StorageConfig};
//!
//! let service = HistoryService::new(&std::env::current_dir()?, StorageConfig::discover());
//! service.initialize_session(None)?;
//! service.log_action("Refactor parser", &[], history_core::ActionStatus::Success)?;
//! ```

pub mod backup;
pub mod config;
pub mod context;
pub mod documents;
pub mod error;
pub mod git;
pub mod hooks;
pub mod queue;
pub mod service;
pub mod session;
pub mod storage;
pub mod validation;
pub mod watcher;
pub mod worklog;

pub use backup::{BackupManager, RestoreReport, SessionListing, SessionLocation};
pub use config::{init_project_storage, ConfigResolver, ProjectConfig, StorageMode, ToolMode};
pub use context::ContextExtractor;
pub use documents::*;
pub use error::{HistoryError, Result};
pub use git::{GitCommit, GitLogQuery};
pub use hooks::{HookCorrelator, HookEvent, HookInput};
pub use queue::{QueueStats, WriteQueue};
pub use service::{
    Health, HistoryService, HookOutcome, RestoreOutcome, WatchStatus, DEFAULT_RECENT_ACTIONS,
    DEFAULT_RECENT_PROMPTS,
};
pub use session::{normalize_agent_name, RetentionPolicy, SessionResolver, DEFAULT_AGENT};
pub use storage::StorageConfig;
pub use watcher::{ChangeWatcher, WatcherOptions};
pub use worklog::{Progress, ProgressReport, RecentContext, WorklogWriter};
