//! Error types for history-core operations.
//!
//! Every variant carries a stable `code()` so call-boundary handlers can
//! render failures as protocol frames without matching on message text.

use std::path::PathBuf;

/// All errors that can occur in history-core operations.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    // ─────────────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No active session. Run track_session first.")]
    NoActiveSession,

    #[error("Success criteria index {index} out of range ({len} criteria)")]
    CriteriaIndexOutOfRange { index: usize, len: usize },

    // ─────────────────────────────────────────────────────────────────────
    // Policy Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("{0}")]
    Validation(String),

    #[error("Tool '{0}' is disabled by project configuration")]
    ToolDisabled(String),

    #[error("Delete blocked: project storage at {0} is delete-protected")]
    DeleteBlocked(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // Backup Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session {session_id} not found in primary or backup storage")]
    RestoreNotFound { session_id: String },

    #[error("Restore of {session_id} interrupted after {copied} file(s): {source}")]
    PartialRestore {
        session_id: String,
        copied: usize,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Write queue is closed")]
    QueueClosed,

    #[error("Queued operation panicked")]
    OperationPanicked,

    #[error("File watcher error: {0}")]
    Watcher(String),

    #[error("Git import failed: {0}")]
    Git(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HistoryError {
    /// Stable machine-readable code for protocol error frames.
    pub fn code(&self) -> &'static str {
        match self {
            HistoryError::NoActiveSession => "no_active_session",
            HistoryError::CriteriaIndexOutOfRange { .. } => "criteria_out_of_range",
            HistoryError::Validation(_) => "validation_failed",
            HistoryError::ToolDisabled(_) => "tool_disabled",
            HistoryError::DeleteBlocked(_) => "delete_blocked",
            HistoryError::RestoreNotFound { .. } => "restore_not_found",
            HistoryError::PartialRestore { .. } => "partial_restore",
            HistoryError::QueueClosed => "queue_closed",
            HistoryError::OperationPanicked => "operation_panicked",
            HistoryError::Watcher(_) => "watcher_error",
            HistoryError::Git(_) => "git_error",
            HistoryError::Io { .. } => "io_error",
            HistoryError::Json { .. } => "json_error",
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        HistoryError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using HistoryError.
pub type Result<T> = std::result::Result<T, HistoryError>;
