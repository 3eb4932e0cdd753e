//! Session documents and their on-disk persistence.
//!
//! Each document is a whole-file JSON snapshot. Mutations always rewrite the
//! full document; nothing is appended in place.
//!
//! ## Persistence rules
//!
//! - **Graceful degradation**: missing or corrupt files read as `Default`
//! - **Atomic writes**: temp file + rename within the target directory
//! - **No clobbering on seed**: `write_document_if_absent` uses create-new
//!
//! All structs use `#[serde(default)]` so older documents keep parsing.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{HistoryError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Session metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// A tracked unit of work for one (directory, agent) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub directory: PathBuf,
    /// Normalized agent slug.
    pub agent_name: String,
    #[serde(default)]
    pub agent_display_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub context_resets: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_context_reset: Option<DateTime<Utc>>,
    pub storage_path: PathBuf,
    pub backup_path: PathBuf,
}

// ═══════════════════════════════════════════════════════════════════════════════
// History
// ═══════════════════════════════════════════════════════════════════════════════

/// Output of the prompt-context extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExtractedContext {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,
}

impl ExtractedContext {
    pub fn is_empty(&self) -> bool {
        self.goals.is_empty() && self.requirements.is_empty() && self.constraints.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "prompt")]
    pub text: String,
    #[serde(default)]
    pub extracted_context: ExtractedContext,
}

/// Marker written into history when the assistant's context window was reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResetEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub reset_count: u32,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryEvent {
    Action(ActionEntry),
    ContextReset(ContextResetEntry),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HistoryDocument {
    #[serde(default)]
    pub prompts: Vec<PromptEntry>,
    #[serde(default)]
    pub actions: Vec<HistoryEvent>,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worklog
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Success,
    Partial,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Partial => "partial",
            ActionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub status: ActionStatus,
}

/// An action before it has been assigned an id and written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionDraft {
    pub action: String,
    pub files_changed: Vec<String>,
    pub status: ActionStatus,
    /// Defaults to the time of writing.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ActionDraft {
    pub fn new(action: impl Into<String>, status: ActionStatus) -> Self {
        Self {
            action: action.into(),
            files_changed: Vec::new(),
            status,
            timestamp: None,
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_changed = files;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorklogSummary {
    #[serde(default)]
    pub total_actions: usize,
    #[serde(default)]
    pub successful_actions: usize,
    #[serde(default)]
    pub failed_actions: usize,
    #[serde(default)]
    pub partial_actions: usize,
    /// Percentage, rounded to the nearest integer.
    #[serde(default)]
    pub success_rate: u32,
    #[serde(default)]
    pub unique_files_modified: usize,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

impl WorklogSummary {
    pub fn from_actions(actions: &[ActionEntry]) -> Self {
        let total = actions.len();
        let count = |status: ActionStatus| actions.iter().filter(|a| a.status == status).count();
        let successful = count(ActionStatus::Success);

        let mut files: Vec<String> = Vec::new();
        for file in actions.iter().flat_map(|a| a.files_changed.iter()) {
            if !files.contains(file) {
                files.push(file.clone());
            }
        }

        Self {
            total_actions: total,
            successful_actions: successful,
            failed_actions: count(ActionStatus::Failed),
            partial_actions: count(ActionStatus::Partial),
            success_rate: percentage(successful, total),
            unique_files_modified: files.len(),
            files_modified: files,
        }
    }
}

/// `round(part / total * 100)`, or 0 for an empty total.
pub fn percentage(part: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((part as f64 / total as f64) * 100.0).round() as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorklogDocument {
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
    #[serde(default)]
    pub summary: WorklogSummary,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Coarse status derived from the tail of the worklog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkStatus {
    Idle,
    Active,
    InProgress,
    Error,
    Struggling,
}

impl WorklogDocument {
    pub fn current_status(&self) -> WorkStatus {
        let Some(last) = self.actions.last() else {
            return WorkStatus::Idle;
        };
        let recent_failures = self
            .actions
            .iter()
            .rev()
            .take(3)
            .filter(|a| a.status == ActionStatus::Failed)
            .count();

        if recent_failures >= 2 {
            WorkStatus::Struggling
        } else if last.status == ActionStatus::Failed {
            WorkStatus::Error
        } else if last.status == ActionStatus::Partial {
            WorkStatus::InProgress
        } else {
            WorkStatus::Active
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Goals & success criteria
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GoalsDocument {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl GoalsDocument {
    /// Merges new context, keeping first-seen order and dropping duplicates.
    pub fn merge(&mut self, context: &ExtractedContext) {
        extend_unique(&mut self.goals, &context.goals);
        extend_unique(&mut self.requirements, &context.requirements);
        extend_unique(&mut self.constraints, &context.constraints);
    }
}

fn extend_unique(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub requirement: String,
    #[serde(default)]
    pub satisfied: bool,
    #[serde(default)]
    pub satisfied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CriteriaDocument {
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl CriteriaDocument {
    /// Rebuilds criteria from goals ∪ requirements.
    ///
    /// Criteria whose text already exists keep their satisfaction state.
    pub fn regenerate(previous: &CriteriaDocument, goals: &GoalsDocument, now: DateTime<Utc>) -> Self {
        let mut criteria: Vec<Criterion> = Vec::new();
        for text in goals.goals.iter().chain(goals.requirements.iter()) {
            if criteria.iter().any(|c| &c.requirement == text) {
                continue;
            }
            let criterion = previous
                .criteria
                .iter()
                .find(|c| &c.requirement == text)
                .cloned()
                .unwrap_or_else(|| Criterion {
                    requirement: text.clone(),
                    satisfied: false,
                    satisfied_at: None,
                    notes: None,
                });
            criteria.push(criterion);
        }
        Self {
            criteria,
            generated_at: Some(now),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persistence helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Reads a document, treating a missing or unparsable file as the default.
pub fn read_document<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return T::default(),
    };
    match serde_json::from_str(&content) {
        Ok(doc) => doc,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "Unparsable document; using default");
            T::default()
        }
    }
}

/// Reads a document that has no meaningful default (e.g. session metadata).
pub fn read_required<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs_err::read_to_string(path).map_err(|e| HistoryError::io("reading document", e))?;
    serde_json::from_str(&content).map_err(|e| HistoryError::Json {
        context: format!("parsing {}", path.display()),
        source: e,
    })
}

fn to_pretty_json<T: Serialize>(doc: &T) -> Result<String> {
    serde_json::to_string_pretty(doc).map_err(|e| HistoryError::Json {
        context: "serializing document".to_string(),
        source: e,
    })
}

/// Writes a whole document atomically (temp file + rename).
pub fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let content = to_pretty_json(doc)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        HistoryError::io(format!("creating temp file in {}", dir.display()), e)
    })?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| HistoryError::io("writing temp file", e))?;
    tmp.flush()
        .map_err(|e| HistoryError::io("flushing temp file", e))?;
    tmp.persist(path).map_err(|e| {
        HistoryError::io(format!("persisting {}", path.display()), e.error)
    })?;
    Ok(())
}

/// Writes a document only if no file exists at `path`. Returns whether it wrote.
pub fn write_document_if_absent<T: Serialize>(path: &Path, doc: &T) -> Result<bool> {
    let content = to_pretty_json(doc)?;
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path);
    match file {
        Ok(mut file) => {
            file.write_all(content.as_bytes())
                .map_err(|e| HistoryError::io(format!("seeding {}", path.display()), e))?;
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(HistoryError::io(format!("seeding {}", path.display()), err)),
    }
}
