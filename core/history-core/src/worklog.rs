//! Worklog and history writer.
//!
//! Every mutation is a full read-modify-write executed on the write queue:
//! read the current document (missing/corrupt → empty default), apply the
//! change, recompute aggregates, write primary, then write mirror.
//!
//! The mirror write is not linked to the primary write. When it fails after
//! the primary succeeded, the caller still sees success; the failure is only
//! logged at `warn`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::documents::{
    percentage, read_document, write_document, ActionDraft, ActionEntry, ContextResetEntry,
    CriteriaDocument, Criterion, ExtractedContext, GoalsDocument, HistoryDocument, HistoryEvent,
    PromptEntry, Session, WorkStatus, WorklogDocument, WorklogSummary,
};
use crate::error::{HistoryError, Result};
use crate::queue::WriteQueue;
use crate::storage::{SessionFiles, CRITERIA_FILE, GOALS_FILE, HISTORY_FILE, METADATA_FILE, WORKLOG_FILE};

const CONTEXT_RESET_EVENT: &str = "context_overflow_reset";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub completed: Vec<String>,
    pub remaining: Vec<String>,
    pub completion_percentage: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentContext {
    pub session_id: String,
    pub goals: GoalsDocument,
    pub recent_prompts: Vec<PromptEntry>,
    pub recent_actions: Vec<ActionEntry>,
    pub total_prompts: usize,
    pub total_actions: usize,
    pub summary: WorklogSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub session_id: String,
    pub current_status: WorkStatus,
    pub recent_actions: Vec<ActionEntry>,
    pub summary: WorklogSummary,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct WorklogWriter {
    queue: Arc<WriteQueue>,
}

impl WorklogWriter {
    pub fn new(queue: Arc<WriteQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<WriteQueue> {
        &self.queue
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Mutations (queued)
    // ─────────────────────────────────────────────────────────────────────────────

    /// Appends a prompt to history and folds its context into goals and criteria.
    pub fn log_prompt(
        &self,
        session: &Session,
        text: String,
        context: ExtractedContext,
    ) -> Result<PromptEntry> {
        let session = session.clone();
        self.queue.run(move || {
            let now = Utc::now();
            let entry = PromptEntry {
                timestamp: now,
                text,
                extracted_context: context,
            };

            let mut history: HistoryDocument = read_primary(&session, HISTORY_FILE);
            history.prompts.push(entry.clone());
            history.last_activity = Some(now);
            write_both(&session, HISTORY_FILE, &history)?;

            let mut goals: GoalsDocument = read_primary(&session, GOALS_FILE);
            if !entry.extracted_context.is_empty() {
                goals.merge(&entry.extracted_context);
            }
            write_both(&session, GOALS_FILE, &goals)?;

            let previous: CriteriaDocument = read_primary(&session, CRITERIA_FILE);
            let criteria = CriteriaDocument::regenerate(&previous, &goals, now);
            write_both(&session, CRITERIA_FILE, &criteria)?;

            Ok(entry)
        })
    }

    /// Appends an action entry to the worklog and mirrors it into history.
    pub fn log_action(&self, session: &Session, draft: ActionDraft) -> Result<ActionEntry> {
        let session = session.clone();
        self.queue.run(move || {
            let mut worklog: WorklogDocument = read_primary(&session, WORKLOG_FILE);

            let mut files: Vec<String> = Vec::with_capacity(draft.files_changed.len());
            for file in draft.files_changed {
                if !files.contains(&file) {
                    files.push(file);
                }
            }

            let entry = ActionEntry {
                id: worklog.actions.len() as u64 + 1,
                timestamp: draft.timestamp.unwrap_or_else(Utc::now),
                action: draft.action,
                files_changed: files,
                status: draft.status,
            };

            worklog.actions.push(entry.clone());
            worklog.last_updated = Some(entry.timestamp);
            worklog.summary = WorklogSummary::from_actions(&worklog.actions);
            write_both(&session, WORKLOG_FILE, &worklog)?;

            let mut history: HistoryDocument = read_primary(&session, HISTORY_FILE);
            history.actions.push(HistoryEvent::Action(entry.clone()));
            history.last_activity = Some(entry.timestamp);
            write_both(&session, HISTORY_FILE, &history)?;

            tracing::debug!(
                session_id = %session.id,
                action_id = entry.id,
                status = entry.status.as_str(),
                "Action logged"
            );
            Ok(entry)
        })
    }

    /// Bumps the context-reset counter and records the reset in history.
    pub fn record_context_reset(&self, session: &Session) -> Result<Session> {
        let mut updated = session.clone();
        self.queue.run(move || {
            let now = Utc::now();
            updated.context_resets += 1;
            updated.last_context_reset = Some(now);

            let mut history: HistoryDocument = read_primary(&updated, HISTORY_FILE);
            history.actions.push(HistoryEvent::ContextReset(ContextResetEntry {
                timestamp: now,
                event: CONTEXT_RESET_EVENT.to_string(),
                reset_count: updated.context_resets,
                note: "Assistant context was reset due to overflow, continuing same session"
                    .to_string(),
            }));
            history.last_activity = Some(now);
            write_both(&updated, HISTORY_FILE, &history)?;
            write_both(&updated, METADATA_FILE, &updated)?;
            Ok(updated)
        })
    }

    /// Marks one success criterion satisfied.
    pub fn mark_criteria_complete(
        &self,
        session: &Session,
        index: usize,
        notes: Option<String>,
    ) -> Result<Criterion> {
        let session = session.clone();
        self.queue.run(move || {
            let mut criteria: CriteriaDocument = read_primary(&session, CRITERIA_FILE);
            let len = criteria.criteria.len();
            let criterion = criteria
                .criteria
                .get_mut(index)
                .ok_or(HistoryError::CriteriaIndexOutOfRange { index, len })?;

            criterion.satisfied = true;
            criterion.satisfied_at = Some(Utc::now());
            criterion.notes = notes;
            let updated = criterion.clone();

            write_both(&session, CRITERIA_FILE, &criteria)?;
            Ok(updated)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn history(&self, session: &Session) -> HistoryDocument {
        read_primary(session, HISTORY_FILE)
    }

    pub fn worklog(&self, session: &Session) -> WorklogDocument {
        read_primary(session, WORKLOG_FILE)
    }

    pub fn goals(&self, session: &Session) -> GoalsDocument {
        read_primary(session, GOALS_FILE)
    }

    pub fn criteria(&self, session: &Session) -> CriteriaDocument {
        read_primary(session, CRITERIA_FILE)
    }

    pub fn progress(&self, session: &Session) -> Progress {
        let criteria = self.criteria(session);
        let (done, open): (Vec<&Criterion>, Vec<&Criterion>) =
            criteria.criteria.iter().partition(|c| c.satisfied);
        Progress {
            completion_percentage: percentage(done.len(), criteria.criteria.len()),
            completed: done.into_iter().map(|c| c.requirement.clone()).collect(),
            remaining: open.into_iter().map(|c| c.requirement.clone()).collect(),
        }
    }

    pub fn recent_context(
        &self,
        session: &Session,
        prompt_count: usize,
        action_count: usize,
    ) -> RecentContext {
        let history = self.history(session);
        let worklog = self.worklog(session);
        RecentContext {
            session_id: session.id.clone(),
            goals: self.goals(session),
            total_prompts: history.prompts.len(),
            total_actions: worklog.actions.len(),
            recent_prompts: tail(&history.prompts, prompt_count),
            recent_actions: tail(&worklog.actions, action_count),
            summary: worklog.summary,
        }
    }

    pub fn progress_report(&self, session: &Session) -> ProgressReport {
        let worklog = self.worklog(session);
        ProgressReport {
            session_id: session.id.clone(),
            current_status: worklog.current_status(),
            recent_actions: tail(&worklog.actions, 5),
            summary: worklog.summary,
            last_activity: worklog.last_updated,
        }
    }
}

fn tail<T: Clone>(items: &[T], count: usize) -> Vec<T> {
    items[items.len().saturating_sub(count)..].to_vec()
}

fn read_primary<T>(session: &Session, file: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    read_document(&session.storage_path.join(file))
}

/// Writes primary (errors propagate), then mirror (errors are only logged).
fn write_both<T: Serialize>(session: &Session, file: &str, doc: &T) -> Result<()> {
    write_document(&session.storage_path.join(file), doc)?;
    let mirror = session.backup_path.join(file);
    if let Err(err) = write_document(&mirror, doc) {
        tracing::warn!(
            session_id = %session.id,
            path = %mirror.display(),
            error = %err,
            "Mirror write failed; primary copy is ahead of backup"
        );
    }
    Ok(())
}

/// Reads a session's first prompt, falling back to its first goal.
pub fn session_summary(session_dir: &Path) -> String {
    const MAX_CHARS: usize = 80;
    let files = SessionFiles::new(session_dir);

    let history: HistoryDocument = read_document(&files.history());
    let first = history.prompts.first().map(|p| p.text.clone()).or_else(|| {
        let goals: GoalsDocument = read_document(&files.goals());
        goals.goals.first().cloned()
    });

    match first {
        Some(text) if text.chars().count() > MAX_CHARS => {
            let truncated: String = text.chars().take(MAX_CHARS - 3).collect();
            format!("{}...", truncated)
        }
        Some(text) => text,
        None => "No description available".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::ActionStatus;
    use crate::session::{RetentionPolicy, SessionResolver};
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (WorklogWriter, Session) {
        let queue = Arc::new(WriteQueue::new());
        let resolver = SessionResolver::new(
            temp.path().join("primary"),
            temp.path().join("mirror"),
            RetentionPolicy::default(),
            Arc::clone(&queue),
        );
        let session = resolver.resolve(Path::new("/work/app"), None).unwrap();
        (WorklogWriter::new(queue), session)
    }

    #[test]
    fn log_action_round_trips_and_updates_summary() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);

        let logged = writer
            .log_action(
                &session,
                ActionDraft::new("Refactor parser", ActionStatus::Success)
                    .with_files(vec!["src/parser.rs".into(), "src/parser.rs".into()]),
            )
            .unwrap();
        writer
            .log_action(&session, ActionDraft::new("Run tests", ActionStatus::Failed))
            .unwrap();
        writer
            .log_action(&session, ActionDraft::new("Fix tests", ActionStatus::Success))
            .unwrap();

        let worklog = writer.worklog(&session);
        assert_eq!(worklog.actions[0], logged);
        assert_eq!(logged.id, 1);
        assert_eq!(logged.files_changed, vec!["src/parser.rs"]);
        assert_eq!(worklog.summary.total_actions, 3);
        assert_eq!(worklog.summary.success_rate, 67);
        assert_eq!(worklog.summary.unique_files_modified, 1);

        let history = writer.history(&session);
        assert_eq!(history.actions.len(), 3);
    }

    #[test]
    fn writes_land_in_both_copies() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);
        writer
            .log_action(&session, ActionDraft::new("Mirror me", ActionStatus::Success))
            .unwrap();

        let primary = std::fs::read(session.storage_path.join(WORKLOG_FILE)).unwrap();
        let mirror = std::fs::read(session.backup_path.join(WORKLOG_FILE)).unwrap();
        assert_eq!(primary, mirror);
    }

    #[test]
    fn mirror_write_failure_is_not_reported_to_caller() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);
        std::fs::remove_dir_all(&session.backup_path).unwrap();

        let result = writer.log_action(&session, ActionDraft::new("Still works", ActionStatus::Success));
        assert!(result.is_ok());
        assert_eq!(writer.worklog(&session).actions.len(), 1);
        assert!(!session.backup_path.join(WORKLOG_FILE).exists());
    }

    #[test]
    fn corrupt_worklog_is_treated_as_empty() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);
        std::fs::write(session.storage_path.join(WORKLOG_FILE), "not json").unwrap();

        let entry = writer
            .log_action(&session, ActionDraft::new("Recover", ActionStatus::Partial))
            .unwrap();
        assert_eq!(entry.id, 1);
        assert_eq!(writer.worklog(&session).summary.partial_actions, 1);
    }

    #[test]
    fn log_prompt_updates_goals_and_criteria() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);

        let context = ExtractedContext {
            goals: vec!["Add caching".into()],
            requirements: vec!["Must keep API stable".into()],
            constraints: vec![],
            extracted_at: None,
        };
        writer
            .log_prompt(&session, "Add caching. Must keep API stable.".into(), context)
            .unwrap();

        let history = writer.history(&session);
        assert_eq!(history.prompts.len(), 1);
        assert_eq!(writer.goals(&session).goals, vec!["Add caching"]);

        let progress = writer.progress(&session);
        assert_eq!(progress.remaining.len(), 2);
        assert_eq!(progress.completion_percentage, 0);
    }

    #[test]
    fn mark_criteria_complete_updates_progress() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);
        let context = ExtractedContext {
            goals: vec!["Goal A".into(), "Goal B".into()],
            ..Default::default()
        };
        writer.log_prompt(&session, "...".into(), context).unwrap();

        let criterion = writer
            .mark_criteria_complete(&session, 1, Some("shipped".into()))
            .unwrap();
        assert!(criterion.satisfied);
        assert!(criterion.satisfied_at.is_some());

        let progress = writer.progress(&session);
        assert_eq!(progress.completed, vec!["Goal B"]);
        assert_eq!(progress.completion_percentage, 50);

        let err = writer.mark_criteria_complete(&session, 9, None).unwrap_err();
        assert!(matches!(
            err,
            HistoryError::CriteriaIndexOutOfRange { index: 9, len: 2 }
        ));
    }

    #[test]
    fn context_reset_increments_counter_and_persists_metadata() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);

        let updated = writer.record_context_reset(&session).unwrap();
        assert_eq!(updated.context_resets, 1);

        let on_disk: Session =
            crate::documents::read_required(&session.storage_path.join(METADATA_FILE)).unwrap();
        assert_eq!(on_disk.context_resets, 1);
        assert!(matches!(
            writer.history(&session).actions.last(),
            Some(HistoryEvent::ContextReset(_))
        ));
    }

    #[test]
    fn recent_context_returns_tails() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);
        for i in 0..4 {
            writer
                .log_action(&session, ActionDraft::new(format!("step {}", i), ActionStatus::Success))
                .unwrap();
        }
        let context = writer.recent_context(&session, 5, 2);
        assert_eq!(context.total_actions, 4);
        assert_eq!(context.recent_actions.len(), 2);
        assert_eq!(context.recent_actions[1].action, "step 3");
    }

    #[test]
    fn summary_truncates_first_prompt_and_falls_back() {
        let temp = TempDir::new().unwrap();
        let (writer, session) = setup(&temp);
        assert_eq!(session_summary(&session.storage_path), "No description available");

        writer
            .log_prompt(&session, "x".repeat(120), ExtractedContext::default())
            .unwrap();
        let summary = session_summary(&session.storage_path);
        assert_eq!(summary.chars().count(), 80);
        assert!(summary.ends_with("..."));
    }
}
