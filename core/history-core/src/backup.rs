//! Listing and restoring sessions across the primary and mirror stores.
//!
//! Restores copy the mirror directory file by file into a fresh primary
//! directory. The copy is not atomic: a failure part-way through leaves the
//! files copied so far in place and surfaces `PartialRestore`.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::documents::{read_required, Session};
use crate::error::{HistoryError, Result};
use crate::queue::WriteQueue;
use crate::session::{session_id_timestamp, SessionResolver};
use crate::storage::SessionFiles;
use crate::worklog::session_summary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLocation {
    Primary,
    MirrorOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionListing {
    pub id: String,
    pub location: SessionLocation,
    pub summary: String,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreReport {
    AlreadyPresent {
        session_id: String,
    },
    Restored {
        session_id: String,
        files: Vec<String>,
        summary: String,
    },
}

#[derive(Clone)]
pub struct BackupManager {
    storage_root: PathBuf,
    backup_root: PathBuf,
    queue: Arc<WriteQueue>,
}

impl BackupManager {
    pub fn new(storage_root: PathBuf, backup_root: PathBuf, queue: Arc<WriteQueue>) -> Self {
        Self {
            storage_root,
            backup_root,
            queue,
        }
    }

    /// Uses the resolver's roots and write queue.
    pub fn for_resolver(resolver: &SessionResolver) -> Self {
        Self::new(
            resolver.storage_root().to_path_buf(),
            resolver.backup_root().to_path_buf(),
            Arc::clone(resolver.queue()),
        )
    }

    /// Primary sessions, then sessions that only exist in the mirror.
    pub fn list_sessions(&self) -> Vec<SessionListing> {
        let primary = session_dirs(&self.storage_root);
        let primary_ids: HashSet<&str> = primary.iter().map(String::as_str).collect();

        let mirror_only: Vec<String> = session_dirs(&self.backup_root)
            .into_iter()
            .filter(|id| !primary_ids.contains(id.as_str()))
            .collect();

        let mut listings: Vec<SessionListing> = primary
            .iter()
            .map(|id| listing(id, &self.storage_root.join(id), SessionLocation::Primary))
            .collect();
        listings.extend(
            mirror_only
                .iter()
                .map(|id| listing(id, &self.backup_root.join(id), SessionLocation::MirrorOnly)),
        );
        listings
    }

    /// Copies a session from the mirror into primary storage.
    ///
    /// Runs on the write queue so it cannot interleave with document writes.
    pub fn restore(&self, session_id: &str) -> Result<RestoreReport> {
        let mut components = Path::new(session_id).components();
        let single_name = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_name {
            return Err(HistoryError::Validation(format!(
                "Invalid session id: {}",
                session_id
            )));
        }

        let id = session_id.to_string();
        let source = self.backup_root.join(session_id);
        let target = self.storage_root.join(session_id);
        let report = self
            .queue
            .run(move || copy_session(&id, &source, &target))?;

        if let RestoreReport::Restored { session_id, files, .. } = &report {
            tracing::info!(session_id = %session_id, files = files.len(), "Session restored from mirror");
        }
        Ok(report)
    }

    /// Picks the newest session for `directory` and activates it, restoring
    /// it from the mirror first when primary metadata is unreadable.
    ///
    /// Returns `Ok(None)` when there is no candidate.
    pub fn auto_restore_latest(
        &self,
        resolver: &SessionResolver,
        directory: &Path,
    ) -> Result<Option<Session>> {
        let mut candidates: Vec<SessionListing> = self
            .list_sessions()
            .into_iter()
            .filter(|l| l.directory.as_deref() == Some(directory))
            .collect();
        candidates.sort_by_key(|l| Reverse((session_id_timestamp(&l.id), l.id.clone())));

        let Some(latest) = candidates.into_iter().next() else {
            return Ok(None);
        };

        match resolver.load(&latest.id) {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                tracing::debug!(session_id = %latest.id, error = %err, "Activation failed; restoring from mirror");
                self.restore(&latest.id)?;
                resolver.load(&latest.id).map(Some)
            }
        }
    }
}

fn session_dirs(root: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut ids: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    ids.sort();
    ids
}

fn listing(id: &str, dir: &Path, location: SessionLocation) -> SessionListing {
    let directory = read_required::<Session>(&SessionFiles::new(dir).metadata())
        .ok()
        .map(|s| s.directory);
    SessionListing {
        id: id.to_string(),
        location,
        summary: session_summary(dir),
        directory,
    }
}

fn copy_session(session_id: &str, source: &Path, target: &Path) -> Result<RestoreReport> {
    if target.is_dir() {
        return Ok(RestoreReport::AlreadyPresent {
            session_id: session_id.to_string(),
        });
    }
    if !source.is_dir() {
        return Err(HistoryError::RestoreNotFound {
            session_id: session_id.to_string(),
        });
    }

    let mut names: Vec<String> = fs_err::read_dir(source)
        .map_err(|e| HistoryError::io("listing mirror session", e))?
        .flatten()
        .filter(|e| !e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();

    fs_err::create_dir_all(target).map_err(|e| HistoryError::io("creating restore directory", e))?;

    for (copied, name) in names.iter().enumerate() {
        std::fs::copy(source.join(name), target.join(name)).map_err(|err| {
            HistoryError::PartialRestore {
                session_id: session_id.to_string(),
                copied,
                source: err,
            }
        })?;
    }

    Ok(RestoreReport::Restored {
        session_id: session_id.to_string(),
        summary: session_summary(target),
        files: names,
    })
}
