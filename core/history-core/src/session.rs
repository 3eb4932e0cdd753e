//! Session resolution: find, reuse, or create a session for (directory, agent).
//!
//! ## Resolution
//!
//! ```text
//! enumerate <storage_root>/*/metadata.json
//!   → keep entries with matching directory + normalized agent
//!   → drop entries older than the TTL (no TTL: nothing expires)
//!   → prefer_recent: newest created_at wins; otherwise listing order
//!   → none left: create + seed documents in both locations
//! ```
//!
//! Seeding never overwrites an existing document, so a racing creator cannot
//! clobber documents that already hold data.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::documents::{
    read_required, write_document, write_document_if_absent, CriteriaDocument, GoalsDocument,
    HistoryDocument, Session, WorklogDocument,
};
use crate::error::{HistoryError, Result};
use crate::queue::WriteQueue;
use crate::storage::SessionFiles;

/// Agent slug used when no agent name is supplied.
pub const DEFAULT_AGENT: &str = "amazon-q";

const ID_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
const ID_TIMESTAMP_LEN: usize = 19;

/// Normalizes an agent name to a stable lowercase slug.
///
/// Unicode letters and digits are kept; every other run becomes one `-`.
/// `normalize_agent_name("My Agent!!") == "my-agent"`
pub fn normalize_agent_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }
    if slug.is_empty() {
        DEFAULT_AGENT.to_string()
    } else {
        slug
    }
}

/// Allocates a sortable, unique session id: `<timestamp>_<agent>_<hash8>`.
pub fn generate_session_id(directory: &Path, agent: &str, now: DateTime<Utc>) -> String {
    let timestamp = now.format(ID_TIMESTAMP_FORMAT).to_string();
    let seed = format!(
        "{}{}{}",
        directory.display(),
        now.to_rfc3339(),
        agent
    );
    let digest = format!("{:x}", md5::compute(seed.as_bytes()));
    format!("{}_{}_{}", timestamp, agent, &digest[..8])
}

/// Parses the creation timestamp embedded at the front of a session id.
pub fn session_id_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let prefix = id.get(..ID_TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(prefix, ID_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Reuse policy applied to existing sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// `None` means no session ever expires.
    pub ttl_hours: Option<u64>,
    pub prefer_recent: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            ttl_hours: None,
            prefer_recent: true,
        }
    }
}

impl RetentionPolicy {
    pub fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        match self.ttl_hours {
            Some(hours) if hours > 0 => {
                let ttl = Duration::hours(i64::try_from(hours).unwrap_or(i64::MAX / 3600));
                now.signed_duration_since(session.created_at) >= ttl
            }
            _ => false,
        }
    }

    /// Picks the session to reuse among valid candidates (in listing order).
    pub fn select(&self, candidates: Vec<Session>) -> Option<Session> {
        if self.prefer_recent {
            candidates.into_iter().max_by_key(|s| s.created_at)
        } else {
            candidates.into_iter().next()
        }
    }
}

#[derive(Clone)]
pub struct SessionResolver {
    storage_root: PathBuf,
    backup_root: PathBuf,
    policy: RetentionPolicy,
    queue: Arc<WriteQueue>,
}

impl SessionResolver {
    pub fn new(
        storage_root: PathBuf,
        backup_root: PathBuf,
        policy: RetentionPolicy,
        queue: Arc<WriteQueue>,
    ) -> Self {
        Self {
            storage_root,
            backup_root,
            policy,
            queue,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn queue(&self) -> &Arc<WriteQueue> {
        &self.queue
    }

    pub fn resolve(&self, directory: &Path, agent: Option<&str>) -> Result<Session> {
        self.resolve_at(directory, agent, Utc::now())
    }

    /// Returns a reusable session inside the TTL window, or creates one.
    pub fn resolve_at(
        &self,
        directory: &Path,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        if let Some(session) = self.find_reusable(directory, agent, now) {
            tracing::debug!(session_id = %session.id, "Reusing existing session");
            return Ok(session);
        }
        self.create(directory, agent, now)
    }

    /// Looks up a reusable session without ever creating one.
    pub fn find_reusable(
        &self,
        directory: &Path,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        let agent = normalize_agent_name(agent.unwrap_or(DEFAULT_AGENT));
        let candidates: Vec<Session> = self
            .list_primary()
            .into_iter()
            .filter(|s| s.directory == directory && normalize_agent_name(&s.agent_name) == agent)
            .filter(|s| !self.policy.is_expired(s, now))
            .collect();
        self.policy.select(candidates)
    }

    /// Looks up an unexpired session for `directory` under any agent.
    pub fn find_for_directory(&self, directory: &Path, now: DateTime<Utc>) -> Option<Session> {
        let candidates: Vec<Session> = self
            .list_primary()
            .into_iter()
            .filter(|s| s.directory == directory && !self.policy.is_expired(s, now))
            .collect();
        self.policy.select(candidates)
    }

    /// Parses every readable session entry under the primary root.
    pub fn list_primary(&self) -> Vec<Session> {
        let entries = match std::fs::read_dir(&self.storage_root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_required::<Session>(&SessionFiles::new(&path).metadata()) {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "Skipping unreadable session entry");
                }
            }
        }
        sessions
    }

    /// Loads a session's metadata from primary storage by id.
    pub fn load(&self, session_id: &str) -> Result<Session> {
        let dir = self.storage_root.join(session_id);
        read_required(&SessionFiles::new(&dir).metadata())
    }

    /// Creates a new session and seeds its documents in both locations.
    pub fn create(
        &self,
        directory: &Path,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let display_name = agent.unwrap_or(DEFAULT_AGENT).trim().to_string();
        let agent_name = normalize_agent_name(&display_name);
        let id = generate_session_id(directory, &agent_name, now);

        let session = Session {
            storage_path: self.storage_root.join(&id),
            backup_path: self.backup_root.join(&id),
            id,
            directory: directory.to_path_buf(),
            agent_name,
            agent_display_name: display_name,
            created_at: now,
            context_resets: 0,
            last_context_reset: None,
        };

        let seeded = session.clone();
        self.queue.run(move || seed_session(&seeded))?;

        tracing::info!(
            session_id = %session.id,
            directory = %session.directory.display(),
            agent = %session.agent_name,
            "Session created"
        );
        Ok(session)
    }
}

fn seed_session(session: &Session) -> Result<()> {
    for dir in [&session.storage_path, &session.backup_path] {
        fs_err::create_dir_all(dir)
            .map_err(|e| HistoryError::io("creating session directory", e))?;

        let files = SessionFiles::new(dir);
        write_document(&files.metadata(), session)?;
        write_document_if_absent(
            &files.history(),
            &HistoryDocument {
                last_activity: Some(session.created_at),
                ..Default::default()
            },
        )?;
        write_document_if_absent(&files.goals(), &GoalsDocument::default())?;
        write_document_if_absent(
            &files.criteria(),
            &CriteriaDocument {
                generated_at: Some(session.created_at),
                ..Default::default()
            },
        )?;
        write_document_if_absent(
            &files.worklog(),
            &WorklogDocument {
                last_updated: Some(session.created_at),
                ..Default::default()
            },
        )?;
    }
    Ok(())
}
