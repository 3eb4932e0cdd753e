//! Storage roots and per-session path layout.
//!
//! Every session lives in two physically independent directories:
//!
//! ```text
//! <storage_root>/<session_id>/{metadata,history,goals,success-criteria,worklog}.json
//! <backup_root>/<session_id>/...   (byte-identical mirror)
//! ```
//!
//! Production code uses `StorageConfig::discover()`.
//! Tests use `StorageConfig::with_roots(..)` for isolation.

use std::env;
use std::path::{Path, PathBuf};

/// Subfolder of the OS temp directory that holds the mirror copies.
pub const BACKUP_DIR_NAME: &str = "amazon-q-history";

/// Project-local directory holding config, and in project mode, session data.
pub const PROJECT_DIR_NAME: &str = ".amazon-q-history";

pub const METADATA_FILE: &str = "metadata.json";
pub const HISTORY_FILE: &str = "history.json";
pub const GOALS_FILE: &str = "goals.json";
pub const CRITERIA_FILE: &str = "success-criteria.json";
pub const WORKLOG_FILE: &str = "worklog.json";

/// The four session documents seeded on creation and rewritten on mutation.
pub const DOCUMENT_FILES: [&str; 4] = [HISTORY_FILE, GOALS_FILE, CRITERIA_FILE, WORKLOG_FILE];

/// Default server-mode roots for session storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Primary session root (default: `<install>/storage/sessions`)
    storage_root: PathBuf,
    /// Mirror session root (default: `<tmp>/amazon-q-history`)
    backup_root: PathBuf,
    /// Server log directory (default: `<install>/logs`)
    log_dir: PathBuf,
}

impl StorageConfig {
    /// Resolves roots from the environment, then the running executable's location.
    pub fn discover() -> Self {
        let install_dir = install_dir();
        let storage_root = env::var_os("HISTORY_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| install_dir.join("storage").join("sessions"));
        let backup_root = env::var_os("HISTORY_BACKUP_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join(BACKUP_DIR_NAME));
        Self {
            storage_root,
            backup_root,
            log_dir: install_dir.join("logs"),
        }
    }

    /// Creates a StorageConfig with explicit roots.
    /// Logs go next to the primary root.
    pub fn with_roots(storage_root: PathBuf, backup_root: PathBuf) -> Self {
        let log_dir = storage_root
            .parent()
            .map(|p| p.join("logs"))
            .unwrap_or_else(|| storage_root.join("logs"));
        Self {
            storage_root,
            backup_root,
            log_dir,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

/// Directory containing the running executable, or the platform data dir.
fn install_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| dirs::data_local_dir().map(|d| d.join(BACKUP_DIR_NAME)))
        .unwrap_or_else(|| env::temp_dir().join(BACKUP_DIR_NAME))
}

/// Paths to one session's documents in a single location (primary or mirror).
#[derive(Debug, Clone, Copy)]
pub struct SessionFiles<'a> {
    dir: &'a Path,
}

impl<'a> SessionFiles<'a> {
    pub fn new(dir: &'a Path) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        self.dir
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn history(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    pub fn goals(&self) -> PathBuf {
        self.dir.join(GOALS_FILE)
    }

    pub fn criteria(&self) -> PathBuf {
        self.dir.join(CRITERIA_FILE)
    }

    pub fn worklog(&self) -> PathBuf {
        self.dir.join(WORKLOG_FILE)
    }
}

/// True if `name` is one of the four session document filenames.
pub fn is_document_file(name: &str) -> bool {
    DOCUMENT_FILES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_roots_sets_paths() {
        let config = StorageConfig::with_roots(
            PathBuf::from("/srv/history/sessions"),
            PathBuf::from("/tmp/amazon-q-history"),
        );
        assert_eq!(config.storage_root(), Path::new("/srv/history/sessions"));
        assert_eq!(config.backup_root(), Path::new("/tmp/amazon-q-history"));
        assert_eq!(config.log_dir(), Path::new("/srv/history/logs"));
    }

    #[test]
    fn test_discover_backup_root_is_under_temp() {
        if env::var_os("HISTORY_BACKUP_ROOT").is_some() {
            return;
        }
        let config = StorageConfig::discover();
        assert!(config.backup_root().ends_with(BACKUP_DIR_NAME));
    }

    #[test]
    fn test_session_files_layout() {
        let dir = PathBuf::from("/s/2026-01-01T00-00-00_agent_abcd1234");
        let files = SessionFiles::new(&dir);
        assert_eq!(files.metadata(), dir.join("metadata.json"));
        assert_eq!(files.history(), dir.join("history.json"));
        assert_eq!(files.goals(), dir.join("goals.json"));
        assert_eq!(files.criteria(), dir.join("success-criteria.json"));
        assert_eq!(files.worklog(), dir.join("worklog.json"));
    }

    #[test]
    fn test_is_document_file() {
        assert!(is_document_file("worklog.json"));
        assert!(is_document_file("success-criteria.json"));
        assert!(!is_document_file("metadata.json"));
        assert!(!is_document_file("main.rs"));
    }
}
