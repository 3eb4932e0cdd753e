//! Project configuration: storage placement, tool permissions, path roots
//! and session retention.
//!
//! Loaded from `<project>/.amazon-q-history/config.json`. A missing or
//! corrupt file never fails the caller; it degrades to server mode.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HistoryError, Result};
use crate::storage::PROJECT_DIR_NAME;

const CONFIG_FILE: &str = "config.json";
const WORKSPACE_EXTENSION: &str = "code-workspace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Server,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolMode {
    #[default]
    All,
    Allow,
    Deny,
    /// Anything else found on disk; corrected to `All` on load.
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    #[serde(default)]
    pub mode: ToolMode,
    #[serde(default)]
    pub list: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// On-disk project configuration. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub tools: ToolPolicy,
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    /// 0 or absent means sessions never expire.
    #[serde(default)]
    pub session_ttl_hours: Option<u64>,
    #[serde(default = "default_true")]
    pub prefer_recent_session: bool,
    #[serde(default)]
    pub restore_latest: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::Server,
            tools: ToolPolicy::default(),
            allowed_paths: Vec::new(),
            session_ttl_hours: None,
            prefer_recent_session: true,
            restore_latest: false,
            created_at: None,
        }
    }
}

/// Returns the path to a project's config file.
pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(PROJECT_DIR_NAME).join(CONFIG_FILE)
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    project_dir: PathBuf,
    config: ProjectConfig,
}

impl ConfigResolver {
    /// Loads the project config, falling back to server mode on absence or corruption.
    pub fn load(project_dir: &Path) -> Self {
        let path = config_path(project_dir);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<ProjectConfig>(&content) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "Project config is malformed; using server-mode defaults"
                    );
                    ProjectConfig::default()
                }
            },
            Err(_) => ProjectConfig::default(),
        };

        if config.tools.mode == ToolMode::Unrecognized {
            tracing::warn!(
                path = %path.display(),
                "Unrecognized tools.mode in project config; falling back to 'all'"
            );
            config.tools.mode = ToolMode::All;
        }

        Self {
            project_dir: project_dir.to_path_buf(),
            config,
        }
    }

    /// Builds a resolver from an in-memory config (used by tests and after init).
    pub fn from_config(project_dir: &Path, config: ProjectConfig) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            config,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn is_project_mode(&self) -> bool {
        self.config.storage_mode == StorageMode::Project
    }

    /// Primary session root: project tree in project mode, otherwise `default_root`.
    pub fn storage_path(&self, default_root: &Path) -> PathBuf {
        if self.is_project_mode() {
            self.project_dir.join(PROJECT_DIR_NAME).join("sessions")
        } else {
            default_root.to_path_buf()
        }
    }

    /// Mirror session root: project tree in project mode, otherwise `default_root`.
    pub fn backup_path(&self, default_root: &Path) -> PathBuf {
        if self.is_project_mode() {
            self.project_dir.join(PROJECT_DIR_NAME).join("backup")
        } else {
            default_root.to_path_buf()
        }
    }

    pub fn is_tool_allowed(&self, name: &str) -> bool {
        let listed = self.config.tools.list.iter().any(|entry| entry == name);
        match self.config.tools.mode {
            ToolMode::Allow => listed,
            ToolMode::Deny => !listed,
            ToolMode::All | ToolMode::Unrecognized => true,
        }
    }

    /// Project-mode storage is delete-protected.
    pub fn can_delete(&self) -> bool {
        !self.is_project_mode()
    }

    /// Session TTL in hours; `None` when unset or zero.
    pub fn session_ttl_hours(&self) -> Option<u64> {
        self.config.session_ttl_hours.filter(|hours| *hours > 0)
    }

    pub fn prefer_recent_session(&self) -> bool {
        self.config.prefer_recent_session
    }

    pub fn restore_latest(&self) -> bool {
        self.config.restore_latest
    }

    /// Project dir ∪ configured roots ∪ workspace-folder roots, deduplicated in order.
    pub fn allowed_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.project_dir.clone()];
        for extra in &self.config.allowed_paths {
            if extra.is_absolute() {
                paths.push(extra.clone());
            } else {
                paths.push(self.project_dir.join(extra));
            }
        }
        if let Some(workspace) = find_workspace_file(&self.project_dir) {
            paths.extend(parse_workspace_folders(&workspace));
        }

        let mut unique: Vec<PathBuf> = Vec::with_capacity(paths.len());
        for path in paths {
            if !unique.contains(&path) {
                unique.push(path);
            }
        }
        unique
    }
}

/// Writes a project-mode config for `project_dir`, preserving other settings.
pub fn init_project_storage(project_dir: &Path) -> Result<PathBuf> {
    let path = config_path(project_dir);
    let mut config = ConfigResolver::load(project_dir).config;
    config.storage_mode = StorageMode::Project;
    config.created_at = Some(Utc::now().to_rfc3339());

    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)
            .map_err(|e| HistoryError::io("creating project config directory", e))?;
    }
    let content = serde_json::to_string_pretty(&config).map_err(|e| HistoryError::Json {
        context: "serializing project config".to_string(),
        source: e,
    })?;
    fs_err::write(&path, content).map_err(|e| HistoryError::io("writing project config", e))?;
    Ok(path)
}

/// Finds a `*.code-workspace` file in `start` or its ancestors.
fn find_workspace_file(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(WORKSPACE_EXTENSION)
                && path.is_file()
            {
                return Some(path);
            }
        }
    }
    None
}

fn parse_workspace_folders(workspace_path: &Path) -> Vec<PathBuf> {
    #[derive(Deserialize)]
    struct Folder {
        path: PathBuf,
    }

    #[derive(Deserialize)]
    struct Workspace {
        #[serde(default)]
        folders: Vec<Folder>,
    }

    let workspace_dir = workspace_path.parent().unwrap_or_else(|| Path::new("/"));
    std::fs::read_to_string(workspace_path)
        .ok()
        .and_then(|content| serde_json::from_str::<Workspace>(&content).ok())
        .map(|workspace| {
            workspace
                .folders
                .into_iter()
                .map(|folder| crate::validation::normalize_lexically(&workspace_dir.join(folder.path)))
                .collect()
        })
        .unwrap_or_default()
}
