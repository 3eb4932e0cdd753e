//! Line protocol types and parameter validation for history-server.
//!
//! This crate is shared by the server and its clients to prevent schema drift.
//! The server remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.
//!
//! One request per line on stdin, one response per line on stdout:
//!
//! ```text
//! {"protocol_version":1,"method":"log_prompt","id":"7","params":{"prompt":"..."}}
//! {"ok":true,"id":"7","data":{"text":"Prompt logged. ...","result":{...}}}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

pub const MAX_RECENT_ITEMS: usize = 1000;
pub const MAX_GIT_COMMITS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    TrackSession,
    LogPrompt,
    LogAction,
    GetSessionHistory,
    CheckProgress,
    ClearSessionHistory,
    InitProjectStorage,
    RestoreBackup,
    LogGitCommits,
    ProcessHook,
    MarkCriteriaComplete,
    GetRecentContext,
    AutoTrackOperations,
    ContextReset,
}

impl Method {
    /// Name used in tool permission lists.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetHealth => "get_health",
            Method::TrackSession => "track_session",
            Method::LogPrompt => "log_prompt",
            Method::LogAction => "log_action",
            Method::GetSessionHistory => "get_session_history",
            Method::CheckProgress => "check_progress",
            Method::ClearSessionHistory => "clear_session_history",
            Method::InitProjectStorage => "init_project_storage",
            Method::RestoreBackup => "restore_backup",
            Method::LogGitCommits => "log_git_commits",
            Method::ProcessHook => "process_hook",
            Method::MarkCriteriaComplete => "mark_criteria_complete",
            Method::GetRecentContext => "get_recent_context",
            Method::AutoTrackOperations => "auto_track_operations",
            Method::ContextReset => "context_reset",
        }
    }

    /// Diagnostics are always reachable, whatever the tool policy says.
    pub fn is_policy_exempt(&self) -> bool {
        matches!(self, Method::GetHealth)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    /// Success carrying a human-readable `text` plus an optional structured `result`.
    pub fn text(id: Option<String>, text: impl Into<String>, result: Option<Value>) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("text".to_string(), Value::String(text.into()));
        if let Some(result) = result {
            data.insert("result".to_string(), result);
        }
        Self::ok(id, Value::Object(data))
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parameters
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TrackSessionParams {
    #[serde(default)]
    pub agent_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogPromptParams {
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatusParam {
    #[default]
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogActionParams {
    pub action: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub status: ActionStatusParam,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ClearHistoryParams {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RestoreBackupParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_since() -> String {
    "1 hour ago".to_string()
}

fn default_max_commits() -> u32 {
    10
}

fn default_branch() -> String {
    "HEAD".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogGitCommitsParams {
    #[serde(default = "default_since")]
    pub since: String,
    #[serde(default = "default_max_commits")]
    pub max_commits: u32,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for LogGitCommitsParams {
    fn default() -> Self {
        Self {
            since: default_since(),
            max_commits: default_max_commits(),
            branch: default_branch(),
        }
    }
}

/// Hook payload. Unknown fields are tolerated; the CLI adds fields over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHookParams {
    pub hook_event_name: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_response: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkCriteriaCompleteParams {
    pub criteria_index: usize,
    #[serde(default)]
    pub completion_notes: Option<String>,
}

fn default_prompt_count() -> usize {
    5
}

fn default_action_count() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecentContextParams {
    #[serde(default = "default_prompt_count")]
    pub prompt_count: usize,
    #[serde(default = "default_action_count")]
    pub action_count: usize,
}

impl Default for RecentContextParams {
    fn default() -> Self {
        Self {
            prompt_count: default_prompt_count(),
            action_count: default_action_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoTrackParams {
    pub enabled: bool,
    #[serde(default)]
    pub watch_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ContextResetParams {
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Shape checks that do not need server state.
pub trait ValidateParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        Ok(())
    }
}

impl ValidateParams for TrackSessionParams {}
impl ValidateParams for LogActionParams {}
impl ValidateParams for ClearHistoryParams {}
impl ValidateParams for MarkCriteriaCompleteParams {}
impl ValidateParams for AutoTrackParams {}
impl ValidateParams for ContextResetParams {}

impl ValidateParams for LogPromptParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_string(&self.prompt, "prompt")
    }
}

impl ValidateParams for RestoreBackupParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        match &self.session_id {
            Some(id) => require_string(id, "session_id"),
            None => Ok(()),
        }
    }
}

impl ValidateParams for LogGitCommitsParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_string(&self.since, "since")?;
        require_string(&self.branch, "branch")?;
        if self.max_commits == 0 || self.max_commits > MAX_GIT_COMMITS {
            return Err(ErrorInfo::new(
                "invalid_params",
                format!("max_commits must be between 1 and {}", MAX_GIT_COMMITS),
            ));
        }
        Ok(())
    }
}

impl ValidateParams for ProcessHookParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_string(&self.hook_event_name, "hook_event_name")
    }
}

impl ValidateParams for RecentContextParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        if self.prompt_count > MAX_RECENT_ITEMS || self.action_count > MAX_RECENT_ITEMS {
            return Err(ErrorInfo::new(
                "invalid_params",
                format!("counts must be {} or fewer", MAX_RECENT_ITEMS),
            ));
        }
        Ok(())
    }
}

/// Parses and validates method parameters. Absent params parse as `{}`.
pub fn parse_params<T>(params: Option<Value>) -> Result<T, ErrorInfo>
where
    T: DeserializeOwned + ValidateParams,
{
    let value = match params {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(value) => value,
    };
    let parsed: T = serde_json::from_value(value).map_err(|err| {
        ErrorInfo::new("invalid_params", format!("params are invalid: {}", err))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

fn require_string(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}
