//! Request dispatch: protocol checks, tool policy, then one service call.
//!
//! Every outcome becomes a `Response`; failures are error frames, never panics
//! or process exits.

use history_core::{
    ActionStatus, GitLogQuery, HistoryError, HistoryService, HookInput, HookOutcome,
    RestoreOutcome, RestoreReport,
};
use history_protocol::{
    parse_params, ActionStatusParam, AutoTrackParams, ClearHistoryParams, ContextResetParams,
    ErrorInfo, LogActionParams, LogGitCommitsParams, LogPromptParams, MarkCriteriaCompleteParams,
    Method, ProcessHookParams, RecentContextParams, Request, Response, RestoreBackupParams,
    TrackSessionParams, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;

/// Outcome of a method handler: human-readable text plus structured result.
struct Reply {
    text: String,
    result: Option<Value>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            result: None,
        }
    }

    fn with<T: Serialize>(text: impl Into<String>, result: &T) -> Self {
        Self {
            text: text.into(),
            result: serde_json::to_value(result).ok(),
        }
    }
}

enum Failure {
    Protocol(ErrorInfo),
    Core(HistoryError),
}

impl From<ErrorInfo> for Failure {
    fn from(err: ErrorInfo) -> Self {
        Failure::Protocol(err)
    }
}

impl From<HistoryError> for Failure {
    fn from(err: HistoryError) -> Self {
        Failure::Core(err)
    }
}

pub fn handle_request(request: Request, service: &HistoryService) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let method = request.method;
    if !method.is_policy_exempt() {
        if let Err(err) = service.check_tool(method.as_str()) {
            return Response::error(request.id, err.code(), format!("Error: {}", err));
        }
    }

    match dispatch(method, request.params, service) {
        Ok(reply) => Response::text(request.id, reply.text, reply.result),
        Err(Failure::Protocol(info)) => {
            tracing::debug!(method = method.as_str(), code = %info.code, "Rejected request params");
            Response::error_with_info(request.id, info)
        }
        Err(Failure::Core(err)) => {
            tracing::warn!(method = method.as_str(), code = err.code(), error = %err, "Request failed");
            Response::error(request.id, err.code(), format!("Error: {}", err))
        }
    }
}

fn dispatch(method: Method, params: Option<Value>, service: &HistoryService) -> Result<Reply, Failure> {
    match method {
        Method::GetHealth => {
            let health = service.health();
            let mut data = serde_json::to_value(&health).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut data {
                map.insert("pid".into(), Value::from(std::process::id()));
                map.insert("version".into(), Value::from(env!("CARGO_PKG_VERSION")));
                map.insert("protocol_version".into(), Value::from(PROTOCOL_VERSION));
            }
            Ok(Reply {
                text: format!(
                    "ok: {} queued writes completed, {} pending, {} pending hook operations",
                    health.queue.completed, health.queue.pending, health.pending_hooks
                ),
                result: Some(data),
            })
        }

        Method::TrackSession => {
            let params: TrackSessionParams = parse_params(params)?;
            let session = service.initialize_session(params.agent_name.as_deref())?;
            Ok(Reply::with(
                format!(
                    "Session tracking initialized: {}\nDirectory: {}\nAgent: {}",
                    session.id,
                    session.directory.display(),
                    session.agent_name
                ),
                &session,
            ))
        }

        Method::LogPrompt => {
            let params: LogPromptParams = parse_params(params)?;
            let entry = service.log_prompt(&params.prompt)?;
            let context = &entry.extracted_context;
            Ok(Reply::with(
                format!(
                    "Prompt logged. Extracted {} goals and {} requirements.",
                    context.goals.len(),
                    context.requirements.len()
                ),
                &entry,
            ))
        }

        Method::LogAction => {
            let params: LogActionParams = parse_params(params)?;
            let status = match params.status {
                ActionStatusParam::Success => ActionStatus::Success,
                ActionStatusParam::Partial => ActionStatus::Partial,
                ActionStatusParam::Failed => ActionStatus::Failed,
            };
            let entry = service.log_action(&params.action, &params.files_changed, status)?;
            Ok(Reply::with(
                format!("Action logged: {} ({})", entry.action, entry.status.as_str()),
                &entry,
            ))
        }

        Method::GetSessionHistory => {
            let history = service.get_history()?;
            let session = service.current_session();
            let text = serde_json::to_string_pretty(&serde_json::json!({
                "session": session,
                "history": history,
            }))
            .unwrap_or_default();
            Ok(Reply::with(text, &history))
        }

        Method::CheckProgress => {
            let progress = service.check_progress()?;
            let report = service.progress_report()?;
            let text = format!(
                "Progress: {}% complete\nCompleted: {}\nRemaining: {}\nStatus: {}",
                progress.completion_percentage,
                progress.completed.len(),
                progress.remaining.len(),
                serde_json::to_value(report.current_status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            );
            Ok(Reply::with(
                text,
                &serde_json::json!({ "progress": progress, "report": report }),
            ))
        }

        Method::ClearSessionHistory => {
            let params: ClearHistoryParams = parse_params(params)?;
            let session = service.clear_history(params.confirm)?;
            Ok(Reply::text(format!("Session history cleared: {}", session.id)))
        }

        Method::InitProjectStorage => {
            let path = service.init_project_storage()?;
            Ok(Reply::with(
                format!(
                    "Project storage initialized. History will be stored in {} and is delete-protected.",
                    path.parent().unwrap_or(&path).display()
                ),
                &serde_json::json!({ "config_path": path }),
            ))
        }

        Method::RestoreBackup => {
            let params: RestoreBackupParams = parse_params(params)?;
            let outcome = service.restore_from_backup(params.session_id.as_deref())?;
            Ok(Reply::with(restore_text(&outcome), &outcome))
        }

        Method::LogGitCommits => {
            let params: LogGitCommitsParams = parse_params(params)?;
            let query = GitLogQuery {
                since: params.since,
                max_commits: params.max_commits,
                branch: params.branch,
            };
            let entries = service.import_git_commits(&query)?;
            Ok(Reply::with(
                format!("Imported {} git commits into worklog", entries.len()),
                &entries,
            ))
        }

        Method::ProcessHook => {
            let params: ProcessHookParams = parse_params(params)?;
            let event = params.hook_event_name.clone();
            let outcome = service.process_hook(&HookInput {
                hook_event_name: params.hook_event_name,
                cwd: params.cwd,
                tool_name: params.tool_name,
                tool_input: params.tool_input,
                tool_response: params.tool_response,
            })?;
            let text = match &outcome {
                HookOutcome::Ignored if service.current_session().is_none() => {
                    "Hook processed (no active session)".to_string()
                }
                _ => format!("Hook {} processed", event),
            };
            Ok(Reply::with(text, &outcome))
        }

        Method::MarkCriteriaComplete => {
            let params: MarkCriteriaCompleteParams = parse_params(params)?;
            let criterion =
                service.mark_criteria_complete(params.criteria_index, params.completion_notes)?;
            Ok(Reply::with(
                format!("Marked criteria complete: {}", criterion.requirement),
                &criterion,
            ))
        }

        Method::GetRecentContext => {
            let params: RecentContextParams = parse_params(params)?;
            let context = service.get_recent_context(params.prompt_count, params.action_count)?;
            let text = serde_json::to_string_pretty(&context).unwrap_or_default();
            Ok(Reply::with(text, &context))
        }

        Method::AutoTrackOperations => {
            let params: AutoTrackParams = parse_params(params)?;
            let status = service.set_auto_tracking(params.enabled, params.watch_directory.as_deref())?;
            let text = match &status.directory {
                Some(dir) if status.enabled => format!(
                    "Auto-tracking enabled for {} ({} files tracked)",
                    dir.display(),
                    status.tracked_files
                ),
                _ => "Auto-tracking disabled".to_string(),
            };
            Ok(Reply::with(text, &status))
        }

        Method::ContextReset => {
            let params: ContextResetParams = parse_params(params)?;
            let session = service.context_reset(params.agent_name.as_deref())?;
            Ok(Reply::with(
                format!(
                    "Context reset recorded for {} (resets: {})",
                    session.id, session.context_resets
                ),
                &session,
            ))
        }
    }
}

fn restore_text(outcome: &RestoreOutcome) -> String {
    match outcome {
        RestoreOutcome::Listing { sessions } if sessions.is_empty() => {
            "No backup sessions found".to_string()
        }
        RestoreOutcome::Listing { sessions } => {
            let lines: Vec<String> = sessions
                .iter()
                .map(|s| format!("- {}: {}", s.id, s.summary))
                .collect();
            format!(
                "Available backup sessions:\n{}\n\nUse restore_backup with session_id parameter to restore.",
                lines.join("\n")
            )
        }
        RestoreOutcome::Report(RestoreReport::AlreadyPresent { session_id }) => {
            format!("Session {} already exists in primary storage; nothing to restore", session_id)
        }
        RestoreOutcome::Report(RestoreReport::Restored { files, summary, .. }) => format!(
            "Successfully restored session: {}\nFiles restored: {}",
            summary,
            files.join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use history_core::StorageConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn service(temp: &TempDir) -> HistoryService {
        let project = temp.path().join("project");
        std::fs::create_dir_all(&project).unwrap();
        HistoryService::new(
            &project,
            StorageConfig::with_roots(temp.path().join("sessions"), temp.path().join("mirror")),
        )
    }

    fn request(method: Method, params: Value) -> Request {
        Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some("req-1".to_string()),
            params: Some(params),
        }
    }

    fn text(response: &Response) -> String {
        response
            .data
            .as_ref()
            .and_then(|d| d["text"].as_str())
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn protocol_mismatch_is_rejected() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let mut req = request(Method::GetHealth, json!({}));
        req.protocol_version = 99;

        let response = handle_request(req, &service);
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, "protocol_mismatch");
    }

    #[test]
    fn session_dependent_call_without_session_returns_error_frame() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let response = handle_request(request(Method::LogPrompt, json!({"prompt": "hi"})), &service);

        assert!(!response.ok);
        let error = response.error.unwrap();
        assert_eq!(error.code, "no_active_session");
        assert!(error.message.contains("Run track_session first"));
    }

    #[test]
    fn track_then_log_prompt() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);

        let tracked = handle_request(request(Method::TrackSession, json!({"agent_name": "Q"})), &service);
        assert!(tracked.ok);
        assert!(text(&tracked).starts_with("Session tracking initialized: "));
        assert_eq!(tracked.id.as_deref(), Some("req-1"));

        let logged = handle_request(
            request(
                Method::LogPrompt,
                json!({"prompt": "The goal is speed. It must be correct."}),
            ),
            &service,
        );
        assert_eq!(text(&logged), "Prompt logged. Extracted 1 goals and 1 requirements.");
    }

    #[test]
    fn invalid_params_are_reported() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let response = handle_request(request(Method::LogAction, json!({"files_changed": []})), &service);
        assert_eq!(response.error.unwrap().code, "invalid_params");
    }

    #[test]
    fn hook_without_session_is_accepted() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let response = handle_request(
            request(
                Method::ProcessHook,
                json!({"hook_event_name": "preToolUse", "tool_name": "fs_write"}),
            ),
            &service,
        );
        assert!(response.ok);
        assert_eq!(text(&response), "Hook processed (no active session)");
    }

    #[test]
    fn disabled_tool_is_blocked_before_dispatch() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        let config_dir = project.join(".amazon-q-history");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.json"),
            r#"{"tools": {"mode": "allow", "list": ["track_session"]}}"#,
        )
        .unwrap();
        let service = service(&temp);

        let blocked = handle_request(request(Method::LogPrompt, json!({"prompt": "x"})), &service);
        assert_eq!(blocked.error.unwrap().code, "tool_disabled");

        let health = handle_request(request(Method::GetHealth, json!({})), &service);
        assert!(health.ok);
    }

    #[test]
    fn clear_in_project_mode_is_blocked() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        assert!(handle_request(request(Method::InitProjectStorage, json!({})), &service).ok);
        assert!(handle_request(request(Method::TrackSession, json!({})), &service).ok);

        let response = handle_request(
            request(Method::ClearSessionHistory, json!({"confirm": true})),
            &service,
        );
        assert_eq!(response.error.unwrap().code, "delete_blocked");
    }

    #[test]
    fn restore_listing_when_empty() {
        let temp = TempDir::new().unwrap();
        let service = service(&temp);
        let response = handle_request(request(Method::RestoreBackup, json!({})), &service);
        assert_eq!(text(&response), "No backup sessions found");
    }
}
