//! Correlation of before/after tool-use hook events into action entries.
//!
//! ## State Machine
//!
//! ```text
//! NONE ──before──► PENDING ──after (same tool)──► RESOLVED  (one action entry)
//!                     │
//!                     ├──stop──────────────────► ABANDONED (one partial entry)
//!                     └──stale / capacity──────► ABANDONED (dropped)
//! ```
//!
//! `after` takes the first pending entry (insertion order) with the same tool
//! name. Concurrent same-named invocations are therefore ambiguous; no extra
//! disambiguation is attempted.
//!
//! Staleness sweeps are lazy: they only run on the next `before` event.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;

use crate::documents::{ActionDraft, ActionStatus};

/// Maximum number of pending operations kept in memory.
pub const PENDING_CAPACITY: usize = 100;

/// Pending operations older than this are dropped on the next `before`.
pub const PENDING_STALE_SECS: i64 = 5 * 60;

const BASH_SUMMARY_CHARS: usize = 50;

/// Raw hook payload as delivered by the assistant CLI.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HookInput {
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

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    Before {
        tool_name: String,
        input: Value,
        cwd: Option<String>,
    },
    After {
        tool_name: String,
        input: Option<Value>,
        response: Option<Value>,
    },
    Stop,
    Unknown {
        event_name: String,
    },
}

impl HookInput {
    /// Maps the payload onto a correlator event. Accepts camelCase and PascalCase names.
    pub fn to_event(&self) -> HookEvent {
        let tool_name = self.tool_name.clone().unwrap_or_else(|| "unknown".to_string());
        match self.hook_event_name.as_str() {
            "preToolUse" | "PreToolUse" => HookEvent::Before {
                tool_name,
                input: self.tool_input.clone().unwrap_or(Value::Null),
                cwd: self.cwd.clone(),
            },
            "postToolUse" | "PostToolUse" => HookEvent::After {
                tool_name,
                input: self.tool_input.clone(),
                response: self.tool_response.clone(),
            },
            "stop" | "Stop" => HookEvent::Stop,
            other => HookEvent::Unknown {
                event_name: other.to_string(),
            },
        }
    }
}

/// In-memory record of a tool invocation between its before and after events.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub tool_name: String,
    pub input: Value,
    pub start_time: DateTime<Utc>,
    pub cwd: Option<String>,
}

pub struct HookCorrelator {
    pending: VecDeque<(String, PendingOperation)>,
    capacity: usize,
    stale_after: Duration,
    sequence: u64,
}

impl Default for HookCorrelator {
    fn default() -> Self {
        Self::new(PENDING_CAPACITY, Duration::seconds(PENDING_STALE_SECS))
    }
}

impl HookCorrelator {
    pub fn new(capacity: usize, stale_after: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            stale_after,
            sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Records a pending operation and returns its synthetic id.
    pub fn before(
        &mut self,
        tool_name: &str,
        input: Value,
        cwd: Option<String>,
        now: DateTime<Utc>,
    ) -> String {
        let stale_after = self.stale_after;
        let before_sweep = self.pending.len();
        self.pending
            .retain(|(_, op)| now.signed_duration_since(op.start_time) <= stale_after);
        let swept = before_sweep - self.pending.len();
        if swept > 0 {
            tracing::debug!(swept, "Dropped stale pending operations");
        }

        if self.pending.len() >= self.capacity {
            if let Some((evicted, _)) = self.pending.pop_front() {
                tracing::warn!(operation_id = %evicted, "Pending operation table full; evicted oldest");
            }
        }

        self.sequence += 1;
        let id = format!("{}_{}_{}", tool_name, now.to_rfc3339(), self.sequence);
        self.pending.push_back((
            id.clone(),
            PendingOperation {
                tool_name: tool_name.to_string(),
                input,
                start_time: now,
                cwd,
            },
        ));
        id
    }

    /// Resolves the first pending operation with a matching tool name.
    ///
    /// Returns `None` when nothing is pending for this tool.
    pub fn after(
        &mut self,
        tool_name: &str,
        input: Option<&Value>,
        response: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Option<ActionDraft> {
        let index = self
            .pending
            .iter()
            .position(|(_, op)| op.tool_name == tool_name)?;
        let (_, operation) = self.pending.remove(index)?;

        let input = input.unwrap_or(&operation.input);
        let status = if response_signals_failure(response) {
            ActionStatus::Failed
        } else {
            ActionStatus::Success
        };

        Some(
            ActionDraft::new(
                format!("Used {}: {}", tool_name, summarize_tool_action(tool_name, input)),
                status,
            )
            .with_files(extract_files(tool_name, input))
            .at(now),
        )
    }

    /// Converts every pending operation into a partial entry and clears the table.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Vec<ActionDraft> {
        self.pending
            .drain(..)
            .map(|(_, op)| {
                ActionDraft::new(
                    format!("Incomplete {} operation", op.tool_name),
                    ActionStatus::Partial,
                )
                .at(now)
            })
            .collect()
    }
}

fn response_signals_failure(response: Option<&Value>) -> bool {
    let Some(response) = response else {
        return false;
    };
    response.get("success").and_then(Value::as_bool) == Some(false)
        || response.get("is_error").and_then(Value::as_bool) == Some(true)
}

/// Files a tool touched, by tool-specific rules.
pub fn extract_files(tool_name: &str, input: &Value) -> Vec<String> {
    let str_field = |key: &str| input.get(key).and_then(Value::as_str).map(str::to_string);

    match tool_name {
        "fs_write" => str_field("path").into_iter().collect(),
        "fs_read" => input
            .get("operations")
            .and_then(Value::as_array)
            .map(|ops| {
                ops.iter()
                    .filter_map(|op| op.get("path").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        "Write" | "Edit" | "MultiEdit" | "Read" => str_field("file_path").into_iter().collect(),
        "NotebookEdit" => str_field("notebook_path").into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Short human-readable description of a tool call.
pub fn summarize_tool_action(tool_name: &str, input: &Value) -> String {
    let str_field = |key: &str| input.get(key).and_then(Value::as_str);

    match tool_name {
        "fs_write" => format!(
            "{} {}",
            str_field("command").unwrap_or("write"),
            str_field("path").unwrap_or("file")
        ),
        "fs_read" => {
            let count = input
                .get("operations")
                .and_then(Value::as_array)
                .map(|ops| ops.len())
                .unwrap_or(1);
            format!("read {} file(s)", count)
        }
        "execute_bash" | "Bash" => {
            let command: String = str_field("command")
                .unwrap_or("bash command")
                .chars()
                .take(BASH_SUMMARY_CHARS)
                .collect();
            format!("{}...", command)
        }
        "Write" | "Edit" | "MultiEdit" | "Read" => format!(
            "{} {}",
            tool_name.to_lowercase(),
            str_field("file_path").unwrap_or("file")
        ),
        _ => format!("{} operation", tool_name),
    }
}
