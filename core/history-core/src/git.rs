//! Import of recent git commits as worklog actions.
//!
//! `git` is invoked directly (no shell) with a `hash|subject|author|date`
//! header format followed by `--name-only` file lists.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Command;

use crate::documents::{ActionDraft, ActionStatus};
use crate::error::{HistoryError, Result};

static HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{7,64}\|").unwrap());

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitLogQuery {
    pub since: String,
    pub max_commits: u32,
    pub branch: String,
}

impl Default for GitLogQuery {
    fn default() -> Self {
        Self {
            since: "1 hour ago".to_string(),
            max_commits: 10,
            branch: "HEAD".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GitCommit {
    pub hash: String,
    pub subject: String,
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    pub files: Vec<String>,
}

impl GitCommit {
    pub fn to_action(&self) -> ActionDraft {
        let draft = ActionDraft::new(format!("Git commit: {}", self.subject), ActionStatus::Success)
            .with_files(self.files.clone());
        match self.date {
            Some(date) => draft.at(date),
            None => draft,
        }
    }
}

/// Parses `git log --pretty=format:%H|%s|%an|%ai --name-only` output.
///
/// Subjects may contain `|`; author and date are taken from the right.
pub fn parse_git_log(output: &str) -> Vec<GitCommit> {
    let mut commits: Vec<GitCommit> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if HEADER.is_match(line) {
            let (hash, rest) = line.split_once('|').unwrap_or((line, ""));
            let mut tail = rest.rsplitn(3, '|');
            let date = tail.next().unwrap_or_default().trim();
            let author = tail.next().unwrap_or_default().trim();
            let subject = tail.next().unwrap_or_default().trim();
            commits.push(GitCommit {
                hash: hash.to_string(),
                subject: subject.to_string(),
                author: author.to_string(),
                date: DateTime::parse_from_str(date, DATE_FORMAT)
                    .ok()
                    .map(|d| d.with_timezone(&Utc)),
                files: Vec::new(),
            });
        } else if let Some(commit) = commits.last_mut() {
            commit.files.push(line.to_string());
        }
    }

    commits
}

/// Runs `git log` in `repo_dir` and parses the result.
pub fn read_commits(repo_dir: &Path, query: &GitLogQuery) -> Result<Vec<GitCommit>> {
    if query.branch.starts_with('-') {
        return Err(HistoryError::Validation(format!(
            "Invalid branch name: {}",
            query.branch
        )));
    }

    let output = Command::new("git")
        .current_dir(repo_dir)
        .arg("log")
        .arg(&query.branch)
        .arg(format!("--since={}", query.since))
        .arg("-n")
        .arg(query.max_commits.to_string())
        .arg("--pretty=format:%H|%s|%an|%ai")
        .arg("--name-only")
        .arg("--")
        .output()
        .map_err(|e| HistoryError::Git(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not a git repository") {
            return Err(HistoryError::Git(
                "Not a git repository. This tool requires git.".to_string(),
            ));
        }
        return Err(HistoryError::Git(stderr.trim().to_string()));
    }

    Ok(parse_git_log(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = "\
3f2a9c1d0e4b5a6978877665544332211aabbccd|Add parser | lexer split|Ada Lovelace|2026-03-01 10:15:00 +0100
src/parser.rs
src/lexer.rs

9b8a7c6d5e4f30211223344556677889900aabbc|Initial commit|Grace Hopper|2026-02-28 09:00:00 +0000
README.md
";

    #[test]
    fn parses_headers_and_file_lists() {
        let commits = parse_git_log(SAMPLE);
        assert_eq!(commits.len(), 2);

        let first = &commits[0];
        assert_eq!(first.subject, "Add parser | lexer split");
        assert_eq!(first.author, "Ada Lovelace");
        assert_eq!(first.files, vec!["src/parser.rs", "src/lexer.rs"]);
        assert_eq!(
            first.date,
            Some(Utc.with_ymd_and_hms(2026, 3, 1, 9, 15, 0).unwrap())
        );

        assert_eq!(commits[1].files, vec!["README.md"]);
    }

    #[test]
    fn commit_becomes_success_action_at_commit_time() {
        let commits = parse_git_log(SAMPLE);
        let draft = commits[1].to_action();
        assert_eq!(draft.action, "Git commit: Initial commit");
        assert_eq!(draft.status, ActionStatus::Success);
        assert_eq!(draft.timestamp, commits[1].date);
    }

    #[test]
    fn empty_output_yields_no_commits() {
        assert!(parse_git_log("").is_empty());
        assert!(parse_git_log("orphan-file.rs\n").is_empty());
    }

    #[test]
    fn option_like_branch_is_rejected() {
        let query = GitLogQuery {
            branch: "--output=/tmp/x".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            read_commits(Path::new("."), &query),
            Err(HistoryError::Validation(_))
        ));
    }
}
