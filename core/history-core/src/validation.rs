//! Input validation applied before any document mutation.
//!
//! Paths must resolve inside an allowed root and must not look like
//! credentials or keys. Free-text inputs are length-capped.

use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::path::{Component, Path, PathBuf};

use crate::error::{HistoryError, Result};

pub const MAX_ACTION_CHARS: usize = 1000;
pub const MAX_PROMPT_CHARS: usize = 10_000;
pub const MAX_AGENT_NAME_CHARS: usize = 100;

struct SensitivePattern {
    label: &'static str,
    regex: Regex,
}

static SENSITIVE_PATTERNS: Lazy<Vec<SensitivePattern>> = Lazy::new(|| {
    [
        ("**/.env*", r"(^|/)\.env[^/]*$"),
        ("**/*.key", r"\.key$"),
        ("**/*.pem", r"\.pem$"),
        ("**/.ssh/**", r"(^|/)\.ssh(/|$)"),
        ("**/secrets/**", r"(^|/)secrets(/|$)"),
        ("**/.aws/**", r"(^|/)\.aws(/|$)"),
        ("**/credentials", r"(^|/)credentials$"),
        ("**/.npmrc", r"(^|/)\.npmrc$"),
        ("**/.pypirc", r"(^|/)\.pypirc$"),
    ]
    .into_iter()
    .map(|(label, pattern)| SensitivePattern {
        label,
        regex: Regex::new(pattern).unwrap(),
    })
    .collect()
});

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Absolute, symlink-free form of `path`.
///
/// Falls back to a lexical join onto the working directory when the path
/// does not exist yet.
pub fn absolute_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs_err::canonicalize(path) {
        return canonical;
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    normalize_lexically(&joined)
}

/// Returns the sensitive pattern `path` matches, if any.
pub fn sensitive_match(path: &Path) -> Option<&'static str> {
    let text = path.to_string_lossy();
    SENSITIVE_PATTERNS
        .iter()
        .find(|pattern| pattern.regex.is_match(&text))
        .map(|pattern| pattern.label)
}

/// Validates a user-supplied path, returning its absolute normalized form.
///
/// Relative paths resolve against `base`.
pub fn validate_path(input: &str, base: &Path, allowed: &[PathBuf]) -> Result<PathBuf> {
    let candidate = Path::new(input);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    };
    let resolved = normalize_lexically(&joined);

    if !allowed.iter().any(|root| resolved.starts_with(root)) {
        return Err(HistoryError::Validation(format!(
            "Path not in allowed paths list: {}",
            input
        )));
    }

    if let Some(label) = sensitive_match(&resolved) {
        return Err(HistoryError::Validation(format!(
            "Access to sensitive path blocked: matches pattern {}",
            label
        )));
    }

    Ok(resolved)
}

pub fn validate_action_text(action: &str) -> Result<()> {
    check_length(action, MAX_ACTION_CHARS, "Action description")
}

pub fn validate_prompt_text(prompt: &str) -> Result<()> {
    check_length(prompt, MAX_PROMPT_CHARS, "Prompt")
}

pub fn validate_agent_name(name: &str) -> Result<()> {
    check_length(name, MAX_AGENT_NAME_CHARS, "Agent name")
}

fn check_length(text: &str, max: usize, what: &str) -> Result<()> {
    if text.chars().count() > max {
        return Err(HistoryError::Validation(format!(
            "{} too long (max {} characters)",
            what, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<PathBuf> {
        vec![PathBuf::from("/work/project")]
    }

        #[test]
    fn absolute_path_resolves_relative_and_missing_paths() {
        let cwd = std::env::current_dir().unwrap();
        let resolved = absolute_path(Path::new("missing-dir/../other"));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("other"));
        assert!(resolved.starts_with(std::fs::canonicalize(&cwd).unwrap()) || resolved.starts_with(&cwd));

        assert_eq!(absolute_path(Path::new(".")), std::fs::canonicalize(&cwd).unwrap());
    }

#[test]
    fn test_normalize_lexically_resolves_dots() {
        assert_eq!(
            normalize_lexically(Path::new("/work/project/./src/../lib.rs")),
            PathBuf::from("/work/project/lib.rs")
        );
    }

    #[test]
    fn test_relative_path_resolves_against_base() {
        let resolved = validate_path("src/main.rs", Path::new("/work/project"), &allowed()).unwrap();
        assert_eq!(resolved, PathBuf::from("/work/project/src/main.rs"));
    }

    #[test]
    fn test_escape_via_parent_dir_is_rejected() {
        let err = validate_path("../other/file.rs", Path::new("/work/project"), &allowed())
            .unwrap_err();
        assert!(matches!(err, HistoryError::Validation(_)));
    }

    #[test]
    fn test_sibling_prefix_is_not_allowed() {
        // starts_with is component-wise, so /work/project-evil is outside /work/project
        assert!(validate_path("/work/project-evil/x", Path::new("/"), &allowed()).is_err());
    }

    #[test]
    fn test_sensitive_paths_are_blocked() {
        for path in [
            "/work/project/.env",
            "/work/project/.env.local",
            "/work/project/certs/server.pem",
            "/work/project/id.key",
            "/work/project/.ssh/config",
            "/work/project/secrets/token.txt",
            "/work/project/.aws/config",
            "/work/project/credentials",
            "/work/project/.npmrc",
            "/work/project/.pypirc",
        ] {
            let err = validate_path(path, Path::new("/"), &allowed()).unwrap_err();
            assert!(
                err.to_string().contains("sensitive path"),
                "expected {} to be blocked",
                path
            );
        }
    }

    #[test]
    fn test_ordinary_files_pass() {
        assert!(validate_path("/work/project/src/environment.rs", Path::new("/"), &allowed()).is_ok());
        assert!(validate_path("/work/project/keys.md", Path::new("/"), &allowed()).is_ok());
    }

    #[test]
    fn test_length_limits() {
        assert!(validate_action_text(&"a".repeat(MAX_ACTION_CHARS)).is_ok());
        assert!(validate_action_text(&"a".repeat(MAX_ACTION_CHARS + 1)).is_err());
        assert!(validate_prompt_text(&"p".repeat(MAX_PROMPT_CHARS + 1)).is_err());
        assert!(validate_agent_name(&"n".repeat(MAX_AGENT_NAME_CHARS + 1)).is_err());
    }
}
