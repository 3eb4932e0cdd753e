//! Keyword-based classification of prompt sentences into goals,
//! requirements and constraints.
//!
//! A sentence may land in more than one bucket ("should" is both a goal and
//! a requirement keyword).

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::documents::ExtractedContext;

static SENTENCE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+").unwrap());

const GOAL_KEYWORDS: &[&str] = &[
    "goal",
    "target",
    "objective",
    "aim",
    "purpose",
    "want to",
    "need to",
    "should",
];

const REQUIREMENT_KEYWORDS: &[&str] = &[
    "requirement",
    "must",
    "should",
    "need",
    "require",
    "constraint",
    "condition",
];

const CONSTRAINT_KEYWORDS: &[&str] = &[
    "constraint",
    "limitation",
    "restriction",
    "cannot",
    "avoid",
    "exclude",
    "without",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ContextExtractor;

impl ContextExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, prompt: &str) -> ExtractedContext {
        let sentences = split_sentences(prompt);
        ExtractedContext {
            goals: matching(&sentences, GOAL_KEYWORDS),
            requirements: matching(&sentences, REQUIREMENT_KEYWORDS),
            constraints: matching(&sentences, CONSTRAINT_KEYWORDS),
            extracted_at: Some(Utc::now()),
        }
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    SENTENCE_BREAK
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn matching(sentences: &[&str], keywords: &[&str]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for sentence in sentences {
        let lower = sentence.to_lowercase();
        if keywords.iter().any(|k| lower.contains(k)) && !found.iter().any(|f| f == sentence) {
            found.push(sentence.to_string());
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sentences_by_keyword() {
        let context = ContextExtractor::new().extract(
            "The goal is a faster build. It must run on CI! Avoid new dependencies? Thanks.",
        );
        assert_eq!(context.goals, vec!["The goal is a faster build"]);
        assert_eq!(context.requirements, vec!["It must run on CI"]);
        assert_eq!(context.constraints, vec!["Avoid new dependencies"]);
        assert!(context.extracted_at.is_some());
    }

    #[test]
    fn should_counts_as_goal_and_requirement() {
        let context = ContextExtractor::new().extract("It should be fast");
        assert_eq!(context.goals, vec!["It should be fast"]);
        assert_eq!(context.requirements, vec!["It should be fast"]);
    }

    #[test]
    fn duplicate_sentences_collapse() {
        let context = ContextExtractor::new().extract("We must ship. We must ship.");
        assert_eq!(context.requirements, vec!["We must ship"]);
    }

    #[test]
    fn plain_text_yields_empty_context() {
        assert!(ContextExtractor::new().extract("hello there").is_empty());
        assert!(ContextExtractor::new().extract("").is_empty());
    }
}
