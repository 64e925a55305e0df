//! Questionnaire parsing.
//!
//! Turns extracted questionnaire text into an ordered list of question
//! strings. Primary heuristic: numbered items (`1.1 What is ...`), with
//! top-level numbers (`1. General`) treated as section headings and skipped.
//! When a questionnaire carries no numbering at all, any line ending in a
//! question mark is taken as a question. A questionnaire yielding zero
//! questions is rejected as `InvalidInput`.

use crate::error::{PipelineError, Result};

/// Parse questionnaire text into ordered question texts.
pub fn parse_questionnaire(text: &str) -> Result<Vec<String>> {
    let mut questions = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = strip_item_number(line) {
            if !rest.is_empty() {
                questions.push(rest.to_string());
            }
        }
    }

    // No numbered items — fall back to question-mark lines.
    if questions.is_empty() {
        for line in text.lines() {
            let line = line.trim();
            if line.ends_with('?') {
                questions.push(line.to_string());
            }
        }
    }

    if questions.is_empty() {
        return Err(PipelineError::invalid(
            "questionnaire contains no recognizable questions",
        ));
    }

    Ok(questions)
}

/// Strip a `N.M` item prefix (`2.3 How ...` → `How ...`). Returns `None` for
/// lines that are not numbered items; a bare `N.` section heading is also
/// `None`.
fn strip_item_number(line: &str) -> Option<&str> {
    let (prefix, rest) = line.split_once(char::is_whitespace)?;

    let mut parts = prefix.trim_end_matches('.').split('.');
    let major = parts.next()?;
    let minor = parts.next();
    if parts.next().is_some() {
        return None;
    }

    if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    match minor {
        // "1.1 text" — a numbered question.
        Some(m) if !m.is_empty() && m.bytes().all(|b| b.is_ascii_digit()) => Some(rest.trim()),
        // "1. text" — a section heading.
        _ => None,
    }
}
