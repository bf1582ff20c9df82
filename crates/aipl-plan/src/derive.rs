//! Check derivation from natural-language acceptance criteria.
//!
//! Only the unambiguous cases are derived: an `outputs/...` path makes a
//! `file_exists` check, and a "contains" clause upgrades it to
//! `file_contains`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Value, json};

fn outputs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:run_dir/)?outputs/([A-Za-z0-9_./-]+)").expect("static regex")
    })
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("static regex"))
}

fn extract_outputs_paths(text: &str) -> Vec<String> {
    outputs_re()
        .captures_iter(text)
        .map(|caps| format!("outputs/{}", &caps[1]))
        .collect()
}

/// The expected substring after a "contains" clause; quoted content wins.
fn extract_needle(text: &str) -> Option<String> {
    let after = text.split_once("contains").map(|(_, after)| after)?;
    let after = after.trim_matches([' ', ':', ',', '.']);
    if let Some(caps) = quoted_re().captures(after) {
        return Some(caps[1].trim().to_string());
    }
    let trimmed = after.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn derive_checks_from_acceptance(acceptance: &[String]) -> Vec<Value> {
    let mut checks = Vec::new();
    for line in acceptance {
        for path in extract_outputs_paths(line) {
            match extract_needle(line) {
                Some(needle) => checks.push(json!({
                    "type": "file_contains", "path": path, "needle": needle
                })),
                None => checks.push(json!({"type": "file_exists", "path": path})),
            }
        }
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_outputs_path_becomes_file_exists() {
        let checks = derive_checks_from_acceptance(&lines(&["outputs/result.txt exists"]));
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0]["type"], "file_exists");
        assert_eq!(checks[0]["path"], "outputs/result.txt");
    }

    #[test]
    fn test_contains_clause_becomes_file_contains() {
        let checks = derive_checks_from_acceptance(&lines(&[
            "outputs/summary.md contains 'Task and Run'",
        ]));
        assert_eq!(checks[0]["type"], "file_contains");
        assert_eq!(checks[0]["needle"], "Task and Run");
    }

    #[test]
    fn test_unquoted_needle() {
        let checks =
            derive_checks_from_acceptance(&lines(&["outputs/log.txt contains DONE"]));
        assert_eq!(checks[0]["needle"], "DONE");
    }

    #[test]
    fn test_run_dir_prefix_stripped() {
        let checks = derive_checks_from_acceptance(&lines(&["run_dir/outputs/x.json exists"]));
        assert_eq!(checks[0]["path"], "outputs/x.json");
    }

    #[test]
    fn test_lines_without_outputs_paths_yield_nothing() {
        let checks = derive_checks_from_acceptance(&lines(&[
            "the code compiles",
            "user is happy",
        ]));
        assert!(checks.is_empty());
    }

    #[test]
    fn test_multiple_paths_in_one_line() {
        let checks = derive_checks_from_acceptance(&lines(&[
            "outputs/a.txt and outputs/b.txt exist",
        ]));
        assert_eq!(checks.len(), 2);
    }
}
