//! Failure categorization and diagnosis reports.

use serde::{Deserialize, Serialize};

use aipl_core::Reason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    SyntaxError,
    RuntimeError,
    DependencyError,
    LogicError,
    EnvironmentError,
    TimeoutError,
    PermissionError,
    Unknown,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::SyntaxError => "syntax_error",
            FailureCategory::RuntimeError => "runtime_error",
            FailureCategory::DependencyError => "dependency_error",
            FailureCategory::LogicError => "logic_error",
            FailureCategory::EnvironmentError => "environment_error",
            FailureCategory::TimeoutError => "timeout_error",
            FailureCategory::PermissionError => "permission_error",
            FailureCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Keyword buckets, first match wins. The `error_type` (reason kind) is
/// checked before free-text summaries.
pub fn categorize(error_type: &str, summary: &str) -> FailureCategory {
    let haystack = format!("{error_type} {summary}").to_lowercase();
    let buckets: [(&[&str], FailureCategory); 7] = [
        (
            &["command_timeout", "timeout", "timed out"],
            FailureCategory::TimeoutError,
        ),
        (
            &["permission", "access denied", "not_allowed", "eacces"],
            FailureCategory::PermissionError,
        ),
        (
            &["syntaxerror", "syntax error", "parse error", "unexpected token", "indentationerror"],
            FailureCategory::SyntaxError,
        ),
        (
            &[
                "modulenotfounderror",
                "importerror",
                "no module named",
                "cannot find module",
                "dependency",
                "package not found",
            ],
            FailureCategory::DependencyError,
        ),
        (
            &["command not found", "no such file", "environment", "env var", "missing_file"],
            FailureCategory::EnvironmentError,
        ),
        (
            &["assertionerror", "assert", "expected", "content_mismatch", "pattern_not_found"],
            FailureCategory::LogicError,
        ),
        (
            &["traceback", "exception", "runtime", "command_failed", "panicked"],
            FailureCategory::RuntimeError,
        ),
    ];
    for (keywords, category) in buckets {
        if keywords.iter().any(|kw| haystack.contains(kw)) {
            return category;
        }
    }
    FailureCategory::Unknown
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSignature {
    pub category: FailureCategory,
    pub error_type: String,
    pub error_message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,

    #[serde(default)]
    pub stack_trace_summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixAttempt {
    pub round_id: usize,
    pub action_type: String,
    pub action_detail: String,
    pub success: bool,

    #[serde(default)]
    pub side_effects: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub task_id: String,
    pub run_id: String,
    pub round_id: usize,
    pub timestamp: f64,
    pub error_signature: ErrorSignature,
    pub root_cause_analysis: String,

    #[serde(default)]
    pub contributing_factors: Vec<String>,

    #[serde(default)]
    pub fix_attempts: Vec<FixAttempt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_fix: Option<String>,

    #[serde(default)]
    pub suggested_prevention: String,

    #[serde(default = "default_true")]
    pub learnable: bool,

    #[serde(default = "default_confidence")]
    pub confidence: f64,

    #[serde(default)]
    pub affected_files: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.5
}

/// Summarize a failed round's reasons into a diagnosis.
pub fn diagnose(
    task_id: &str,
    run_id: &str,
    round_id: usize,
    reasons: &[Reason],
    now: f64,
) -> DiagnosisReport {
    let primary = reasons
        .iter()
        .find(|reason| reason.kind != "retry_context")
        .cloned()
        .unwrap_or_else(|| Reason::new("unknown"));
    let summary = primary
        .get("actual")
        .and_then(serde_json::Value::as_str)
        .or_else(|| primary.get("hint").and_then(serde_json::Value::as_str))
        .unwrap_or_default()
        .to_string();
    let category = categorize(&primary.kind, &summary);
    let file_path = primary
        .get("file")
        .or_else(|| primary.get("path"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);
    let affected_files: Vec<String> = reasons
        .iter()
        .filter_map(|reason| {
            reason
                .get("file")
                .or_else(|| reason.get("path"))
                .and_then(serde_json::Value::as_str)
        })
        .map(str::to_string)
        .collect();
    let contributing_factors: Vec<String> = reasons
        .iter()
        .skip(1)
        .filter(|reason| reason.kind != "retry_context")
        .map(|reason| reason.kind.clone())
        .collect();

    DiagnosisReport {
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
        round_id,
        timestamp: now,
        error_signature: ErrorSignature {
            category,
            error_type: primary.kind.clone(),
            error_message: summary,
            file_path,
            line_number: None,
            stack_trace_summary: String::new(),
        },
        root_cause_analysis: format!("{} failure during verification round {round_id}", category),
        contributing_factors,
        fix_attempts: Vec::new(),
        successful_fix: None,
        suggested_prevention: String::new(),
        learnable: category != FailureCategory::Unknown,
        confidence: if category == FailureCategory::Unknown { 0.3 } else { 0.6 },
        affected_files,
        tags: vec![category.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── categorize ──────────────────────────────────────────────────

    #[test]
    fn test_categorize_by_reason_kind() {
        assert_eq!(categorize("command_timeout", ""), FailureCategory::TimeoutError);
        assert_eq!(categorize("content_mismatch", ""), FailureCategory::LogicError);
        assert_eq!(categorize("command_failed", ""), FailureCategory::RuntimeError);
        assert_eq!(categorize("missing_file", ""), FailureCategory::EnvironmentError);
    }

    #[test]
    fn test_categorize_by_summary_text() {
        assert_eq!(
            categorize("x", "SyntaxError: invalid syntax"),
            FailureCategory::SyntaxError
        );
        assert_eq!(
            categorize("x", "ModuleNotFoundError: No module named 'foo'"),
            FailureCategory::DependencyError
        );
        assert_eq!(
            categorize("x", "AssertionError: expected 3 got 4"),
            FailureCategory::LogicError
        );
        assert_eq!(categorize("x", "Permission denied"), FailureCategory::PermissionError);
        assert_eq!(categorize("x", "something odd"), FailureCategory::Unknown);
    }

    #[test]
    fn test_timeout_beats_other_keywords() {
        assert_eq!(
            categorize("command_timeout", "Traceback most recent call"),
            FailureCategory::TimeoutError
        );
    }

    // ── diagnose ────────────────────────────────────────────────────

    #[test]
    fn test_diagnose_builds_signature() {
        let reasons = vec![
            Reason::new("command_failed")
                .with("cmd", "pytest -q")
                .with("actual", "AssertionError: boom"),
            Reason::new("missing_file").with("file", "outputs/summary.txt"),
            Reason::new("retry_context"),
        ];
        let report = diagnose("T001", "run-1", 1, &reasons, 1000.0);
        assert_eq!(report.error_signature.category, FailureCategory::LogicError);
        assert_eq!(report.error_signature.error_type, "command_failed");
        assert_eq!(report.contributing_factors, vec!["missing_file"]);
        assert_eq!(report.affected_files, vec!["outputs/summary.txt"]);
        assert!(report.learnable);
    }

    #[test]
    fn test_diagnose_empty_reasons_is_unknown() {
        let report = diagnose("T001", "run-1", 0, &[], 1000.0);
        assert_eq!(report.error_signature.category, FailureCategory::Unknown);
        assert!(!report.learnable);
        assert!((report.confidence - 0.3).abs() < 1e-9);
    }
}
