//! Human-oriented run reports: `verification_report.md` and the per-run
//! evidence index.

use std::path::Path;

use aipl_core::Reason;
use aipl_core::types::{Check, CheckSpec};

fn format_check(check: &Check) -> String {
    match check {
        Check::Known(CheckSpec::Command { cmd, timeout, .. }) => {
            format!(
                "- command: {cmd} timeout={}",
                timeout.map(|t| t.to_string()).unwrap_or_default()
            )
        }
        Check::Known(CheckSpec::CommandContains { cmd, needle, .. }) => {
            format!("- command_contains: {cmd} needle={needle}")
        }
        Check::Known(CheckSpec::FileExists { path, .. }) => format!("- file_exists: {path}"),
        Check::Known(CheckSpec::FileContains { path, needle, .. }) => {
            format!("- file_contains: {path} needle={needle}")
        }
        Check::Known(CheckSpec::FileMatches { path, pattern, .. }) => {
            format!("- file_matches: {path} pattern={pattern}")
        }
        Check::Known(CheckSpec::JsonSchema { path, .. }) => format!("- json_schema: {path}"),
        Check::Known(CheckSpec::HttpCheck { url, .. }) => format!("- http_check: {url}"),
        Check::Unknown(raw) => format!("- unknown: {raw}"),
    }
}

fn format_how_to_verify(check: &Check) -> String {
    match check {
        Check::Known(CheckSpec::Command { cmd, .. })
        | Check::Known(CheckSpec::CommandContains { cmd, .. }) => format!("- run: {cmd}"),
        Check::Known(CheckSpec::FileExists { path, .. }) => {
            format!("- check file exists: {path}")
        }
        Check::Known(CheckSpec::FileContains { path, needle, .. }) => {
            format!("- check file contains: {path} -> {needle}")
        }
        Check::Known(CheckSpec::FileMatches { path, pattern, .. }) => {
            format!("- check file matches: {path} ~ {pattern}")
        }
        Check::Known(CheckSpec::JsonSchema { path, .. }) => {
            format!("- validate json: {path}")
        }
        Check::Known(CheckSpec::HttpCheck { url, .. }) => format!("- request: {url}"),
        Check::Unknown(raw) => format!("- manual check: {raw}"),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn write_verification_report(
    run_dir: &Path,
    task_id: &str,
    plan_id: Option<&str>,
    workspace: Option<&Path>,
    passed: bool,
    reasons: &[Reason],
    checks: &[Check],
) {
    let mut lines = vec![
        "# Verification Report".to_string(),
        format!("- task_id: {task_id}"),
        format!("- plan_id: {}", plan_id.unwrap_or("-")),
        format!("- run_dir: {}", run_dir.display()),
        format!(
            "- workspace: {}",
            workspace.map(|p| p.display().to_string()).unwrap_or_else(|| "-".into())
        ),
        format!("- passed: {passed}"),
        String::new(),
        "## Checks".to_string(),
    ];
    if checks.is_empty() {
        lines.push("- (none)".to_string());
    } else {
        lines.extend(checks.iter().map(format_check));
    }
    lines.push(String::new());
    lines.push("## How To Verify".to_string());
    if checks.is_empty() {
        lines.push("- no checks available".to_string());
    } else {
        lines.extend(checks.iter().map(format_how_to_verify));
    }
    lines.push(String::new());
    lines.push("## Failure Reasons".to_string());
    if reasons.is_empty() {
        lines.push("- none".to_string());
    } else {
        for reason in reasons {
            lines.push(format!(
                "- {}",
                serde_json::to_string(reason).unwrap_or_default()
            ));
        }
    }
    lines.push(String::new());
    let _ = std::fs::write(run_dir.join("verification_report.md"), lines.join("\n"));
}

/// Evidence index for the run directory.
pub fn write_run_index(run_dir: &Path, run_id: &str, last_step: Option<&str>) {
    let mut lines = vec![
        format!("# Run {run_id}"),
        format!("- Task: {}", last_step.unwrap_or("-")),
        String::new(),
        "## Evidence".to_string(),
        "- meta.json".to_string(),
        "- events.jsonl".to_string(),
        "- policy.json".to_string(),
        "- capabilities.json".to_string(),
        "- verification_result.json".to_string(),
        "- verification_report.md".to_string(),
        "- outputs/".to_string(),
    ];
    if let Some(step) = last_step {
        lines.push(format!("- steps/{step}/round-0/"));
        lines.push(format!("- steps/{step}/round-1/"));
    }
    lines.push(String::new());
    let _ = std::fs::write(run_dir.join("index.md"), lines.join("\n"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_lists_checks_and_reasons() {
        let tmp = tempfile::tempdir().unwrap();
        let checks: Vec<Check> = vec![
            serde_json::from_value(json!({"type": "command", "cmd": "pytest -q", "timeout": 60}))
                .unwrap(),
            serde_json::from_value(json!({"type": "file_contains", "path": "outputs/x.txt", "needle": "ok"}))
                .unwrap(),
        ];
        let reasons = vec![Reason::new("command_failed").with("cmd", "pytest -q")];
        write_verification_report(
            tmp.path(),
            "T001",
            Some("plan-1"),
            None,
            false,
            &reasons,
            &checks,
        );
        let text = std::fs::read_to_string(tmp.path().join("verification_report.md")).unwrap();
        assert!(text.contains("- task_id: T001"));
        assert!(text.contains("- command: pytest -q timeout=60"));
        assert!(text.contains("- run: pytest -q"));
        assert!(text.contains("command_failed"));
        assert!(text.contains("- passed: false"));
    }

    #[test]
    fn test_report_without_checks() {
        let tmp = tempfile::tempdir().unwrap();
        write_verification_report(tmp.path(), "T001", None, None, true, &[], &[]);
        let text = std::fs::read_to_string(tmp.path().join("verification_report.md")).unwrap();
        assert!(text.contains("- (none)"));
        assert!(text.contains("- no checks available"));
        assert!(text.contains("## Failure Reasons\n- none"));
    }

    #[test]
    fn test_run_index() {
        let tmp = tempfile::tempdir().unwrap();
        write_run_index(tmp.path(), "run-1", Some("T001"));
        let text = std::fs::read_to_string(tmp.path().join("index.md")).unwrap();
        assert!(text.contains("# Run run-1"));
        assert!(text.contains("- steps/T001/round-0/"));
        assert!(text.contains("- events.jsonl"));
    }
}
