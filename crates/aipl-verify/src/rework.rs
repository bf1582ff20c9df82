//! Failure-diagnosis artifact: builds the `ReworkRequest` the next round's
//! assistant prompt is seeded with.

use std::path::Path;

use aipl_core::Reason;

use crate::types::{CheckRecord, ExecutionError, ExecutionErrors, ReworkRequest};

const KEY_ERROR_KEYWORDS: [&str; 17] = [
    "error:",
    "Error:",
    "ERROR:",
    "failed",
    "Failed",
    "FAILED",
    "Traceback",
    "SyntaxError",
    "TypeError",
    "ValueError",
    "AssertionError",
    "ImportError",
    "ModuleNotFoundError",
    "cannot find",
    "not found",
    "undefined",
    "panicked at",
];

/// Lines that look like the root of a failure, capped at `max_lines`.
pub fn extract_key_error_lines(output: &str, max_lines: usize) -> String {
    output
        .lines()
        .filter(|line| KEY_ERROR_KEYWORDS.iter().any(|kw| line.contains(kw)))
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n")
}

fn last_bytes(text: &str, max_len: usize) -> String {
    crate::runner::tail(text, max_len)
}

/// Gather per-command failure evidence from check records and their logs.
pub fn collect_execution_errors(check_results: &[CheckRecord], log_dir: &Path) -> ExecutionErrors {
    let mut errors = ExecutionErrors::default();
    for result in check_results {
        let is_execution = matches!(
            result.check_type.as_str(),
            "command" | "command_contains" | "http_check"
        );
        if !is_execution || result.ok {
            continue;
        }
        errors.has_errors = true;
        let stdout = std::fs::read_to_string(log_dir.join(format!("cmd-{}.stdout.txt", result.index)))
            .unwrap_or_default();
        let stderr = std::fs::read_to_string(log_dir.join(format!("cmd-{}.stderr.txt", result.index)))
            .unwrap_or_default();
        let key_errors = extract_key_error_lines(&format!("{stderr}\n{stdout}"), 30);
        errors.failed_commands.push(ExecutionError {
            cmd: result.cmd.clone().or_else(|| result.url.clone()),
            exit_code: result.exit_code,
            status: result.status.clone(),
            stdout: last_bytes(&stdout, 3000),
            stderr: last_bytes(&stderr, 3000),
            key_errors,
        });
    }
    errors.error_summary = build_error_summary(&errors.failed_commands);
    errors
}

fn build_error_summary(errors: &[ExecutionError]) -> String {
    let mut lines = Vec::new();
    for err in errors {
        let cmd = err.cmd.as_deref().unwrap_or("(unknown)");
        let status = err.status.as_deref().unwrap_or("failed");
        lines.push(format!("{cmd} -> {status} (exit={:?})", err.exit_code));
        if !err.key_errors.is_empty() {
            lines.push(err.key_errors.clone());
        }
    }
    lines.join("\n")
}

/// Category-specific guidance string handed to the assistant.
pub fn generate_fix_guidance(reasons: &[Reason], errors: &ExecutionErrors) -> String {
    let mut lines: Vec<String> = Vec::new();
    if errors.has_errors {
        lines.push("## Command execution failed".to_string());
        lines.push(String::new());
        lines.push("Analyze the errors below and fix the code:".to_string());
        lines.push(String::new());
        lines.push("```".to_string());
        lines.push(errors.error_summary.chars().take(2000).collect());
        lines.push("```".to_string());
        lines.push(String::new());
        lines.push("### Suggested fixes".to_string());
        lines.push("1. Check for syntax errors".to_string());
        lines.push("2. Make sure names and signatures are correct".to_string());
        lines.push("3. Verify imported modules exist".to_string());
        lines.push("4. Check argument types and counts".to_string());
    } else if !reasons.is_empty() {
        lines.push("## Verification failed".to_string());
        lines.push(String::new());
        lines.push("Fix the causes listed in why_failed and retry.".to_string());
    }
    lines.join("\n")
}

/// Build the full rework brief for the round that just failed.
#[allow(clippy::too_many_arguments)]
pub fn collect_errors_for_retry(
    run_dir: &Path,
    round_id: usize,
    max_rounds: usize,
    reasons: &[Reason],
    check_results: &[CheckRecord],
    produced_files: &[String],
    workspace: Option<&Path>,
    prev_stdout: &str,
    suspected_related_files: &[String],
) -> ReworkRequest {
    let log_dir = run_dir.join("verification");
    let errors = collect_execution_errors(check_results, &log_dir);
    let fix_guidance = generate_fix_guidance(reasons, &errors);
    ReworkRequest {
        round: round_id,
        remaining_attempts: max_rounds.saturating_sub(round_id + 1),
        why_failed: reasons.to_vec(),
        error_summary: errors.error_summary.clone(),
        execution_errors: errors,
        fix_guidance,
        prev_stdout: prev_stdout.to_string(),
        code_modified: !produced_files.is_empty(),
        produced_files: produced_files.to_vec(),
        workspace: workspace
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        suspected_related_files: suspected_related_files.to_vec(),
        validation_reasons: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_key_error_lines() {
        let output = "collecting...\nE   AssertionError: boom\nok line\nModuleNotFoundError: No module named 'x'\n";
        let key = extract_key_error_lines(output, 30);
        assert!(key.contains("AssertionError"));
        assert!(key.contains("ModuleNotFoundError"));
        assert!(!key.contains("ok line"));
    }

    #[test]
    fn test_extract_caps_lines() {
        let output = "error: x\n".repeat(50);
        let key = extract_key_error_lines(&output, 30);
        assert_eq!(key.lines().count(), 30);
    }

    #[test]
    fn test_collect_execution_errors_reads_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("verification");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("cmd-0.stdout.txt"), "1 failed, 0 passed\n").unwrap();
        std::fs::write(log_dir.join("cmd-0.stderr.txt"), "AssertionError: nope\n").unwrap();

        let records = vec![
            CheckRecord {
                index: 0,
                check_type: "command".into(),
                ok: false,
                cmd: Some("pytest -q".into()),
                exit_code: Some(1),
                status: Some("failed".into()),
                executed: true,
                ..Default::default()
            },
            CheckRecord {
                index: 1,
                check_type: "file_exists".into(),
                ok: false,
                ..Default::default()
            },
        ];
        let errors = collect_execution_errors(&records, &log_dir);
        assert!(errors.has_errors);
        // file checks never contribute execution errors
        assert_eq!(errors.failed_commands.len(), 1);
        let failure = &errors.failed_commands[0];
        assert_eq!(failure.cmd.as_deref(), Some("pytest -q"));
        assert!(failure.key_errors.contains("AssertionError"));
        assert!(errors.error_summary.contains("pytest -q -> failed"));
    }

    #[test]
    fn test_collect_skips_passing_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let records = vec![CheckRecord {
            index: 0,
            check_type: "command".into(),
            ok: true,
            executed: true,
            ..Default::default()
        }];
        let errors = collect_execution_errors(&records, tmp.path());
        assert!(!errors.has_errors);
        assert!(errors.error_summary.is_empty());
    }

    #[test]
    fn test_rework_request_counts_remaining() {
        let tmp = tempfile::tempdir().unwrap();
        let request = collect_errors_for_retry(
            tmp.path(),
            0,
            3,
            &[Reason::new("command_failed")],
            &[],
            &["src/app.py".to_string()],
            None,
            "stdout tail",
            &["src/related.py".to_string()],
        );
        assert_eq!(request.round, 0);
        assert_eq!(request.remaining_attempts, 2);
        assert!(request.code_modified);
        assert_eq!(request.suspected_related_files, vec!["src/related.py"]);
        assert!(request.fix_guidance.contains("Verification failed"));
    }

    #[test]
    fn test_fix_guidance_prefers_execution_errors() {
        let errors = ExecutionErrors {
            has_errors: true,
            error_summary: "pytest -> failed (exit=Some(1))".into(),
            ..Default::default()
        };
        let guidance = generate_fix_guidance(&[], &errors);
        assert!(guidance.contains("Command execution failed"));
        assert!(guidance.contains("pytest"));
    }
}
