//! The verifier: executes a task's effective check set against the staged
//! workspace and mandates proof of real execution.

pub mod handlers;
pub mod rework;
pub mod runner;
pub mod schema;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use aipl_core::Reason;
use aipl_core::env::{EngineConfig, NoChecksBehavior};
use aipl_core::types::{Check, Task};

use handlers::CheckContext;
use runner::{CommandRunner, SubprocessRunner};

pub use rework::collect_errors_for_retry;
pub use types::{CheckRecord, ReworkRequest, VerifyOutcome};

/// What the verifier needs to know about the task under verification.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub task_id: String,
    pub checks: Vec<Check>,
    pub task_workspace: Option<PathBuf>,
    pub retry_context: Option<Reason>,
    pub high_risk: bool,
}

impl TaskContext {
    pub fn from_task(task: &Task) -> Self {
        let retry_context = (task.last_run.is_some() || !task.last_reasons.is_empty()).then(|| {
            Reason::new("retry_context")
                .with("last_run", task.last_run.clone().unwrap_or_default())
                .with(
                    "last_reasons",
                    serde_json::to_value(&task.last_reasons).unwrap_or(Value::Null),
                )
        });
        Self {
            task_id: task.id.clone(),
            checks: task.checks.clone(),
            task_workspace: task.workspace_path.clone().map(PathBuf::from),
            retry_context,
            high_risk: task.is_high_risk(),
        }
    }
}

/// Task checks win outright when they contain an execution check and the
/// task is not high-risk; otherwise policy checks are appended.
pub fn merge_checks(task_checks: &[Check], policy_checks: &[Check], high_risk: bool) -> Vec<Check> {
    if has_execution_check(task_checks) && !high_risk {
        return task_checks.to_vec();
    }
    let mut merged = task_checks.to_vec();
    merged.extend(policy_checks.iter().cloned());
    merged
}

pub fn has_execution_check(checks: &[Check]) -> bool {
    checks.iter().any(Check::is_execution)
}

/// Policy fallback checks from the run's `policy.json`.
pub fn load_policy_checks(run_dir: &Path) -> Vec<Check> {
    let policy: Value = aipl_core::fsio::read_json_or(&run_dir.join("policy.json"), Value::Null);
    policy
        .get("checks")
        .and_then(Value::as_array)
        .map(|checks| {
            checks
                .iter()
                .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub struct Verifier {
    config: EngineConfig,
    runner: Arc<dyn CommandRunner>,
}

impl Verifier {
    pub fn new(config: EngineConfig) -> Self {
        let runner = Arc::new(SubprocessRunner::new(config.allow_shell_commands));
        Self { config, runner }
    }

    /// Substitute a custom command runner (tests, dry runs).
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Run the task's effective checks. `workspace` is normally the stage
    /// root; per-task workspace overrides apply when it is absent.
    pub async fn verify_task(
        &self,
        run_dir: &Path,
        task: &TaskContext,
        workspace: Option<&Path>,
    ) -> VerifyOutcome {
        let policy_checks = load_policy_checks(run_dir);
        let workspace = workspace
            .map(Path::to_path_buf)
            .or_else(|| task.task_workspace.clone());
        let effective = merge_checks(&task.checks, &policy_checks, task.high_risk);

        let outcome = if effective.is_empty() {
            self.no_checks_outcome(task)
        } else {
            let has_http = effective
                .iter()
                .any(|check| check.type_name() == "http_check");
            if workspace.is_none() && !has_http {
                let mut reasons = vec![
                    Reason::new("workspace_required")
                        .with("hint", "workspace path is required for non-http checks"),
                ];
                reasons.extend(task.retry_context.clone());
                VerifyOutcome {
                    passed: false,
                    reasons,
                    check_results: Vec::new(),
                    total_duration_ms: 0,
                }
            } else {
                let mut outcome = self
                    .run_checks(run_dir, &effective, workspace.as_deref(), task)
                    .await;
                self.enforce_execution_requirement(&effective, &mut outcome);
                outcome
            }
        };

        self.write_result(run_dir, &task.task_id, &outcome);
        info!(
            task_id = %task.task_id,
            passed = outcome.passed,
            checks = outcome.check_results.len(),
            "verification complete"
        );
        outcome
    }

    fn no_checks_outcome(&self, task: &TaskContext) -> VerifyOutcome {
        let (passed, reasons) = match self.config.no_checks_behavior {
            NoChecksBehavior::Fail => (
                false,
                vec![Reason::new("no_checks").with("hint", "no verification checks available")],
            ),
            NoChecksBehavior::Warn => (
                true,
                vec![Reason::new("no_checks_warning")
                    .with("hint", "no verification checks available")
                    .as_warning()],
            ),
            NoChecksBehavior::Skip => (true, Vec::new()),
        };
        let mut reasons = reasons;
        if !passed {
            reasons.extend(task.retry_context.clone());
        }
        VerifyOutcome {
            passed,
            reasons,
            check_results: Vec::new(),
            total_duration_ms: 0,
        }
    }

    async fn run_checks(
        &self,
        run_dir: &Path,
        effective: &[Check],
        workspace: Option<&Path>,
        task: &TaskContext,
    ) -> VerifyOutcome {
        let started = std::time::Instant::now();
        let context = CheckContext {
            run_dir,
            workspace,
            log_dir: run_dir.join("verification"),
            config: &self.config,
            runner: self.runner.as_ref(),
            tests_disabled: self.tests_disabled(run_dir),
        };
        let mut passed = true;
        let mut reasons = Vec::new();
        let mut check_results = Vec::new();
        for (idx, check) in effective.iter().enumerate() {
            let mut record = context.run_check(idx, check).await;
            if !record.ok {
                if check.is_soft() {
                    record.reason = record.reason.take().map(Reason::as_warning);
                } else if let Some(reason) = &record.reason {
                    reasons.push(reason.clone());
                    passed = false;
                }
            }
            check_results.push(record);
        }
        if !passed {
            reasons.extend(task.retry_context.clone());
        }
        VerifyOutcome {
            passed,
            reasons,
            check_results,
            total_duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// The execution guard: when the effective set contains execution checks
    /// at least one must actually have run; skipped test commands pass only
    /// under `ALLOW_SKIP_TESTS` when every skip was a disabled-tests skip.
    fn enforce_execution_requirement(&self, effective: &[Check], outcome: &mut VerifyOutcome) {
        if !self.config.require_execution {
            return;
        }
        let execution_indexes: Vec<usize> = effective
            .iter()
            .enumerate()
            .filter(|(_, check)| check.is_execution())
            .map(|(idx, _)| idx)
            .collect();
        if execution_indexes.is_empty() {
            if self.config.no_checks_behavior == NoChecksBehavior::Fail {
                outcome.passed = false;
                outcome.reasons.push(Reason::new("no_execution_check_defined"));
            }
            return;
        }
        let execution_results: Vec<&CheckRecord> = outcome
            .check_results
            .iter()
            .filter(|record| execution_indexes.contains(&record.index))
            .collect();
        if execution_results.iter().any(|record| record.executed) {
            return;
        }
        let skipped: Vec<&&CheckRecord> = execution_results
            .iter()
            .filter(|record| record.status.as_deref() == Some("skipped"))
            .collect();
        let tests_disabled_count = skipped
            .iter()
            .filter(|record| record.skip_reason.as_deref() == Some("tests_disabled"))
            .count();
        if self.config.allow_skip_tests && !skipped.is_empty() && tests_disabled_count == skipped.len()
        {
            outcome
                .reasons
                .push(Reason::new("tests_skipped_allowed").with("severity", "info"));
            return;
        }
        outcome.passed = false;
        let skipped_commands: Vec<String> = execution_results
            .iter()
            .filter(|record| record.status.as_deref() == Some("skipped"))
            .filter_map(|record| record.cmd.clone())
            .collect();
        outcome.reasons.push(
            Reason::new("no_commands_executed")
                .with("skipped_commands", serde_json::json!(skipped_commands)),
        );
    }

    fn tests_disabled(&self, run_dir: &Path) -> bool {
        if self.config.allow_tests {
            return false;
        }
        if self.config.disable_tests {
            return true;
        }
        let meta: Value = aipl_core::fsio::read_json_or(&run_dir.join("meta.json"), Value::Null);
        meta.get("disable_tests").and_then(Value::as_bool) == Some(true)
    }

    fn write_result(&self, run_dir: &Path, task_id: &str, outcome: &VerifyOutcome) {
        let executed: Vec<&CheckRecord> = outcome
            .check_results
            .iter()
            .filter(|record| record.executed)
            .collect();
        let payload = serde_json::json!({
            "status": if outcome.passed { "success" } else { "failed" },
            "passed": outcome.passed,
            "task_id": task_id,
            "run_dir": run_dir.to_string_lossy(),
            "checks": outcome.check_results,
            "executed_commands": executed,
            "reasons": outcome.reasons,
            "total_duration_ms": outcome.total_duration_ms,
            "ts": aipl_core::now_ts() as i64,
        });
        let _ = aipl_core::fsio::write_json(&run_dir.join("verification_result.json"), &payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(raw: Value) -> Check {
        serde_json::from_value(raw).unwrap()
    }

    fn task_with_checks(checks: Vec<Check>) -> TaskContext {
        TaskContext {
            task_id: "T001".into(),
            checks,
            ..Default::default()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    // ── merge rule ──────────────────────────────────────────────────

    #[test]
    fn test_merge_task_execution_checks_win() {
        let task = vec![check(json!({"type": "command", "cmd": "pytest -q"}))];
        let policy = vec![check(json!({"type": "file_exists", "path": "x"}))];
        let merged = merge_checks(&task, &policy, false);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_merge_appends_policy_for_file_only_tasks() {
        let task = vec![check(json!({"type": "file_exists", "path": "x"}))];
        let policy = vec![check(json!({"type": "command", "cmd": "pytest -q"}))];
        let merged = merge_checks(&task, &policy, false);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_high_risk_always_appends_policy() {
        let task = vec![check(json!({"type": "command", "cmd": "pytest -q"}))];
        let policy = vec![check(json!({"type": "command", "cmd": "npm test"}))];
        let merged = merge_checks(&task, &policy, true);
        assert_eq!(merged.len(), 2);
    }

    // ── no checks behavior ──────────────────────────────────────────

    #[tokio::test]
    async fn test_empty_checks_fail_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(config());
        let outcome = verifier
            .verify_task(tmp.path(), &task_with_checks(vec![]), Some(tmp.path()))
            .await;
        assert!(!outcome.passed);
        assert_eq!(outcome.reasons[0].kind, "no_checks");
        // result artifact persisted
        let result: Value =
            aipl_core::fsio::read_json(&tmp.path().join("verification_result.json")).unwrap();
        assert_eq!(result["passed"], false);
        assert_eq!(result["task_id"], "T001");
    }

    #[tokio::test]
    async fn test_empty_checks_warn_and_skip_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut warn_config = config();
        warn_config.no_checks_behavior = NoChecksBehavior::Warn;
        let outcome = Verifier::new(warn_config)
            .verify_task(tmp.path(), &task_with_checks(vec![]), Some(tmp.path()))
            .await;
        assert!(outcome.passed);
        assert!(outcome.reasons[0].is_warning());

        let mut skip_config = config();
        skip_config.no_checks_behavior = NoChecksBehavior::Skip;
        let outcome = Verifier::new(skip_config)
            .verify_task(tmp.path(), &task_with_checks(vec![]), Some(tmp.path()))
            .await;
        assert!(outcome.passed);
        assert!(outcome.reasons.is_empty());
    }

    // ── file checks end to end ──────────────────────────────────────

    #[tokio::test]
    async fn test_file_checks_and_execution_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("summary.txt"), "status: ok\n").unwrap();

        let task = task_with_checks(vec![check(
            json!({"type": "file_contains", "path": "summary.txt", "needle": "ok"}),
        )]);
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        // file check passed but the execution guard demands an execution check
        assert!(!outcome.passed);
        assert!(outcome
            .reasons
            .iter()
            .any(|r| r.kind == "no_execution_check_defined"));
        assert!(outcome.check_results[0].ok);
    }

    #[tokio::test]
    async fn test_file_check_without_execution_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("summary.txt"), "ok\n").unwrap();
        let mut cfg = config();
        cfg.require_execution = false;

        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let task = task_with_checks(vec![check(
            json!({"type": "file_contains", "path": "summary.txt", "needle": "ok"}),
        )]);
        let outcome = Verifier::new(cfg).verify_task(&run_dir, &task, Some(&ws)).await;
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn test_outputs_paths_resolve_against_run_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(run_dir.join("outputs")).unwrap();
        std::fs::write(run_dir.join("outputs/summary.txt"), "ok").unwrap();
        let mut cfg = config();
        cfg.require_execution = false;

        let task = task_with_checks(vec![check(
            json!({"type": "file_contains", "path": "outputs/summary.txt", "needle": "ok"}),
        )]);
        // no workspace at all, but outputs/ paths still verify
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let outcome = Verifier::new(cfg).verify_task(&run_dir, &task, Some(&ws)).await;
        assert!(outcome.passed);
    }

    // ── command checks end to end ───────────────────────────────────

    #[tokio::test]
    async fn test_policy_blocked_command_not_executed() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();

        let task = task_with_checks(vec![check(json!({"type": "command", "cmd": "rm -rf /"}))]);
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(!outcome.passed);
        let record = &outcome.check_results[0];
        assert!(!record.executed);
        assert_eq!(
            record.reason.as_ref().unwrap().kind,
            "command_not_allowed"
        );
        // blocked command also trips the execution guard
        assert!(outcome.reasons.iter().any(|r| r.kind == "no_commands_executed"));
    }

    #[tokio::test]
    async fn test_command_passes_with_custom_prefixes() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();

        let task = task_with_checks(vec![check(json!({
            "type": "command",
            "cmd": "echo verification-ok",
            "allow_prefixes": ["echo"]
        }))]);
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(outcome.passed);
        let record = &outcome.check_results[0];
        assert!(record.executed);
        assert_eq!(record.exit_code, Some(0));
        let stdout = std::fs::read_to_string(run_dir.join("verification/cmd-0.stdout.txt")).unwrap();
        assert!(stdout.contains("verification-ok"));
    }

    #[tokio::test]
    async fn test_command_timeout_writes_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();

        let task = task_with_checks(vec![check(json!({
            "type": "command",
            "cmd": "sleep 10",
            "timeout": 1,
            "allow_prefixes": ["sleep"]
        }))]);
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(!outcome.passed);
        let record = &outcome.check_results[0];
        assert!(record.timed_out);
        assert_eq!(record.exit_code, None);
        assert_eq!(record.reason.as_ref().unwrap().kind, "command_timeout");
        assert!(run_dir.join("verification/cmd-0.timeout.txt").exists());
    }

    #[tokio::test]
    async fn test_command_contains() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();

        let task = task_with_checks(vec![check(json!({
            "type": "command_contains",
            "cmd": "echo all 3 tests passed",
            "needle": "tests passed",
            "allow_prefixes": ["echo"]
        }))]);
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(outcome.passed);

        let task = task_with_checks(vec![check(json!({
            "type": "command_contains",
            "cmd": "echo nothing here",
            "needle": "tests passed",
            "allow_prefixes": ["echo"]
        }))]);
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(!outcome.passed);
        assert_eq!(outcome.reasons[0].kind, "command_output_missing");
    }

    // ── soft checks ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_soft_check_failure_is_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();

        let task = task_with_checks(vec![
            check(json!({
                "type": "command", "cmd": "echo ok", "allow_prefixes": ["echo"]
            })),
            check(json!({
                "type": "file_exists", "path": "missing.txt", "soft": true
            })),
        ]);
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(outcome.passed);
        assert!(outcome.reasons.is_empty());
        assert!(outcome.check_results[1]
            .reason
            .as_ref()
            .unwrap()
            .is_warning());
    }

    // ── skipped tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_allow_skip_tests_accepts_disabled_test_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        aipl_core::fsio::write_json(&run_dir.join("meta.json"), &json!({"disable_tests": true}))
            .unwrap();

        let mut cfg = config();
        cfg.allow_skip_tests = true;
        let task = task_with_checks(vec![check(json!({
            "type": "command", "cmd": "pytest -q"
        }))]);
        let outcome = Verifier::new(cfg).verify_task(&run_dir, &task, Some(&ws)).await;
        assert!(outcome.passed);
        assert_eq!(outcome.check_results[0].skip_reason.as_deref(), Some("tests_disabled"));
        assert!(outcome
            .reasons
            .iter()
            .any(|r| r.kind == "tests_skipped_allowed"));
    }

    #[tokio::test]
    async fn test_skipped_tests_fail_without_allow_skip() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        aipl_core::fsio::write_json(&run_dir.join("meta.json"), &json!({"disable_tests": true}))
            .unwrap();

        let task = task_with_checks(vec![check(json!({
            "type": "command", "cmd": "pytest -q"
        }))]);
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(!outcome.passed);
        assert!(outcome.reasons.iter().any(|r| r.kind == "no_commands_executed"));
    }

    // ── unknown checks and policy fallback ──────────────────────────

    #[tokio::test]
    async fn test_unknown_check_reports_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();
        let mut cfg = config();
        cfg.require_execution = false;

        let task = task_with_checks(vec![check(json!({"type": "quantum_check"}))]);
        let outcome = Verifier::new(cfg).verify_task(&run_dir, &task, Some(&ws)).await;
        assert!(!outcome.passed);
        assert_eq!(outcome.reasons[0].kind, "unknown_check");
    }

    #[tokio::test]
    async fn test_policy_checks_fallback_from_policy_json() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        aipl_core::fsio::write_json(
            &run_dir.join("policy.json"),
            &json!({"checks": [{"type": "command", "cmd": "echo policy", "allow_prefixes": ["echo"]}]}),
        )
        .unwrap();

        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task_with_checks(vec![]), Some(&ws))
            .await;
        assert!(outcome.passed);
        assert_eq!(outcome.check_results[0].check_type, "command");
    }

    #[tokio::test]
    async fn test_retry_context_appended_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        let run_dir = tmp.path().join("run");
        std::fs::create_dir_all(&run_dir).unwrap();

        let mut task = task_with_checks(vec![check(
            json!({"type": "file_exists", "path": "missing.txt"}),
        )]);
        task.retry_context = Some(Reason::new("retry_context").with("last_run", "run-0"));
        let outcome = Verifier::new(config())
            .verify_task(&run_dir, &task, Some(&ws))
            .await;
        assert!(!outcome.passed);
        assert!(outcome.reasons.iter().any(|r| r.kind == "retry_context"));
    }
}
