//! Drop-with-reason validation of assistant-proposed checks, writes, and
//! commands. Invalid items never abort anything; they are removed from the
//! cleaned output and accounted for in the returned reasons.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aipl_core::Reason;
use aipl_core::types::Check;

use crate::guard::{is_command_allowed, is_safe_relative_path, is_write_allowed};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteTarget {
    /// The staged workspace, gated by allow_write/deny_write.
    Workspace,
    /// The run directory, confined below it.
    Run,
}

impl std::fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteTarget::Workspace => f.write_str("workspace"),
            WriteTarget::Run => f.write_str("run"),
        }
    }
}

/// A file write that survived validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteOp {
    pub target: WriteTarget,
    pub path: String,
    #[serde(default)]
    pub content: String,
}

/// A command that survived validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOp {
    pub cmd: String,
    pub timeout: u64,
}

const FILE_CHECK_TYPES: [&str; 4] = ["file_exists", "file_contains", "file_matches", "json_schema"];
const COMMAND_CHECK_TYPES: [&str; 2] = ["command", "command_contains"];

/// Validate a raw check list. Command checks that pass are pinned to the
/// effective allowed prefixes and a workspace-root cwd. Unrecognized check
/// types pass through untouched; the verifier reports them.
pub fn validate_checks(
    checks: &[Value],
    allowed_commands: &[String],
    command_whitelist: Option<&[String]>,
) -> (Vec<Check>, Vec<Reason>) {
    let mut cleaned = Vec::new();
    let mut reasons = Vec::new();

    for (idx, raw) in checks.iter().enumerate() {
        let Some(check) = raw.as_object() else {
            reasons.push(
                Reason::new("invalid_check")
                    .with("index", idx)
                    .with("reason", "not_object"),
            );
            continue;
        };
        let Some(ctype) = check.get("type").and_then(Value::as_str) else {
            reasons.push(
                Reason::new("invalid_check")
                    .with("index", idx)
                    .with("reason", "missing_type"),
            );
            continue;
        };

        if FILE_CHECK_TYPES.contains(&ctype) {
            let path = check.get("path").and_then(Value::as_str).unwrap_or("");
            if !is_safe_relative_path(path) {
                reasons.push(
                    Reason::new("invalid_check_path")
                        .with("index", idx)
                        .with("check_type", ctype)
                        .with("path", path),
                );
                continue;
            }
        }

        let mut raw = raw.clone();
        if COMMAND_CHECK_TYPES.contains(&ctype) {
            let cmd = check
                .get("cmd")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if !allowed_commands.iter().any(|p| cmd.starts_with(p.as_str())) {
                reasons.push(
                    Reason::new("command_not_allowed")
                        .with("index", idx)
                        .with("cmd", cmd)
                        .with("expected", serde_json::json!(allowed_commands)),
                );
                continue;
            }
            if let Some(whitelist) = command_whitelist {
                if !whitelist.iter().any(|w| w == &cmd) {
                    reasons.push(
                        Reason::new("command_not_in_whitelist")
                            .with("index", idx)
                            .with("cmd", cmd),
                    );
                    continue;
                }
            }
            if let Some(cwd) = check.get("cwd").and_then(Value::as_str) {
                if !cwd.is_empty() && !is_safe_relative_path(cwd) {
                    reasons.push(Reason::new("invalid_cwd").with("index", idx).with("cwd", cwd));
                    continue;
                }
            }
            let obj = raw.as_object_mut().expect("check was an object");
            obj.insert(
                "allow_prefixes".to_string(),
                serde_json::json!(allowed_commands),
            );
            obj.insert("cwd".to_string(), Value::String(".".to_string()));
        }

        match serde_json::from_value::<Check>(raw) {
            Ok(check) => cleaned.push(check),
            Err(_) => reasons.push(
                Reason::new("invalid_check")
                    .with("index", idx)
                    .with("reason", "unparseable"),
            ),
        }
    }

    (cleaned, reasons)
}

/// Validate assistant write proposals. When `enforced` is false, allow/deny
/// gating downgrades from drop to report-only; malformed targets and unsafe
/// paths are always dropped.
pub fn validate_writes(
    writes: &[Value],
    allow_write: &[String],
    deny_write: &[String],
    enforced: bool,
) -> (Vec<WriteOp>, Vec<Reason>) {
    let mut cleaned = Vec::new();
    let mut reasons = Vec::new();

    for (idx, raw) in writes.iter().enumerate() {
        let Some(write) = raw.as_object() else {
            reasons.push(
                Reason::new("invalid_write")
                    .with("index", idx)
                    .with("reason", "not_object"),
            );
            continue;
        };
        let target_raw = write.get("target").and_then(Value::as_str).unwrap_or("");
        let target = match target_raw {
            "workspace" => WriteTarget::Workspace,
            "run" => WriteTarget::Run,
            other => {
                reasons.push(
                    Reason::new("invalid_write_target")
                        .with("index", idx)
                        .with("target", other),
                );
                continue;
            }
        };
        let path = write.get("path").and_then(Value::as_str).unwrap_or("");
        if !is_safe_relative_path(path) {
            reasons.push(
                Reason::new("invalid_write_path")
                    .with("index", idx)
                    .with("target", target_raw)
                    .with("path", path),
            );
            continue;
        }
        if target == WriteTarget::Workspace && !is_write_allowed(path, allow_write, deny_write) {
            let reason = Reason::new("write_not_allowed").with("index", idx).with("path", path);
            if enforced {
                reasons.push(reason);
                continue;
            }
            reasons.push(reason.as_warning());
        }
        cleaned.push(WriteOp {
            target,
            path: path.to_string(),
            content: write
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        });
    }

    (cleaned, reasons)
}

/// Validate assistant command proposals. Items may be bare strings or
/// `{cmd, timeout}` objects; empty commands are silently skipped.
pub fn validate_commands(
    commands: &[Value],
    allowed_commands: &[String],
    default_timeout: u64,
    enforced: bool,
) -> (Vec<CommandOp>, Vec<Reason>) {
    let mut cleaned = Vec::new();
    let mut reasons = Vec::new();

    for (idx, raw) in commands.iter().enumerate() {
        let (cmd, timeout) = match raw {
            Value::Object(map) => {
                let cmd = map
                    .get("cmd")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                let timeout = map
                    .get("timeout")
                    .and_then(Value::as_u64)
                    .unwrap_or(default_timeout);
                (cmd, timeout)
            }
            Value::String(s) => (s.trim().to_string(), default_timeout),
            other => (other.to_string().trim().to_string(), default_timeout),
        };
        if cmd.is_empty() {
            continue;
        }
        if !is_command_allowed(&cmd, allowed_commands) {
            let reason = Reason::new("command_not_allowed")
                .with("index", idx)
                .with("cmd", cmd.clone())
                .with("expected", serde_json::json!(allowed_commands));
            if enforced {
                reasons.push(reason);
                continue;
            }
            reasons.push(reason.as_warning());
        }
        let timeout = if timeout == 0 { default_timeout } else { timeout };
        cleaned.push(CommandOp { cmd, timeout });
    }

    (cleaned, reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn allowed() -> Vec<String> {
        vec!["python".to_string(), "pytest".to_string(), "npm".to_string()]
    }

    // ── validate_checks ─────────────────────────────────────────────

    #[test]
    fn test_checks_pass_and_get_pinned() {
        let checks = vec![json!({"type": "command", "cmd": "pytest -q", "cwd": "tests"})];
        let (cleaned, reasons) = validate_checks(&checks, &allowed(), None);
        assert!(reasons.is_empty());
        assert_eq!(cleaned.len(), 1);
        match &cleaned[0] {
            Check::Known(aipl_core::types::CheckSpec::Command {
                cmd,
                cwd,
                allow_prefixes,
                ..
            }) => {
                assert_eq!(cmd, "pytest -q");
                assert_eq!(cwd.as_deref(), Some("."));
                assert_eq!(allow_prefixes, &allowed());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_checks_drop_disallowed_command() {
        let checks = vec![json!({"type": "command", "cmd": "rm -rf /"})];
        let (cleaned, reasons) = validate_checks(&checks, &allowed(), None);
        assert!(cleaned.is_empty());
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].kind, "command_not_allowed");
        assert_eq!(reasons[0].get("index").unwrap(), 0);
    }

    #[test]
    fn test_checks_drop_unsafe_file_path() {
        let checks = vec![
            json!({"type": "file_exists", "path": "../etc/passwd"}),
            json!({"type": "file_contains", "path": "ok.txt", "needle": "x"}),
        ];
        let (cleaned, reasons) = validate_checks(&checks, &allowed(), None);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].kind, "invalid_check_path");
    }

    #[test]
    fn test_checks_whitelist_gate() {
        let checks = vec![json!({"type": "command", "cmd": "pytest -q"})];
        let whitelist = vec!["python -m pytest".to_string()];
        let (cleaned, reasons) = validate_checks(&checks, &allowed(), Some(&whitelist));
        assert!(cleaned.is_empty());
        assert_eq!(reasons[0].kind, "command_not_in_whitelist");
    }

    #[test]
    fn test_checks_non_object_and_missing_type() {
        let checks = vec![json!("nope"), json!({"path": "a.txt"})];
        let (cleaned, reasons) = validate_checks(&checks, &allowed(), None);
        assert!(cleaned.is_empty());
        assert_eq!(reasons.len(), 2);
        assert_eq!(reasons[0].kind, "invalid_check");
        assert_eq!(reasons[1].get("reason").unwrap(), "missing_type");
    }

    #[test]
    fn test_checks_unknown_type_passes_through() {
        let checks = vec![json!({"type": "quantum_check", "qubits": 3})];
        let (cleaned, reasons) = validate_checks(&checks, &allowed(), None);
        assert!(reasons.is_empty());
        assert_eq!(cleaned.len(), 1);
        assert!(matches!(cleaned[0], Check::Unknown(_)));
    }

    #[test]
    fn test_checks_invalid_cwd() {
        let checks = vec![json!({"type": "command", "cmd": "pytest", "cwd": "../up"})];
        let (cleaned, reasons) = validate_checks(&checks, &allowed(), None);
        assert!(cleaned.is_empty());
        assert_eq!(reasons[0].kind, "invalid_cwd");
    }

    // ── validate_writes ─────────────────────────────────────────────

    #[test]
    fn test_writes_valid() {
        let writes = vec![
            json!({"target": "workspace", "path": "src/x.py", "content": "pass"}),
            json!({"target": "run", "path": "outputs/summary.txt", "content": "ok"}),
        ];
        let (cleaned, reasons) = validate_writes(&writes, &[], &[], true);
        assert!(reasons.is_empty());
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].target, WriteTarget::Workspace);
        assert_eq!(cleaned[1].target, WriteTarget::Run);
    }

    #[test]
    fn test_writes_bad_target_and_path() {
        let writes = vec![
            json!({"target": "system", "path": "x"}),
            json!({"target": "workspace", "path": "/abs"}),
            json!(42),
        ];
        let (cleaned, reasons) = validate_writes(&writes, &[], &[], true);
        assert!(cleaned.is_empty());
        assert_eq!(reasons.len(), 3);
        assert_eq!(reasons[0].kind, "invalid_write_target");
        assert_eq!(reasons[1].kind, "invalid_write_path");
        assert_eq!(reasons[2].kind, "invalid_write");
    }

    #[test]
    fn test_writes_deny_gating() {
        let deny = vec![".git".to_string()];
        let writes = vec![json!({"target": "workspace", "path": ".git/hooks/pre-commit"})];
        let (cleaned, reasons) = validate_writes(&writes, &[], &deny, true);
        assert!(cleaned.is_empty());
        assert_eq!(reasons[0].kind, "write_not_allowed");
    }

    #[test]
    fn test_writes_report_only_keeps_item() {
        let deny = vec![".git".to_string()];
        let writes = vec![json!({"target": "workspace", "path": ".git/config"})];
        let (cleaned, reasons) = validate_writes(&writes, &[], &deny, false);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].is_warning());
    }

    #[test]
    fn test_writes_run_target_not_gated_by_allow() {
        let allow = vec!["src".to_string()];
        let writes = vec![json!({"target": "run", "path": "outputs/x.txt"})];
        let (cleaned, reasons) = validate_writes(&writes, &allow, &[], true);
        assert_eq!(cleaned.len(), 1);
        assert!(reasons.is_empty());
    }

    // ── validate_commands ───────────────────────────────────────────

    #[test]
    fn test_commands_mixed_forms() {
        let commands = vec![
            json!("pytest -q"),
            json!({"cmd": "python build.py", "timeout": 60}),
            json!(""),
        ];
        let (cleaned, reasons) = validate_commands(&commands, &allowed(), 300, true);
        assert!(reasons.is_empty());
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0], CommandOp { cmd: "pytest -q".into(), timeout: 300 });
        assert_eq!(cleaned[1].timeout, 60);
    }

    #[test]
    fn test_commands_drop_disallowed() {
        let commands = vec![json!("rm -rf /"), json!("pytest; rm -rf /")];
        let (cleaned, reasons) = validate_commands(&commands, &allowed(), 300, true);
        assert!(cleaned.is_empty());
        assert_eq!(reasons.len(), 2);
        assert!(reasons.iter().all(|r| r.kind == "command_not_allowed"));
    }

    #[test]
    fn test_commands_report_only_keeps() {
        let commands = vec![json!("rm -rf /tmp/x")];
        let (cleaned, reasons) = validate_commands(&commands, &allowed(), 300, false);
        assert_eq!(cleaned.len(), 1);
        assert!(reasons[0].is_warning());
    }

    #[test]
    fn test_commands_zero_timeout_uses_default() {
        let commands = vec![json!({"cmd": "pytest", "timeout": 0})];
        let (cleaned, _) = validate_commands(&commands, &allowed(), 120, true);
        assert_eq!(cleaned[0].timeout, 120);
    }
}
