//! Check handlers, dispatched by the `type` tag of each check.

use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use serde_json::Value;
use tracing::debug;

use aipl_core::Reason;
use aipl_core::env::EngineConfig;
use aipl_core::types::{Check, CheckSpec};

use crate::runner::{CommandRunner, tail, truncate_output};
use crate::schema::{MAX_SCHEMA_DEPTH, json_contains, schema_depth, validate_schema};
use crate::types::{CheckRecord, Evidence};

pub const MAX_JSON_BYTES: u64 = 1024 * 1024;

/// Test-runner command shapes that may be skipped when tests are disabled.
const TEST_COMMAND_PREFIXES: [&str; 20] = [
    "pytest",
    "python -m pytest",
    "python -m unittest",
    "tox",
    "nosetests",
    "go test",
    "mvn test",
    "mvn -q test",
    "gradle test",
    "./gradlew test",
    "npm test",
    "npm run test",
    "pnpm test",
    "pnpm run test",
    "yarn test",
    "yarn run test",
    "bun test",
    "cargo test",
    "jest",
    "vitest",
];

pub struct CheckContext<'a> {
    pub run_dir: &'a Path,
    pub workspace: Option<&'a Path>,
    pub log_dir: PathBuf,
    pub config: &'a EngineConfig,
    pub runner: &'a dyn CommandRunner,
    /// Resolved from env + run meta by the verifier.
    pub tests_disabled: bool,
}

impl<'a> CheckContext<'a> {
    pub async fn run_check(&self, idx: usize, check: &Check) -> CheckRecord {
        let started = std::time::Instant::now();
        let mut record = match check {
            Check::Unknown(raw) => {
                let mut record = CheckRecord {
                    index: idx,
                    check_type: check.type_name().to_string(),
                    ok: false,
                    ..Default::default()
                };
                record.reason = Some(
                    Reason::new("unknown_check")
                        .with("hint", serde_json::to_string(raw).unwrap_or_default()),
                );
                record
            }
            Check::Known(spec) => self.dispatch(idx, spec).await,
        };
        record.index = idx;
        record.duration_ms = started.elapsed().as_millis() as u64;
        record
    }

    async fn dispatch(&self, idx: usize, spec: &CheckSpec) -> CheckRecord {
        match spec {
            CheckSpec::FileExists { path, .. } => self.file_exists(spec, path),
            CheckSpec::FileContains { path, needle, .. } => self.file_contains(spec, path, needle),
            CheckSpec::FileMatches {
                path,
                pattern,
                ignore_case,
                multiline,
                ..
            } => self.file_matches(spec, path, pattern, *ignore_case, *multiline),
            CheckSpec::Command { .. } | CheckSpec::CommandContains { .. } => {
                self.command(idx, spec).await
            }
            CheckSpec::JsonSchema {
                path,
                schema,
                schema_path,
                ..
            } => self.json_schema(spec, path, schema.as_ref(), schema_path.as_deref()),
            CheckSpec::HttpCheck { .. } => self.http_check(spec).await,
        }
    }

    fn record(&self, spec: &CheckSpec) -> CheckRecord {
        CheckRecord {
            check_type: spec.type_name().to_string(),
            ok: false,
            ..Default::default()
        }
    }

    fn fail(&self, mut record: CheckRecord, reason: Reason) -> CheckRecord {
        record.ok = false;
        record.reason = Some(reason);
        record
    }

    fn pass(&self, mut record: CheckRecord) -> CheckRecord {
        record.ok = true;
        record
    }

    /// Paths under `outputs/` resolve against the run directory; everything
    /// else needs the workspace.
    fn select_base(&self, path: &str) -> Option<&Path> {
        let norm = path.replace('\\', "/");
        if norm == "outputs" || norm.starts_with("outputs/") {
            Some(self.run_dir)
        } else {
            self.workspace
        }
    }

    // ── file checks ─────────────────────────────────────────────────

    fn file_exists(&self, spec: &CheckSpec, path: &str) -> CheckRecord {
        let mut record = self.record(spec);
        record.path = Some(path.to_string());
        let Some(base) = self.select_base(path) else {
            return self.fail(record, workspace_required("file_exists"));
        };
        match confine(base, path) {
            Some(target) if target.exists() => self.pass(record),
            Some(_) => self.fail(record, Reason::new("missing_file").with("file", path)),
            None => self.fail(
                record,
                Reason::new("invalid_path")
                    .with("file", path)
                    .with("hint", "escape detected"),
            ),
        }
    }

    fn read_checked(&self, record: CheckRecord, path: &str) -> Result<(CheckRecord, String), CheckRecord> {
        let Some(base) = self.select_base(path) else {
            return Err(self.fail(record, workspace_required("file_contains")));
        };
        let Some(target) = confine(base, path) else {
            return Err(self.fail(
                record,
                Reason::new("invalid_path")
                    .with("file", path)
                    .with("hint", "escape detected"),
            ));
        };
        if !target.exists() {
            return Err(self.fail(record, Reason::new("missing_file").with("file", path)));
        }
        let text = std::fs::read(&target)
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default();
        Ok((record, text))
    }

    fn file_contains(&self, spec: &CheckSpec, path: &str, needle: &str) -> CheckRecord {
        let mut record = self.record(spec);
        record.path = Some(path.to_string());
        let (record, text) = match self.read_checked(record, path) {
            Ok(ok) => ok,
            Err(failed) => return failed,
        };
        if text.contains(needle) {
            self.pass(record)
        } else {
            self.fail(
                record,
                Reason::new("content_mismatch")
                    .with("file", path)
                    .with("expected", format!("contains {needle:?}"))
                    .with("actual", text.chars().take(200).collect::<String>()),
            )
        }
    }

    fn file_matches(
        &self,
        spec: &CheckSpec,
        path: &str,
        pattern: &str,
        ignore_case: bool,
        multiline: bool,
    ) -> CheckRecord {
        let mut record = self.record(spec);
        record.path = Some(path.to_string());
        let (record, text) = match self.read_checked(record, path) {
            Ok(ok) => ok,
            Err(failed) => return failed,
        };
        let regex = match RegexBuilder::new(pattern)
            .case_insensitive(ignore_case)
            .multi_line(multiline)
            .build()
        {
            Ok(regex) => regex,
            Err(err) => {
                return self.fail(
                    record,
                    Reason::new("pattern_not_found")
                        .with("file", path)
                        .with("expected", pattern)
                        .with("actual", format!("invalid pattern: {err}")),
                );
            }
        };
        if regex.is_match(&text) {
            self.pass(record)
        } else {
            self.fail(
                record,
                Reason::new("pattern_not_found")
                    .with("file", path)
                    .with("expected", pattern)
                    .with("actual", text.chars().take(200).collect::<String>()),
            )
        }
    }

    // ── command checks ──────────────────────────────────────────────

    async fn command(&self, idx: usize, spec: &CheckSpec) -> CheckRecord {
        let (cmd, needle, cwd, timeout, expect_exit_code, allow_prefixes, policy_enforced) =
            match spec {
                CheckSpec::Command {
                    cmd,
                    cwd,
                    timeout,
                    expect_exit_code,
                    allow_prefixes,
                    policy_enforced,
                    ..
                } => (cmd, None, cwd, timeout, expect_exit_code, allow_prefixes, policy_enforced),
                CheckSpec::CommandContains {
                    cmd,
                    needle,
                    cwd,
                    timeout,
                    expect_exit_code,
                    allow_prefixes,
                    policy_enforced,
                    ..
                } => (
                    cmd,
                    Some(needle.as_str()),
                    cwd,
                    timeout,
                    expect_exit_code,
                    allow_prefixes,
                    policy_enforced,
                ),
                _ => unreachable!("command() only dispatches command checks"),
            };

        let mut record = self.record(spec);
        record.cmd = Some(cmd.clone());
        record.evidence = Some(Evidence::default());

        let check_type = record.check_type.clone();
        let Some(workspace) = self.workspace else {
            return self.fail(record, workspace_required(&check_type));
        };
        if cmd.trim().is_empty() {
            record.status = Some("skipped".to_string());
            return self.fail(record, Reason::new("empty_command").with("cmd", cmd.clone()));
        }
        if self.tests_disabled && is_test_command(cmd) {
            record.status = Some("skipped".to_string());
            record.skip_reason = Some("tests_disabled".to_string());
            return self.pass(record);
        }
        let prefixes: Vec<String> = if allow_prefixes.is_empty() {
            self.config.allowed_commands.clone()
        } else {
            allow_prefixes.clone()
        };
        let enforced = policy_enforced.unwrap_or(true);
        if enforced && !aipl_policy::is_command_allowed(cmd, &prefixes) {
            record.status = Some("skipped".to_string());
            return self.fail(
                record,
                Reason::new("command_not_allowed")
                    .with("cmd", cmd.clone())
                    .with("expected", format!("prefix in {prefixes:?}")),
            );
        }
        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let expect_exit_code = expect_exit_code.unwrap_or(0);
        let Some(cwd_path) = resolve_cwd(workspace, cwd.as_deref()) else {
            record.status = Some("invalid_cwd".to_string());
            return self.fail(
                record,
                Reason::new("invalid_cwd").with("cwd", cwd.clone().unwrap_or_default()),
            );
        };

        let record = self
            .execute_command(idx, record, cmd, &cwd_path, timeout, expect_exit_code)
            .await;
        if !record.ok || needle.is_none() {
            return record;
        }

        // command_contains: substring over combined stdout+stderr
        let needle = needle.unwrap_or_default();
        let stdout = read_log(&self.log_dir, idx, "stdout");
        let stderr = read_log(&self.log_dir, idx, "stderr");
        let hay = format!("{stdout}\n{stderr}");
        if hay.contains(needle) {
            record
        } else {
            let mut record = record;
            record.status = Some("output_missing".to_string());
            self.fail(
                record,
                Reason::new("command_output_missing")
                    .with("cmd", cmd.clone())
                    .with("expected", format!("contains {needle:?}"))
                    .with("actual", hay.chars().take(200).collect::<String>()),
            )
        }
    }

    async fn execute_command(
        &self,
        idx: usize,
        mut record: CheckRecord,
        cmd: &str,
        cwd: &Path,
        timeout: u64,
        expect_exit_code: i32,
    ) -> CheckRecord {
        let _ = std::fs::create_dir_all(&self.log_dir);
        let stdout_rel = format!("verification/cmd-{idx}.stdout.txt");
        let stderr_rel = format!("verification/cmd-{idx}.stderr.txt");
        let timeout_rel = format!("verification/cmd-{idx}.timeout.txt");
        record.stdout_log = Some(stdout_rel.clone());
        record.stderr_log = Some(stderr_rel.clone());

        debug!(cmd, timeout, cwd = %cwd.display(), "running verification command");
        let result = self.runner.run(cmd, cwd, timeout).await;
        let stdout = truncate_output(&result.stdout, self.config.max_output_bytes);
        let stderr = truncate_output(&result.stderr, self.config.max_output_bytes);
        record.executed = result.executed;
        record.timed_out = result.timed_out;
        record.exit_code = result.exit_code;
        record.evidence = Some(Evidence {
            stdout_tail: tail(&stdout, 500),
            stderr_tail: tail(&stderr, 500),
        });

        if !result.executed {
            record.status = Some("skipped".to_string());
            return self.fail(
                record,
                Reason::new("command_not_executed")
                    .with("cmd", cmd)
                    .with("hint", "runner skipped execution"),
            );
        }
        if result.timed_out {
            let message = result
                .timeout_error
                .unwrap_or_else(|| format!("timeout after {timeout}s"));
            let _ = std::fs::write(self.log_dir.join(format!("cmd-{idx}.timeout.txt")), &message);
            record.status = Some("timeout".to_string());
            record.timeout_log = Some(timeout_rel.clone());
            return self.fail(
                record,
                Reason::new("command_timeout")
                    .with("cmd", cmd)
                    .with("expected", format!("<= {timeout}s"))
                    .with("actual", message)
                    .with("hint", format!("log: {timeout_rel}")),
            );
        }

        let _ = std::fs::write(self.log_dir.join(format!("cmd-{idx}.stdout.txt")), &stdout);
        let _ = std::fs::write(self.log_dir.join(format!("cmd-{idx}.stderr.txt")), &stderr);

        if record.exit_code != Some(expect_exit_code) {
            record.status = Some("failed".to_string());
            let actual = record
                .exit_code
                .map(|code| format!("exit code {code}"))
                .unwrap_or_else(|| "no exit code".to_string());
            return self.fail(
                record,
                Reason::new("command_failed")
                    .with("cmd", cmd)
                    .with("expected", format!("exit code {expect_exit_code}"))
                    .with("actual", actual)
                    .with("hint", format!("log: {stdout_rel} / {stderr_rel}")),
            );
        }
        record.status = Some("ok".to_string());
        self.pass(record)
    }

    // ── json schema ─────────────────────────────────────────────────

    fn json_schema(
        &self,
        spec: &CheckSpec,
        path: &str,
        schema: Option<&Value>,
        schema_path: Option<&str>,
    ) -> CheckRecord {
        let mut record = self.record(spec);
        record.path = Some(path.to_string());
        let Some(base) = self.select_base(path) else {
            return self.fail(record, workspace_required("json_schema"));
        };
        let Some(target) = confine(base, path) else {
            return self.fail(
                record,
                Reason::new("invalid_path")
                    .with("file", path)
                    .with("hint", "escape detected"),
            );
        };
        if !target.exists() {
            return self.fail(record, Reason::new("missing_file").with("file", path));
        }
        if std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0) > MAX_JSON_BYTES {
            return self.fail(
                record,
                Reason::new("file_too_large")
                    .with("file", path)
                    .with("expected", format!("<= {MAX_JSON_BYTES} bytes")),
            );
        }
        let schema_value = match schema {
            Some(schema) => schema.clone(),
            None => {
                let Some(schema_path) = schema_path else {
                    return self.fail(
                        record,
                        Reason::new("missing_schema").with("hint", "provide schema or schema_path"),
                    );
                };
                let Some(schema_target) = confine(base, schema_path).filter(|p| p.exists()) else {
                    return self.fail(
                        record,
                        Reason::new("missing_schema").with("hint", "provide schema or schema_path"),
                    );
                };
                match aipl_core::fsio::read_json::<Value>(&schema_target) {
                    Ok(value) => value,
                    Err(err) => {
                        return self.fail(
                            record,
                            Reason::new("missing_schema").with("hint", err.to_string()),
                        );
                    }
                }
            }
        };
        if schema_depth(&schema_value) > MAX_SCHEMA_DEPTH {
            return self.fail(
                record,
                Reason::new("schema_too_deep").with("expected", format!("<= {MAX_SCHEMA_DEPTH}")),
            );
        }
        let data: Value = match aipl_core::fsio::read_json(&target) {
            Ok(data) => data,
            Err(err) => {
                return self.fail(
                    record,
                    Reason::new("schema_mismatch")
                        .with("file", path)
                        .with("actual", format!("invalid json: {err}")),
                );
            }
        };
        match validate_schema(&data, &schema_value) {
            Ok(()) => self.pass(record),
            Err(err) => self.fail(
                record,
                Reason::new("schema_mismatch")
                    .with("file", path)
                    .with("expected", schema_value.to_string())
                    .with("actual", err),
            ),
        }
    }

    // ── http ────────────────────────────────────────────────────────

    async fn http_check(&self, spec: &CheckSpec) -> CheckRecord {
        let CheckSpec::HttpCheck {
            url,
            method,
            headers,
            body,
            expected_status,
            contains,
            json_contains: json_expected,
            allow_hosts,
            timeout,
            retry,
            ..
        } = spec
        else {
            unreachable!("http_check() only dispatches http checks");
        };
        let mut record = self.record(spec);
        record.url = Some(url.clone());

        let mut hosts: Vec<String> = allow_hosts.clone();
        hosts.push("127.0.0.1".to_string());
        hosts.push("localhost".to_string());
        hosts.sort();
        hosts.dedup();

        let parsed = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => {
                return self.fail(
                    record,
                    Reason::new("http_not_allowed")
                        .with("url", url.clone())
                        .with("actual", err.to_string()),
                );
            }
        };
        let host = parsed.host_str().unwrap_or_default().to_string();
        let scheme_ok = matches!(parsed.scheme(), "http" | "https");
        let host_allowed = hosts.iter().any(|h| h == &host);
        if !scheme_ok || !host_allowed {
            return self.fail(
                record,
                Reason::new("http_not_allowed")
                    .with("url", url.clone())
                    .with("expected", format!("host in {hosts:?}")),
            );
        }

        let expected_status = expected_status.unwrap_or(200);
        let timeout = timeout.unwrap_or(self.config.http_timeout);
        let retries = retry.unwrap_or(self.config.http_retries).max(1);
        let method = reqwest::Method::from_bytes(
            method.as_deref().unwrap_or("GET").to_uppercase().as_bytes(),
        )
        .unwrap_or(reqwest::Method::GET);

        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                return self.fail(
                    record,
                    Reason::new("http_error").with("url", url.clone()).with("actual", err.to_string()),
                );
            }
        };

        let mut last_error = String::new();
        let mut response: Option<(u16, String)> = None;
        for _ in 0..retries {
            let mut request = client.request(method.clone(), parsed.clone());
            for (key, value) in headers {
                request = request.header(key.as_str(), value.as_str());
            }
            if let Some(body) = body {
                request = match body {
                    Value::String(text) => request.body(text.clone()),
                    other => request
                        .header("Content-Type", "application/json")
                        .body(other.to_string()),
                };
            }
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    response = Some((status, text));
                    break;
                }
                Err(err) => last_error = err.to_string(),
            }
        }

        let Some((status, body_text)) = response else {
            if self.config.http_soft_fail && host_allowed {
                record.status = Some("skipped".to_string());
                record.skip_reason = Some(last_error);
                return self.pass(record);
            }
            record.executed = true;
            record.status = Some("error".to_string());
            return self.fail(
                record,
                Reason::new("http_error")
                    .with("url", url.clone())
                    .with("actual", last_error),
            );
        };
        record.executed = true;
        record.status = Some(status.to_string());

        if status != expected_status {
            return self.fail(
                record,
                Reason::new("http_status_mismatch")
                    .with("url", url.clone())
                    .with("expected", expected_status)
                    .with("actual", status),
            );
        }
        if let Some(needle) = contains {
            if !needle.is_empty() && !body_text.contains(needle) {
                return self.fail(
                    record,
                    Reason::new("http_body_missing")
                        .with("url", url.clone())
                        .with("expected", format!("contains {needle:?}"))
                        .with("actual", body_text.chars().take(200).collect::<String>()),
                );
            }
        }
        let Some(expected_json) = json_expected else {
            return self.pass(record);
        };
        let data: Value = match serde_json::from_str(&body_text) {
            Ok(data) => data,
            Err(err) => {
                return self.fail(
                    record,
                    Reason::new("http_json_invalid")
                        .with("url", url.clone())
                        .with("actual", err.to_string()),
                );
            }
        };
        if json_contains(&data, expected_json) {
            self.pass(record)
        } else {
            self.fail(
                record,
                Reason::new("http_json_mismatch")
                    .with("url", url.clone())
                    .with("expected", expected_json.clone())
                    .with("actual", data),
            )
        }
    }
}

fn workspace_required(check_type: &str) -> Reason {
    Reason::new("workspace_required")
        .with("check_type", check_type)
        .with("hint", "workspace path is required for this check")
}

pub fn is_test_command(cmd: &str) -> bool {
    let normalized = cmd.trim().to_lowercase();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    TEST_COMMAND_PREFIXES
        .iter()
        .any(|prefix| normalized.starts_with(prefix))
}

/// Join `rel` below `base` without allowing escapes. Lexical only, so the
/// target may not exist yet.
pub fn confine(base: &Path, rel: &str) -> Option<PathBuf> {
    let rel = rel.replace('\\', "/");
    let rel_path = Path::new(&rel);
    if rel_path.is_absolute() {
        return None;
    }
    let mut depth: i64 = 0;
    let mut joined = base.to_path_buf();
    for component in rel_path.components() {
        match component {
            std::path::Component::Normal(seg) => {
                depth += 1;
                joined.push(seg);
            }
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
                joined.pop();
            }
            _ => return None,
        }
    }
    Some(joined)
}

/// Resolve a check's cwd strictly inside the workspace.
pub fn resolve_cwd(workspace: &Path, cwd: Option<&str>) -> Option<PathBuf> {
    match cwd {
        None | Some("") => Some(workspace.to_path_buf()),
        Some(rel) => {
            let target = confine(workspace, rel)?;
            target.is_dir().then_some(target)
        }
    }
}

fn read_log(log_dir: &Path, idx: usize, stream: &str) -> String {
    std::fs::read_to_string(log_dir.join(format!("cmd-{idx}.{stream}.txt"))).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confine_blocks_escapes() {
        let base = Path::new("/ws");
        assert_eq!(confine(base, "a/b.txt"), Some(PathBuf::from("/ws/a/b.txt")));
        assert_eq!(confine(base, "./a.txt"), Some(PathBuf::from("/ws/a.txt")));
        assert_eq!(confine(base, "a/../b.txt"), Some(PathBuf::from("/ws/b.txt")));
        assert!(confine(base, "../escape.txt").is_none());
        assert!(confine(base, "a/../../escape.txt").is_none());
        assert!(confine(base, "/abs.txt").is_none());
    }

    #[test]
    fn test_resolve_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        assert_eq!(resolve_cwd(tmp.path(), None), Some(tmp.path().to_path_buf()));
        assert_eq!(
            resolve_cwd(tmp.path(), Some("sub")),
            Some(tmp.path().join("sub"))
        );
        assert!(resolve_cwd(tmp.path(), Some("missing")).is_none());
        assert!(resolve_cwd(tmp.path(), Some("../up")).is_none());
    }

    #[test]
    fn test_is_test_command() {
        assert!(is_test_command("pytest -q"));
        assert!(is_test_command("  PYTHON -m pytest tests/"));
        assert!(is_test_command("npm  run  test"));
        assert!(is_test_command("cargo test --all"));
        assert!(!is_test_command("python build.py"));
        assert!(!is_test_command("npm run build"));
    }
}
