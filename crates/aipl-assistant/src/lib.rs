//! Assistant invocation: runs the external code-generation binary as a
//! schema-constrained subprocess with idle and hard timeouts.

pub mod schemas;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use aipl_core::AppError;

pub use schemas::{
    FixResponse, PlanResponse, fix_schema, parse_fix_response, parse_plan_response, plan_schema,
    write_schema_file,
};

const STDERR_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One assistant invocation.
pub struct AssistantRequest {
    pub prompt: String,
    pub schema_path: PathBuf,
    /// Sandbox mode flag forwarded to the assistant (e.g. "workspace-write").
    pub sandbox_mode: String,
    pub work_dir: PathBuf,
    /// Directory for prompt/output/error artifacts of this invocation.
    pub io_dir: PathBuf,
    /// No output for this long kills the process (recoverable per round).
    pub idle_timeout: Duration,
    /// Absolute wall-clock ceiling.
    pub hard_timeout: Duration,
    /// Touched on every observed activity for external watchers.
    pub heartbeat_path: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

pub struct AssistantInvoker {
    binary: PathBuf,
}

impl AssistantInvoker {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Locate the assistant binary: `AIPL_ASSISTANT_BIN` wins, then `codex`
    /// on PATH.
    pub fn discover() -> Result<Self, AppError> {
        if let Ok(explicit) = std::env::var("AIPL_ASSISTANT_BIN") {
            if !explicit.trim().is_empty() {
                return Ok(Self::new(PathBuf::from(explicit)));
            }
        }
        which::which("codex")
            .map(Self::new)
            .map_err(|_| AppError::AssistantNotInstalled("codex".to_string()))
    }

    /// Run the assistant. On success the returned text is the raw response;
    /// callers validate it against the declared schema before side effects.
    pub async fn run(&self, request: &AssistantRequest) -> Result<String> {
        std::fs::create_dir_all(&request.io_dir)?;
        let prompt_path = request.io_dir.join("prompt.txt");
        let output_path = request.io_dir.join("output.json");
        let error_path = request.io_dir.join("error.log");
        std::fs::write(&prompt_path, &request.prompt)?;

        let mut command = Command::new(&self.binary);
        command
            .arg("exec")
            .arg("--full-auto")
            .args(["--sandbox", &request.sandbox_mode])
            .arg("-C")
            .arg(&request.work_dir)
            .arg("--skip-git-repo-check")
            .arg("--output-schema")
            .arg(&request.schema_path)
            .args(["--color", "never"])
            .args(&request.extra_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        debug!(binary = %self.binary.display(), "spawning assistant");
        let mut child = command.spawn().context("Failed to spawn assistant")?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone().into_bytes();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&prompt).await {
                    warn!(error = %err, "failed to write assistant prompt");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let started = Instant::now();
        let mut last_activity = Instant::now();
        let mut output = String::new();
        let mut errors = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        while !stdout_done || !stderr_done {
            tokio::select! {
                line = stdout_reader.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            last_activity = Instant::now();
                            self.touch_heartbeat(request);
                            output.push_str(&line);
                            output.push('\n');
                        }
                        _ => stdout_done = true,
                    }
                }
                line = stderr_reader.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            last_activity = Instant::now();
                            self.touch_heartbeat(request);
                            errors.push_str(&line);
                            errors.push('\n');
                        }
                        _ => stderr_done = true,
                    }
                }
                _ = tokio::time::sleep(STDERR_POLL_INTERVAL) => {
                    if last_activity.elapsed() >= request.idle_timeout {
                        let _ = std::fs::write(&error_path, &errors);
                        warn!(seconds = request.idle_timeout.as_secs(), "assistant idle timeout");
                        return Err(
                            AppError::AssistantIdleTimeout(request.idle_timeout.as_secs()).into()
                        );
                    }
                    if started.elapsed() >= request.hard_timeout {
                        let _ = std::fs::write(&error_path, &errors);
                        warn!(seconds = request.hard_timeout.as_secs(), "assistant hard timeout");
                        return Err(
                            AppError::AssistantHardTimeout(request.hard_timeout.as_secs()).into()
                        );
                    }
                }
            }
        }

        let status = child.wait().await.context("Failed to wait for assistant")?;
        std::fs::write(&output_path, &output)?;
        std::fs::write(&error_path, &errors)?;

        if !status.success() {
            let detail = last_non_empty(&errors)
                .or_else(|| last_non_empty(&output))
                .unwrap_or_else(|| format!("assistant exited with {status}"));
            anyhow::bail!("assistant failed: {detail}");
        }
        Ok(output.trim().to_string())
    }

    fn touch_heartbeat(&self, request: &AssistantRequest) {
        if let Some(path) = &request.heartbeat_path {
            let _ = std::fs::write(path, format!("{}", aipl_core::now_ts()));
        }
    }
}

fn last_non_empty(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Build the fix-round prompt from the task and an optional rework brief.
pub fn build_fix_prompt(
    task_title: &str,
    acceptance_criteria: &[String],
    context_rules: &[String],
    rework: Option<&aipl_verify::ReworkRequest>,
) -> String {
    let mut lines = vec![
        format!("Task: {task_title}"),
        String::new(),
        "Acceptance criteria:".to_string(),
    ];
    if acceptance_criteria.is_empty() {
        lines.push("- (none)".to_string());
    }
    for criterion in acceptance_criteria {
        lines.push(format!("- {criterion}"));
    }
    if !context_rules.is_empty() {
        lines.push(String::new());
        lines.push("Rules:".to_string());
        for rule in context_rules {
            lines.push(format!("- {rule}"));
        }
    }
    if let Some(rework) = rework {
        lines.push(String::new());
        lines.push(format!(
            "Previous round failed ({} attempts left).",
            rework.remaining_attempts
        ));
        if !rework.error_summary.is_empty() {
            lines.push("Errors:".to_string());
            lines.push(rework.error_summary.clone());
        }
        if !rework.fix_guidance.is_empty() {
            lines.push(rework.fix_guidance.clone());
        }
        if !rework.suspected_related_files.is_empty() {
            lines.push(format!(
                "Files likely involved: {}",
                rework.suspected_related_files.join(", ")
            ));
        }
    }
    lines.push(String::new());
    lines.push(
        "Respond with JSON matching the output schema: writes (target/path/content) and commands."
            .to_string(),
    );
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(io_dir: PathBuf, work_dir: PathBuf, schema_path: PathBuf) -> AssistantRequest {
        AssistantRequest {
            prompt: "do the thing".into(),
            schema_path,
            sandbox_mode: "workspace-write".into(),
            work_dir,
            io_dir,
            idle_timeout: Duration::from_secs(5),
            hard_timeout: Duration::from_secs(10),
            heartbeat_path: None,
            extra_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_run_with_stub_binary() {
        let tmp = tempfile::tempdir().unwrap();
        // stub assistant: ignores args, prints a fix response
        let stub = tmp.path().join("stub-assistant.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\ncat > /dev/null\necho '{\"writes\": [], \"commands\": []}'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let schema_path = write_schema_file(tmp.path(), "fix", &fix_schema()).unwrap();
        let invoker = AssistantInvoker::new(stub);
        let io_dir = tmp.path().join("io");
        let response = invoker
            .run(&request(io_dir.clone(), tmp.path().to_path_buf(), schema_path))
            .await
            .unwrap();
        let fix = parse_fix_response(&response).unwrap();
        assert!(fix.writes.is_empty());
        assert!(io_dir.join("prompt.txt").exists());
        assert!(io_dir.join("output.json").exists());
    }

    #[tokio::test]
    async fn test_idle_timeout_kills_silent_assistant() {
        let tmp = tempfile::tempdir().unwrap();
        let stub = tmp.path().join("sleeper.sh");
        std::fs::write(&stub, "#!/bin/sh\ncat > /dev/null\nsleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let schema_path = write_schema_file(tmp.path(), "fix", &fix_schema()).unwrap();
        let invoker = AssistantInvoker::new(stub);
        let mut req = request(tmp.path().join("io"), tmp.path().to_path_buf(), schema_path);
        req.idle_timeout = Duration::from_secs(1);
        let err = invoker.run(&req).await.unwrap_err();
        let app_err = err.downcast_ref::<AppError>().unwrap();
        assert!(matches!(app_err, AppError::AssistantIdleTimeout(1)));
    }

    #[tokio::test]
    async fn test_failed_assistant_surfaces_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let stub = tmp.path().join("broken.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\ncat > /dev/null\necho 'rate limited' >&2\nexit 2\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let schema_path = write_schema_file(tmp.path(), "fix", &fix_schema()).unwrap();
        let invoker = AssistantInvoker::new(stub);
        let req = request(tmp.path().join("io"), tmp.path().to_path_buf(), schema_path);
        let err = invoker.run(&req).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_build_fix_prompt_includes_rework() {
        let rework = aipl_verify::ReworkRequest {
            remaining_attempts: 1,
            error_summary: "pytest -> failed (exit=Some(1))".into(),
            suspected_related_files: vec!["src/calc.py".into()],
            ..Default::default()
        };
        let prompt = build_fix_prompt(
            "Fix the calculator",
            &["tests pass".to_string()],
            &["prefer small diffs".to_string()],
            Some(&rework),
        );
        assert!(prompt.contains("Task: Fix the calculator"));
        assert!(prompt.contains("- tests pass"));
        assert!(prompt.contains("- prefer small diffs"));
        assert!(prompt.contains("1 attempts left"));
        assert!(prompt.contains("src/calc.py"));
    }

    #[test]
    fn test_discover_honors_env() {
        // Use a scoped env var; discover() reads it directly.
        unsafe { std::env::set_var("AIPL_ASSISTANT_BIN", "/opt/assistant/bin/assistant") };
        let invoker = AssistantInvoker::discover().unwrap();
        assert_eq!(invoker.binary, PathBuf::from("/opt/assistant/bin/assistant"));
        unsafe { std::env::remove_var("AIPL_ASSISTANT_BIN") };
    }
}
