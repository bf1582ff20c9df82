//! Pluggable command execution for `command` checks.
//!
//! The default runner spawns real subprocesses; tests and policy dry-runs
//! substitute their own implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Raw result of one command attempt. `executed == false` means the runner
/// refused to run it (e.g. a recording runner in report-only experiments).
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub executed: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timeout_error: Option<String>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &str, cwd: &Path, timeout_secs: u64) -> CommandResult;
}

/// Default subprocess runner. With `allow_shell` the command line goes
/// through `sh -c`; otherwise it is split on whitespace into explicit argv.
/// Either way the command has already passed the metacharacter guard.
pub struct SubprocessRunner {
    pub allow_shell: bool,
}

impl SubprocessRunner {
    pub fn new(allow_shell: bool) -> Self {
        Self { allow_shell }
    }

    fn build_command(&self, cmd: &str, cwd: &Path) -> Option<Command> {
        let mut command = if self.allow_shell {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        } else {
            let mut parts = cmd.split_whitespace();
            let program = parts.next()?;
            let mut c = Command::new(program);
            c.args(parts);
            c
        };
        command.current_dir(cwd);
        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);
        Some(command)
    }
}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, cmd: &str, cwd: &Path, timeout_secs: u64) -> CommandResult {
        let Some(mut command) = self.build_command(cmd, cwd) else {
            return CommandResult {
                executed: false,
                ..Default::default()
            };
        };
        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return CommandResult {
                    executed: true,
                    exit_code: Some(127),
                    stderr: err.to_string(),
                    ..Default::default()
                };
            }
        };
        // kill_on_drop reaps the child when the timeout drops the future.
        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => CommandResult {
                executed: true,
                timed_out: false,
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timeout_error: None,
            },
            Ok(Err(err)) => CommandResult {
                executed: true,
                exit_code: Some(1),
                stderr: err.to_string(),
                ..Default::default()
            },
            Err(_) => CommandResult {
                executed: true,
                timed_out: true,
                exit_code: None,
                timeout_error: Some(format!("timeout after {timeout_secs}s: {cmd}")),
                ..Default::default()
            },
        }
    }
}

/// Truncate text to `max_bytes`, keeping the head and tail around a centered
/// omission marker. Splits land on char boundaries.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let keep = max_bytes / 2;
    let mut head_end = keep.min(text.len());
    while head_end > 0 && !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len().saturating_sub(keep);
    while tail_start < text.len() && !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let omitted = tail_start - head_end;
    format!(
        "{}\n... [{} bytes truncated] ...\n{}",
        &text[..head_end],
        omitted,
        &text[tail_start..]
    )
}

/// Last `max_len` bytes of a string, on a char boundary.
pub fn tail(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut start = text.len() - max_len;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
