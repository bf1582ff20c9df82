//! Verification records and the rework brief.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aipl_core::Reason;

/// One check's evidence: output tails captured at execution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    #[serde(default)]
    pub stdout_tail: String,

    #[serde(default)]
    pub stderr_tail: String,
}

/// Per-check record persisted into `verification_result.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckRecord {
    pub index: usize,

    #[serde(rename = "type")]
    pub check_type: String,

    pub ok: bool,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default)]
    pub executed: bool,

    #[serde(default)]
    pub timed_out: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_log: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_log: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_log: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

/// Outcome of a full verification pass.
#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub passed: bool,
    pub reasons: Vec<Reason>,
    pub check_results: Vec<CheckRecord>,
    pub total_duration_ms: u64,
}

/// Failure evidence for one failed execution check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub key_errors: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionErrors {
    #[serde(default)]
    pub has_errors: bool,

    #[serde(default)]
    pub failed_commands: Vec<ExecutionError>,

    #[serde(default)]
    pub error_summary: String,
}

/// Structured failure briefing consumed by the next assistant round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReworkRequest {
    pub round: usize,
    pub remaining_attempts: usize,
    pub why_failed: Vec<Reason>,
    pub execution_errors: ExecutionErrors,
    pub error_summary: String,
    pub fix_guidance: String,

    #[serde(default)]
    pub prev_stdout: String,

    #[serde(default)]
    pub code_modified: bool,

    #[serde(default)]
    pub produced_files: Vec<String>,

    #[serde(default)]
    pub workspace: String,

    #[serde(default)]
    pub suspected_related_files: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_reasons: Vec<Value>,
}
