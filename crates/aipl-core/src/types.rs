//! Task, check, and run data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::reason::Reason;
use crate::state::TaskStatus;

/// The only schedulable task type. Tasks of any other type are never picked.
pub const TASK_TYPE_TIME_FOR_CERTAINTY: &str = "time_for_certainty";

/// A machine-verifiable assertion, tagged by `type` on the wire.
///
/// Unrecognized variants are preserved as raw JSON so a single unknown check
/// inside a backlog never poisons the whole task; the verifier reports it as
/// `unknown_check` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Known(CheckSpec),
    Unknown(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckSpec {
    FileExists {
        path: String,
        #[serde(default)]
        soft: bool,
    },
    FileContains {
        path: String,
        #[serde(default)]
        needle: String,
        #[serde(default)]
        soft: bool,
    },
    FileMatches {
        path: String,
        pattern: String,
        #[serde(default)]
        ignore_case: bool,
        #[serde(default)]
        multiline: bool,
        #[serde(default)]
        soft: bool,
    },
    Command {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allow_prefixes: Vec<String>,
        /// Set to false by the policy layer in report-only mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy_enforced: Option<bool>,
        #[serde(default)]
        soft: bool,
    },
    CommandContains {
        cmd: String,
        #[serde(default)]
        needle: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allow_prefixes: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy_enforced: Option<bool>,
        #[serde(default)]
        soft: bool,
    },
    JsonSchema {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema_path: Option<String>,
        #[serde(default)]
        soft: bool,
    },
    HttpCheck {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contains: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        json_contains: Option<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        allow_hosts: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<u32>,
        #[serde(default)]
        soft: bool,
    },
}

impl Check {
    pub fn type_name(&self) -> &str {
        match self {
            Check::Known(spec) => spec.type_name(),
            Check::Unknown(value) => value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }

    /// Execution checks prove something actually ran (command or HTTP), as
    /// opposed to inspecting files the assistant may simply have written.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            Check::Known(
                CheckSpec::Command { .. }
                    | CheckSpec::CommandContains { .. }
                    | CheckSpec::HttpCheck { .. }
            )
        )
    }

    pub fn is_soft(&self) -> bool {
        match self {
            Check::Known(spec) => spec.is_soft(),
            Check::Unknown(value) => {
                value.get("soft").and_then(Value::as_bool).unwrap_or(false)
            }
        }
    }

    /// The workspace-relative path this check inspects, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Check::Known(
                CheckSpec::FileExists { path, .. }
                | CheckSpec::FileContains { path, .. }
                | CheckSpec::FileMatches { path, .. }
                | CheckSpec::JsonSchema { path, .. },
            ) => Some(path),
            _ => None,
        }
    }
}

impl CheckSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            CheckSpec::FileExists { .. } => "file_exists",
            CheckSpec::FileContains { .. } => "file_contains",
            CheckSpec::FileMatches { .. } => "file_matches",
            CheckSpec::Command { .. } => "command",
            CheckSpec::CommandContains { .. } => "command_contains",
            CheckSpec::JsonSchema { .. } => "json_schema",
            CheckSpec::HttpCheck { .. } => "http_check",
        }
    }

    pub fn is_soft(&self) -> bool {
        match self {
            CheckSpec::FileExists { soft, .. }
            | CheckSpec::FileContains { soft, .. }
            | CheckSpec::FileMatches { soft, .. }
            | CheckSpec::Command { soft, .. }
            | CheckSpec::CommandContains { soft, .. }
            | CheckSpec::JsonSchema { soft, .. }
            | CheckSpec::HttpCheck { soft, .. } => *soft,
        }
    }
}

impl Serialize for Check {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Check::Known(spec) => spec.serialize(serializer),
            Check::Unknown(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Check {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match serde_json::from_value::<CheckSpec>(value.clone()) {
            Ok(spec) => Ok(Check::Known(spec)),
            Err(_) => Ok(Check::Unknown(value)),
        }
    }
}

/// The unit of scheduling. Lives inside a backlog file, identified uniquely
/// within its plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,

    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    #[serde(default)]
    pub checks: Vec<Check>,

    /// Per-task workspace override; absolute path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,

    /// Bumped while the task is `doing`; drives the stale scanner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_ts: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_ts: Option<f64>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub stale_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_ts: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from_goal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_reasons: Vec<Reason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_plan: Option<String>,

    /// High-risk marker: true, numeric >= 7, or "high"/"critical".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<Value>,
}

fn default_task_type() -> String {
    TASK_TYPE_TIME_FOR_CERTAINTY.to_string()
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            task_type: default_task_type(),
            priority: 0,
            dependencies: Vec::new(),
            status: TaskStatus::Todo,
            acceptance_criteria: Vec::new(),
            checks: Vec::new(),
            workspace_path: None,
            plan_id: None,
            step_id: None,
            estimated_minutes: None,
            heartbeat_ts: None,
            stale_ts: None,
            stale_count: 0,
            status_ts: None,
            created_ts: None,
            created_from_goal: None,
            last_run: None,
            last_reasons: Vec::new(),
            last_plan: None,
            risk_level: None,
        }
    }

    pub fn is_high_risk(&self) -> bool {
        match &self.risk_level {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v >= 7.0),
            Some(Value::String(s)) => {
                matches!(s.trim().to_lowercase().as_str(), "high" | "critical")
            }
            _ => false,
        }
    }
}

/// Lifecycle of one execution attempt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Starting,
    Running,
    Paused,
    Canceled,
    AwaitingReview,
    Done,
    Failed,
    Discarded,
}

impl RunStatus {
    /// Terminal states clean their stage and accept no further rounds.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Canceled | RunStatus::Done | RunStatus::Failed | RunStatus::Discarded
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Canceled => "canceled",
            RunStatus::AwaitingReview => "awaiting_review",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
            RunStatus::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Mutable run record persisted at `<run_dir>/meta.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMeta {
    #[serde(default)]
    pub run_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_main_root: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_stage_root: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default)]
    pub status: RunStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_tests: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patchset_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_files_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_files_count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_results: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<f64>,
}
