//! Plan builder: turns a user goal into a validated, dependency-ordered
//! backlog via the assistant's plan schema plus derivation rules.

pub mod derive;
pub mod snapshot;

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::info;

use aipl_backlog::{Backlog, BacklogStore};
use aipl_core::Reason;
use aipl_core::fsio;
use aipl_core::layout;
use aipl_core::types::Task;
use aipl_policy::validate_checks;

pub use derive::derive_checks_from_acceptance;
pub use snapshot::cleanup_snapshot;

/// Everything `build_plan` needs besides the raw assistant response.
pub struct PlanInput {
    pub plan_id: String,
    pub input_task: String,
    pub goal: String,
    pub prompt: String,
    pub workspace: Option<PathBuf>,
    pub allowed_commands: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan_id: String,
    pub tasks_count: usize,
    pub backlog_path: PathBuf,
    pub plan_dir: PathBuf,
    pub validation: Vec<Value>,
}

/// The plan prompt handed to the assistant, parameterized by the policy
/// blocks so the assistant proposes only admissible checks.
pub fn build_plan_prompt(
    plan_id: &str,
    max_tasks: usize,
    task_text: &str,
    goal_text: &str,
    hard_block: &str,
    soft_block: &str,
) -> String {
    format!(
        "You are planning work for plan {plan_id}.\n\
         Break the objective into at most {max_tasks} small, independently \
         verifiable tasks with explicit dependencies.\n\n\
         Objective:\n{task_text}\n\n\
         Background goal:\n{goal_text}\n\n\
         Sandbox policy (hard):\n{hard_block}\n\n\
         Workspace profile (soft):\n{soft_block}\n\n\
         Every task needs acceptance_criteria and, where possible, machine \
         checks (file_exists / file_contains / command). Respond with JSON \
         matching the output schema."
    )
}

/// Normalize, validate, and persist one plan: `plan.json`,
/// `plan.tasks.jsonl`, and the plan's backlog file.
pub fn build_plan(root: &Path, input: &PlanInput, raw_plan: &Value) -> Result<PlanOutcome> {
    let store = BacklogStore::new(root);
    let plan_dir = layout::plan_dir(root, input.workspace.as_deref(), &input.plan_id);
    std::fs::create_dir_all(&plan_dir)?;

    let raw_tasks: Vec<Value> = raw_plan
        .get("tasks")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    // Per-task normalized records for external consumers.
    let mut validation_summary: Vec<Value> = Vec::new();
    let tasks_record = plan_dir.join("plan.tasks.jsonl");
    let _ = std::fs::remove_file(&tasks_record);
    for task in &raw_tasks {
        let mut record = task.clone();
        let checks = normalized_checks(task);
        let (_, reasons) = validate_checks(&checks, &input.allowed_commands, None);
        record["plan_id"] = json!(input.plan_id);
        record["checks"] = Value::Array(checks);
        if !reasons.is_empty() {
            record["validation_reasons"] = serde_json::to_value(&reasons)?;
            validation_summary.push(json!({
                "task_id": record.get("id"),
                "reasons": reasons,
            }));
        }
        fsio::append_jsonl(&tasks_record, &record)?;
    }

    // Backlog entries with validated checks and unique ids.
    let backlog_path = store.backlog_path(input.workspace.as_deref(), &input.plan_id);
    let mut backlog = store.load(&backlog_path);
    let mut existing_ids: std::collections::HashSet<String> = store
        .load_tasks_filtered(None)
        .into_iter()
        .map(|(task, _)| task.id)
        .collect();
    let now = aipl_core::now_ts();
    for (idx, raw_task) in raw_tasks.iter().enumerate() {
        let mut task_id = raw_task
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-T{:02}", input.plan_id, idx + 1));
        if existing_ids.contains(&task_id) {
            task_id = format!("{task_id}_{}", now as i64);
        }
        existing_ids.insert(task_id.clone());

        let checks = normalized_checks(raw_task);
        let (cleaned, reasons) = validate_checks(&checks, &input.allowed_commands, None);
        let mut task = Task::new(
            task_id,
            raw_task
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(&format!("Task {}", idx + 1)),
        );
        task.priority = raw_task.get("priority").and_then(Value::as_i64).unwrap_or(50);
        task.estimated_minutes = raw_task
            .get("estimated_minutes")
            .and_then(Value::as_u64)
            .map(|m| m as u32)
            .or(Some(30));
        task.dependencies = raw_task
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        task.acceptance_criteria = raw_task
            .get("acceptance_criteria")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        task.checks = cleaned;
        task.plan_id = Some(input.plan_id.clone());
        task.workspace_path = input
            .workspace
            .as_deref()
            .map(|p| p.to_string_lossy().to_string());
        task.created_from_goal = Some(input.goal.clone());
        task.created_ts = Some(now);
        task.status_ts = Some(now);
        task.last_reasons = reasons;
        backlog.tasks.push(task);
    }
    store.save(&backlog_path, &backlog)?;

    fsio::write_json(
        &plan_dir.join("plan.json"),
        &json!({
            "plan_id": input.plan_id,
            "input_task": input.input_task,
            "goal": input.goal,
            "prompt": input.prompt,
            "raw_plan": raw_plan,
            "validation": validation_summary,
            "workspace_path": input.workspace.as_ref().map(|p| p.to_string_lossy()),
            "created_ts": now,
        }),
    )?;

    info!(plan_id = %input.plan_id, tasks = raw_tasks.len(), "plan written to backlog");
    Ok(PlanOutcome {
        plan_id: input.plan_id.clone(),
        tasks_count: raw_tasks.len(),
        backlog_path,
        plan_dir,
        validation: validation_summary,
    })
}

/// A task's checks, falling back to acceptance-criteria derivation when the
/// assistant supplied none.
fn normalized_checks(raw_task: &Value) -> Vec<Value> {
    let provided = raw_task
        .get("checks")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !provided.is_empty() {
        return provided;
    }
    let acceptance: Vec<String> = raw_task
        .get("acceptance_criteria")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    derive_checks_from_acceptance(&acceptance)
}

/// Per-task validation reasons as stored on the backlog task.
pub fn validation_reasons_of(task: &Task) -> &[Reason] {
    &task.last_reasons
}
