//! Run lifecycle commands: status, events, artifacts, and operator actions.

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use aipl_controller::{RunController, read_events};
use aipl_core::AppError;
use aipl_core::layout;

pub fn cmd_status(
    controller: &RunController,
    plan_id: Option<&str>,
    run_id: Option<&str>,
) -> Result<Value> {
    controller.status_snapshot(plan_id, run_id)
}

pub fn cmd_events(
    root: &Path,
    plan_id: Option<&str>,
    run_id: &str,
    cursor: usize,
    limit: usize,
) -> Result<Value> {
    let run_dir = layout::find_run_dir(root, plan_id, run_id)
        .ok_or_else(|| AppError::RunNotFound(run_id.to_string()))?;
    let page = read_events(&run_dir, cursor, limit);
    Ok(serde_json::to_value(page)?)
}

pub fn cmd_artifacts(root: &Path, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
    let run_dir = layout::find_run_dir(root, plan_id, run_id)
        .ok_or_else(|| AppError::RunNotFound(run_id.to_string()))?;
    let mut files: Vec<String> = Vec::new();
    let mut stack = vec![run_dir.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            // the stage is the working tree, not an artifact
            if path.file_name().is_some_and(|name| name == "stage") && path.is_dir() {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(&run_dir) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    files.sort();
    Ok(json!({
        "run_id": run_id,
        "run_dir": run_dir.to_string_lossy(),
        "files": files,
    }))
}

pub fn cmd_cancel(controller: &RunController, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
    controller.cancel_run(plan_id, run_id)
}

pub fn cmd_pause(controller: &RunController, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
    controller.pause_run(plan_id, run_id)
}

pub fn cmd_resume(controller: &RunController, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
    controller.resume_run(plan_id, run_id)
}

pub fn cmd_cancel_plan_runs(controller: &RunController, plan_id: &str) -> Result<Value> {
    controller.cancel_plan_runs(plan_id)
}

pub fn cmd_retry(
    controller: &RunController,
    plan_id: Option<&str>,
    run_id: &str,
    retry_deps: bool,
) -> Result<Value> {
    controller.retry_run(plan_id, run_id, retry_deps)
}

pub fn cmd_apply(controller: &RunController, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
    controller.apply_run(plan_id, run_id)
}

pub fn cmd_discard(
    controller: &RunController,
    plan_id: Option<&str>,
    run_id: &str,
) -> Result<Value> {
    controller.discard_run(plan_id, run_id)
}

pub async fn cmd_rework(
    controller: &RunController,
    plan_id: Option<&str>,
    run_id: &str,
    feedback: &str,
    step_id: Option<&str>,
) -> Result<Value> {
    controller.rework_run(plan_id, run_id, feedback, step_id).await
}
