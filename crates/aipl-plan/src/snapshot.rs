//! One-shot plan cleanup: remove a plan's tasks from the backlog and park
//! them as a snapshot on the plan record.
//!
//! Cleanup of one plan is serialized through a file lock so concurrent runs
//! of the same plan cannot interleave snapshotting.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use fd_lock::RwLock;
use serde_json::{Value, json};

use aipl_backlog::BacklogStore;
use aipl_core::fsio;
use aipl_core::layout;

#[derive(Debug, Clone)]
pub struct CleanupOutcome {
    pub removed: usize,
    pub kept: usize,
    pub already_cleaned: bool,
}

/// Remove the plan's tasks from its backlog file, record them as
/// `cleanup_snapshot` on plan.json, and write `snapshot.json`. A second call
/// observes the recorded snapshot and changes nothing.
pub fn cleanup_snapshot(root: &Path, workspace: Option<&Path>, plan_id: &str) -> Result<CleanupOutcome> {
    let plan_dir = layout::plan_dir(root, workspace, plan_id);
    std::fs::create_dir_all(&plan_dir)?;

    let lock_path = plan_dir.join("cleanup.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    let mut lock = RwLock::new(lock_file);
    let _guard = lock.write().context("failed to take cleanup lock")?;

    let plan_path = plan_dir.join("plan.json");
    let mut plan: Value = fsio::read_json_or(&plan_path, json!({"plan_id": plan_id}));
    if plan.get("cleanup_snapshot").is_some() {
        let removed = plan["cleanup_snapshot"].as_array().map(Vec::len).unwrap_or(0);
        return Ok(CleanupOutcome {
            removed,
            kept: 0,
            already_cleaned: true,
        });
    }

    let store = BacklogStore::new(root);
    let backlog_path = store.backlog_path(workspace, plan_id);
    let mut backlog = store.load(&backlog_path);
    let (removed_tasks, kept_tasks): (Vec<_>, Vec<_>) = backlog
        .tasks
        .drain(..)
        .partition(|task| task.plan_id.as_deref() == Some(plan_id));
    backlog.tasks = kept_tasks;
    store.save(&backlog_path, &backlog)?;

    let now = aipl_core::now_ts();
    let removed_json = serde_json::to_value(&removed_tasks)?;
    plan["last_cleanup_ts"] = json!(now);
    plan["cleanup_snapshot"] = removed_json.clone();
    fsio::write_json(&plan_path, &plan)?;
    fsio::write_json(
        &plan_dir.join("snapshot.json"),
        &json!({
            "plan_id": plan_id,
            "snapshot_ts": now,
            "stop_reason": "cleanup",
            "tasks": removed_json,
        }),
    )?;

    Ok(CleanupOutcome {
        removed: removed_tasks.len(),
        kept: backlog.tasks.len(),
        already_cleaned: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aipl_backlog::Backlog;
    use aipl_core::types::Task;

    fn seeded(tmp: &tempfile::TempDir) -> BacklogStore {
        let store = BacklogStore::new(tmp.path());
        let mut plan_task = Task::new("T001", "planned");
        plan_task.plan_id = Some("plan-x".into());
        let other_task = Task::new("T900", "unrelated");
        store
            .save(
                &store.backlog_path(None, "plan-x"),
                &Backlog {
                    tasks: vec![plan_task, other_task],
                },
            )
            .unwrap();
        store
    }

    #[test]
    fn test_cleanup_removes_plan_tasks_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded(&tmp);
        let outcome = cleanup_snapshot(tmp.path(), None, "plan-x").unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.kept, 1);
        assert!(!outcome.already_cleaned);

        let backlog = store.load(&store.backlog_path(None, "plan-x"));
        assert_eq!(backlog.tasks.len(), 1);
        assert_eq!(backlog.tasks[0].id, "T900");

        let plan_dir = layout::plan_dir(tmp.path(), None, "plan-x");
        let snapshot: Value = fsio::read_json(&plan_dir.join("snapshot.json")).unwrap();
        assert_eq!(snapshot["tasks"][0]["id"], "T001");
        let plan: Value = fsio::read_json(&plan_dir.join("plan.json")).unwrap();
        assert_eq!(plan["cleanup_snapshot"][0]["id"], "T001");
    }

    #[test]
    fn test_cleanup_is_one_shot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = seeded(&tmp);
        cleanup_snapshot(tmp.path(), None, "plan-x").unwrap();

        // re-add a task with the same plan id; second cleanup must not touch it
        let path = store.backlog_path(None, "plan-x");
        let mut backlog = store.load(&path);
        let mut late = Task::new("T002", "late");
        late.plan_id = Some("plan-x".into());
        backlog.tasks.push(late);
        store.save(&path, &backlog).unwrap();

        let second = cleanup_snapshot(tmp.path(), None, "plan-x").unwrap();
        assert!(second.already_cleaned);
        assert_eq!(store.load(&path).tasks.len(), 2);
    }
}
