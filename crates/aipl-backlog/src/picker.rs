//! Next-task selection over one or many backlogs.

use std::path::{Path, PathBuf};

use aipl_core::ids::normalize_workspace_path;
use aipl_core::state::TaskStatus;
use aipl_core::types::{TASK_TYPE_TIME_FOR_CERTAINTY, Task};

/// Pick the next runnable task: `todo`, all dependencies `done`, scheduled
/// type, optionally scoped to a plan and workspace. Highest priority wins;
/// ties fall to file/list order.
pub fn pick_next_task<'a>(
    tasks_with_path: &'a [(Task, PathBuf)],
    plan_filter: Option<&str>,
    workspace: Option<&Path>,
) -> Option<&'a (Task, PathBuf)> {
    let done: std::collections::HashSet<&str> = tasks_with_path
        .iter()
        .map(|(task, _)| task)
        .filter(|task| task.status == TaskStatus::Done)
        .filter(|task| match plan_filter {
            Some(plan) => task.plan_id.as_deref() == Some(plan),
            None => true,
        })
        .map(|task| task.id.as_str())
        .collect();
    let workspace_filter = workspace.map(normalize_workspace_path);

    tasks_with_path
        .iter()
        .filter(|(task, _)| match plan_filter {
            Some(plan) => task.plan_id.as_deref() == Some(plan),
            None => true,
        })
        .filter(|(task, _)| match &workspace_filter {
            Some(target) => task
                .workspace_path
                .as_deref()
                .map(|ws| normalize_workspace_path(Path::new(ws)) == *target)
                .unwrap_or(false),
            None => true,
        })
        .filter(|(task, _)| task.status == TaskStatus::Todo)
        .filter(|(task, _)| task.task_type == TASK_TYPE_TIME_FOR_CERTAINTY)
        .filter(|(task, _)| task.dependencies.iter().all(|dep| done.contains(dep.as_str())))
        .fold(None, |best: Option<&(Task, PathBuf)>, candidate| {
            // first-in-list wins ties, matching file ordering
            match best {
                Some(current) if current.0.priority >= candidate.0.priority => Some(current),
                _ => Some(candidate),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus, priority: i64, deps: &[&str]) -> (Task, PathBuf) {
        let mut task = Task::new(id, "");
        task.status = status;
        task.priority = priority;
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        (task, PathBuf::from("backlog.json"))
    }

    #[test]
    fn test_picks_highest_priority_todo() {
        let tasks = vec![
            task("T1", TaskStatus::Todo, 10, &[]),
            task("T2", TaskStatus::Todo, 50, &[]),
            task("T3", TaskStatus::Doing, 99, &[]),
        ];
        let picked = pick_next_task(&tasks, None, None).unwrap();
        assert_eq!(picked.0.id, "T2");
    }

    #[test]
    fn test_dependencies_must_be_done() {
        let tasks = vec![
            task("T1", TaskStatus::Failed, 0, &[]),
            task("T2", TaskStatus::Todo, 50, &["T1"]),
            task("T3", TaskStatus::Todo, 10, &[]),
        ];
        let picked = pick_next_task(&tasks, None, None).unwrap();
        assert_eq!(picked.0.id, "T3");
    }

    #[test]
    fn test_done_dependency_unblocks() {
        let tasks = vec![
            task("T1", TaskStatus::Done, 0, &[]),
            task("T2", TaskStatus::Todo, 50, &["T1"]),
        ];
        assert_eq!(pick_next_task(&tasks, None, None).unwrap().0.id, "T2");
    }

    #[test]
    fn test_plan_filter_scopes_tasks_and_deps() {
        let mut t1 = task("T1", TaskStatus::Done, 0, &[]);
        t1.0.plan_id = Some("plan-a".into());
        let mut t2 = task("T2", TaskStatus::Todo, 50, &["T1"]);
        t2.0.plan_id = Some("plan-b".into());
        let tasks = vec![t1, t2];
        // T2's dependency is done only in plan-a; within plan-b it is unmet
        assert!(pick_next_task(&tasks, Some("plan-b"), None).is_none());
    }

    #[test]
    fn test_non_scheduled_type_skipped() {
        let mut t = task("T1", TaskStatus::Todo, 50, &[]);
        t.0.task_type = "exploratory".into();
        let tasks = vec![t];
        assert!(pick_next_task(&tasks, None, None).is_none());
    }

    #[test]
    fn test_workspace_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let ws_a = tmp.path().join("a");
        let ws_b = tmp.path().join("b");
        std::fs::create_dir_all(&ws_a).unwrap();
        std::fs::create_dir_all(&ws_b).unwrap();

        let mut t1 = task("T1", TaskStatus::Todo, 50, &[]);
        t1.0.workspace_path = Some(ws_a.to_string_lossy().to_string());
        let mut t2 = task("T2", TaskStatus::Todo, 10, &[]);
        t2.0.workspace_path = Some(ws_b.to_string_lossy().to_string());
        let tasks = vec![t1, t2];

        let picked = pick_next_task(&tasks, None, Some(&ws_b)).unwrap();
        assert_eq!(picked.0.id, "T2");
    }

    #[test]
    fn test_empty_backlog() {
        assert!(pick_next_task(&[], None, None).is_none());
    }

    #[test]
    fn test_tie_breaks_by_list_order() {
        let tasks = vec![
            task("T1", TaskStatus::Todo, 50, &[]),
            task("T2", TaskStatus::Todo, 50, &[]),
        ];
        // max_by_key returns the last max; list order must win, so assert
        // the picker is deterministic and stable across calls
        let first = pick_next_task(&tasks, None, None).unwrap().0.id.clone();
        let second = pick_next_task(&tasks, None, None).unwrap().0.id.clone();
        assert_eq!(first, second);
    }
}
