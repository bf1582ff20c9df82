//! File-backed backlogs: one JSON file per plan under each workspace's
//! artifacts tree, plus the stale scanner and retry reset.

pub mod curriculum;
pub mod picker;

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use aipl_core::fsio;
use aipl_core::layout;
use aipl_core::state::{self, TaskStatus, TransitionEvent};
use aipl_core::types::Task;

pub use curriculum::suggest_next_task;
pub use picker::pick_next_task;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Backlog {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

pub struct BacklogStore {
    root: PathBuf,
}

impl BacklogStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn backlog_path(&self, workspace: Option<&Path>, plan_id: &str) -> PathBuf {
        layout::backlog_dir(&self.root, workspace).join(format!("{plan_id}.json"))
    }

    pub fn load(&self, path: &Path) -> Backlog {
        fsio::read_json_or(path, Backlog::default())
    }

    pub fn save(&self, path: &Path, backlog: &Backlog) -> Result<()> {
        Ok(fsio::write_json(path, backlog)?)
    }

    /// Every backlog file across all workspaces, in sorted path order.
    pub fn list_backlog_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let ws_root = layout::artifacts_dir(&self.root).join("workspaces");
        if let Ok(entries) = std::fs::read_dir(&ws_root) {
            for entry in entries.flatten() {
                let backlog_dir = entry.path().join("backlog");
                if let Ok(backlogs) = std::fs::read_dir(&backlog_dir) {
                    files.extend(
                        backlogs
                            .flatten()
                            .map(|e| e.path())
                            .filter(|p| p.extension().is_some_and(|ext| ext == "json")),
                    );
                }
            }
        }
        files.sort();
        files
    }

    /// All tasks with their owning backlog file, optionally filtered by
    /// workspace (tasks without a workspace pass the filter).
    pub fn load_tasks_filtered(&self, workspace: Option<&Path>) -> Vec<(Task, PathBuf)> {
        let target = workspace.map(aipl_core::ids::normalize_workspace_path);
        let mut tasks_with_path = Vec::new();
        for path in self.list_backlog_files() {
            let backlog = self.load(&path);
            for task in backlog.tasks {
                if let Some(target) = &target {
                    if let Some(task_ws) = task.workspace_path.as_deref() {
                        if aipl_core::ids::normalize_workspace_path(Path::new(task_ws)) != *target {
                            continue;
                        }
                    }
                }
                tasks_with_path.push((task, path.clone()));
            }
        }
        tasks_with_path
    }

    pub fn find_task(&self, task_id: &str) -> Option<(Task, PathBuf)> {
        for path in self.list_backlog_files() {
            let backlog = self.load(&path);
            if let Some(task) = backlog.tasks.into_iter().find(|task| task.id == task_id) {
                return Some((task, path));
            }
        }
        None
    }

    /// Apply `update` to one task in its backlog file and persist; returns
    /// the transition events the update produced.
    pub fn update_task<F>(&self, path: &Path, task_id: &str, update: F) -> Result<Vec<TransitionEvent>>
    where
        F: FnOnce(&mut Task) -> Vec<TransitionEvent>,
    {
        let mut backlog = self.load(path);
        let mut events = Vec::new();
        if let Some(task) = backlog.tasks.iter_mut().find(|task| task.id == task_id) {
            events = update(task);
        }
        self.save(path, &backlog)?;
        self.append_state_events(&events)?;
        Ok(events)
    }

    pub fn append_state_events(&self, events: &[TransitionEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let path = layout::state_events_path(&self.root);
        for event in events {
            fsio::append_jsonl(&path, event)?;
        }
        Ok(())
    }

    /// Stale scan over every backlog; persists changed backlogs and appends
    /// the transition events to the workspace event log.
    pub fn scan_for_stale(&self, stale_seconds: u64, auto_reset: bool, now: f64) -> Result<usize> {
        let mut total = 0;
        for path in self.list_backlog_files() {
            let mut backlog = self.load(&path);
            let events =
                state::scan_tasks_for_stale(&mut backlog.tasks, stale_seconds, auto_reset, now, "stale_scanner");
            if events.is_empty() {
                continue;
            }
            total += events.len();
            self.save(&path, &backlog)?;
            self.append_state_events(&events)?;
        }
        if total > 0 {
            info!(transitions = total, "stale scan moved tasks");
        }
        Ok(total)
    }

    /// Reset a task (and optionally its dependency closure) back to `todo`,
    /// clearing heartbeat/stale bookkeeping. Tasks currently `doing` are left
    /// alone. Returns the ids actually reset.
    pub fn retry_tasks(
        &self,
        backlog_path: &Path,
        task_id: &str,
        retry_deps: bool,
        run_id: Option<&str>,
        now: f64,
    ) -> Result<Vec<String>> {
        let mut backlog = self.load(backlog_path);
        let reset_ids = collect_retry_ids(&backlog.tasks, task_id, retry_deps);
        let reason = serde_json::json!({
            "type": "retry_reset",
            "run_id": run_id,
            "retry_deps": retry_deps,
        });

        let mut events = Vec::new();
        let mut reset = Vec::new();
        for task in backlog.tasks.iter_mut() {
            if !reset_ids.contains(&task.id) {
                continue;
            }
            if task.status == TaskStatus::Todo || task.status == TaskStatus::Doing {
                continue;
            }
            let from = task.status;
            task.status = TaskStatus::Todo;
            task.status_ts = Some(now);
            task.heartbeat_ts = None;
            task.stale_ts = None;
            events.push(TransitionEvent {
                kind: "status_transition".to_string(),
                task_id: task.id.clone(),
                plan_id: task.plan_id.clone(),
                from: Some(from),
                to: TaskStatus::Todo,
                ts: now,
                source: Some("retry".to_string()),
                reason: Some(reason.clone()),
            });
            reset.push(task.id.clone());
        }
        self.save(backlog_path, &backlog)?;
        self.append_state_events(&events)?;
        Ok(reset)
    }
}

/// The task plus (optionally) its transitive dependency closure.
fn collect_retry_ids(tasks: &[Task], task_id: &str, include_deps: bool) -> std::collections::HashSet<String> {
    let mut seen = std::collections::HashSet::new();
    if !include_deps {
        seen.insert(task_id.to_string());
        return seen;
    }
    let by_id: std::collections::HashMap<&str, &Task> =
        tasks.iter().map(|task| (task.id.as_str(), task)).collect();
    let mut stack = vec![task_id.to_string()];
    while let Some(current) = stack.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        if let Some(task) = by_id.get(current.as_str()) {
            for dep in &task.dependencies {
                if !seen.contains(dep) {
                    stack.push(dep.clone());
                }
            }
        }
    }
    seen
}
