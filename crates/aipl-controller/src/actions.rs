//! Operator actions on runs: cancel, pause/resume, apply, discard, rework,
//! and retry. Every action is status-gated and mirrored.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};
use tracing::info;

use aipl_backlog::BacklogStore;
use aipl_core::AppError;
use aipl_core::fsio;
use aipl_core::layout;
use aipl_core::types::{RunMeta, RunStatus};
use aipl_graph::{CoChangeCollector, CoChangeLearner};
use aipl_stage::{ChangedFile, StageManager, apply_patchset, build_patchset};
use aipl_verify::TaskContext;

use crate::events::EventLog;
use crate::{RunController, check_paused, read_meta, write_meta};

fn resolve_run_dir(root: &Path, plan_id: Option<&str>, run_id: &str) -> Result<PathBuf, AppError> {
    layout::find_run_dir(root, plan_id, run_id).ok_or_else(|| AppError::RunNotFound(run_id.into()))
}

fn remove_flag(run_dir: &Path, name: &str) {
    let _ = std::fs::remove_file(run_dir.join(name));
}

fn write_flag(run_dir: &Path, name: &str) {
    let _ = std::fs::write(run_dir.join(name), format!("{}", aipl_core::now_ts() as i64));
}

impl RunController {
    /// Request cancellation. Already-terminal runs report their state
    /// without error.
    pub fn cancel_run(&self, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
        let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
        let mut meta = read_meta(&run_dir);
        let plan = meta.plan_id.clone().or(plan_id.map(str::to_string));
        if meta.status.is_terminal() {
            return Ok(json!({
                "run_id": run_id,
                "plan_id": plan,
                "status": meta.status.to_string(),
                "message": format!("run already in terminal state: {}", meta.status),
            }));
        }
        write_flag(&run_dir, "cancel.flag");
        remove_flag(&run_dir, "pause.flag");
        meta.status = RunStatus::Canceled;
        meta.canceled_at = Some(aipl_core::now_ts());
        write_meta(&run_dir, &meta)?;
        EventLog::new(&run_dir).emit("run_canceled", json!({"run_id": run_id, "plan_id": plan}));
        aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "canceled");
        Ok(json!({
            "run_id": run_id,
            "plan_id": plan,
            "status": "canceled",
            "workspace_main_root": meta.workspace_main_root,
        }))
    }

    pub fn pause_run(&self, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
        let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
        let mut meta = read_meta(&run_dir);
        if meta.status != RunStatus::Running {
            return Err(AppError::InvalidRunStatus {
                action: "pause".into(),
                status: meta.status.to_string(),
            }
            .into());
        }
        write_flag(&run_dir, "pause.flag");
        meta.status = RunStatus::Paused;
        meta.paused_at = Some(aipl_core::now_ts());
        write_meta(&run_dir, &meta)?;
        EventLog::new(&run_dir)
            .emit("run_paused", json!({"run_id": run_id, "plan_id": meta.plan_id}));
        aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "paused");
        Ok(json!({"run_id": run_id, "plan_id": meta.plan_id, "status": "paused"}))
    }

    pub fn resume_run(&self, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
        let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
        let mut meta = read_meta(&run_dir);
        if meta.status != RunStatus::Paused {
            return Err(AppError::InvalidRunStatus {
                action: "resume".into(),
                status: meta.status.to_string(),
            }
            .into());
        }
        remove_flag(&run_dir, "pause.flag");
        meta.status = RunStatus::Running;
        meta.resumed_at = Some(aipl_core::now_ts());
        write_meta(&run_dir, &meta)?;
        EventLog::new(&run_dir)
            .emit("run_resumed", json!({"run_id": run_id, "plan_id": meta.plan_id}));
        aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "running");
        Ok(json!({"run_id": run_id, "plan_id": meta.plan_id, "status": "running"}))
    }

    /// Cancel every non-terminal run of a plan.
    pub fn cancel_plan_runs(&self, plan_id: &str) -> Result<Value> {
        let workspace = layout::find_plan_workspace(self.root(), plan_id);
        let runs_dir = layout::plan_dir(self.root(), workspace.as_deref(), plan_id).join("runs");
        let mut canceled: Vec<String> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&runs_dir) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let run_dir = entry.path();
                let mut meta = read_meta(&run_dir);
                if matches!(
                    meta.status,
                    RunStatus::Running | RunStatus::Paused | RunStatus::Starting
                ) {
                    let run_id = entry.file_name().to_string_lossy().to_string();
                    write_flag(&run_dir, "cancel.flag");
                    remove_flag(&run_dir, "pause.flag");
                    meta.status = RunStatus::Canceled;
                    meta.canceled_at = Some(aipl_core::now_ts());
                    write_meta(&run_dir, &meta)?;
                    EventLog::new(&run_dir).emit(
                        "run_canceled",
                        json!({"run_id": run_id, "plan_id": plan_id, "reason": "plan_canceled"}),
                    );
                    aipl_profile::mirror::update_run_status(&self.mirror_db(), &run_id, "canceled");
                    canceled.push(run_id);
                }
            }
        }
        Ok(json!({
            "plan_id": plan_id,
            "canceled": canceled.len(),
            "canceled_runs": canceled,
        }))
    }

    /// Copy the reviewed patch set into the main workspace; only valid for
    /// runs parked in `awaiting_review`.
    pub fn apply_run(&self, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
        let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
        let mut meta = read_meta(&run_dir);
        if meta.status != RunStatus::AwaitingReview {
            return Err(AppError::RunNotAwaitingReview.into());
        }
        let (stage_root, main_root) = stage_and_main(&meta)?;

        let changed_path = meta
            .changed_files_path
            .as_deref()
            .map(|rel| {
                let path = Path::new(rel);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    run_dir.join(path)
                }
            })
            .unwrap_or_else(|| run_dir.join("patchset").join("changed_files.json"));
        let payload: Value = fsio::read_json_or(&changed_path, json!({}));
        let changed_files: Vec<ChangedFile> = payload
            .get("changed_files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let log = EventLog::new(&run_dir);
        log.emit("apply_start", json!({"run_id": run_id}));
        let results = apply_patchset(&stage_root, &main_root, &changed_files);
        StageManager::new(&run_dir).remove_stage(&stage_root, Some(&main_root));

        meta.status = RunStatus::Done;
        meta.apply_results = Some(serde_json::to_value(&results)?);
        write_meta(&run_dir, &meta)?;
        log.emit("apply_done", json!({"run_id": run_id, "status": "done"}));
        log.emit(
            "run_done",
            json!({"run_id": run_id, "status": "done", "passed": true}),
        );
        aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "done");

        self.learn_co_changes(&meta, &changed_files, run_id);

        info!(run_id, files = changed_files.len(), "patch set applied");
        Ok(json!({
            "run_id": run_id,
            "plan_id": meta.plan_id,
            "status": "done",
            "apply_results": results,
            "workspace_main_root": meta.workspace_main_root,
            "workspace_stage_root": meta.workspace_stage_root,
        }))
    }

    /// Drop a run's pending change set and stage.
    pub fn discard_run(&self, plan_id: Option<&str>, run_id: &str) -> Result<Value> {
        let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
        let mut meta = read_meta(&run_dir);
        if let (Some(stage), Some(main)) = (
            meta.workspace_stage_root.as_deref(),
            meta.workspace_main_root.as_deref(),
        ) {
            StageManager::new(&run_dir).remove_stage(Path::new(stage), Some(Path::new(main)));
        }
        meta.status = RunStatus::Discarded;
        write_meta(&run_dir, &meta)?;
        let log = EventLog::new(&run_dir);
        log.emit("discard_done", json!({"run_id": run_id, "status": "discarded"}));
        log.emit(
            "run_done",
            json!({"run_id": run_id, "status": "discarded", "passed": false}),
        );
        aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "discarded");
        Ok(json!({
            "run_id": run_id,
            "plan_id": meta.plan_id,
            "status": "discarded",
            "workspace_main_root": meta.workspace_main_root,
            "workspace_stage_root": meta.workspace_stage_root,
        }))
    }

    /// Schedule one extra round on the same stage with operator feedback.
    pub async fn rework_run(
        &self,
        plan_id: Option<&str>,
        run_id: &str,
        feedback: &str,
        step_id: Option<&str>,
    ) -> Result<Value> {
        let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
        let mut meta = read_meta(&run_dir);
        let (stage_root, main_root) = stage_and_main(&meta)?;
        let Some(task_id) = meta.task_id.clone() else {
            anyhow::bail!("missing stage/main/task");
        };

        let step_id = step_id
            .map(str::to_string)
            .or(meta.step_id.clone())
            .unwrap_or_else(|| task_id.clone());
        let steps_dir = run_dir.join("steps").join(&step_id);
        std::fs::create_dir_all(&steps_dir)?;
        let next_round = next_round_index(&steps_dir);
        let round_dir = steps_dir.join(format!("round-{next_round}"));
        std::fs::create_dir_all(&round_dir)?;
        fsio::write_json(
            &round_dir.join("rework_request.json"),
            &json!({
                "step_id": step_id,
                "feedback": feedback,
                "ts": aipl_core::now_ts(),
            }),
        )?;
        let log = EventLog::new(&run_dir);
        log.emit(
            "rework_start",
            json!({"run_id": run_id, "step": step_id, "round": next_round}),
        );
        remove_flag(&run_dir, "cancel.flag");
        meta.status = RunStatus::Running;
        write_meta(&run_dir, &meta)?;
        aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "running");

        // One more verification pass over the same stage.
        let store = BacklogStore::new(self.root());
        let context = store
            .find_task(&task_id)
            .map(|(task, _)| TaskContext::from_task(&task))
            .unwrap_or_else(|| TaskContext {
                task_id: task_id.clone(),
                ..Default::default()
            });
        let outcome = self
            .verifier
            .verify_task(&run_dir, &context, Some(&stage_root))
            .await;
        fsio::write_json(
            &round_dir.join("verification.json"),
            &json!({"passed": outcome.passed, "reasons": outcome.reasons}),
        )?;
        log.emit(
            "rework_done",
            json!({"run_id": run_id, "step": step_id, "round": next_round, "passed": outcome.passed}),
        );
        log.emit(
            "step_round_verified",
            json!({"run_id": run_id, "step": step_id, "round": next_round, "passed": outcome.passed}),
        );

        if outcome.passed {
            let patchset = build_patchset(&stage_root, &main_root, &run_dir)?;
            let changed = patchset.changed_files.len();
            meta.patchset_path = Some(rel_str(&patchset.patchset_path, &run_dir));
            meta.changed_files_path = Some(rel_str(&patchset.changed_files_path, &run_dir));
            meta.changed_files_count = Some(changed);
            meta.status = RunStatus::AwaitingReview;
            write_meta(&run_dir, &meta)?;
            log.emit(
                "patchset_ready",
                json!({"run_id": run_id, "changed_files": changed, "patchset_path": meta.patchset_path}),
            );
            log.emit("awaiting_review", json!({"run_id": run_id}));
            aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "awaiting_review");
            Ok(json!({"run_id": run_id, "plan_id": meta.plan_id, "status": "awaiting_review"}))
        } else {
            meta.status = RunStatus::Failed;
            write_meta(&run_dir, &meta)?;
            log.emit(
                "run_done",
                json!({"run_id": run_id, "status": "failed", "passed": false}),
            );
            aipl_profile::mirror::update_run_status(&self.mirror_db(), run_id, "failed");
            anyhow::bail!("rework failed")
        }
    }

    /// Reset the run's task (optionally its dependency subgraph) to `todo`.
    pub fn retry_run(
        &self,
        plan_id: Option<&str>,
        run_id: &str,
        retry_deps: bool,
    ) -> Result<Value> {
        let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
        let meta = read_meta(&run_dir);
        let Some(task_id) = meta.task_id.clone() else {
            anyhow::bail!("task_id missing");
        };
        let plan = meta
            .plan_id
            .clone()
            .or(plan_id.map(str::to_string))
            .ok_or_else(|| AppError::PlanNotFound(String::new()))?;
        let workspace = layout::find_plan_workspace(self.root(), &plan);
        let store = BacklogStore::new(self.root());
        let backlog_path = store.backlog_path(workspace.as_deref(), &plan);
        let reset = store.retry_tasks(
            &backlog_path,
            &task_id,
            retry_deps,
            Some(run_id),
            aipl_core::now_ts(),
        )?;
        Ok(json!({"reset": reset.len(), "task_ids": reset}))
    }

    /// Compact status snapshot for the `status` command.
    pub fn status_snapshot(&self, plan_id: Option<&str>, run_id: Option<&str>) -> Result<Value> {
        if let Some(run_id) = run_id {
            let run_dir = resolve_run_dir(self.root(), plan_id, run_id)?;
            let meta = read_meta(&run_dir);
            return Ok(json!({
                "run_id": run_id,
                "plan_id": meta.plan_id,
                "task_id": meta.task_id,
                "status": meta.status.to_string(),
                "paused": check_paused(&run_dir),
                "workspace_main_root": meta.workspace_main_root,
                "patchset_path": meta.patchset_path,
                "changed_files_count": meta.changed_files_count,
            }));
        }
        let store = BacklogStore::new(self.root());
        let tasks = store.load_tasks_filtered(None);
        let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
        for (task, _) in &tasks {
            if let Some(plan) = plan_id {
                if task.plan_id.as_deref() != Some(plan) {
                    continue;
                }
            }
            *counts.entry(task.status.to_string()).or_default() += 1;
        }
        Ok(json!({"plan_id": plan_id, "task_counts": counts}))
    }

    fn learn_co_changes(&self, meta: &RunMeta, changed_files: &[ChangedFile], run_id: &str) {
        if changed_files.len() < 2 {
            return;
        }
        let workspace = meta.workspace_main_root.as_deref().map(Path::new);
        let learned_dir = layout::learned_dir(self.root(), workspace);
        let mut collector = CoChangeCollector::new();
        let files: Vec<String> = changed_files.iter().map(|file| file.path.clone()).collect();
        let now = aipl_core::now_ts();
        collector.collect_from_run(
            run_id,
            meta.task_id.as_deref().unwrap_or(""),
            &files,
            true,
            "time_for_certainty",
            now,
        );
        let mut learner = CoChangeLearner::new(&learned_dir.join("co_change.json"));
        learner.load();
        learner.learn_from_change_sets(collector.change_sets(), now);
        let _ = learner.save(now);
    }

    fn mirror_db(&self) -> PathBuf {
        layout::resolve_db_path(self.root(), self.config().db_path.as_deref())
    }
}

fn stage_and_main(meta: &RunMeta) -> Result<(PathBuf, PathBuf)> {
    match (
        meta.workspace_stage_root.as_deref(),
        meta.workspace_main_root.as_deref(),
    ) {
        (Some(stage), Some(main)) => Ok((PathBuf::from(stage), PathBuf::from(main))),
        _ => anyhow::bail!("missing stage/main root"),
    }
}

fn next_round_index(steps_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(steps_dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix("round-")
                .and_then(|n| n.parse::<usize>().ok())
        })
        .max()
        .map(|max| max + 1)
        .unwrap_or(0)
}

fn rel_str(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
