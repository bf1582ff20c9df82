//! The run controller: drives the step → round → verify → retry → patch →
//! review loop over one task (or one full plan) at a time.

pub mod actions;
pub mod events;
pub mod policy;
pub mod report;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{info, warn};

use aipl_assistant::AssistantInvoker;
use aipl_backlog::{BacklogStore, pick_next_task, suggest_next_task};
use aipl_core::AppError;
use aipl_core::Reason;
use aipl_core::env::{EngineConfig, PolicyMode};
use aipl_core::fsio;
use aipl_core::layout;
use aipl_core::state::{TaskStatus, transition_task};
use aipl_core::types::{RunMeta, RunStatus, Task};
use aipl_graph::{CodeGraph, CodeGraphService};
use aipl_learn::{LearningCollector, diagnose};
use aipl_profile::ProfileService;
use aipl_stage::{StageManager, StageMeta, build_patchset};
use aipl_verify::runner::{CommandRunner, SubprocessRunner};
use aipl_verify::{TaskContext, Verifier};

use events::EventLog;
use policy::{LoadedPolicy, load_policy};

pub use events::read_events;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Autopilot,
    Manual,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Autopilot => "autopilot",
            RunMode::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub plan_id: Option<String>,
    pub workspace: Option<PathBuf>,
    pub mode: RunMode,
    pub max_rounds: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            plan_id: None,
            workspace: None,
            mode: RunMode::Manual,
            max_rounds: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub plan_id: String,
    pub task_id: Option<String>,
    pub status: RunStatus,
    pub run_dir: PathBuf,
    pub passed: bool,
}

pub struct RunController {
    root: PathBuf,
    config: EngineConfig,
    profile_service: ProfileService,
    verifier: Verifier,
    graph_service: CodeGraphService,
    assistant: Option<AssistantInvoker>,
}

impl RunController {
    pub fn new(root: &Path, config: EngineConfig) -> Self {
        let profile_service = ProfileService::new(root, config.clone());
        let verifier = Verifier::new(config.clone());
        // the watch knob implies refresh-on-access, which needs the cache
        let cache_root = (config.code_graph_cache || config.code_graph_watch)
            .then(|| config.code_graph_cache_root.clone().unwrap_or_else(|| root.to_path_buf()));
        Self {
            root: root.to_path_buf(),
            config,
            profile_service,
            verifier,
            graph_service: CodeGraphService::new(cache_root),
            assistant: None,
        }
    }

    /// Attach the external assistant; without one only manual mode runs.
    pub fn with_assistant(mut self, assistant: AssistantInvoker) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn db_path(&self) -> PathBuf {
        layout::resolve_db_path(&self.root, self.config.db_path.as_deref())
    }

    /// Execute the next runnable task (or every runnable task of a plan,
    /// when `plan_id` is given). Returns `None` when nothing is runnable.
    pub async fn run(&self, options: &RunOptions) -> Result<Option<RunSummary>> {
        let store = BacklogStore::new(&self.root);

        // Stale scan ahead of picking, as the planner does.
        let _ = store.scan_for_stale(
            self.config.stale_seconds,
            self.config.stale_auto_reset,
            aipl_core::now_ts(),
        );

        let plan_workspace = options
            .plan_id
            .as_deref()
            .and_then(|plan_id| layout::find_plan_workspace(&self.root, plan_id));
        let workspace_target = plan_workspace
            .or_else(|| options.workspace.clone())
            .or_else(|| self.config.default_workspace.clone());

        let mut tasks_with_path = self.load_candidate_tasks(&store, options, workspace_target.as_deref());
        let mut picked = pick_next_task(
            &tasks_with_path,
            options.plan_id.as_deref(),
            workspace_target.as_deref(),
        )
        .cloned();

        if picked.is_none() && options.plan_id.is_none() {
            // curriculum fallback: synthesize the next ladder task
            let existing: Vec<Task> = tasks_with_path.iter().map(|(task, _)| task.clone()).collect();
            if let Some(new_task) = suggest_next_task("", &existing, aipl_core::now_ts()) {
                let adhoc_path = store.backlog_path(workspace_target.as_deref(), "adhoc");
                let mut backlog = store.load(&adhoc_path);
                info!(task_id = %new_task.id, "curriculum appended synthetic task");
                backlog.tasks.push(new_task);
                store.save(&adhoc_path, &backlog)?;
                tasks_with_path = self.load_candidate_tasks(&store, options, workspace_target.as_deref());
                picked = pick_next_task(&tasks_with_path, None, workspace_target.as_deref()).cloned();
            }
        }

        let Some((task, backlog_path)) = picked else {
            info!("no runnable tasks in backlog");
            return Ok(None);
        };

        self.run_task(&store, options, task, backlog_path, workspace_target)
            .await
            .map(Some)
    }

    fn load_candidate_tasks(
        &self,
        store: &BacklogStore,
        options: &RunOptions,
        workspace_target: Option<&Path>,
    ) -> Vec<(Task, PathBuf)> {
        match &options.plan_id {
            Some(plan_id) => {
                let path = store.backlog_path(workspace_target, plan_id);
                store
                    .load(&path)
                    .tasks
                    .into_iter()
                    .map(|task| (task, path.clone()))
                    .collect()
            }
            None => store.load_tasks_filtered(workspace_target),
        }
    }

    async fn run_task(
        &self,
        store: &BacklogStore,
        options: &RunOptions,
        first_task: Task,
        backlog_path: PathBuf,
        workspace_target: Option<PathBuf>,
    ) -> Result<RunSummary> {
        let plan_id_for_run = first_task
            .plan_id
            .clone()
            .unwrap_or_else(aipl_core::ids::new_plan_id);

        // Per-task workspace override wins over the invocation workspace.
        let workspace_path = first_task
            .workspace_path
            .clone()
            .map(PathBuf::from)
            .or(workspace_target);
        if let Some(workspace) = &workspace_path {
            if layout::is_workspace_unsafe(&self.root, workspace) {
                return Err(AppError::UnsafeWorkspace {
                    workspace: workspace.to_string_lossy().to_string(),
                    root: self.root.to_string_lossy().to_string(),
                }
                .into());
            }
        }

        let (run_id, run_dir) =
            self.allocate_run_dir(workspace_path.as_deref(), &plan_id_for_run)?;
        let log = EventLog::new(&run_dir);

        let mut loaded = load_policy(&self.profile_service, workspace_path.as_deref())?;
        aipl_policy::apply_deny_commands(
            &mut loaded.policy.allowed_commands,
            &self.config.deny_commands,
        );
        fsio::write_json(&run_dir.join("policy.json"), &loaded.policy)?;
        if let Some(capabilities) = &loaded.capabilities {
            fsio::write_json(&run_dir.join("capabilities.json"), capabilities)?;
        }

        let stage_manager = StageManager::new(&run_dir);
        let stage_meta = match &workspace_path {
            Some(workspace) => Some(stage_manager.create_stage(&run_id, workspace)?),
            None => None,
        };

        let disable_tests = resolve_disable_tests(&self.config, options.mode);
        let mut meta = RunMeta {
            run_id: run_id.clone(),
            task_id: Some(first_task.id.clone()),
            plan_id: Some(plan_id_for_run.clone()),
            ts: Some(aipl_core::now_ts()),
            workspace_main_root: workspace_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            workspace_stage_root: stage_meta
                .as_ref()
                .map(|m| m.stage_root.to_string_lossy().to_string()),
            stage_mode: stage_meta.as_ref().map(|m| m.mode.to_string()),
            base_ref: stage_meta.as_ref().and_then(|m| m.base_ref.clone()),
            policy_source: Some(loaded.source.clone()),
            workspace_id: loaded.policy.workspace_id.clone(),
            fingerprint: loaded.policy.fingerprint.clone(),
            mode: Some(options.mode.as_str().to_string()),
            status: RunStatus::Running,
            disable_tests: Some(disable_tests),
            ..Default::default()
        };
        write_meta(&run_dir, &meta)?;
        log.emit(
            "run_init",
            json!({
                "run_id": run_id,
                "plan_id": plan_id_for_run,
                "workspace": meta.workspace_main_root,
            }),
        );
        if let Some(stage) = &stage_meta {
            log.emit(
                "workspace_stage_ready",
                json!({
                    "run_id": run_id,
                    "stage_root": stage.stage_root.to_string_lossy(),
                    "base_ref": stage.base_ref,
                    "stage_mode": stage.mode.to_string(),
                }),
            );
        }

        let cleanup_stage = |stage_meta: &Option<StageMeta>| {
            if let Some(stage) = stage_meta {
                stage_manager.remove_stage(&stage.stage_root, workspace_path.as_deref());
            }
        };

        let mut passed_all = true;
        let mut last_step_id: Option<String> = None;
        let max_rounds = options.max_rounds.max(1);
        let mut current: Option<(Task, PathBuf)> = Some((first_task, backlog_path));

        while let Some((task, backlog_path)) = current.take() {
            if check_canceled(&run_dir) {
                self.finish_canceled(&run_dir, &log, &run_id, &plan_id_for_run, &mut meta)?;
                cleanup_stage(&stage_meta);
                return Ok(self.summary(&run_id, &plan_id_for_run, Some(&task.id), &run_dir, &meta));
            }
            if check_paused(&run_dir) {
                log.emit("run_paused", json!({"run_id": run_id, "plan_id": plan_id_for_run}));
                meta.status = RunStatus::Paused;
                meta.paused_at = Some(aipl_core::now_ts());
                write_meta(&run_dir, &meta)?;
                let canceled = wait_while_paused(&run_dir).await;
                if canceled {
                    self.finish_canceled(&run_dir, &log, &run_id, &plan_id_for_run, &mut meta)?;
                    cleanup_stage(&stage_meta);
                    return Ok(self.summary(&run_id, &plan_id_for_run, Some(&task.id), &run_dir, &meta));
                }
                log.emit("run_resumed", json!({"run_id": run_id, "plan_id": plan_id_for_run}));
                meta.status = RunStatus::Running;
                meta.resumed_at = Some(aipl_core::now_ts());
                write_meta(&run_dir, &meta)?;
            }

            let task_id = task.id.clone();
            let step_id = task.step_id.clone().unwrap_or_else(|| task_id.clone());
            last_step_id = Some(step_id.clone());

            store.update_task(&backlog_path, &task_id, |task| {
                transition_task(task, TaskStatus::Doing, aipl_core::now_ts(), Some("controller"), None)
                    .into_iter()
                    .collect()
            })?;
            meta.task_id = Some(task_id.clone());
            meta.step_id = Some(step_id.clone());
            meta.task_title = Some(task.title.clone());
            meta.status = RunStatus::Running;
            write_meta(&run_dir, &meta)?;
            log.emit(
                "step_start",
                json!({
                    "task_id": task_id,
                    "plan_id": plan_id_for_run,
                    "step": step_id,
                    "task_title": task.title,
                    "summary": task.title,
                }),
            );

            let (passed, final_reasons, canceled) = self
                .round_loop(
                    &run_dir,
                    &log,
                    &loaded,
                    &task,
                    &step_id,
                    &plan_id_for_run,
                    stage_meta.as_ref(),
                    workspace_path.as_deref(),
                    options.mode,
                    max_rounds,
                )
                .await?;
            if canceled {
                passed_all = false;
                self.finish_canceled(&run_dir, &log, &run_id, &plan_id_for_run, &mut meta)?;
                cleanup_stage(&stage_meta);
                report::write_run_index(&run_dir, &run_id, last_step_id.as_deref());
                return Ok(self.summary(&run_id, &plan_id_for_run, Some(&task_id), &run_dir, &meta));
            }

            let policy_checks = aipl_verify::load_policy_checks(&run_dir);
            let effective = aipl_verify::merge_checks(&task.checks, &policy_checks, task.is_high_risk());
            report::write_verification_report(
                &run_dir,
                &task_id,
                Some(&plan_id_for_run),
                workspace_path.as_deref(),
                passed,
                &final_reasons,
                &effective,
            );

            let run_id_for_task = run_id.clone();
            let plan_for_task = plan_id_for_run.clone();
            let reasons_for_task = final_reasons.clone();
            store.update_task(&backlog_path, &task_id, move |task| {
                let events = transition_task(
                    task,
                    if passed { TaskStatus::Done } else { TaskStatus::Failed },
                    aipl_core::now_ts(),
                    Some("controller"),
                    serde_json::to_value(&reasons_for_task).ok(),
                )
                .into_iter()
                .collect();
                task.last_run = Some(run_id_for_task);
                task.last_reasons = reasons_for_task.clone();
                task.last_plan = Some(plan_for_task);
                events
            })?;

            if !passed {
                passed_all = false;
                break;
            }
            log.emit(
                "step_done",
                json!({"task_id": task_id, "plan_id": plan_id_for_run, "step": step_id}),
            );

            if options.plan_id.is_some() {
                let refreshed = self.load_candidate_tasks(
                    store,
                    options,
                    workspace_path.as_deref(),
                );
                current = pick_next_task(&refreshed, options.plan_id.as_deref(), None).cloned();
            }
        }

        report::write_run_index(&run_dir, &run_id, last_step_id.as_deref());

        // Patch/review decision.
        let mut final_status = RunStatus::Failed;
        if check_canceled(&run_dir) {
            final_status = RunStatus::Canceled;
            log.emit(
                "run_done",
                json!({"run_id": run_id, "plan_id": plan_id_for_run, "passed": false, "status": "canceled"}),
            );
        } else if passed_all {
            let mut changed = 0;
            if let (Some(stage), Some(workspace)) = (&stage_meta, &workspace_path) {
                let patchset = build_patchset(&stage.stage_root, workspace, &run_dir)?;
                changed = patchset.changed_files.len();
                if changed > 0 {
                    let patch_rel = relative_to(&patchset.patchset_path, &run_dir);
                    meta.patchset_path = Some(patch_rel.clone());
                    meta.changed_files_path =
                        Some(relative_to(&patchset.changed_files_path, &run_dir));
                    meta.changed_files_count = Some(changed);
                    log.emit(
                        "patchset_ready",
                        json!({"run_id": run_id, "changed_files": changed, "patchset_path": patch_rel}),
                    );
                }
            }
            if changed > 0 {
                final_status = RunStatus::AwaitingReview;
                log.emit("awaiting_review", json!({"run_id": run_id}));
            } else {
                final_status = RunStatus::Done;
                log.emit(
                    "run_done",
                    json!({"run_id": run_id, "plan_id": plan_id_for_run, "passed": true, "status": "done"}),
                );
            }
        } else {
            log.emit(
                "run_done",
                json!({"run_id": run_id, "plan_id": plan_id_for_run, "passed": false, "status": "failed"}),
            );
        }
        meta.status = final_status;
        write_meta(&run_dir, &meta)?;
        if final_status.is_terminal() {
            cleanup_stage(&stage_meta);
        }

        aipl_profile::mirror::mirror_run(
            &self.db_path(),
            &run_id,
            &plan_id_for_run,
            workspace_path.as_deref(),
            &final_status.to_string(),
            meta.task_title.as_deref().unwrap_or(""),
        );

        if final_status == RunStatus::Failed {
            if let Some(workspace) = &workspace_path {
                if self.profile_service.should_propose_on_failure(workspace, 2, 20) {
                    let _ = self.profile_service.propose_soft(workspace, "repeated_failures");
                }
            }
        }

        info!(run_id = %run_id, status = %final_status, "run finished");
        Ok(self.summary(
            &run_id,
            &plan_id_for_run,
            meta.task_id.as_deref(),
            &run_dir,
            &meta,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn round_loop(
        &self,
        run_dir: &Path,
        log: &EventLog,
        loaded: &LoadedPolicy,
        task: &Task,
        step_id: &str,
        plan_id: &str,
        stage_meta: Option<&StageMeta>,
        workspace_path: Option<&Path>,
        mode: RunMode,
        max_rounds: usize,
    ) -> Result<(bool, Vec<Reason>, bool)> {
        let mut passed = false;
        let mut final_reasons: Vec<Reason> = Vec::new();
        let mut rework: Option<aipl_verify::ReworkRequest> = None;
        let mut collector = LearningCollector::new(&layout::learned_dir(
            &self.root,
            workspace_path,
        ));

        for round_id in 0..max_rounds {
            if check_canceled(run_dir) {
                log.emit(
                    "run_canceled",
                    json!({"run_id": run_dir.file_name().map(|n| n.to_string_lossy().to_string()),
                           "plan_id": plan_id, "round": round_id}),
                );
                return Ok((passed, final_reasons, true));
            }
            let round_dir = run_dir
                .join("steps")
                .join(step_id)
                .join(format!("round-{round_id}"));
            std::fs::create_dir_all(&round_dir)?;
            log.emit(
                "step_round_start",
                json!({
                    "task_id": task.id, "plan_id": plan_id, "step": step_id,
                    "round": round_id, "mode": "good",
                }),
            );

            let mut produced_files: Vec<String> = Vec::new();
            if mode == RunMode::Autopilot {
                log.emit(
                    "subagent_start",
                    json!({"task_id": task.id, "step": step_id, "round": round_id}),
                );
                let round_outcome = self
                    .invoke_assistant_round(run_dir, &round_dir, loaded, task, stage_meta, rework.as_ref())
                    .await;
                match round_outcome {
                    Ok(produced) => produced_files = produced,
                    Err(err) => {
                        warn!(round = round_id, error = %err, "assistant round failed");
                        std::fs::write(round_dir.join("stderr.txt"), err.to_string())?;
                    }
                }
                log.emit(
                    "subagent_done",
                    json!({"task_id": task.id, "step": step_id, "round": round_id}),
                );
            } else {
                std::fs::write(round_dir.join("stdout.txt"), "manual mode: no side effects\n")?;
                std::fs::write(round_dir.join("stderr.txt"), "")?;
            }

            let (round_passed, reasons) = if mode == RunMode::Manual {
                (true, Vec::new())
            } else {
                let verify_root = stage_meta
                    .map(|stage| stage.stage_root.as_path())
                    .or(workspace_path);
                let context = TaskContext::from_task(task);
                let outcome = self.verifier.verify_task(run_dir, &context, verify_root).await;
                (outcome.passed, outcome.reasons)
            };
            final_reasons = reasons.clone();

            fsio::write_json(
                &round_dir.join("verification.json"),
                &json!({"passed": round_passed, "reasons": reasons}),
            )?;
            log.emit(
                "step_round_verified",
                json!({
                    "task_id": task.id, "plan_id": plan_id, "step": step_id,
                    "round": round_id, "passed": round_passed,
                }),
            );

            if round_passed {
                passed = true;
                break;
            }

            // Diagnose and learn from the failed round.
            let run_id = run_dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let diagnosis = diagnose(&task.id, &run_id, round_id, &reasons, aipl_core::now_ts());
            collector.collect_from_diagnosis(&diagnosis, &run_id, &task.id, aipl_core::now_ts());
            let _ = collector.store_all(0.5);

            if round_id + 1 < max_rounds {
                let prev_stdout = std::fs::read_to_string(round_dir.join("stdout.txt"))
                    .unwrap_or_default()
                    .chars()
                    .take(1000)
                    .collect::<String>();
                let suspected = self.suspected_related_files(plan_id, workspace_path, task, &reasons);
                let verification: Value =
                    fsio::read_json_or(&run_dir.join("verification_result.json"), Value::Null);
                let check_results: Vec<aipl_verify::CheckRecord> = verification
                    .get("checks")
                    .and_then(Value::as_array)
                    .map(|checks| {
                        checks
                            .iter()
                            .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                let mut request = aipl_verify::collect_errors_for_retry(
                    run_dir,
                    round_id,
                    max_rounds,
                    &reasons,
                    &check_results,
                    &produced_files,
                    workspace_path,
                    &prev_stdout,
                    &suspected,
                );
                let shape: Value =
                    fsio::read_json_or(&round_dir.join("shape_response.json"), Value::Null);
                if let Some(validation) = shape.get("validation_reasons").and_then(Value::as_array) {
                    request.validation_reasons = validation.clone();
                }
                let next_round_dir = run_dir
                    .join("steps")
                    .join(step_id)
                    .join(format!("round-{}", round_id + 1));
                fsio::write_json(&next_round_dir.join("rework_request.json"), &request)?;
                rework = Some(request);
            }
        }

        Ok((passed, final_reasons, false))
    }

    /// One autopilot round: invoke the assistant under the fix schema, apply
    /// validated writes, and execute validated commands in the stage.
    async fn invoke_assistant_round(
        &self,
        run_dir: &Path,
        round_dir: &Path,
        loaded: &LoadedPolicy,
        task: &Task,
        stage_meta: Option<&StageMeta>,
        rework: Option<&aipl_verify::ReworkRequest>,
    ) -> Result<Vec<String>> {
        let assistant = self
            .assistant
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no assistant configured for autopilot mode"))?;
        let schema_path = aipl_assistant::write_schema_file(
            run_dir,
            "fix",
            &aipl_assistant::fix_schema(),
        )?;
        let rules = self.context_rules(loaded);
        let prompt = aipl_assistant::build_fix_prompt(
            &task.title,
            &task.acceptance_criteria,
            &rules,
            rework,
        );
        let work_dir = stage_meta
            .map(|stage| stage.stage_root.clone())
            .unwrap_or_else(|| run_dir.to_path_buf());
        let request = aipl_assistant::AssistantRequest {
            prompt,
            schema_path,
            sandbox_mode: "workspace-write".to_string(),
            work_dir: work_dir.clone(),
            io_dir: round_dir.to_path_buf(),
            idle_timeout: Duration::from_secs(300),
            hard_timeout: Duration::from_secs(1800),
            heartbeat_path: Some(run_dir.join("heartbeat")),
            extra_args: Vec::new(),
        };
        let response_text = assistant.run(&request).await?;
        let fix = aipl_assistant::parse_fix_response(&response_text)?;

        let enforced = self.config.policy_mode == PolicyMode::Enforce;
        let (writes, mut validation_reasons) = aipl_policy::validate_writes(
            &fix.writes,
            &loaded.policy.allow_write,
            &loaded.policy.deny_write,
            enforced,
        );
        let (commands, command_reasons) = aipl_policy::validate_commands(
            &fix.commands,
            &loaded.policy.allowed_commands,
            loaded.policy.command_timeout,
            enforced,
        );
        validation_reasons.extend(command_reasons);

        let mut produced: Vec<String> = Vec::new();
        for write in &writes {
            match write.target {
                aipl_policy::WriteTarget::Workspace => {
                    let Some(stage) = stage_meta else { continue };
                    // outputs/ is run-local; never materialize it in the stage
                    let normalized = write.path.replace('\\', "/");
                    if normalized == "outputs" || normalized.starts_with("outputs/") {
                        validation_reasons.push(
                            Reason::new("invalid_write_path")
                                .with("path", write.path.clone())
                                .with("hint", "outputs/ is reserved for the run directory"),
                        );
                        continue;
                    }
                    if let Some(target) =
                        aipl_verify::handlers::confine(&stage.stage_root, &write.path)
                    {
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(target, &write.content)?;
                        produced.push(write.path.clone());
                    }
                }
                aipl_policy::WriteTarget::Run => {
                    if let Some(target) = aipl_verify::handlers::confine(run_dir, &write.path) {
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(target, &write.content)?;
                        produced.push(write.path.clone());
                    }
                }
            }
        }

        let runner = SubprocessRunner::new(self.config.allow_shell_commands);
        let mut stdout_text = String::new();
        let mut stderr_text = String::new();
        for command in &commands {
            let result = runner.run(&command.cmd, &work_dir, command.timeout).await;
            stdout_text.push_str(&format!("$ {}\n{}", command.cmd, result.stdout));
            stderr_text.push_str(&result.stderr);
        }
        if !fix.summary.is_empty() {
            stdout_text.push_str(&fix.summary);
            stdout_text.push('\n');
        }
        std::fs::write(round_dir.join("stdout.txt"), stdout_text)?;
        std::fs::write(round_dir.join("stderr.txt"), stderr_text)?;

        produced.extend(fix.produced.iter().cloned());
        fsio::write_json(
            &round_dir.join("shape_response.json"),
            &json!({
                "writes": fix.writes.len(),
                "commands": commands,
                "summary": fix.summary,
                "produced": &produced,
                "validation_reasons": validation_reasons,
            }),
        )?;
        Ok(produced)
    }

    /// Context rules layered from user config, packs, and learned content.
    fn context_rules(&self, loaded: &LoadedPolicy) -> Vec<String> {
        let Some(profile) = &loaded.profile else {
            return Vec::new();
        };
        let Some(workspace) = profile.record.workspace_path.as_deref() else {
            return Vec::new();
        };
        let ws_dir = layout::workspace_dir(&self.root, Some(Path::new(workspace)));
        aipl_policy::rules::merge_for_scope(&ws_dir, "fix")
            .rules
            .into_iter()
            .map(|rule| rule.content)
            .collect()
    }

    fn suspected_related_files(
        &self,
        plan_id: &str,
        workspace: Option<&Path>,
        task: &Task,
        reasons: &[Reason],
    ) -> Vec<String> {
        let Some(graph) = self.load_plan_graph(plan_id, workspace) else {
            return Vec::new();
        };
        let mut seeds: Vec<String> = Vec::new();
        for reason in reasons {
            for key in ["file", "path"] {
                if let Some(path) = reason.get(key).and_then(Value::as_str) {
                    seeds.push(path.to_string());
                }
            }
        }
        for check in &task.checks {
            if let Some(path) = check.path() {
                seeds.push(path.to_string());
            }
        }
        let seeds: Vec<String> = seeds
            .into_iter()
            .filter_map(|seed| graph.normalize_path(&seed))
            .collect();
        if seeds.is_empty() {
            return Vec::new();
        }
        graph.related_files(&seeds, 2)
    }

    fn load_plan_graph(&self, plan_id: &str, workspace: Option<&Path>) -> Option<CodeGraph> {
        let plan_dir = layout::plan_dir(&self.root, workspace, plan_id);
        let plan: Value = fsio::read_json_or(&plan_dir.join("plan.json"), Value::Null);
        let graph_path = plan
            .get("code_graph_path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| plan_dir.join("code-graph.json"));
        graph_path
            .exists()
            .then(|| self.graph_service.load(&graph_path).ok())
            .flatten()
    }

    fn allocate_run_dir(
        &self,
        workspace: Option<&Path>,
        plan_id: &str,
    ) -> Result<(String, PathBuf)> {
        let base_id = aipl_core::ids::new_run_id();
        for attempt in 0..100 {
            let run_id = if attempt == 0 {
                base_id.clone()
            } else {
                format!("{base_id}-{}", attempt + 1)
            };
            let run_dir = layout::run_dir(&self.root, workspace, plan_id, &run_id);
            if !run_dir.exists() {
                std::fs::create_dir_all(&run_dir)?;
                return Ok((run_id, run_dir));
            }
        }
        anyhow::bail!("could not allocate run directory for {base_id}")
    }

    fn finish_canceled(
        &self,
        run_dir: &Path,
        log: &EventLog,
        run_id: &str,
        plan_id: &str,
        meta: &mut RunMeta,
    ) -> Result<()> {
        log.emit("run_canceled", json!({"run_id": run_id, "plan_id": plan_id}));
        meta.status = RunStatus::Canceled;
        meta.canceled_at = Some(aipl_core::now_ts());
        write_meta(run_dir, meta)?;
        aipl_profile::mirror::update_run_status(&self.db_path(), run_id, "canceled");
        Ok(())
    }

    fn summary(
        &self,
        run_id: &str,
        plan_id: &str,
        task_id: Option<&str>,
        run_dir: &Path,
        meta: &RunMeta,
    ) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            plan_id: plan_id.to_string(),
            task_id: task_id.map(str::to_string),
            status: meta.status,
            run_dir: run_dir.to_path_buf(),
            passed: matches!(meta.status, RunStatus::Done | RunStatus::AwaitingReview),
        }
    }
}

pub fn write_meta(run_dir: &Path, meta: &RunMeta) -> std::io::Result<()> {
    let mut meta = meta.clone();
    meta.updated_at = Some(aipl_core::now_ts());
    fsio::write_json(&run_dir.join("meta.json"), &meta)
}

pub fn read_meta(run_dir: &Path) -> RunMeta {
    fsio::read_json_or(&run_dir.join("meta.json"), RunMeta::default())
}

pub fn check_canceled(run_dir: &Path) -> bool {
    run_dir.join("cancel.flag").exists()
}

pub fn check_paused(run_dir: &Path) -> bool {
    run_dir.join("pause.flag").exists()
}

/// Poll while paused; returns true when a cancellation arrived meanwhile.
async fn wait_while_paused(run_dir: &Path) -> bool {
    while check_paused(run_dir) {
        if check_canceled(run_dir) {
            return true;
        }
        tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
    }
    false
}

fn resolve_disable_tests(config: &EngineConfig, _mode: RunMode) -> bool {
    if config.allow_tests {
        return false;
    }
    config.disable_tests
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
