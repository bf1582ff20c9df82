//! plan / run / run-plan / assistant-chat.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};

use aipl_assistant::AssistantInvoker;
use aipl_backlog::BacklogStore;
use aipl_controller::{RunController, RunMode, RunOptions};
use aipl_core::env::EngineConfig;
use aipl_core::layout;
use aipl_plan::{PlanInput, build_plan, build_plan_prompt};
use aipl_profile::ProfileService;

pub struct PlanArgs {
    pub task: String,
    pub plan_id: Option<String>,
    pub workspace: Option<PathBuf>,
    pub goal: Option<String>,
    pub max_tasks: usize,
}

pub async fn cmd_plan(root: &Path, config: &EngineConfig, args: &PlanArgs) -> Result<Value> {
    let plan_id = args
        .plan_id
        .clone()
        .unwrap_or_else(aipl_core::ids::new_plan_id);
    let goal = args.goal.clone().unwrap_or_else(|| {
        std::fs::read_to_string(root.join("goal.txt")).unwrap_or_default()
    });

    // stale scan ahead of planning, same as ahead of running
    let store = BacklogStore::new(root);
    let _ = store.scan_for_stale(
        config.stale_seconds,
        config.stale_auto_reset,
        aipl_core::now_ts(),
    );

    let profile_service = ProfileService::new(root, config.clone());
    let mut allowed_commands = config.allowed_commands.clone();
    aipl_policy::apply_deny_commands(&mut allowed_commands, &config.deny_commands);
    let mut hard_block = "none".to_string();
    let mut soft_block = "none".to_string();
    if let Some(workspace) = &args.workspace {
        let mut profile = profile_service.ensure_profile(workspace)?;
        if profile.created {
            profile = profile_service.propose_soft(workspace, "new_workspace")?;
        } else if profile.fingerprint_changed {
            profile = profile_service.propose_soft(workspace, "fingerprint_changed")?;
        }
        allowed_commands = profile.effective_hard.allowed_commands.clone();
        aipl_policy::apply_deny_commands(&mut allowed_commands, &config.deny_commands);
        hard_block = serde_json::to_string_pretty(&json!({
            "allow_write": profile.effective_hard.allow_write,
            "deny_write": profile.effective_hard.deny_write,
            "allowed_commands": allowed_commands,
            "command_timeout": profile.effective_hard.command_timeout,
            "max_concurrency": profile.effective_hard.max_concurrency,
        }))?;
        if let Some(approved) = &profile.record.soft_approved {
            soft_block = serde_json::to_string_pretty(approved)?;
        }
    }

    let prompt = build_plan_prompt(
        &plan_id,
        args.max_tasks,
        &args.task,
        &goal,
        &hard_block,
        &soft_block,
    );

    let plan_dir = layout::plan_dir(root, args.workspace.as_deref(), &plan_id);
    std::fs::create_dir_all(&plan_dir)?;
    let schema_path =
        aipl_assistant::write_schema_file(&plan_dir, "plan", &aipl_assistant::plan_schema())?;
    let assistant = AssistantInvoker::discover()?;
    let request = aipl_assistant::AssistantRequest {
        prompt: prompt.clone(),
        schema_path,
        sandbox_mode: "workspace-write".to_string(),
        work_dir: args.workspace.clone().unwrap_or_else(|| root.to_path_buf()),
        io_dir: plan_dir.join("planner"),
        idle_timeout: Duration::from_secs(300),
        hard_timeout: Duration::from_secs(1800),
        heartbeat_path: None,
        extra_args: Vec::new(),
    };
    let response_text = assistant.run(&request).await?;
    let plan_response = aipl_assistant::parse_plan_response(&response_text)?;
    let raw_plan = json!({"tasks": plan_response.tasks});

    let input = PlanInput {
        plan_id: plan_id.clone(),
        input_task: args.task.clone(),
        goal,
        prompt,
        workspace: args.workspace.clone(),
        allowed_commands,
    };
    let outcome = build_plan(root, &input, &raw_plan)?;

    aipl_profile::mirror::mirror_plan(
        &layout::resolve_db_path(root, config.db_path.as_deref()),
        &plan_id,
        args.workspace.as_deref(),
        outcome.tasks_count,
        &args.task,
    );

    Ok(json!({
        "plan_id": plan_id,
        "workspace": args.workspace.as_ref().map(|p| p.to_string_lossy()),
        "tasks_count": outcome.tasks_count,
        "backlog_written": true,
        "artifacts_root": outcome.plan_dir.to_string_lossy(),
        "validation": outcome.validation,
    }))
}

pub fn parse_mode(mode: &str) -> RunMode {
    if mode.eq_ignore_ascii_case("manual") {
        RunMode::Manual
    } else {
        RunMode::Autopilot
    }
}

pub async fn cmd_run(
    root: &Path,
    config: &EngineConfig,
    plan_id: Option<String>,
    workspace: Option<PathBuf>,
    mode: RunMode,
    max_rounds: usize,
) -> Result<Value> {
    let mut controller = RunController::new(root, config.clone());
    if mode == RunMode::Autopilot {
        controller = controller.with_assistant(AssistantInvoker::discover()?);
    }
    let options = RunOptions {
        plan_id,
        workspace,
        mode,
        max_rounds,
    };
    match controller.run(&options).await? {
        Some(summary) => Ok(json!({
            "run_id": summary.run_id,
            "plan_id": summary.plan_id,
            "task_id": summary.task_id,
            "status": summary.status.to_string(),
            "passed": summary.passed,
            "run_dir": summary.run_dir.to_string_lossy(),
        })),
        None => Ok(json!({"noop": true, "message": "no runnable tasks in backlog"})),
    }
}

pub struct RunPlanArgs {
    pub task: String,
    pub plan_id: Option<String>,
    pub workspace: Option<PathBuf>,
    pub mode: RunMode,
    pub max_rounds: usize,
    pub cleanup: bool,
}

pub async fn cmd_run_plan(root: &Path, config: &EngineConfig, args: &RunPlanArgs) -> Result<Value> {
    let plan_args = PlanArgs {
        task: args.task.clone(),
        plan_id: args.plan_id.clone(),
        workspace: args.workspace.clone(),
        goal: None,
        max_tasks: 8,
    };
    let planned = cmd_plan(root, config, &plan_args).await?;
    let plan_id = planned["plan_id"].as_str().unwrap_or_default().to_string();
    let executed = cmd_run(
        root,
        config,
        Some(plan_id.clone()),
        args.workspace.clone(),
        args.mode,
        args.max_rounds,
    )
    .await?;
    let cleanup = if args.cleanup {
        let outcome =
            aipl_plan::cleanup_snapshot(root, args.workspace.as_deref(), &plan_id)?;
        Some(json!({
            "removed": outcome.removed,
            "kept": outcome.kept,
            "already_cleaned": outcome.already_cleaned,
        }))
    } else {
        None
    };
    Ok(json!({"plan": planned, "run": executed, "cleanup": cleanup}))
}

pub async fn cmd_assistant_chat(
    root: &Path,
    prompt: &str,
    workspace: Option<PathBuf>,
) -> Result<Value> {
    let assistant = AssistantInvoker::discover()?;
    let io_dir = layout::artifacts_dir(root).join("chat");
    // free-form exchange: any JSON object satisfies the schema
    let schema_path =
        aipl_assistant::write_schema_file(&io_dir, "chat", &json!({"type": "object"}))?;
    let request = aipl_assistant::AssistantRequest {
        prompt: prompt.to_string(),
        schema_path,
        sandbox_mode: "read-only".to_string(),
        work_dir: workspace.unwrap_or_else(|| root.to_path_buf()),
        io_dir,
        idle_timeout: Duration::from_secs(300),
        hard_timeout: Duration::from_secs(900),
        heartbeat_path: None,
        extra_args: Vec::new(),
    };
    let response = assistant.run(&request).await?;
    Ok(json!({"response": response}))
}
