//! `aipl` binary: command dispatch over the JSON envelope surface.

mod cli;
mod commands;
mod envelope;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;

use aipl_controller::RunController;
use aipl_core::env::EngineConfig;

use cli::{
    ChecksCommands, Cli, CodeGraphCommands, Commands, LessonsCommands, PackCommands,
    ProfileCommands, RulesCommands,
};
use commands::{graph_cmds, pack_cmds, plan_cmds, profile_cmds, run_cmds};
use envelope::Envelope;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    // logs go to stderr; stdout carries exactly one JSON envelope
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_root(cli_root: Option<&str>) -> Result<PathBuf> {
    match cli_root {
        Some(root) => Ok(PathBuf::from(root)),
        None => Ok(std::env::current_dir()?),
    }
}

fn opt_path(value: &Option<String>) -> Option<PathBuf> {
    value.as_ref().filter(|s| !s.trim().is_empty()).map(PathBuf::from)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let Ok(root) = resolve_root(cli.root.as_deref()) else {
        eprintln!("cannot determine engine root");
        return ExitCode::FAILURE;
    };
    let config = EngineConfig::from_env();

    let outcome = dispatch(&root, &config, cli.command).await;
    match outcome {
        Ok(data) => Envelope::success(data).print(),
        Err(err) => Envelope::failure(format!("{err:#}")).print(),
    }
    ExitCode::SUCCESS
}

async fn dispatch(root: &Path, config: &EngineConfig, command: Commands) -> Result<Value> {
    let controller = RunController::new(root, config.clone());
    match command {
        Commands::Plan {
            task,
            plan_id,
            workspace,
            goal,
            max_tasks,
        } => {
            let args = plan_cmds::PlanArgs {
                task,
                plan_id,
                workspace: opt_path(&workspace),
                goal,
                max_tasks,
            };
            plan_cmds::cmd_plan(root, config, &args).await
        }
        Commands::Run {
            plan_id,
            workspace,
            mode,
            max_rounds,
        } => {
            plan_cmds::cmd_run(
                root,
                config,
                plan_id,
                opt_path(&workspace),
                plan_cmds::parse_mode(&mode),
                max_rounds,
            )
            .await
        }
        Commands::RunPlan {
            task,
            plan_id,
            workspace,
            mode,
            max_rounds,
            cleanup,
        } => {
            let args = plan_cmds::RunPlanArgs {
                task,
                plan_id,
                workspace: opt_path(&workspace),
                mode: plan_cmds::parse_mode(&mode),
                max_rounds,
                cleanup,
            };
            plan_cmds::cmd_run_plan(root, config, &args).await
        }
        Commands::Status { plan_id, run_id } => {
            run_cmds::cmd_status(&controller, plan_id.as_deref(), run_id.as_deref())
        }
        Commands::Events {
            plan_id,
            run_id,
            cursor,
            limit,
        } => run_cmds::cmd_events(root, plan_id.as_deref(), &run_id, cursor, limit),
        Commands::Artifacts { plan_id, run_id } => {
            run_cmds::cmd_artifacts(root, plan_id.as_deref(), &run_id)
        }
        Commands::Cancel { plan_id, run_id } => {
            run_cmds::cmd_cancel(&controller, plan_id.as_deref(), &run_id)
        }
        Commands::Pause { plan_id, run_id } => {
            run_cmds::cmd_pause(&controller, plan_id.as_deref(), &run_id)
        }
        Commands::Resume { plan_id, run_id } => {
            run_cmds::cmd_resume(&controller, plan_id.as_deref(), &run_id)
        }
        Commands::CancelPlanRuns { plan_id } => {
            run_cmds::cmd_cancel_plan_runs(&controller, &plan_id)
        }
        Commands::Retry {
            plan_id,
            run_id,
            retry_deps,
        } => run_cmds::cmd_retry(&controller, plan_id.as_deref(), &run_id, retry_deps),
        Commands::Apply { plan_id, run_id } => {
            run_cmds::cmd_apply(&controller, plan_id.as_deref(), &run_id)
        }
        Commands::Discard { plan_id, run_id } => {
            run_cmds::cmd_discard(&controller, plan_id.as_deref(), &run_id)
        }
        Commands::Rework {
            plan_id,
            run_id,
            feedback,
            step_id,
        } => {
            run_cmds::cmd_rework(
                &controller,
                plan_id.as_deref(),
                &run_id,
                &feedback,
                step_id.as_deref(),
            )
            .await
        }
        Commands::Profile { cmd } => match cmd {
            ProfileCommands::Get { workspace } => {
                profile_cmds::cmd_profile_get(root, config, Path::new(&workspace))
            }
            ProfileCommands::Update {
                workspace,
                propose_soft,
                approve_soft,
                reject_soft,
            } => profile_cmds::cmd_profile_update(
                root,
                config,
                Path::new(&workspace),
                propose_soft,
                approve_soft,
                reject_soft,
            ),
        },
        Commands::Rules { cmd } => match cmd {
            RulesCommands::Add {
                workspace,
                scope,
                content,
            } => profile_cmds::cmd_rules_add(root, Path::new(&workspace), &scope, &content),
            RulesCommands::Delete { workspace, id } => {
                profile_cmds::cmd_rules_delete(root, Path::new(&workspace), &id)
            }
        },
        Commands::Checks { cmd } => match cmd {
            ChecksCommands::Add {
                workspace,
                scope,
                check,
            } => profile_cmds::cmd_checks_add(root, Path::new(&workspace), &scope, &check),
            ChecksCommands::Delete { workspace, id } => {
                profile_cmds::cmd_checks_delete(root, Path::new(&workspace), &id)
            }
        },
        Commands::Lessons { cmd } => match cmd {
            LessonsCommands::Delete {
                workspace,
                contains,
            } => profile_cmds::cmd_lessons_delete(root, Path::new(&workspace), &contains),
            LessonsCommands::Clear { workspace } => {
                profile_cmds::cmd_lessons_clear(root, Path::new(&workspace))
            }
        },
        Commands::CodeGraph { cmd } => match cmd {
            CodeGraphCommands::Build { workspace, output } => graph_cmds::cmd_graph_build(
                root,
                config,
                Path::new(&workspace),
                output.as_deref().map(Path::new),
            ),
            CodeGraphCommands::Related {
                workspace,
                file,
                hops,
            } => graph_cmds::cmd_graph_related(root, config, Path::new(&workspace), &file, hops),
        },
        Commands::WorkspaceTree { workspace, depth } => {
            graph_cmds::cmd_workspace_tree(Path::new(&workspace), depth)
        }
        Commands::WorkspaceRead { workspace, path } => {
            graph_cmds::cmd_workspace_read(Path::new(&workspace), &path)
        }
        Commands::ExperiencePacks { cmd } => {
            dispatch_packs(root, pack_cmds::PackKind::Experience, cmd)
        }
        Commands::LanguagePacks { cmd } => {
            dispatch_packs(root, pack_cmds::PackKind::Language, cmd)
        }
        Commands::AssistantChat { prompt, workspace } => {
            plan_cmds::cmd_assistant_chat(root, &prompt, opt_path(&workspace)).await
        }
    }
}

fn dispatch_packs(root: &Path, kind: pack_cmds::PackKind, cmd: PackCommands) -> Result<Value> {
    match cmd {
        PackCommands::List => pack_cmds::cmd_list(root, kind),
        PackCommands::Get { name } => pack_cmds::cmd_get(root, kind, &name),
        PackCommands::Import { file } => pack_cmds::cmd_import(root, kind, Path::new(&file)),
        PackCommands::ImportWorkspace { name, workspace } => {
            pack_cmds::cmd_import_workspace(root, kind, &name, Path::new(&workspace))
        }
        PackCommands::Export { name, output } => {
            pack_cmds::cmd_export(root, kind, &name, Path::new(&output))
        }
        PackCommands::Delete { name } => pack_cmds::cmd_delete(root, kind, &name),
        PackCommands::Update { name, file } => {
            pack_cmds::cmd_update(root, kind, &name, Path::new(&file))
        }
    }
}
