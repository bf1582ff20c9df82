//! Staged workspaces: the only tree the assistant may mutate.
//!
//! A stage is either a git worktree anchored at the main workspace's HEAD or
//! a filtered recursive copy. It is created fresh per run, owned exclusively
//! by that run, and removed when the run reaches a terminal status.

pub mod chain;
pub mod patchset;

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use patchset::{ApplyOutcome, ChangedFile, FileStatus, PatchSet, apply_patchset, build_patchset};

/// Directories never copied into a stage and never diffed back out of one.
pub const STAGE_IGNORE_DIRS: [&str; 8] = [
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "artifacts",
    "runs",
    "outputs",
    ".pytest_cache",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    Worktree,
    Copy,
}

impl std::fmt::Display for StageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageMode::Worktree => f.write_str("worktree"),
            StageMode::Copy => f.write_str("copy"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMeta {
    pub stage_root: PathBuf,
    pub mode: StageMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,

    pub created_ts: f64,
}

pub struct StageManager {
    stage_parent: PathBuf,
}

impl StageManager {
    /// `stage_parent` is the directory stages are created under, normally
    /// `<run_dir>` (the stage lands at `<run_dir>/stage`).
    pub fn new(stage_parent: &Path) -> Self {
        Self {
            stage_parent: stage_parent.to_path_buf(),
        }
    }

    /// Create a fresh stage for `run_id` from `main_root`. Any pre-existing
    /// tree at the stage path is deleted first.
    pub fn create_stage(&self, run_id: &str, main_root: &Path) -> Result<StageMeta> {
        let stage_dir = self.stage_parent.join("stage");
        if stage_dir.exists() {
            remove_tree(&stage_dir);
        }
        std::fs::create_dir_all(&self.stage_parent)
            .with_context(|| format!("failed to create {}", self.stage_parent.display()))?;

        let mut mode = StageMode::Copy;
        let mut base_ref = None;
        if main_root.join(".git").exists() {
            base_ref = git_head(main_root);
            let ref_arg = base_ref.clone().unwrap_or_else(|| "HEAD".to_string());
            let worktree_ok = Command::new("git")
                .args(["-C"])
                .arg(main_root)
                .args(["worktree", "add"])
                .arg(&stage_dir)
                .arg(&ref_arg)
                .output()
                .map(|out| out.status.success())
                .unwrap_or(false);
            if worktree_ok {
                mode = StageMode::Worktree;
            } else {
                debug!(run_id, "git worktree add failed, falling back to copy");
            }
        }

        if mode == StageMode::Copy {
            if stage_dir.exists() {
                remove_tree(&stage_dir);
            }
            copy_tree(main_root, &stage_dir)
                .map_err(|err| aipl_core::AppError::StageCreation(err.to_string()))?;
        }

        Ok(StageMeta {
            stage_root: stage_dir,
            mode,
            base_ref,
            created_ts: aipl_core::now_ts(),
        })
    }

    /// Remove a stage. Worktrees go through `git worktree remove --force` so
    /// the main repository's bookkeeping stays clean; anything else is a
    /// recursive delete.
    pub fn remove_stage(&self, stage_root: &Path, main_root: Option<&Path>) {
        if !stage_root.exists() {
            return;
        }
        if stage_root.join(".git").exists() {
            if let Some(main_root) = main_root {
                let removed = Command::new("git")
                    .args(["-C"])
                    .arg(main_root)
                    .args(["worktree", "remove", "--force"])
                    .arg(stage_root)
                    .output()
                    .map(|out| out.status.success())
                    .unwrap_or(false);
                if removed {
                    return;
                }
                warn!(stage = %stage_root.display(), "git worktree remove failed, deleting tree");
            }
        }
        remove_tree(stage_root);
    }
}

fn git_head(repo: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["-C"])
        .arg(repo)
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!head.is_empty()).then_some(head)
}

fn remove_tree(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        if path.exists() {
            warn!(path = %path.display(), error = %err, "failed to remove tree");
        }
    }
}

/// Recursive copy honoring [`STAGE_IGNORE_DIRS`].
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        if entry.file_type()?.is_dir() {
            if STAGE_IGNORE_DIRS.contains(&name_str.as_ref()) {
                continue;
            }
            copy_tree(&src_path, &dst_path)?;
        } else if entry.file_type()?.is_file() {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}
