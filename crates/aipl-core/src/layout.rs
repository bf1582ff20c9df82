//! The authoritative artifacts layout under the engine root.
//!
//! ```text
//! <root>/artifacts/
//!   workspaces/<ws_id>/backlog/<plan_id>.json
//!   workspaces/<ws_id>/executions/<plan_id>/runs/<run_id>/
//!   workspaces/<ws_id>/learned/
//!   state/events.jsonl
//! <root>/server/data/aipl.db
//! ```

use std::path::{Path, PathBuf};

use crate::fsio;
use crate::ids::compute_workspace_id;

pub fn artifacts_dir(root: &Path) -> PathBuf {
    root.join("artifacts")
}

pub fn workspace_dir(root: &Path, workspace: Option<&Path>) -> PathBuf {
    artifacts_dir(root)
        .join("workspaces")
        .join(compute_workspace_id(workspace))
}

pub fn backlog_dir(root: &Path, workspace: Option<&Path>) -> PathBuf {
    workspace_dir(root, workspace).join("backlog")
}

pub fn plan_dir(root: &Path, workspace: Option<&Path>, plan_id: &str) -> PathBuf {
    workspace_dir(root, workspace).join("executions").join(plan_id)
}

pub fn run_dir(root: &Path, workspace: Option<&Path>, plan_id: &str, run_id: &str) -> PathBuf {
    plan_dir(root, workspace, plan_id).join("runs").join(run_id)
}

pub fn learned_dir(root: &Path, workspace: Option<&Path>) -> PathBuf {
    workspace_dir(root, workspace).join("learned")
}

/// Cross-workspace status-transition event log.
pub fn state_events_path(root: &Path) -> PathBuf {
    artifacts_dir(root).join("state").join("events.jsonl")
}

/// SQLite mirror location; `AIPL_DB_PATH` overrides.
pub fn resolve_db_path(root: &Path, override_path: Option<&Path>) -> PathBuf {
    match override_path {
        Some(path) => path.to_path_buf(),
        None => root.join("server").join("data").join("aipl.db"),
    }
}

/// Locate the workspace that owns a plan by scanning per-workspace execution
/// trees for `plan.json` / `capabilities.json` workspace records.
pub fn find_plan_workspace(root: &Path, plan_id: &str) -> Option<PathBuf> {
    if plan_id.is_empty() {
        return None;
    }
    let ws_root = artifacts_dir(root).join("workspaces");
    let entries = std::fs::read_dir(&ws_root).ok()?;
    for entry in entries.flatten() {
        let plan_dir = entry.path().join("executions").join(plan_id);
        if !plan_dir.exists() {
            continue;
        }
        let caps: serde_json::Value =
            fsio::read_json_or(&plan_dir.join("capabilities.json"), serde_json::Value::Null);
        if let Some(ws) = caps.get("workspace").and_then(serde_json::Value::as_str) {
            if !ws.is_empty() {
                return Some(PathBuf::from(ws));
            }
        }
        let plan: serde_json::Value =
            fsio::read_json_or(&plan_dir.join("plan.json"), serde_json::Value::Null);
        for key in ["workspace_path", "workspace_main_root"] {
            if let Some(ws) = plan.get(key).and_then(serde_json::Value::as_str) {
                if !ws.is_empty() {
                    return Some(PathBuf::from(ws));
                }
            }
        }
    }
    None
}

/// Locate a run directory by id, optionally scoped to a plan.
pub fn find_run_dir(root: &Path, plan_id: Option<&str>, run_id: &str) -> Option<PathBuf> {
    let ws_root = artifacts_dir(root).join("workspaces");
    let entries = std::fs::read_dir(&ws_root).ok()?;
    for entry in entries.flatten() {
        let executions = entry.path().join("executions");
        let Ok(plans) = std::fs::read_dir(&executions) else {
            continue;
        };
        for plan_entry in plans.flatten() {
            if let Some(filter) = plan_id {
                if plan_entry.file_name().to_string_lossy() != filter {
                    continue;
                }
            }
            let candidate = plan_entry.path().join("runs").join(run_id);
            if candidate.is_dir() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Refuse workspaces that contain the engine root: a run writing into its own
/// artifacts tree would recurse.
pub fn is_workspace_unsafe(root: &Path, workspace: &Path) -> bool {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    root.starts_with(&workspace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsio::write_json;
    use serde_json::json;

    #[test]
    fn test_layout_paths() {
        let root = Path::new("/data/aipl");
        let run = run_dir(root, None, "plan-1", "run-1");
        assert_eq!(
            run,
            Path::new("/data/aipl/artifacts/workspaces/_default/executions/plan-1/runs/run-1")
        );
        assert_eq!(
            state_events_path(root),
            Path::new("/data/aipl/artifacts/state/events.jsonl")
        );
    }

    #[test]
    fn test_resolve_db_path() {
        let root = Path::new("/data/aipl");
        assert_eq!(
            resolve_db_path(root, None),
            Path::new("/data/aipl/server/data/aipl.db")
        );
        assert_eq!(
            resolve_db_path(root, Some(Path::new("/tmp/x.db"))),
            Path::new("/tmp/x.db")
        );
    }

    #[test]
    fn test_find_plan_workspace_from_plan_json() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        let plan_dir = plan_dir(root, Some(&ws), "plan-x");
        write_json(
            &plan_dir.join("plan.json"),
            &json!({"workspace_path": ws.to_string_lossy()}),
        )
        .unwrap();
        let found = find_plan_workspace(root, "plan-x").unwrap();
        assert_eq!(found, ws);
    }

    #[test]
    fn test_find_run_dir_scoped_and_unscoped() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let run = run_dir(root, None, "plan-a", "run-7");
        std::fs::create_dir_all(&run).unwrap();
        assert_eq!(find_run_dir(root, Some("plan-a"), "run-7").unwrap(), run);
        assert_eq!(find_run_dir(root, None, "run-7").unwrap(), run);
        assert!(find_run_dir(root, Some("plan-b"), "run-7").is_none());
        assert!(find_run_dir(root, None, "run-8").is_none());
    }

    #[test]
    fn test_workspace_containing_root_is_unsafe() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("engine");
        std::fs::create_dir_all(&root).unwrap();
        assert!(is_workspace_unsafe(&root, tmp.path()));
        let sibling = tmp.path().join("project");
        std::fs::create_dir_all(&sibling).unwrap();
        assert!(!is_workspace_unsafe(&root, &sibling));
    }
}
