//! Single-file SQLite mirror of plans and runs for external UIs.
//!
//! A pure shadow: writes are best-effort upserts keyed on plan/run id,
//! last write wins, and failures only log.

use std::path::Path;

use rusqlite::{Connection, params};
use tracing::warn;

use aipl_core::ids::compute_workspace_id;

fn open(db_path: &Path) -> Option<Connection> {
    if let Some(parent) = db_path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return None;
        }
    }
    let conn = Connection::open(db_path).ok()?;
    let schema = "CREATE TABLE IF NOT EXISTS plans (
            plan_id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            workspace_path TEXT,
            tasks_count INTEGER DEFAULT 0,
            input_task TEXT,
            updated_at INTEGER
        );
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            plan_id TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            workspace_path TEXT,
            status TEXT DEFAULT 'unknown',
            task TEXT,
            updated_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_plans_ws ON plans(workspace_id);
        CREATE INDEX IF NOT EXISTS idx_runs_ws ON runs(workspace_id);";
    if conn.execute_batch(schema).is_err() {
        return None;
    }
    Some(conn)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn mirror_plan(
    db_path: &Path,
    plan_id: &str,
    workspace: Option<&Path>,
    tasks_count: usize,
    input_task: &str,
) {
    let Some(conn) = open(db_path) else { return };
    let workspace_id = compute_workspace_id(workspace);
    let workspace_path = workspace.map(|p| p.to_string_lossy().to_string());
    let result = conn.execute(
        "INSERT INTO plans(plan_id, workspace_id, workspace_path, tasks_count, input_task, updated_at)
         VALUES(?1,?2,?3,?4,?5,?6)
         ON CONFLICT(plan_id) DO UPDATE SET
            workspace_id=excluded.workspace_id,
            workspace_path=excluded.workspace_path,
            tasks_count=excluded.tasks_count,
            input_task=excluded.input_task,
            updated_at=excluded.updated_at",
        params![plan_id, workspace_id, workspace_path, tasks_count as i64, input_task, now_ms()],
    );
    if let Err(err) = result {
        warn!(plan_id, error = %err, "mirror_plan failed");
    }
}

pub fn mirror_run(
    db_path: &Path,
    run_id: &str,
    plan_id: &str,
    workspace: Option<&Path>,
    status: &str,
    task: &str,
) {
    let Some(conn) = open(db_path) else { return };
    let workspace_id = compute_workspace_id(workspace);
    let workspace_path = workspace.map(|p| p.to_string_lossy().to_string());
    let result = conn.execute(
        "INSERT INTO runs(run_id, plan_id, workspace_id, workspace_path, status, task, updated_at)
         VALUES(?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(run_id) DO UPDATE SET
            plan_id=excluded.plan_id,
            workspace_id=excluded.workspace_id,
            workspace_path=excluded.workspace_path,
            status=excluded.status,
            task=excluded.task,
            updated_at=excluded.updated_at",
        params![run_id, plan_id, workspace_id, workspace_path, status, task, now_ms()],
    );
    if let Err(err) = result {
        warn!(run_id, error = %err, "mirror_run failed");
    }
}

/// Update status only; a no-op when the run was never mirrored.
pub fn update_run_status(db_path: &Path, run_id: &str, status: &str) {
    if !db_path.exists() {
        return;
    }
    let Some(conn) = open(db_path) else { return };
    let result = conn.execute(
        "UPDATE runs SET status=?1, updated_at=?2 WHERE run_id=?3",
        params![status, now_ms(), run_id],
    );
    if let Err(err) = result {
        warn!(run_id, error = %err, "update_run_status failed");
    }
}

pub fn delete_plan(db_path: &Path, plan_id: &str) {
    if !db_path.exists() {
        return;
    }
    let Some(conn) = open(db_path) else { return };
    let _ = conn.execute("DELETE FROM runs WHERE plan_id=?1", params![plan_id]);
    let _ = conn.execute("DELETE FROM plans WHERE plan_id=?1", params![plan_id]);
}

pub fn delete_run(db_path: &Path, run_id: &str) {
    if !db_path.exists() {
        return;
    }
    let Some(conn) = open(db_path) else { return };
    let _ = conn.execute("DELETE FROM runs WHERE run_id=?1", params![run_id]);
}

/// Read back a run's mirrored status, mostly for tests and status commands.
pub fn run_status(db_path: &Path, run_id: &str) -> Option<String> {
    let conn = open(db_path)?;
    conn.query_row(
        "SELECT status FROM runs WHERE run_id=?1",
        params![run_id],
        |row| row.get(0),
    )
    .ok()
}
