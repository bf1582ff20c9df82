//! SQLite-backed profile store: `workspace_profiles` plus the append-only
//! `profile_review_log` audit table.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use aipl_policy::UserHardPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileRecord {
    pub workspace_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_hard: Option<UserHardPolicy>,

    #[serde(default)]
    pub system_hard: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_draft: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_approved: Option<Value>,

    #[serde(default)]
    pub soft_version: i64,

    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct ProfileStore {
    conn: Arc<Mutex<Connection>>,
}

impl ProfileStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).context("failed to open profile db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory db")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workspace_profiles (
                workspace_id TEXT PRIMARY KEY,
                workspace_path TEXT,
                fingerprint TEXT,
                user_hard_json TEXT,
                system_hard_json TEXT NOT NULL,
                soft_draft_json TEXT,
                soft_approved_json TEXT,
                soft_version INTEGER DEFAULT 0,
                updated_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS profile_review_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id TEXT,
                action TEXT,
                fingerprint TEXT,
                payload_json TEXT,
                ts INTEGER
            );",
        )?;
        Ok(())
    }

    pub fn read(&self, workspace_id: &str) -> Result<Option<ProfileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT workspace_id, workspace_path, fingerprint, user_hard_json,
                    system_hard_json, soft_draft_json, soft_approved_json,
                    soft_version, updated_at
             FROM workspace_profiles WHERE workspace_id = ?1",
        )?;
        let mut rows = stmt.query(params![workspace_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let user_hard_json: Option<String> = row.get(3)?;
        let system_hard_json: String = row.get(4)?;
        let soft_draft_json: Option<String> = row.get(5)?;
        let soft_approved_json: Option<String> = row.get(6)?;
        Ok(Some(ProfileRecord {
            workspace_id: row.get(0)?,
            workspace_path: row.get(1)?,
            fingerprint: row.get(2)?,
            user_hard: user_hard_json.and_then(|text| serde_json::from_str(&text).ok()),
            system_hard: serde_json::from_str(&system_hard_json).unwrap_or(Value::Null),
            soft_draft: soft_draft_json.and_then(|text| serde_json::from_str(&text).ok()),
            soft_approved: soft_approved_json.and_then(|text| serde_json::from_str(&text).ok()),
            soft_version: row.get(7)?,
            updated_at: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        }))
    }

    pub fn upsert(&self, profile: &ProfileRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO workspace_profiles(
                workspace_id, workspace_path, fingerprint, user_hard_json,
                system_hard_json, soft_draft_json, soft_approved_json,
                soft_version, updated_at
             ) VALUES(?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(workspace_id) DO UPDATE SET
                workspace_path=excluded.workspace_path,
                fingerprint=excluded.fingerprint,
                user_hard_json=excluded.user_hard_json,
                system_hard_json=excluded.system_hard_json,
                soft_draft_json=excluded.soft_draft_json,
                soft_approved_json=excluded.soft_approved_json,
                soft_version=excluded.soft_version,
                updated_at=excluded.updated_at",
            params![
                profile.workspace_id,
                profile.workspace_path,
                profile.fingerprint,
                profile
                    .user_hard
                    .as_ref()
                    .map(|u| serde_json::to_string(u).unwrap_or_default()),
                serde_json::to_string(&profile.system_hard).unwrap_or_else(|_| "{}".into()),
                profile
                    .soft_draft
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                profile
                    .soft_approved
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
                profile.soft_version,
                profile.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn log_review(
        &self,
        workspace_id: &str,
        action: &str,
        fingerprint: &str,
        payload: Option<&Value>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO profile_review_log(workspace_id, action, fingerprint, payload_json, ts)
             VALUES(?1,?2,?3,?4,?5)",
            params![
                workspace_id,
                action,
                fingerprint,
                payload.map(|v| serde_json::to_string(v).unwrap_or_default()),
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn review_log(&self, workspace_id: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT action, ts FROM profile_review_log WHERE workspace_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> ProfileRecord {
        ProfileRecord {
            workspace_id: id.to_string(),
            workspace_path: Some("/tmp/ws".into()),
            fingerprint: Some("abc123".into()),
            system_hard: json!({"command_timeout": 300}),
            updated_at: 1700000000,
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_then_read() {
        let store = ProfileStore::memory().unwrap();
        store.upsert(&record("ws1")).unwrap();
        let loaded = store.read("ws1").unwrap().unwrap();
        assert_eq!(loaded.workspace_id, "ws1");
        assert_eq!(loaded.fingerprint.as_deref(), Some("abc123"));
        assert_eq!(loaded.system_hard["command_timeout"], 300);
    }

    #[test]
    fn test_read_missing_is_none() {
        let store = ProfileStore::memory().unwrap();
        assert!(store.read("nope").unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites() {
        let store = ProfileStore::memory().unwrap();
        store.upsert(&record("ws1")).unwrap();
        let mut updated = record("ws1");
        updated.fingerprint = Some("def456".into());
        updated.soft_version = 2;
        store.upsert(&updated).unwrap();
        let loaded = store.read("ws1").unwrap().unwrap();
        assert_eq!(loaded.fingerprint.as_deref(), Some("def456"));
        assert_eq!(loaded.soft_version, 2);
    }

    #[test]
    fn test_soft_payloads_roundtrip() {
        let store = ProfileStore::memory().unwrap();
        let mut rec = record("ws1");
        rec.soft_draft = Some(json!({"project_type": "python"}));
        store.upsert(&rec).unwrap();
        let loaded = store.read("ws1").unwrap().unwrap();
        assert_eq!(loaded.soft_draft.unwrap()["project_type"], "python");
        assert!(loaded.soft_approved.is_none());
    }

    #[test]
    fn test_review_log_appends() {
        let store = ProfileStore::memory().unwrap();
        store
            .log_review("ws1", "propose", "fp", Some(&json!({"reason": "new_workspace"})))
            .unwrap();
        store.log_review("ws1", "approve", "fp", None).unwrap();
        let log = store.review_log("ws1").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "propose");
        assert_eq!(log[1].0, "approve");
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server").join("data").join("aipl.db");
        let store = ProfileStore::open(&path).unwrap();
        store.upsert(&record("ws1")).unwrap();
        assert!(path.exists());
    }
}
