//! profile / rules / checks / lessons commands.

use std::path::Path;

use anyhow::Result;
use serde_json::{Value, json};

use aipl_core::env::EngineConfig;
use aipl_core::layout;
use aipl_learn::LearningStorage;
use aipl_profile::ProfileService;

pub fn cmd_profile_get(root: &Path, config: &EngineConfig, workspace: &Path) -> Result<Value> {
    let service = ProfileService::new(root, config.clone());
    let ensured = service.ensure_profile(workspace)?;
    Ok(serde_json::to_value(&ensured)?)
}

pub fn cmd_profile_update(
    root: &Path,
    config: &EngineConfig,
    workspace: &Path,
    propose_soft: bool,
    approve_soft: bool,
    reject_soft: bool,
) -> Result<Value> {
    let service = ProfileService::new(root, config.clone());
    let ensured = if propose_soft {
        service.propose_soft(workspace, "manual_propose")?
    } else if approve_soft {
        service.approve_soft(workspace)?
    } else if reject_soft {
        service.reject_soft(workspace)?
    } else {
        // plain update: re-read the policy file and recompute the fingerprint
        service.ensure_profile(workspace)?
    };
    Ok(serde_json::to_value(&ensured)?)
}

fn user_file(root: &Path, workspace: &Path, name: &str) -> std::path::PathBuf {
    layout::workspace_dir(root, Some(workspace)).join("user").join(name)
}

fn next_entry_id(entries: &[Value], prefix: &str) -> String {
    let max: u64 = entries
        .iter()
        .filter_map(|entry| entry.get("id").and_then(Value::as_str))
        .filter_map(|id| id.strip_prefix(prefix).and_then(|n| n.parse().ok()))
        .max()
        .unwrap_or(0);
    format!("{prefix}{:03}", max + 1)
}

fn add_entry(path: &Path, key: &str, prefix: &str, mut entry: Value) -> Result<Value> {
    let mut data: Value = aipl_core::fsio::read_json_or(path, json!({key: []}));
    let entries = data
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .ok_or_else(|| anyhow::anyhow!("corrupt {key} store"))?;
    let id = next_entry_id(entries, prefix);
    entry["id"] = json!(id);
    entries.push(entry.clone());
    aipl_core::fsio::write_json(path, &data)?;
    Ok(json!({"added": entry}))
}

fn delete_entry(path: &Path, key: &str, id: &str) -> Result<Value> {
    let mut data: Value = aipl_core::fsio::read_json_or(path, json!({key: []}));
    let entries = data
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .ok_or_else(|| anyhow::anyhow!("corrupt {key} store"))?;
    let before = entries.len();
    entries.retain(|entry| entry.get("id").and_then(Value::as_str) != Some(id));
    let removed = before - entries.len();
    aipl_core::fsio::write_json(path, &data)?;
    Ok(json!({"removed": removed}))
}

pub fn cmd_rules_add(root: &Path, workspace: &Path, scope: &str, content: &str) -> Result<Value> {
    add_entry(
        &user_file(root, workspace, "rules.json"),
        "rules",
        "rule-",
        json!({"scope": scope, "content": content}),
    )
}

pub fn cmd_rules_delete(root: &Path, workspace: &Path, id: &str) -> Result<Value> {
    delete_entry(&user_file(root, workspace, "rules.json"), "rules", id)
}

pub fn cmd_checks_add(root: &Path, workspace: &Path, scope: &str, check: &str) -> Result<Value> {
    let mut parsed: Value =
        serde_json::from_str(check).map_err(|err| anyhow::anyhow!("invalid check json: {err}"))?;
    if !parsed.is_object() {
        anyhow::bail!("check must be a JSON object");
    }
    parsed["scope"] = json!(scope);
    add_entry(
        &user_file(root, workspace, "checks.json"),
        "checks",
        "check-",
        parsed,
    )
}

pub fn cmd_checks_delete(root: &Path, workspace: &Path, id: &str) -> Result<Value> {
    delete_entry(&user_file(root, workspace, "checks.json"), "checks", id)
}

pub fn cmd_lessons_delete(root: &Path, workspace: &Path, contains: &str) -> Result<Value> {
    let storage = LearningStorage::new(&layout::learned_dir(root, Some(workspace)));
    let needle = contains.to_string();
    let removed = storage.delete_lessons(|lesson| {
        lesson
            .get("content")
            .and_then(Value::as_str)
            .is_some_and(|content| content.contains(&needle))
    })?;
    Ok(json!({"removed": removed}))
}

pub fn cmd_lessons_clear(root: &Path, workspace: &Path) -> Result<Value> {
    let storage = LearningStorage::new(&layout::learned_dir(root, Some(workspace)));
    Ok(json!({"removed": storage.clear_lessons()?}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_add_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();

        let added = cmd_rules_add(tmp.path(), &ws, "fix", "prefer small diffs").unwrap();
        assert_eq!(added["added"]["id"], "rule-001");
        let added2 = cmd_rules_add(tmp.path(), &ws, "fix", "run tests").unwrap();
        assert_eq!(added2["added"]["id"], "rule-002");

        let removed = cmd_rules_delete(tmp.path(), &ws, "rule-001").unwrap();
        assert_eq!(removed["removed"], 1);
        let removed = cmd_rules_delete(tmp.path(), &ws, "rule-001").unwrap();
        assert_eq!(removed["removed"], 0);
    }

    #[test]
    fn test_rules_feed_context_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        cmd_rules_add(tmp.path(), &ws, "fix", "User rule").unwrap();

        let ws_dir = layout::workspace_dir(tmp.path(), Some(&ws));
        let merged = aipl_policy::rules::merge_for_scope(&ws_dir, "fix");
        assert_eq!(merged.rules.len(), 1);
        assert_eq!(merged.rules[0].content, "User rule");
    }

    #[test]
    fn test_checks_add_rejects_bad_json() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        assert!(cmd_checks_add(tmp.path(), &ws, "fix", "{not json").is_err());
        assert!(cmd_checks_add(tmp.path(), &ws, "fix", "[1,2]").is_err());
        let ok = cmd_checks_add(
            tmp.path(),
            &ws,
            "fix",
            r#"{"type": "file_exists", "path": "x.txt"}"#,
        )
        .unwrap();
        assert_eq!(ok["added"]["scope"], "fix");
    }
}
