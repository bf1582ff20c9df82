//! Hard policy: the sandbox contract. System defaults, optional user policy
//! file, field-by-field merge.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aipl_core::Reason;
use aipl_core::env::EngineConfig;

/// The effective sandbox contract a run executes under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardPolicy {
    /// Writable path prefixes; an empty entry means "anywhere safe".
    #[serde(default)]
    pub allow_write: Vec<String>,

    #[serde(default)]
    pub deny_write: Vec<String>,

    #[serde(default)]
    pub allowed_commands: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

fn default_command_timeout() -> u64 {
    300
}

fn default_max_concurrency() -> u32 {
    2
}

/// Sanitized subset of a user policy file; only present fields override.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserHardPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_write: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_write: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_commands: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

impl UserHardPolicy {
    pub fn is_empty(&self) -> bool {
        self == &UserHardPolicy::default()
    }
}

/// Built-in defaults for a workspace, from the environment configuration.
pub fn build_system_hard_policy(workspace: &Path, config: &EngineConfig) -> HardPolicy {
    HardPolicy {
        allow_write: vec![String::new()],
        deny_write: config.deny_write.clone(),
        allowed_commands: config.allowed_commands.clone(),
        command_timeout: config.command_timeout,
        max_concurrency: config.max_concurrency,
        workspace_path: Some(workspace.to_string_lossy().to_string()),
    }
}

fn coerce_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn normalize_rel_entries(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.replace('\\', "/").trim().to_string())
        .collect()
}

/// Keep only the known fields of a raw user policy; reject non-positive
/// integers with a reason per field.
pub fn sanitize_user_hard(raw: Option<&Value>) -> (Option<UserHardPolicy>, Vec<Reason>) {
    let Some(Value::Object(map)) = raw else {
        return (None, Vec::new());
    };
    let mut reasons = Vec::new();
    let mut cleaned = UserHardPolicy::default();

    if let Some(value) = map.get("allow_write") {
        cleaned.allow_write = coerce_list(value).map(normalize_rel_entries);
    }
    if let Some(value) = map.get("deny_write") {
        cleaned.deny_write = coerce_list(value).map(normalize_rel_entries);
    }
    if let Some(value) = map.get("allowed_commands") {
        cleaned.allowed_commands = coerce_list(value);
    }
    for key in ["command_timeout", "max_concurrency"] {
        let Some(value) = map.get(key) else { continue };
        let parsed = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()));
        match parsed {
            Some(n) if n > 0 => match key {
                "command_timeout" => cleaned.command_timeout = Some(n as u64),
                _ => cleaned.max_concurrency = Some(n as u32),
            },
            _ => reasons.push(
                Reason::new("invalid_hard_value")
                    .with("field", key)
                    .with("value", value.clone()),
            ),
        }
    }

    if cleaned.is_empty() && reasons.is_empty() {
        (None, reasons)
    } else {
        (Some(cleaned), reasons)
    }
}

/// User fields override system fields one by one.
pub fn merge_hard_policy(
    system: &HardPolicy,
    user: Option<&UserHardPolicy>,
) -> HardPolicy {
    let mut effective = system.clone();
    let Some(user) = user else {
        return effective;
    };
    if let Some(allow) = &user.allow_write {
        effective.allow_write = allow.clone();
    }
    if let Some(deny) = &user.deny_write {
        effective.deny_write = deny.clone();
    }
    if let Some(commands) = &user.allowed_commands {
        effective.allowed_commands = commands.clone();
    }
    if let Some(timeout) = user.command_timeout {
        effective.command_timeout = timeout;
    }
    if let Some(concurrency) = user.max_concurrency {
        effective.max_concurrency = concurrency;
    }
    effective
}

/// Strip allowed-command prefixes that a deny list covers. A deny entry
/// removes every allowed prefix it is a prefix of.
pub fn apply_deny_commands(allowed: &mut Vec<String>, deny: &[String]) {
    if deny.is_empty() {
        return;
    }
    allowed.retain(|prefix| !deny.iter().any(|denied| prefix.starts_with(denied.as_str())));
}

/// Raw user policy from `aipl.policy.json` or `aipl.policy.toml` at the
/// workspace root; JSON wins when both exist. Unreadable files are treated as
/// absent.
pub fn load_user_hard_policy(workspace: &Path) -> Option<Value> {
    let json_path = workspace.join("aipl.policy.json");
    if json_path.exists() {
        return std::fs::read_to_string(&json_path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok());
    }
    let toml_path = workspace.join("aipl.policy.toml");
    if toml_path.exists() {
        let text = std::fs::read_to_string(&toml_path).ok()?;
        let parsed: toml::Value = toml::from_str(&text).ok()?;
        return serde_json::to_value(parsed).ok();
    }
    None
}
