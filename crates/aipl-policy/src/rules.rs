//! Context rule layering.
//!
//! Rules reach the assistant prompt from three places, merged in priority
//! order: user configuration, imported experience packs, learned content.
//! Duplicates (by lowercased content) from lower layers are discarded but
//! recorded.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use aipl_core::fsio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    User,
    Pack,
    Learned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedRule {
    pub content: String,
    pub source: RuleSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscardedRule {
    pub rule: String,
    pub source: RuleSource,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergedContext {
    pub rules: Vec<MergedRule>,
    pub conflicts_discarded: Vec<DiscardedRule>,
}

fn normalize(rule: &str) -> String {
    rule.to_lowercase().trim().to_string()
}

/// Merge rule layers, highest priority first. The first occurrence of a
/// normalized rule wins; later occurrences are discarded with the layer they
/// came from.
pub fn merge_rules(
    user_rules: &[String],
    pack_rules: &[String],
    learned_rules: &[String],
) -> MergedContext {
    let mut merged = MergedContext::default();
    let mut seen: HashSet<String> = HashSet::new();

    for rule in user_rules {
        if seen.insert(normalize(rule)) {
            merged.rules.push(MergedRule {
                content: rule.clone(),
                source: RuleSource::User,
            });
        }
    }
    for rule in pack_rules {
        if seen.insert(normalize(rule)) {
            merged.rules.push(MergedRule {
                content: rule.clone(),
                source: RuleSource::Pack,
            });
        } else {
            merged.conflicts_discarded.push(DiscardedRule {
                rule: rule.clone(),
                source: RuleSource::Pack,
                reason: "conflict_with_user".to_string(),
            });
        }
    }
    for rule in learned_rules {
        if seen.insert(normalize(rule)) {
            merged.rules.push(MergedRule {
                content: rule.clone(),
                source: RuleSource::Learned,
            });
        } else {
            merged.conflicts_discarded.push(DiscardedRule {
                rule: rule.clone(),
                source: RuleSource::Learned,
                reason: "conflict".to_string(),
            });
        }
    }
    merged
}

fn rules_from_file(path: &Path, key: &str, scope: Option<&str>) -> Vec<String> {
    let data: Value = fsio::read_json_or(path, Value::Null);
    let Some(items) = data.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| match scope {
            Some(scope) => item.get("scope").and_then(Value::as_str) == Some(scope),
            None => true,
        })
        .filter_map(|item| item.get("content").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn pack_files(workspace_dir: &Path) -> Vec<PathBuf> {
    let packs_dir = workspace_dir.join("user").join("imported_packs");
    let Ok(entries) = std::fs::read_dir(&packs_dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

/// Load and merge the three rule layers for one workspace artifacts dir.
pub fn merge_for_scope(workspace_dir: &Path, scope: &str) -> MergedContext {
    let user_rules = rules_from_file(
        &workspace_dir.join("user").join("rules.json"),
        "rules",
        Some(scope),
    );
    let mut pack_rules = Vec::new();
    for pack in pack_files(workspace_dir) {
        pack_rules.extend(rules_from_file(&pack, "rules", Some(scope)));
    }
    let learned_rules = rules_from_file(
        &workspace_dir.join("learned").join("lessons.json"),
        "lessons",
        None,
    );
    merge_rules(&user_rules, &pack_rules, &learned_rules)
}
