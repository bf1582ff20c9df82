//! Read access to the learned stores.

use std::path::{Path, PathBuf};

use serde_json::Value;

pub struct LearningStorage {
    learned_dir: PathBuf,
}

impl LearningStorage {
    pub fn new(learned_dir: &Path) -> Self {
        Self {
            learned_dir: learned_dir.to_path_buf(),
        }
    }

    fn load(&self, filename: &str, key: &str) -> Vec<Value> {
        let data: Value =
            aipl_core::fsio::read_json_or(&self.learned_dir.join(filename), Value::Null);
        data.get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub fn signatures(&self, category: Option<&str>) -> Vec<Value> {
        let items = self.load("signatures.json", "signatures");
        match category {
            Some(category) => items
                .into_iter()
                .filter(|item| item.get("category").and_then(Value::as_str) == Some(category))
                .collect(),
            None => items,
        }
    }

    pub fn hints(&self, scope: Option<&str>) -> Vec<Value> {
        let items = self.load("hints.json", "hints");
        match scope {
            Some(scope) => items
                .into_iter()
                .filter(|item| item.get("scope").and_then(Value::as_str) == Some(scope))
                .collect(),
            None => items,
        }
    }

    /// Most recent lessons first.
    pub fn lessons(&self, limit: usize) -> Vec<Value> {
        let mut items = self.load("lessons.json", "lessons");
        items.sort_by(|a, b| {
            let ta = a.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            let tb = b.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
        });
        items.truncate(limit);
        items
    }

    /// Fix hints whose trigger matches the given error type.
    pub fn hints_for_error(&self, error_type: &str) -> Vec<String> {
        self.hints(Some("fix"))
            .into_iter()
            .filter(|hint| {
                hint.get("trigger_signature").and_then(Value::as_str) == Some(error_type)
            })
            .filter_map(|hint| {
                hint.get("hint").and_then(Value::as_str).map(str::to_string)
            })
            .collect()
    }

    pub fn delete_lessons(&self, predicate: impl Fn(&Value) -> bool) -> std::io::Result<usize> {
        let path = self.learned_dir.join("lessons.json");
        let mut data: Value = aipl_core::fsio::read_json_or(&path, serde_json::json!({"lessons": []}));
        let Some(items) = data.get_mut("lessons").and_then(Value::as_array_mut) else {
            return Ok(0);
        };
        let before = items.len();
        items.retain(|item| !predicate(item));
        let removed = before - items.len();
        if removed > 0 {
            aipl_core::fsio::write_json(&path, &data)?;
        }
        Ok(removed)
    }

    pub fn clear_lessons(&self) -> std::io::Result<usize> {
        self.delete_lessons(|_| true)
    }
}
