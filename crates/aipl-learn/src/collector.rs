//! Learning collector: turns diagnoses into signature/hint/lesson candidates
//! and merges them into the per-workspace `learned/` stores.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::diagnosis::DiagnosisReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearnedKind {
    Signature,
    Hint,
    Lesson,
}

impl LearnedKind {
    pub fn file_and_key(&self) -> (&'static str, &'static str) {
        match self {
            LearnedKind::Signature => ("signatures.json", "signatures"),
            LearnedKind::Hint => ("hints.json", "hints"),
            LearnedKind::Lesson => ("lessons.json", "lessons"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnedItem {
    pub kind: LearnedKind,
    pub content: Value,
    pub source_run_id: String,
    pub source_task_id: String,
    pub timestamp: f64,
    pub confidence: f64,
}

pub struct LearningCollector {
    learned_dir: PathBuf,
    candidates: Vec<LearnedItem>,
}

impl LearningCollector {
    pub fn new(learned_dir: &Path) -> Self {
        Self {
            learned_dir: learned_dir.to_path_buf(),
            candidates: Vec::new(),
        }
    }

    /// Convert one diagnosis into candidates; non-learnable diagnoses yield
    /// nothing.
    pub fn collect_from_diagnosis(
        &mut self,
        diagnosis: &DiagnosisReport,
        run_id: &str,
        task_id: &str,
        now: f64,
    ) -> usize {
        if !diagnosis.learnable {
            return 0;
        }
        let mut added = 0;
        let sig = &diagnosis.error_signature;
        self.candidates.push(LearnedItem {
            kind: LearnedKind::Signature,
            content: json!({
                "category": sig.category,
                "error_type": sig.error_type,
                "error_pattern": extract_pattern(&sig.error_message),
                "file_pattern": sig.file_path.as_deref().map(file_pattern),
            }),
            source_run_id: run_id.to_string(),
            source_task_id: task_id.to_string(),
            timestamp: now,
            confidence: diagnosis.confidence,
        });
        added += 1;
        if let Some(fix) = &diagnosis.successful_fix {
            self.candidates.push(LearnedItem {
                kind: LearnedKind::Hint,
                content: json!({
                    "trigger_signature": sig.error_type,
                    "hint": fix,
                    "scope": "fix",
                }),
                source_run_id: run_id.to_string(),
                source_task_id: task_id.to_string(),
                timestamp: now,
                confidence: diagnosis.confidence,
            });
            added += 1;
        }
        if !diagnosis.suggested_prevention.is_empty() {
            self.candidates.push(LearnedItem {
                kind: LearnedKind::Lesson,
                content: json!({
                    "content": diagnosis.suggested_prevention,
                    "context": diagnosis
                        .root_cause_analysis
                        .chars()
                        .take(100)
                        .collect::<String>(),
                    "tags": diagnosis.tags,
                }),
                source_run_id: run_id.to_string(),
                source_task_id: task_id.to_string(),
                timestamp: now,
                confidence: diagnosis.confidence,
            });
            added += 1;
        }
        added
    }

    pub fn candidates(&self) -> &[LearnedItem] {
        &self.candidates
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }

    /// Merge candidates at or above `min_confidence` into the stores,
    /// deduplicated by canonical JSON of their content. Returns the number
    /// merged; candidates are consumed either way.
    pub fn store_all(&mut self, min_confidence: f64) -> std::io::Result<usize> {
        std::fs::create_dir_all(&self.learned_dir)?;
        let mut stored = 0;
        let candidates = std::mem::take(&mut self.candidates);
        for kind in [LearnedKind::Signature, LearnedKind::Hint, LearnedKind::Lesson] {
            let batch: Vec<&LearnedItem> = candidates
                .iter()
                .filter(|item| item.kind == kind && item.confidence >= min_confidence)
                .collect();
            if batch.is_empty() {
                continue;
            }
            stored += self.merge_items(kind, &batch)?;
        }
        Ok(stored)
    }

    fn merge_items(&self, kind: LearnedKind, items: &[&LearnedItem]) -> std::io::Result<usize> {
        let (filename, key) = kind.file_and_key();
        let path = self.learned_dir.join(filename);
        let mut data: Value = aipl_core::fsio::read_json_or(&path, json!({key: []}));
        let existing = data
            .get_mut(key)
            .and_then(Value::as_array_mut)
            .map(std::mem::take)
            .unwrap_or_default();

        let mut seen: std::collections::HashSet<String> = existing
            .iter()
            .map(|entry| canonical_content(entry))
            .collect();
        let mut merged = existing;
        let mut added = 0;
        for item in items {
            let marker = canonical(&item.content);
            if !seen.insert(marker) {
                continue;
            }
            let mut entry = item
                .content
                .as_object()
                .cloned()
                .unwrap_or_else(Map::new);
            entry.insert("source_run_id".into(), json!(item.source_run_id));
            entry.insert("source_task_id".into(), json!(item.source_task_id));
            entry.insert("timestamp".into(), json!(item.timestamp));
            entry.insert("confidence".into(), json!(item.confidence));
            merged.push(Value::Object(entry));
            added += 1;
        }
        data[key] = Value::Array(merged);
        aipl_core::fsio::write_json(&path, &data)?;
        Ok(added)
    }
}

/// Canonical (sorted-key) JSON string of a value.
fn canonical(value: &Value) -> String {
    // serde_json object maps preserve insertion order; rebuild sorted
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut sorted = Map::new();
                for key in keys {
                    sorted.insert(key.clone(), sort(&map[key]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Dedup marker for an existing store entry: its content minus bookkeeping.
fn canonical_content(entry: &Value) -> String {
    let mut content = entry.clone();
    if let Some(map) = content.as_object_mut() {
        for key in ["source_run_id", "source_task_id", "timestamp", "confidence"] {
            map.remove(key);
        }
    }
    canonical(&content)
}

/// Generalize an error message: collapse paths, line numbers, and counters.
fn extract_pattern(message: &str) -> String {
    static PATH_RE: OnceLock<Regex> = OnceLock::new();
    static LINE_RE: OnceLock<Regex> = OnceLock::new();
    static NUM_RE: OnceLock<Regex> = OnceLock::new();
    let path_re = PATH_RE.get_or_init(|| Regex::new(r"/[^\s:]+/").expect("static regex"));
    let line_re = LINE_RE.get_or_init(|| Regex::new(r"line \d+").expect("static regex"));
    let num_re = NUM_RE.get_or_init(|| Regex::new(r"\b\d+\b").expect("static regex"));

    let pattern = path_re.replace_all(message, "/");
    let pattern = line_re.replace_all(&pattern, "line N");
    let pattern = num_re.replace_all(&pattern, "N");
    pattern.chars().take(200).collect()
}

fn file_pattern(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!("*/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::{ErrorSignature, FailureCategory};

    fn diagnosis(fix: Option<&str>, prevention: &str) -> DiagnosisReport {
        DiagnosisReport {
            task_id: "T001".into(),
            run_id: "run-1".into(),
            round_id: 0,
            timestamp: 1000.0,
            error_signature: ErrorSignature {
                category: FailureCategory::DependencyError,
                error_type: "command_failed".into(),
                error_message: "ModuleNotFoundError: No module named 'requests' at line 12".into(),
                file_path: Some("src/api/client.py".into()),
                line_number: None,
                stack_trace_summary: String::new(),
            },
            root_cause_analysis: "missing dependency".into(),
            contributing_factors: vec![],
            fix_attempts: vec![],
            successful_fix: fix.map(str::to_string),
            suggested_prevention: prevention.to_string(),
            learnable: true,
            confidence: 0.8,
            affected_files: vec![],
            tags: vec!["dependency_error".into()],
        }
    }

    #[test]
    fn test_collect_produces_all_three_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let mut collector = LearningCollector::new(tmp.path());
        let added = collector.collect_from_diagnosis(
            &diagnosis(Some("pip install requests"), "pin dependencies in requirements.txt"),
            "run-1",
            "T001",
            1000.0,
        );
        assert_eq!(added, 3);
    }

    #[test]
    fn test_collect_skips_non_learnable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut collector = LearningCollector::new(tmp.path());
        let mut report = diagnosis(None, "");
        report.learnable = false;
        assert_eq!(collector.collect_from_diagnosis(&report, "r", "t", 0.0), 0);
    }

    #[test]
    fn test_store_all_gates_on_confidence_and_dedups() {
        let tmp = tempfile::tempdir().unwrap();
        let mut collector = LearningCollector::new(tmp.path());
        collector.collect_from_diagnosis(&diagnosis(None, ""), "run-1", "T001", 1000.0);
        let stored = collector.store_all(0.5).unwrap();
        assert_eq!(stored, 1);

        // identical content from another run dedups away
        collector.collect_from_diagnosis(&diagnosis(None, ""), "run-2", "T002", 2000.0);
        let stored = collector.store_all(0.5).unwrap();
        assert_eq!(stored, 0);

        // below min_confidence nothing is written
        collector.collect_from_diagnosis(&diagnosis(None, ""), "run-3", "T003", 3000.0);
        assert_eq!(collector.store_all(0.95).unwrap(), 0);

        let data: Value =
            aipl_core::fsio::read_json(&tmp.path().join("signatures.json")).unwrap();
        assert_eq!(data["signatures"].as_array().unwrap().len(), 1);
        assert_eq!(data["signatures"][0]["source_run_id"], "run-1");
    }

    #[test]
    fn test_pattern_extraction_generalizes() {
        let pattern = extract_pattern("error in /home/user/proj/x.py at line 42, code 7");
        assert!(!pattern.contains("home"));
        assert!(pattern.contains("line N"));
        assert!(!pattern.contains("42"));
        assert!(!pattern.contains('7'));
    }

    #[test]
    fn test_file_pattern_keeps_name_only() {
        assert_eq!(file_pattern("src/api/client.py"), "*/client.py");
    }
}
