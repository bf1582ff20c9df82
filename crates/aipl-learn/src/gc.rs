//! Garbage collection over the learned stores: confidence decays with a
//! 30-day half-life, entries below 0.1 are dropped, and each kind is capped
//! at 500 entries (highest confidence kept).

use std::path::{Path, PathBuf};

use serde_json::Value;

pub const DECAY_HALF_LIFE_DAYS: f64 = 30.0;
pub const MAX_ITEMS_PER_KIND: usize = 500;
pub const MIN_CONFIDENCE: f64 = 0.1;

const LEARNED_FILES: [&str; 3] = ["signatures.json", "hints.json", "lessons.json"];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub removed: usize,
    pub decayed: usize,
}

pub struct LearningGc {
    learned_dir: PathBuf,
}

impl LearningGc {
    pub fn new(learned_dir: &Path) -> Self {
        Self {
            learned_dir: learned_dir.to_path_buf(),
        }
    }

    pub fn run(&self, now: f64) -> GcStats {
        let mut stats = GcStats::default();
        for filename in LEARNED_FILES {
            let path = self.learned_dir.join(filename);
            if !path.exists() {
                continue;
            }
            let file_stats = self.gc_file(&path, now);
            stats.removed += file_stats.removed;
            stats.decayed += file_stats.decayed;
        }
        stats
    }

    fn gc_file(&self, path: &Path, now: f64) -> GcStats {
        let mut stats = GcStats::default();
        let mut data: Value = aipl_core::fsio::read_json_or(path, Value::Null);
        let Some(map) = data.as_object_mut() else {
            return stats;
        };
        for items in map.values_mut() {
            let Some(entries) = items.as_array_mut() else {
                continue;
            };
            let mut kept: Vec<Value> = Vec::new();
            for mut entry in std::mem::take(entries) {
                let timestamp = entry.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
                let confidence = entry.get("confidence").and_then(Value::as_f64).unwrap_or(0.5);
                let age_days = (now - timestamp).max(0.0) / 86_400.0;
                let decayed = confidence * 0.5_f64.powf(age_days / DECAY_HALF_LIFE_DAYS);
                if decayed < confidence {
                    stats.decayed += 1;
                }
                if decayed < MIN_CONFIDENCE {
                    stats.removed += 1;
                    continue;
                }
                entry["confidence"] = serde_json::json!(decayed);
                kept.push(entry);
            }
            if kept.len() > MAX_ITEMS_PER_KIND {
                kept.sort_by(|a, b| {
                    let ca = a.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
                    let cb = b.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
                    cb.partial_cmp(&ca).unwrap_or(std::cmp::Ordering::Equal)
                });
                stats.removed += kept.len() - MAX_ITEMS_PER_KIND;
                kept.truncate(MAX_ITEMS_PER_KIND);
            }
            *entries = kept;
        }
        let _ = aipl_core::fsio::write_json(path, &data);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: f64 = 1_700_000_000.0;

    fn write_hints(dir: &Path, entries: Vec<Value>) {
        aipl_core::fsio::write_json(&dir.join("hints.json"), &json!({"hints": entries})).unwrap();
    }

    #[test]
    fn test_decay_halves_per_month() {
        let tmp = tempfile::tempdir().unwrap();
        write_hints(
            tmp.path(),
            vec![json!({"hint": "x", "confidence": 0.8, "timestamp": NOW - 30.0 * 86_400.0})],
        );
        let stats = LearningGc::new(tmp.path()).run(NOW);
        assert_eq!(stats.decayed, 1);
        assert_eq!(stats.removed, 0);
        let data: Value = aipl_core::fsio::read_json(&tmp.path().join("hints.json")).unwrap();
        let confidence = data["hints"][0]["confidence"].as_f64().unwrap();
        assert!((confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_drops_below_floor() {
        let tmp = tempfile::tempdir().unwrap();
        write_hints(
            tmp.path(),
            vec![json!({"hint": "old", "confidence": 0.2, "timestamp": NOW - 365.0 * 86_400.0})],
        );
        let stats = LearningGc::new(tmp.path()).run(NOW);
        assert_eq!(stats.removed, 1);
        let data: Value = aipl_core::fsio::read_json(&tmp.path().join("hints.json")).unwrap();
        assert!(data["hints"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_caps_at_max_keeping_highest() {
        let tmp = tempfile::tempdir().unwrap();
        let entries: Vec<Value> = (0..(MAX_ITEMS_PER_KIND + 10))
            .map(|i| {
                json!({
                    "hint": format!("h{i}"),
                    "confidence": 0.2 + (i as f64) / 10_000.0,
                    "timestamp": NOW,
                })
            })
            .collect();
        write_hints(tmp.path(), entries);
        let stats = LearningGc::new(tmp.path()).run(NOW);
        assert_eq!(stats.removed, 10);
        let data: Value = aipl_core::fsio::read_json(&tmp.path().join("hints.json")).unwrap();
        let kept = data["hints"].as_array().unwrap();
        assert_eq!(kept.len(), MAX_ITEMS_PER_KIND);
        // the lowest-confidence entries are the ones removed
        assert!(kept
            .iter()
            .all(|entry| entry["hint"].as_str().unwrap() != "h0"));
    }

    #[test]
    fn test_missing_files_are_fine() {
        let tmp = tempfile::tempdir().unwrap();
        let stats = LearningGc::new(tmp.path()).run(NOW);
        assert_eq!(stats, GcStats::default());
    }
}
