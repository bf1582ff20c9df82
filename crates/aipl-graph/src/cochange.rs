//! Co-change learning: which files are modified together in successful runs.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

const MIN_OCCURRENCE: u64 = 2;
const MIN_CONFIDENCE: f64 = 0.3;
const MAX_PATTERNS: usize = 500;
const DECAY_HALF_LIFE_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSet {
    pub run_id: String,
    pub task_id: String,
    pub files: Vec<String>,
    pub timestamp: f64,
    pub success: bool,

    #[serde(default)]
    pub task_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoChangePattern {
    pub files: Vec<String>,
    pub occurrence_count: u64,
    pub confidence: f64,

    #[serde(default)]
    pub avg_change_size: u64,

    #[serde(default)]
    pub source_runs: Vec<String>,

    pub first_seen: f64,
    pub last_seen: f64,
    pub pattern_type: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Accumulates change sets during a controller session.
#[derive(Debug, Default)]
pub struct CoChangeCollector {
    change_sets: Vec<ChangeSet>,
}

impl CoChangeCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run's modified files. Only successful runs that touched at
    /// least two (normalizable) files produce a change set.
    pub fn collect_from_run(
        &mut self,
        run_id: &str,
        task_id: &str,
        modified_files: &[String],
        success: bool,
        task_type: &str,
        now: f64,
    ) -> Option<&ChangeSet> {
        if !success || modified_files.len() < 2 {
            return None;
        }
        let mut files: Vec<String> = modified_files
            .iter()
            .filter_map(|f| normalize_path(f))
            .collect();
        files.sort();
        files.dedup();
        if files.len() < 2 {
            return None;
        }
        self.change_sets.push(ChangeSet {
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            files,
            timestamp: now,
            success,
            task_type: task_type.to_string(),
        });
        self.change_sets.last()
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    pub fn clear(&mut self) {
        self.change_sets.clear();
    }
}

fn normalize_path(path: &str) -> Option<String> {
    let cleaned = path.replace('\\', "/");
    let cleaned = cleaned.trim();
    let cleaned = cleaned.strip_prefix("./").unwrap_or(cleaned);
    for token in ["__pycache__", ".pyc", ".git", "node_modules"] {
        if cleaned.contains(token) {
            return None;
        }
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// File-backed pair-count learner with confidence decay and GC.
#[derive(Debug)]
pub struct CoChangeLearner {
    storage_path: std::path::PathBuf,
    patterns: Vec<CoChangePattern>,
    pair_counts: BTreeMap<(String, String), u64>,
    file_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LearnerFile {
    #[serde(default)]
    patterns: Vec<CoChangePattern>,

    #[serde(default)]
    pair_counts: BTreeMap<String, u64>,

    #[serde(default)]
    file_counts: BTreeMap<String, u64>,

    #[serde(default)]
    updated_at: f64,
}

impl CoChangeLearner {
    pub fn new(storage_path: &Path) -> Self {
        Self {
            storage_path: storage_path.to_path_buf(),
            patterns: Vec::new(),
            pair_counts: BTreeMap::new(),
            file_counts: BTreeMap::new(),
        }
    }

    pub fn load(&mut self) {
        let data: LearnerFile =
            aipl_core::fsio::read_json_or(&self.storage_path, LearnerFile::default());
        self.patterns = data.patterns;
        self.pair_counts = data
            .pair_counts
            .into_iter()
            .filter_map(|(key, count)| {
                key.split_once('|')
                    .map(|(a, b)| ((a.to_string(), b.to_string()), count))
            })
            .collect();
        self.file_counts = data.file_counts;
    }

    pub fn save(&self, now: f64) -> std::io::Result<()> {
        let data = LearnerFile {
            patterns: self
                .patterns
                .iter()
                .map(|p| CoChangePattern {
                    source_runs: p.source_runs.iter().rev().take(10).rev().cloned().collect(),
                    ..p.clone()
                })
                .collect(),
            pair_counts: self
                .pair_counts
                .iter()
                .map(|((a, b), count)| (format!("{a}|{b}"), *count))
                .collect(),
            file_counts: self.file_counts.clone(),
            updated_at: now,
        };
        aipl_core::fsio::write_json(&self.storage_path, &data)
    }

    pub fn patterns(&self) -> &[CoChangePattern] {
        &self.patterns
    }

    /// Fold change sets into pair counts and re-derive patterns. Confidence
    /// of a pair is `count / max(count of either file)`; pairs below the
    /// occurrence or confidence floors are not retained.
    pub fn learn_from_change_sets(&mut self, change_sets: &[ChangeSet], now: f64) -> usize {
        for cs in change_sets {
            if !cs.success || cs.files.len() < 2 {
                continue;
            }
            for file in &cs.files {
                *self.file_counts.entry(file.clone()).or_default() += 1;
            }
            for (i, f1) in cs.files.iter().enumerate() {
                for f2 in cs.files.iter().skip(i + 1) {
                    let pair = if f1 <= f2 {
                        (f1.clone(), f2.clone())
                    } else {
                        (f2.clone(), f1.clone())
                    };
                    *self.pair_counts.entry(pair).or_default() += 1;
                }
            }
        }

        let mut new_patterns = 0;
        for ((f1, f2), count) in self.pair_counts.clone() {
            if count < MIN_OCCURRENCE {
                continue;
            }
            let max_single = self
                .file_counts
                .get(&f1)
                .copied()
                .unwrap_or(0)
                .max(self.file_counts.get(&f2).copied().unwrap_or(0));
            if max_single == 0 {
                continue;
            }
            let confidence = count as f64 / max_single as f64;
            if confidence < MIN_CONFIDENCE {
                continue;
            }
            if let Some(existing) = self
                .patterns
                .iter_mut()
                .find(|p| p.files.len() == 2 && p.files.contains(&f1) && p.files.contains(&f2))
            {
                existing.occurrence_count = count;
                existing.confidence = confidence;
                existing.last_seen = now;
            } else {
                self.patterns.push(CoChangePattern {
                    files: vec![f1.clone(), f2.clone()],
                    occurrence_count: count,
                    confidence,
                    avg_change_size: 2,
                    source_runs: Vec::new(),
                    first_seen: now,
                    last_seen: now,
                    pattern_type: detect_pattern_type(&f1, &f2),
                    tags: extract_tags(&f1, &f2),
                });
                new_patterns += 1;
            }
        }

        self.gc();
        new_patterns
    }

    /// Co-changers of `file_path` at or above `min_confidence`, with 30-day
    /// half-life decay applied from `last_seen`.
    pub fn query_co_changes(
        &self,
        file_path: &str,
        min_confidence: f64,
        now: f64,
    ) -> Vec<(String, f64)> {
        let Some(normalized) = normalize_path(file_path) else {
            return Vec::new();
        };
        let mut best: BTreeMap<String, f64> = BTreeMap::new();
        for pattern in &self.patterns {
            if !pattern.files.contains(&normalized) {
                continue;
            }
            if pattern.confidence < min_confidence {
                continue;
            }
            let age_days = (now - pattern.last_seen).max(0.0) / 86_400.0;
            let decayed = pattern.confidence * 0.5_f64.powf(age_days / DECAY_HALF_LIFE_DAYS);
            if decayed < min_confidence {
                continue;
            }
            for file in &pattern.files {
                if file != &normalized {
                    let entry = best.entry(file.clone()).or_insert(0.0);
                    if decayed > *entry {
                        *entry = decayed;
                    }
                }
            }
        }
        let mut results: Vec<(String, f64)> = best.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results
    }

    /// Files that frequently co-change with any modified file but are not in
    /// the modified set.
    pub fn suggest_missing_files(
        &self,
        modified: &[String],
        min_confidence: f64,
        now: f64,
    ) -> Vec<(String, f64)> {
        let modified_set: std::collections::BTreeSet<String> = modified
            .iter()
            .filter_map(|f| normalize_path(f))
            .collect();
        let mut best: BTreeMap<String, f64> = BTreeMap::new();
        for file in &modified_set {
            for (candidate, confidence) in self.query_co_changes(file, min_confidence, now) {
                if modified_set.contains(&candidate) {
                    continue;
                }
                let entry = best.entry(candidate).or_insert(0.0);
                if confidence > *entry {
                    *entry = confidence;
                }
            }
        }
        let mut results: Vec<(String, f64)> = best.into_iter().collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results
    }

    fn gc(&mut self) {
        if self.patterns.len() <= MAX_PATTERNS {
            return;
        }
        self.patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.patterns.truncate(MAX_PATTERNS);
    }
}

fn detect_pattern_type(f1: &str, f2: &str) -> String {
    let p1 = Path::new(f1);
    let p2 = Path::new(f2);
    if p1.parent() == p2.parent() {
        return "same_directory".to_string();
    }
    if p1.file_stem() == p2.file_stem() {
        return "same_name".to_string();
    }
    if format!("{f1} {f2}").to_lowercase().contains("test") {
        return "test_related".to_string();
    }
    "exact".to_string()
}

fn extract_tags(f1: &str, f2: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut push = |tag: &str| {
        if !tags.contains(&tag.to_string()) {
            tags.push(tag.to_string());
        }
    };
    for file in [f1, f2] {
        if file.ends_with(".py") {
            push("python");
        } else if file.ends_with(".java") {
            push("java");
        } else if file.ends_with(".ts") || file.ends_with(".tsx") {
            push("typescript");
        }
    }
    for file in [f1, f2] {
        let parts: Vec<&str> = file.split('/').collect();
        if parts.contains(&"api") {
            push("api");
        }
        if parts.contains(&"models") {
            push("model");
        }
        if parts.contains(&"tests") || parts.contains(&"test") {
            push("test");
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: f64 = 1_700_000_000.0;

    fn change_set(run: &str, files: &[&str]) -> ChangeSet {
        ChangeSet {
            run_id: run.to_string(),
            task_id: "T1".to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
            timestamp: NOW,
            success: true,
            task_type: String::new(),
        }
    }

    // ── Collector ───────────────────────────────────────────────────

    #[test]
    fn test_collector_requires_success_and_two_files() {
        let mut collector = CoChangeCollector::new();
        assert!(collector
            .collect_from_run("r1", "T1", &["a.py".into()], true, "", NOW)
            .is_none());
        assert!(collector
            .collect_from_run("r1", "T1", &["a.py".into(), "b.py".into()], false, "", NOW)
            .is_none());
        let cs = collector
            .collect_from_run("r1", "T1", &["b.py".into(), "a.py".into()], true, "", NOW)
            .unwrap();
        assert_eq!(cs.files, vec!["a.py", "b.py"]);
    }

    #[test]
    fn test_collector_filters_noise_paths() {
        let mut collector = CoChangeCollector::new();
        assert!(collector
            .collect_from_run(
                "r1",
                "T1",
                &["a.py".into(), "__pycache__/a.pyc".into()],
                true,
                "",
                NOW,
            )
            .is_none());
    }

    // ── Learner ─────────────────────────────────────────────────────

    #[test]
    fn test_learner_thresholds() {
        let tmp = tempfile::tempdir().unwrap();
        let mut learner = CoChangeLearner::new(&tmp.path().join("cochange.json"));
        // one occurrence is below MIN_OCCURRENCE
        learner.learn_from_change_sets(&[change_set("r1", &["a.py", "b.py"])], NOW);
        assert!(learner.patterns().is_empty());
        // second occurrence crosses the floor, confidence 2/2 = 1.0
        learner.learn_from_change_sets(&[change_set("r2", &["a.py", "b.py"])], NOW);
        assert_eq!(learner.patterns().len(), 1);
        let pattern = &learner.patterns()[0];
        assert_eq!(pattern.occurrence_count, 2);
        assert!((pattern.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_is_count_over_max_file_count() {
        let tmp = tempfile::tempdir().unwrap();
        let mut learner = CoChangeLearner::new(&tmp.path().join("cochange.json"));
        let sets = vec![
            change_set("r1", &["a.py", "b.py"]),
            change_set("r2", &["a.py", "b.py"]),
            change_set("r3", &["a.py", "c.py"]),
            change_set("r4", &["a.py", "c.py"]),
        ];
        learner.learn_from_change_sets(&sets, NOW);
        // a.py seen 4 times, pair (a,b) twice -> 0.5
        let ab = learner
            .patterns()
            .iter()
            .find(|p| p.files.contains(&"b.py".to_string()))
            .unwrap();
        assert!((ab.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_query_applies_decay() {
        let tmp = tempfile::tempdir().unwrap();
        let mut learner = CoChangeLearner::new(&tmp.path().join("cochange.json"));
        learner.learn_from_change_sets(
            &[
                change_set("r1", &["a.py", "b.py"]),
                change_set("r2", &["a.py", "b.py"]),
            ],
            NOW,
        );
        let fresh = learner.query_co_changes("a.py", 0.3, NOW);
        assert_eq!(fresh[0].0, "b.py");
        assert!((fresh[0].1 - 1.0).abs() < 1e-9);

        // 30 days later the confidence has halved
        let month_later = NOW + 30.0 * 86_400.0;
        let decayed = learner.query_co_changes("a.py", 0.3, month_later);
        assert!((decayed[0].1 - 0.5).abs() < 1e-6);

        // below the floor after enough decay
        let year_later = NOW + 365.0 * 86_400.0;
        assert!(learner.query_co_changes("a.py", 0.3, year_later).is_empty());
    }

    #[test]
    fn test_suggest_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut learner = CoChangeLearner::new(&tmp.path().join("cochange.json"));
        learner.learn_from_change_sets(
            &[
                change_set("r1", &["api.py", "schema.py"]),
                change_set("r2", &["api.py", "schema.py"]),
                change_set("r3", &["api.py", "schema.py"]),
            ],
            NOW,
        );
        let suggested = learner.suggest_missing_files(&["api.py".to_string()], 0.7, NOW);
        assert_eq!(suggested.len(), 1);
        assert_eq!(suggested[0].0, "schema.py");
        // nothing to suggest when both are already modified
        assert!(learner
            .suggest_missing_files(&["api.py".to_string(), "schema.py".to_string()], 0.7, NOW)
            .is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cochange.json");
        let mut learner = CoChangeLearner::new(&path);
        learner.learn_from_change_sets(
            &[
                change_set("r1", &["a.py", "b.py"]),
                change_set("r2", &["a.py", "b.py"]),
            ],
            NOW,
        );
        learner.save(NOW).unwrap();

        let mut reloaded = CoChangeLearner::new(&path);
        reloaded.load();
        assert_eq!(reloaded.patterns().len(), 1);
        // counts survive, so further learning continues from 2
        reloaded.learn_from_change_sets(&[change_set("r3", &["a.py", "b.py"])], NOW);
        assert_eq!(reloaded.patterns()[0].occurrence_count, 3);
    }

    #[test]
    fn test_pattern_type_detection() {
        assert_eq!(detect_pattern_type("src/a.py", "src/b.py"), "same_directory");
        assert_eq!(detect_pattern_type("src/a.py", "lib/a.ts"), "same_name");
        assert_eq!(detect_pattern_type("src/a.py", "tests/test_b.py"), "test_related");
        assert_eq!(detect_pattern_type("src/a.py", "lib/b.ts"), "exact");
    }
}
