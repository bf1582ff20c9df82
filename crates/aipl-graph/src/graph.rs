//! The import graph itself: nodes are workspace-relative source files, edges
//! are static import relationships.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const JS_TS_EXTS: [&str; 4] = [".ts", ".tsx", ".js", ".jsx"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeGraph {
    pub workspace_root: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// rel path -> language tag ("python" | "java" | "js").
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,

    /// Forward edges: importer -> imported.
    #[serde(default)]
    pub deps: BTreeMap<String, BTreeSet<String>>,

    /// Reverse edges, rebuilt from `deps`; never serialized.
    #[serde(skip)]
    pub rdeps: BTreeMap<String, BTreeSet<String>>,
}

impl CodeGraph {
    pub fn new(workspace_root: &Path, fingerprint: Option<String>) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            fingerprint,
            ..Default::default()
        }
    }

    /// Normalize any path (absolute or relative) to a workspace-relative
    /// forward-slash form; `None` when it escapes the workspace.
    pub fn normalize_path(&self, path: &str) -> Option<String> {
        let cleaned = path.replace('\\', "/");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return None;
        }
        let candidate = Path::new(cleaned);
        let rel = if candidate.is_absolute() {
            candidate.strip_prefix(&self.workspace_root).ok()?.to_path_buf()
        } else {
            candidate.to_path_buf()
        };
        let mut parts = Vec::new();
        for part in rel.components() {
            match part {
                std::path::Component::Normal(seg) => parts.push(seg.to_string_lossy().to_string()),
                std::path::Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }

    pub fn ensure_node(&mut self, rel_path: &str, lang: &str) {
        self.nodes
            .entry(rel_path.to_string())
            .or_insert_with(|| lang.to_string());
    }

    /// Self-edges and edges to unknown nodes are dropped.
    pub fn add_edge(&mut self, src: &str, dst: &str) {
        if src == dst {
            return;
        }
        if !self.nodes.contains_key(src) || !self.nodes.contains_key(dst) {
            return;
        }
        self.deps
            .entry(src.to_string())
            .or_default()
            .insert(dst.to_string());
    }

    pub fn finalize(&mut self) {
        self.rdeps.clear();
        for (src, targets) in &self.deps {
            for dst in targets {
                self.rdeps
                    .entry(dst.clone())
                    .or_default()
                    .insert(src.clone());
            }
        }
    }

    /// BFS over the union of forward and reverse edges within `max_hops`.
    /// Zero hops returns nothing; results are monotone in `max_hops`.
    pub fn related_files(&self, paths: &[String], max_hops: usize) -> Vec<String> {
        if max_hops == 0 {
            return Vec::new();
        }
        let seeds: Vec<String> = paths
            .iter()
            .filter_map(|p| self.normalize_path(p))
            .filter(|p| self.nodes.contains_key(p))
            .collect();
        if seeds.is_empty() {
            return Vec::new();
        }
        let mut visited: BTreeSet<String> = seeds.iter().cloned().collect();
        let mut queue: VecDeque<(String, usize)> =
            seeds.into_iter().map(|p| (p, 0)).collect();
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            let mut neighbors: BTreeSet<&String> = BTreeSet::new();
            if let Some(fwd) = self.deps.get(&current) {
                neighbors.extend(fwd);
            }
            if let Some(rev) = self.rdeps.get(&current) {
                neighbors.extend(rev);
            }
            for next in neighbors {
                if visited.insert(next.clone()) {
                    queue.push_back((next.clone(), depth + 1));
                }
            }
        }
        visited.into_iter().collect()
    }

    /// Name-based test association per language.
    pub fn tests_for_files(&self, paths: &[String]) -> Vec<String> {
        let test_files: Vec<&String> = self.nodes.keys().filter(|p| is_test_file(p)).collect();
        if test_files.is_empty() {
            return Vec::new();
        }
        let test_names: BTreeMap<String, &String> = test_files
            .iter()
            .filter_map(|p| {
                Path::new(p.as_str())
                    .file_name()
                    .map(|name| (name.to_string_lossy().to_string(), *p))
            })
            .collect();
        let mut matches: BTreeSet<String> = BTreeSet::new();
        for raw in paths {
            let Some(norm) = self.normalize_path(raw) else {
                continue;
            };
            if is_test_file(&norm) {
                matches.insert(norm);
                continue;
            }
            let path = Path::new(&norm);
            let base = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let ext = path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let candidates: Vec<String> = match ext.as_str() {
                ".py" => vec![format!("test_{base}.py"), format!("{base}_test.py")],
                ".java" => vec![format!("{base}Test.java"), format!("Test{base}.java")],
                _ if JS_TS_EXTS.contains(&ext.as_str()) => vec![
                    format!("{base}.test{ext}"),
                    format!("{base}.spec{ext}"),
                ],
                _ => Vec::new(),
            };
            for name in candidates {
                if let Some(hit) = test_names.get(&name) {
                    matches.insert((*hit).clone());
                }
            }
        }
        matches.into_iter().collect()
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        aipl_core::fsio::write_json(path, self)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let mut graph: CodeGraph = aipl_core::fsio::read_json(path)?;
        graph.finalize();
        Ok(graph)
    }
}

pub fn is_test_file(rel_path: &str) -> bool {
    let wrapped = format!("/{rel_path}/");
    if wrapped.contains("/tests/") || wrapped.contains("/test/") || wrapped.contains("/__tests__/")
    {
        return true;
    }
    let name = Path::new(rel_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.starts_with("test_") && name.ends_with(".py") {
        return true;
    }
    if name.ends_with("_test.py") {
        return true;
    }
    if name.ends_with("Test.java") || (name.starts_with("Test") && name.ends_with(".java")) {
        return true;
    }
    for ext in JS_TS_EXTS {
        for marker in [".test", ".spec"] {
            if name.ends_with(&format!("{marker}{ext}")) {
                return true;
            }
        }
    }
    false
}
