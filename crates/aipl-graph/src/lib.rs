//! Code graph construction with incremental caching, plus the co-change
//! learner.

pub mod cache;
pub mod cochange;
pub mod graph;
pub mod scan;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

pub use cochange::{ChangeSet, CoChangeCollector, CoChangeLearner, CoChangePattern};
pub use graph::CodeGraph;

use cache::{GraphCache, cache_path, mtime_ms};
use scan::{FileMeta, lang_for_path, parse_file_meta, scan_source_files};

#[derive(Debug, Clone, Default)]
pub struct CodeGraphService {
    /// Cache directory root; `None` disables caching entirely.
    pub cache_root: Option<PathBuf>,
}

impl CodeGraphService {
    pub fn new(cache_root: Option<PathBuf>) -> Self {
        Self { cache_root }
    }

    /// Build (or incrementally refresh) the import graph for a workspace.
    ///
    /// When caching is enabled, files whose mtime+size match the cache reuse
    /// their parsed import meta; only changed files are re-read.
    pub fn build(&self, workspace_root: &Path, fingerprint: Option<&str>) -> Result<CodeGraph> {
        let cache_file = self
            .cache_root
            .as_deref()
            .map(|root| cache_path(root, fingerprint));
        let mut cache = match &cache_file {
            Some(path) => GraphCache::load(path),
            None => GraphCache::default(),
        };
        if cache.fingerprint.as_deref() != fingerprint {
            cache = GraphCache {
                fingerprint: fingerprint.map(str::to_string),
                ..Default::default()
            };
        }

        let files = scan_source_files(workspace_root);
        let mut metas: Vec<(String, FileMeta)> = Vec::new();
        let mut live: BTreeSet<String> = BTreeSet::new();
        let mut parsed = 0usize;

        for rel in &files {
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            let abs = workspace_root.join(rel);
            let Ok(metadata) = std::fs::metadata(&abs) else {
                continue;
            };
            let (mtime, size) = (mtime_ms(&metadata), metadata.len());
            live.insert(rel_str.clone());
            if let Some(meta) = cache.lookup(&rel_str, mtime, size) {
                metas.push((rel_str, meta.clone()));
                continue;
            }
            let Some(lang) = lang_for_path(rel) else {
                continue;
            };
            let Ok(text) = std::fs::read_to_string(&abs) else {
                continue;
            };
            let meta = parse_file_meta(lang, &text);
            cache.insert(rel_str.clone(), mtime, size, meta.clone());
            metas.push((rel_str, meta));
            parsed += 1;
        }
        cache.retain_paths(&live);
        debug!(total = files.len(), parsed, "code graph scan complete");

        if let Some(path) = &cache_file {
            cache.updated_at = aipl_core::now_ts();
            let _ = cache.save(path);
        }

        Ok(build_from_metas(workspace_root, fingerprint, &metas))
    }

    pub fn load(&self, path: &Path) -> Result<CodeGraph> {
        Ok(CodeGraph::load(path)?)
    }

    pub fn save(&self, graph: &CodeGraph, path: &Path) -> Result<()> {
        Ok(graph.save(path)?)
    }
}

/// Resolve parsed metas into a finished graph. Java imports resolve through
/// a package+class map; Python and JS resolve against the filesystem layout
/// captured by the node set.
fn build_from_metas(
    workspace_root: &Path,
    fingerprint: Option<&str>,
    metas: &[(String, FileMeta)],
) -> CodeGraph {
    let mut graph = CodeGraph::new(workspace_root, fingerprint.map(str::to_string));
    for (rel, meta) in metas {
        graph.ensure_node(rel, meta.lang());
    }

    // Java class map: fully-qualified class name -> file.
    let mut class_map: std::collections::BTreeMap<String, String> = Default::default();
    let mut package_map: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    for (rel, meta) in metas {
        if let FileMeta::Java { package, .. } = meta {
            let stem = Path::new(rel)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let fqcn = if package.is_empty() {
                stem.clone()
            } else {
                format!("{package}.{stem}")
            };
            class_map.insert(fqcn, rel.clone());
            package_map.entry(package.clone()).or_default().push(rel.clone());
        }
    }

    for (rel, meta) in metas {
        match meta {
            FileMeta::Python { imports } => {
                for import in imports {
                    for dst in scan::resolve_python_import(workspace_root, rel, import) {
                        graph.add_edge(rel, &dst);
                    }
                }
            }
            FileMeta::Java { imports, .. } => {
                for import in imports {
                    if let Some(package) = import.strip_suffix(".*") {
                        if let Some(files) = package_map.get(package) {
                            for dst in files.clone() {
                                graph.add_edge(rel, &dst);
                            }
                        }
                    } else if let Some(dst) = class_map.get(import) {
                        graph.add_edge(rel, &dst.clone());
                    }
                }
            }
            FileMeta::Js { specs } => {
                for spec in specs {
                    for dst in scan::resolve_js_import(workspace_root, rel, spec) {
                        graph.add_edge(rel, &dst);
                    }
                }
            }
        }
    }

    graph.finalize();
    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn test_build_python_graph() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "app/__init__.py", "");
        write(ws, "app/models.py", "import os\n");
        write(ws, "app/views.py", "from app.models import Thing\n");
        write(ws, "main.py", "from app import views\n");

        let service = CodeGraphService::new(None);
        let graph = service.build(ws, None).unwrap();
        assert!(graph.deps.get("app/views.py").unwrap().contains("app/models.py"));
        assert!(graph.deps.get("main.py").unwrap().contains("app/views.py"));
        // reverse edges reach the importer
        let related = graph.related_files(&["app/models.py".to_string()], 1);
        assert!(related.contains(&"app/views.py".to_string()));
    }

    #[test]
    fn test_build_java_graph_via_class_map() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(
            ws,
            "src/com/acme/Util.java",
            "package com.acme;\npublic class Util {}\n",
        );
        write(
            ws,
            "src/com/acme/app/Main.java",
            "package com.acme.app;\nimport com.acme.Util;\npublic class Main {}\n",
        );
        let service = CodeGraphService::new(None);
        let graph = service.build(ws, None).unwrap();
        assert!(graph
            .deps
            .get("src/com/acme/app/Main.java")
            .unwrap()
            .contains("src/com/acme/Util.java"));
    }

    #[test]
    fn test_build_java_wildcard_import() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "A.java", "package com.acme;\npublic class A {}\n");
        write(ws, "B.java", "package com.acme;\npublic class B {}\n");
        write(
            ws,
            "Main.java",
            "package app;\nimport com.acme.*;\npublic class Main {}\n",
        );
        let graph = CodeGraphService::new(None).build(ws, None).unwrap();
        let deps = graph.deps.get("Main.java").unwrap();
        assert!(deps.contains("A.java"));
        assert!(deps.contains("B.java"));
    }

    #[test]
    fn test_build_js_graph() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "src/util.ts", "export const x = 1;\n");
        write(ws, "src/main.ts", "import {x} from './util';\n");
        let graph = CodeGraphService::new(None).build(ws, None).unwrap();
        assert!(graph.deps.get("src/main.ts").unwrap().contains("src/util.ts"));
    }

    #[test]
    fn test_cache_reused_and_invalidated() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        let cache_root = tmp.path().join("engine");
        write(&ws, "a.py", "import b\n");
        write(&ws, "b.py", "");

        let service = CodeGraphService::new(Some(cache_root.clone()));
        let first = service.build(&ws, Some("fp1")).unwrap();
        assert!(first.deps.get("a.py").unwrap().contains("b.py"));
        let cache_file = cache::cache_path(&cache_root, Some("fp1"));
        assert!(cache_file.exists());

        // unchanged rebuild uses the cache and yields the same graph
        let second = service.build(&ws, Some("fp1")).unwrap();
        assert_eq!(second.deps, first.deps);

        // a content change with a new mtime refreshes the edge set
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(&ws, "c.py", "");
        write(&ws, "a.py", "import c\n# changed\n");
        let third = service.build(&ws, Some("fp1")).unwrap();
        assert!(third.deps.get("a.py").unwrap().contains("c.py"));
        assert!(!third.deps.get("a.py").unwrap().contains("b.py"));
    }

    #[test]
    fn test_fingerprint_change_resets_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        let cache_root = tmp.path().join("engine");
        write(&ws, "a.py", "");
        let service = CodeGraphService::new(Some(cache_root.clone()));
        service.build(&ws, Some("fp1")).unwrap();
        // different fingerprint gets its own cache file
        service.build(&ws, Some("fp2")).unwrap();
        assert!(cache::cache_path(&cache_root, Some("fp1")).exists());
        assert!(cache::cache_path(&cache_root, Some("fp2")).exists());
    }

    #[test]
    fn test_graph_save_load_via_service() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        write(&ws, "a.py", "import b\n");
        write(&ws, "b.py", "");
        let service = CodeGraphService::new(None);
        let graph = service.build(&ws, None).unwrap();
        let path = tmp.path().join("code-graph.json");
        service.save(&graph, &path).unwrap();
        let loaded = service.load(&path).unwrap();
        assert_eq!(loaded.deps, graph.deps);
    }
}
