//! code-graph / workspace-tree / workspace-read commands.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};

use aipl_core::env::EngineConfig;
use aipl_graph::CodeGraphService;
use aipl_profile::compute_fingerprint;

fn graph_service(root: &Path, config: &EngineConfig) -> CodeGraphService {
    let cache_root = (config.code_graph_cache || config.code_graph_watch)
        .then(|| config.code_graph_cache_root.clone().unwrap_or_else(|| root.to_path_buf()));
    CodeGraphService::new(cache_root)
}

pub fn cmd_graph_build(
    root: &Path,
    config: &EngineConfig,
    workspace: &Path,
    output: Option<&Path>,
) -> Result<Value> {
    let fingerprint = compute_fingerprint(workspace);
    let graph = graph_service(root, config).build(workspace, Some(&fingerprint))?;
    if let Some(output) = output {
        graph.save(output)?;
    }
    Ok(json!({
        "workspace": workspace.to_string_lossy(),
        "fingerprint": fingerprint,
        "nodes": graph.nodes.len(),
        "edges": graph.deps.values().map(|targets| targets.len()).sum::<usize>(),
        "output": output.map(|p| p.to_string_lossy()),
    }))
}

pub fn cmd_graph_related(
    root: &Path,
    config: &EngineConfig,
    workspace: &Path,
    files: &[String],
    hops: usize,
) -> Result<Value> {
    let fingerprint = compute_fingerprint(workspace);
    let graph = graph_service(root, config).build(workspace, Some(&fingerprint))?;
    let related = graph.related_files(files, hops);
    let tests = graph.tests_for_files(files);
    Ok(json!({
        "seeds": files,
        "hops": hops,
        "related": related,
        "tests": tests,
    }))
}

pub fn cmd_workspace_tree(workspace: &Path, depth: usize) -> Result<Value> {
    fn walk(dir: &Path, depth_left: usize, out: &mut Vec<String>, base: &Path) {
        if depth_left == 0 {
            return;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        paths.sort();
        for path in paths {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            if aipl_graph::scan::EXCLUDE_DIRS.contains(&name.as_ref()) {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(base) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if path.is_dir() {
                    out.push(format!("{rel}/"));
                    walk(&path, depth_left - 1, out, base);
                } else {
                    out.push(rel);
                }
            }
        }
    }
    if !workspace.is_dir() {
        anyhow::bail!("workspace not found: {}", workspace.display());
    }
    let mut entries = Vec::new();
    walk(workspace, depth.max(1), &mut entries, workspace);
    Ok(json!({
        "workspace": workspace.to_string_lossy(),
        "depth": depth,
        "entries": entries,
    }))
}

pub fn cmd_workspace_read(workspace: &Path, rel_path: &str) -> Result<Value> {
    if !aipl_policy::is_safe_relative_path(rel_path) {
        anyhow::bail!("unsafe path: {rel_path}");
    }
    let target = aipl_verify::handlers::confine(workspace, rel_path)
        .ok_or_else(|| anyhow::anyhow!("unsafe path: {rel_path}"))?;
    if !target.is_file() {
        anyhow::bail!("file not found: {rel_path}");
    }
    let bytes = std::fs::read(&target)?;
    let content = String::from_utf8_lossy(&bytes).to_string();
    Ok(json!({
        "path": rel_path,
        "size": bytes.len(),
        "content": content,
    }))
}
