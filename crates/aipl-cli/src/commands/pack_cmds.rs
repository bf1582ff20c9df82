//! Experience-pack and language-pack library management.
//!
//! Packs are JSON files in a per-kind library under the engine's artifacts
//! tree; importing into a workspace copies a library pack into that
//! workspace's `user/imported_packs/`, where the context merger picks it up.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};

use aipl_core::layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackKind {
    Experience,
    Language,
}

impl PackKind {
    fn dir_name(&self) -> &'static str {
        match self {
            PackKind::Experience => "experience-packs",
            PackKind::Language => "language-packs",
        }
    }
}

fn library_dir(root: &Path, kind: PackKind) -> PathBuf {
    layout::artifacts_dir(root).join(kind.dir_name())
}

fn pack_path(root: &Path, kind: PackKind, name: &str) -> Result<PathBuf> {
    if !aipl_policy::is_safe_relative_path(name) || name.contains('/') {
        anyhow::bail!("invalid pack name: {name}");
    }
    Ok(library_dir(root, kind).join(format!("{name}.json")))
}

pub fn cmd_list(root: &Path, kind: PackKind) -> Result<Value> {
    let mut names: Vec<String> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(library_dir(root, kind)) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().to_string());
                }
            }
        }
    }
    names.sort();
    Ok(json!({"packs": names}))
}

pub fn cmd_get(root: &Path, kind: PackKind, name: &str) -> Result<Value> {
    let path = pack_path(root, kind, name)?;
    if !path.exists() {
        anyhow::bail!("pack not found: {name}");
    }
    let content: Value = aipl_core::fsio::read_json(&path)?;
    Ok(json!({"name": name, "content": content}))
}

fn read_pack_file(file: &Path) -> Result<Value> {
    let content: Value = aipl_core::fsio::read_json(file)
        .map_err(|err| anyhow::anyhow!("unreadable pack file: {err}"))?;
    if !content.is_object() {
        anyhow::bail!("pack must be a JSON object");
    }
    Ok(content)
}

pub fn cmd_import(root: &Path, kind: PackKind, file: &Path) -> Result<Value> {
    let content = read_pack_file(file)?;
    let name = content
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            file.file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
        })
        .ok_or_else(|| anyhow::anyhow!("pack has no name"))?;
    let path = pack_path(root, kind, &name)?;
    aipl_core::fsio::write_json(&path, &content)?;
    Ok(json!({"imported": name}))
}

pub fn cmd_import_workspace(
    root: &Path,
    kind: PackKind,
    name: &str,
    workspace: &Path,
) -> Result<Value> {
    let source = pack_path(root, kind, name)?;
    if !source.exists() {
        anyhow::bail!("pack not found: {name}");
    }
    let content: Value = aipl_core::fsio::read_json(&source)?;
    let dest = layout::workspace_dir(root, Some(workspace))
        .join("user")
        .join("imported_packs")
        .join(format!("{name}.json"));
    aipl_core::fsio::write_json(&dest, &content)?;
    Ok(json!({
        "imported": name,
        "workspace": workspace.to_string_lossy(),
        "path": dest.to_string_lossy(),
    }))
}

pub fn cmd_export(root: &Path, kind: PackKind, name: &str, output: &Path) -> Result<Value> {
    let source = pack_path(root, kind, name)?;
    if !source.exists() {
        anyhow::bail!("pack not found: {name}");
    }
    let content: Value = aipl_core::fsio::read_json(&source)?;
    aipl_core::fsio::write_json(output, &content)?;
    Ok(json!({"exported": name, "output": output.to_string_lossy()}))
}

pub fn cmd_delete(root: &Path, kind: PackKind, name: &str) -> Result<Value> {
    let path = pack_path(root, kind, name)?;
    let existed = path.exists();
    if existed {
        std::fs::remove_file(&path)?;
    }
    Ok(json!({"deleted": name, "existed": existed}))
}

pub fn cmd_update(root: &Path, kind: PackKind, name: &str, file: &Path) -> Result<Value> {
    let path = pack_path(root, kind, name)?;
    if !path.exists() {
        anyhow::bail!("pack not found: {name}");
    }
    let content = read_pack_file(file)?;
    aipl_core::fsio::write_json(&path, &content)?;
    Ok(json!({"updated": name}))
}
