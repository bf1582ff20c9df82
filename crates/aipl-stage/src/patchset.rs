//! Patch set construction and controlled apply.
//!
//! The patch set is the reviewable artifact of a successful run: a per-file
//! inventory plus a unified diff of stage vs main. Applying copies bytes from
//! the stage into the main workspace; it never executes anything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::TextDiff;

use crate::STAGE_IGNORE_DIRS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSet {
    pub patchset_path: PathBuf,
    pub changed_files_path: PathBuf,
    pub changed_files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyOutcome {
    pub path: String,
    pub status: Option<FileStatus>,
    pub result: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn walk_files(root: &Path) -> BTreeMap<String, PathBuf> {
    let mut files = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if !STAGE_IGNORE_DIRS.contains(&name.as_str()) {
                    stack.push(path);
                }
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    files.insert(rel.to_string_lossy().replace('\\', "/"), path);
                }
            }
        }
    }
    files
}

fn hash_file(path: &Path) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    HEXLOWER.encode(&Sha256::digest(&bytes))
}

fn read_lossy(path: &Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

fn unified(old: &str, new: &str, rel: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .header(&format!("a/{rel}"), &format!("b/{rel}"))
        .to_string()
}

/// Diff the stage against main and persist `patchset/patchset.diff` plus the
/// `changed_files.json` inventory under `run_dir`. An empty inventory means
/// no changes.
pub fn build_patchset(stage_root: &Path, main_root: &Path, run_dir: &Path) -> std::io::Result<PatchSet> {
    let patch_dir = run_dir.join("patchset");
    std::fs::create_dir_all(&patch_dir)?;
    let patch_path = patch_dir.join("patchset.diff");
    let changed_files_path = patch_dir.join("changed_files.json");

    let stage_files = walk_files(stage_root);
    let main_files = walk_files(main_root);

    let mut changed: Vec<ChangedFile> = Vec::new();
    let mut diff_text = String::new();

    let all_paths: std::collections::BTreeSet<&String> =
        stage_files.keys().chain(main_files.keys()).collect();
    for rel in all_paths {
        match (stage_files.get(rel), main_files.get(rel)) {
            (Some(stage_path), None) => {
                changed.push(ChangedFile {
                    path: rel.clone(),
                    status: FileStatus::Added,
                });
                diff_text.push_str(&unified("", &read_lossy(stage_path), rel));
            }
            (None, Some(main_path)) => {
                changed.push(ChangedFile {
                    path: rel.clone(),
                    status: FileStatus::Deleted,
                });
                diff_text.push_str(&unified(&read_lossy(main_path), "", rel));
            }
            (Some(stage_path), Some(main_path)) => {
                if hash_file(stage_path) != hash_file(main_path) {
                    changed.push(ChangedFile {
                        path: rel.clone(),
                        status: FileStatus::Modified,
                    });
                    diff_text.push_str(&unified(
                        &read_lossy(main_path),
                        &read_lossy(stage_path),
                        rel,
                    ));
                }
            }
            (None, None) => unreachable!(),
        }
    }

    std::fs::write(&patch_path, &diff_text)?;
    aipl_core::fsio::write_json(
        &changed_files_path,
        &serde_json::json!({
            "generated_at": aipl_core::now_ts() as i64,
            "changed_files": changed,
        }),
    )?;

    Ok(PatchSet {
        patchset_path: patch_path,
        changed_files_path,
        changed_files: changed,
    })
}

/// Copy the inventory into the main workspace. Unsafe paths are skipped, not
/// errors; each entry yields a result record.
pub fn apply_patchset(
    stage_root: &Path,
    main_root: &Path,
    changed_files: &[ChangedFile],
) -> Vec<ApplyOutcome> {
    let mut results = Vec::new();
    for item in changed_files {
        let rel = &item.path;
        if rel.is_empty()
            || rel.starts_with('/')
            || rel.starts_with('\\')
            || rel.split(['/', '\\']).any(|part| part == "..")
        {
            results.push(ApplyOutcome {
                path: rel.clone(),
                status: Some(item.status),
                result: "skipped".to_string(),
                reason: Some("unsafe_path".to_string()),
            });
            continue;
        }
        let src = stage_root.join(rel);
        let dest = main_root.join(rel);
        if item.status == FileStatus::Deleted {
            let outcome = if dest.exists() {
                match std::fs::remove_file(&dest) {
                    Ok(()) => ApplyOutcome {
                        path: rel.clone(),
                        status: Some(item.status),
                        result: "deleted".to_string(),
                        reason: None,
                    },
                    Err(err) => ApplyOutcome {
                        path: rel.clone(),
                        status: Some(item.status),
                        result: "failed".to_string(),
                        reason: Some(err.to_string()),
                    },
                }
            } else {
                ApplyOutcome {
                    path: rel.clone(),
                    status: Some(item.status),
                    result: "missing".to_string(),
                    reason: None,
                }
            };
            results.push(outcome);
            continue;
        }
        if !src.exists() {
            results.push(ApplyOutcome {
                path: rel.clone(),
                status: Some(item.status),
                result: "missing_source".to_string(),
                reason: None,
            });
            continue;
        }
        let copy = || -> std::io::Result<()> {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dest)?;
            Ok(())
        };
        match copy() {
            Ok(()) => results.push(ApplyOutcome {
                path: rel.clone(),
                status: Some(item.status),
                result: "copied".to_string(),
                reason: None,
            }),
            Err(err) => results.push(ApplyOutcome {
                path: rel.clone(),
                status: Some(item.status),
                result: "failed".to_string(),
                reason: Some(err.to_string()),
            }),
        }
    }
    results
}
