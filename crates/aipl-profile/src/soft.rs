//! Soft profile drafts: learned, human-reviewable workspace guidance.
//! Drafts are proposed automatically and only take effect once approved.

use std::path::Path;

use serde_json::{Value, json};

use crate::detect::detect_workspace;

const SCAN_DEPTH: usize = 3;
const MAX_FILE_KB: usize = 64;

const README_NAMES: [&str; 3] = ["readme", "readme.md", "readme.txt"];
const TEST_ENTRY_FILES: [&str; 7] = [
    "pytest.ini",
    "tox.ini",
    "setup.cfg",
    "package.json",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
];

fn walk_limited(root: &Path, max_depth: usize) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];
    while let Some((dir, depth)) = stack.pop() {
        if depth >= max_depth {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push((path, depth + 1));
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn limited_read(path: &Path, max_kb: usize) -> String {
    let Ok(text) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let limit = max_kb * 1024;
    if text.len() <= limit {
        text
    } else {
        let mut end = limit;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

fn collect_conventions(root: &Path) -> Vec<String> {
    let mut conventions = Vec::new();
    for name in ["src", "tests", "test", "docs", "scripts", "configs"] {
        if root.join(name).exists() {
            conventions.push(format!("dir:{name}"));
        }
    }
    for name in [
        "pyproject.toml",
        "package.json",
        "pom.xml",
        "build.gradle",
        "build.gradle.kts",
    ] {
        if root.join(name).exists() {
            conventions.push(format!("config:{name}"));
        }
    }
    conventions
}

/// Build a soft-profile draft from a bounded workspace scan.
pub fn propose_soft_profile(workspace: &Path, fingerprint: Option<&str>) -> Value {
    let detection = detect_workspace(workspace);
    let build_and_test: Vec<String> = detection
        .capabilities
        .commands
        .iter()
        .filter(|c| c.kind == "test" || c.kind == "build")
        .map(|c| c.cmd.clone())
        .collect();

    let files = walk_limited(workspace, SCAN_DEPTH);
    let readme_summary: Vec<String> = files
        .iter()
        .find(|path| {
            path.file_name()
                .map(|name| README_NAMES.contains(&name.to_string_lossy().to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|path| {
            limited_read(path, MAX_FILE_KB)
                .lines()
                .take(10)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let test_entry_files: Vec<String> = files
        .iter()
        .filter(|path| {
            path.file_name()
                .map(|name| TEST_ENTRY_FILES.contains(&name.to_string_lossy().as_ref()))
                .unwrap_or(false)
        })
        .filter_map(|path| path.strip_prefix(workspace).ok())
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .collect();

    json!({
        "project_type": detection.project_type,
        "build_and_test": build_and_test,
        "code_style_hints": [
            "prefer small diffs",
            "keep public APIs stable",
            "avoid large refactors unless asked",
        ],
        "conventions": collect_conventions(workspace),
        "checks_templates": detection.checks,
        "path_rules": [
            "checks.path must be relative to workspace or outputs/",
            "no drive letters, no colon, no .. segments",
            "allowed chars: A-Z a-z 0-9 . _ / -",
            "no braces, quotes, or template tokens",
        ],
        "scan_limits": {"max_depth": SCAN_DEPTH, "max_file_kb": MAX_FILE_KB},
        "readme_summary": readme_summary,
        "test_entry_files": test_entry_files,
        "fingerprint": fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_for_python_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pyproject.toml"), "[tool.pytest]\n").unwrap();
        std::fs::write(tmp.path().join("README.md"), "# My Project\nA thing.\n").unwrap();
        let draft = propose_soft_profile(tmp.path(), Some("fp123"));
        assert_eq!(draft["project_type"], "python");
        assert_eq!(draft["fingerprint"], "fp123");
        assert_eq!(draft["readme_summary"][0], "# My Project");
        assert!(draft["test_entry_files"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "pyproject.toml"));
    }

    #[test]
    fn test_draft_for_empty_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let draft = propose_soft_profile(tmp.path(), None);
        assert_eq!(draft["project_type"], "unknown");
        assert_eq!(draft["readme_summary"], serde_json::json!([]));
        assert!(draft["fingerprint"].is_null());
    }

    #[test]
    fn test_scan_respects_depth_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("a").join("b").join("c").join("d");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("pytest.ini"), "").unwrap();
        let draft = propose_soft_profile(tmp.path(), None);
        // four levels down is beyond SCAN_DEPTH
        assert!(draft["test_entry_files"].as_array().unwrap().is_empty());
    }
}
