//! Workspace fingerprint over build-manifest files. A changed fingerprint
//! signals that re-learning is warranted.

use std::path::{Path, PathBuf};

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

const FINGERPRINT_FILES: [&str; 8] = [
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "package.json",
    "pyproject.toml",
    "requirements.txt",
    "go.mod",
    "Cargo.toml",
];
const FINGERPRINT_GLOBS: [&str; 1] = ["*.sln"];

/// Sentinel hashed when no manifest file exists.
const EMPTY_SENTINEL: &[u8] = b"no_key_files";

fn collect_fingerprint_files(workspace: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = FINGERPRINT_FILES
        .iter()
        .map(|name| workspace.join(name))
        .filter(|path| path.is_file())
        .collect();
    for pattern in FINGERPRINT_GLOBS {
        let full = workspace.join(pattern);
        if let Ok(matches) = glob::glob(&full.to_string_lossy()) {
            files.extend(matches.flatten().filter(|path| path.is_file()));
        }
    }
    files.sort();
    files.dedup();
    files
}

/// SHA-256 over `(relative_path || file_bytes)` of every present manifest
/// file, in sorted order.
pub fn compute_fingerprint(workspace: &Path) -> String {
    let files = collect_fingerprint_files(workspace);
    let mut hasher = Sha256::new();
    for path in &files {
        let rel = path
            .strip_prefix(workspace)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        hasher.update(rel.as_bytes());
        match std::fs::read(path) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(b"<unreadable>"),
        }
    }
    if files.is_empty() {
        hasher.update(EMPTY_SENTINEL);
    }
    HEXLOWER.encode(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_workspace_uses_sentinel() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_eq!(compute_fingerprint(a.path()), compute_fingerprint(b.path()));
    }

    #[test]
    fn test_fingerprint_changes_with_manifest_content() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("package.json"), "{}").unwrap();
        let first = compute_fingerprint(tmp.path());
        std::fs::write(tmp.path().join("package.json"), r#"{"name":"x"}"#).unwrap();
        let second = compute_fingerprint(tmp.path());
        assert_ne!(first, second);
    }

    #[test]
    fn test_fingerprint_covers_sln_glob() {
        let tmp = tempfile::tempdir().unwrap();
        let base = compute_fingerprint(tmp.path());
        std::fs::write(tmp.path().join("app.sln"), "solution").unwrap();
        assert_ne!(base, compute_fingerprint(tmp.path()));
    }

    #[test]
    fn test_fingerprint_ignores_non_manifest_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Cargo.toml"), "[package]").unwrap();
        let with_manifest = compute_fingerprint(tmp.path());
        std::fs::write(tmp.path().join("main.rs"), "fn main() {}").unwrap();
        assert_eq!(with_manifest, compute_fingerprint(tmp.path()));
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let tmp = tempfile::tempdir().unwrap();
        let fp = compute_fingerprint(tmp.path());
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
