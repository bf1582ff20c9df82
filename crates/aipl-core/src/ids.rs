//! Identifier derivation: workspace ids, run/plan ids, trace ids.

use std::path::Path;

use chrono::Local;
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

/// Workspace id for a missing/unset workspace.
pub const DEFAULT_WORKSPACE_ID: &str = "_default";

/// Normalize a workspace path for identity hashing: resolved, forward
/// slashes, and on Windows case-folded with any `\\?\` prefix stripped so the
/// id stays stable across processes.
pub fn normalize_workspace_path(workspace: &Path) -> String {
    let resolved = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let mut raw = resolved.to_string_lossy().to_string();
    if cfg!(windows) {
        for prefix in ["\\\\?\\", "//?/"] {
            if let Some(stripped) = raw.strip_prefix(prefix) {
                raw = stripped.to_string();
                break;
            }
        }
        raw = raw.to_lowercase();
    }
    raw.replace('\\', "/").trim().to_string()
}

/// Stable 16-hex-prefix SHA-256 identity of a workspace path.
pub fn compute_workspace_id(workspace: Option<&Path>) -> String {
    let Some(workspace) = workspace else {
        return DEFAULT_WORKSPACE_ID.to_string();
    };
    let normalized = normalize_workspace_path(workspace);
    if normalized.is_empty() {
        return DEFAULT_WORKSPACE_ID.to_string();
    }
    let digest = Sha256::digest(normalized.as_bytes());
    HEXLOWER.encode(&digest)[..16].to_string()
}

pub fn new_run_id() -> String {
    Local::now().format("run-%Y%m%d-%H%M%S").to_string()
}

pub fn new_plan_id() -> String {
    Local::now().format("plan-%Y%m%d-%H%M%S").to_string()
}

/// Envelope trace id: `trc_` + 12 hex chars.
pub fn new_trace_id() -> String {
    let ulid = ulid::Ulid::new();
    let digest = Sha256::digest(ulid.to_string().as_bytes());
    format!("trc_{}", &HEXLOWER.encode(&digest)[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_workspace_id_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let a = compute_workspace_id(Some(tmp.path()));
        let b = compute_workspace_id(Some(tmp.path()));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_workspace_id_default_for_none() {
        assert_eq!(compute_workspace_id(None), DEFAULT_WORKSPACE_ID);
    }

    #[test]
    fn test_workspace_id_differs_per_path() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_ne!(
            compute_workspace_id(Some(a.path())),
            compute_workspace_id(Some(b.path()))
        );
    }

    #[test]
    fn test_normalize_uses_forward_slashes() {
        let normalized = normalize_workspace_path(&PathBuf::from("/tmp/does-not-exist-xyz"));
        assert!(!normalized.contains('\\'));
    }

    #[test]
    fn test_run_and_plan_id_format() {
        let run = new_run_id();
        assert!(run.starts_with("run-"));
        assert_eq!(run.len(), "run-20250101-120000".len());
        let plan = new_plan_id();
        assert!(plan.starts_with("plan-"));
    }

    #[test]
    fn test_trace_id_format() {
        let trace = new_trace_id();
        assert!(trace.starts_with("trc_"));
        assert_eq!(trace.len(), 16);
        assert!(trace[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(trace, new_trace_id());
    }
}
