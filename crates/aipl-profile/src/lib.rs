//! Per-workspace profiles: identity, fingerprint, hard policy layering, the
//! soft-profile review lifecycle, and the SQLite mirror for external UIs.

pub mod detect;
pub mod fingerprint;
pub mod mirror;
pub mod soft;
pub mod store;

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use aipl_core::Reason;
use aipl_core::env::EngineConfig;
use aipl_core::fsio;
use aipl_core::ids::compute_workspace_id;
use aipl_core::layout;
use aipl_policy::HardPolicy;

pub use detect::{WorkspaceDetection, detect_workspace};
pub use fingerprint::compute_fingerprint;
pub use soft::propose_soft_profile;
pub use store::{ProfileRecord, ProfileStore};

/// `ensure_profile` output: the stored record plus computed policy state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsuredProfile {
    #[serde(flatten)]
    pub record: ProfileRecord,

    pub effective_hard: HardPolicy,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hard_validation_reasons: Vec<Reason>,

    pub created: bool,
    pub fingerprint_changed: bool,
}

pub struct ProfileService {
    root: PathBuf,
    config: EngineConfig,
}

impl ProfileService {
    pub fn new(root: &Path, config: EngineConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }

    fn db_path(&self) -> PathBuf {
        layout::resolve_db_path(&self.root, self.config.db_path.as_deref())
    }

    fn open_store(&self) -> Result<ProfileStore> {
        ProfileStore::open(&self.db_path())
    }

    /// Idempotently insert/update the workspace profile row, recomputing the
    /// fingerprint and sanitizing the user policy file.
    pub fn ensure_profile(&self, workspace: &Path) -> Result<EnsuredProfile> {
        let workspace_id = compute_workspace_id(Some(workspace));
        let fingerprint = compute_fingerprint(workspace);
        let system_hard = aipl_policy::build_system_hard_policy(workspace, &self.config);
        let user_raw = aipl_policy::load_user_hard_policy(workspace);
        let (user_hard, hard_reasons) = aipl_policy::sanitize_user_hard(user_raw.as_ref());
        let effective_hard = aipl_policy::merge_hard_policy(&system_hard, user_hard.as_ref());

        let store = self.open_store()?;
        let existing = store.read(&workspace_id)?;
        let created = existing.is_none();
        let fingerprint_changed = existing
            .as_ref()
            .is_some_and(|prev| prev.fingerprint.as_deref() != Some(fingerprint.as_str()));

        let mut record = existing.unwrap_or_default();
        record.workspace_id = workspace_id;
        record.workspace_path = Some(workspace.to_string_lossy().to_string());
        record.fingerprint = Some(fingerprint);
        record.user_hard = user_hard;
        record.system_hard = serde_json::to_value(&system_hard)?;
        record.updated_at = chrono::Utc::now().timestamp();
        store.upsert(&record)?;

        Ok(EnsuredProfile {
            record,
            effective_hard,
            hard_validation_reasons: hard_reasons,
            created,
            fingerprint_changed,
        })
    }

    /// Draft a soft profile from a workspace scan and park it for review.
    pub fn propose_soft(&self, workspace: &Path, reason: &str) -> Result<EnsuredProfile> {
        let mut ensured = self.ensure_profile(workspace)?;
        let draft = propose_soft_profile(workspace, ensured.record.fingerprint.as_deref());
        let store = self.open_store()?;
        ensured.record.soft_draft = Some(draft.clone());
        ensured.record.updated_at = chrono::Utc::now().timestamp();
        store.upsert(&ensured.record)?;
        store.log_review(
            &ensured.record.workspace_id,
            "propose",
            ensured.record.fingerprint.as_deref().unwrap_or(""),
            Some(&serde_json::json!({"reason": reason, "draft": draft})),
        )?;
        info!(workspace_id = %ensured.record.workspace_id, reason, "soft profile proposed");
        Ok(ensured)
    }

    /// Promote the parked draft; bumps `soft_version`.
    pub fn approve_soft(&self, workspace: &Path) -> Result<EnsuredProfile> {
        let mut ensured = self.ensure_profile(workspace)?;
        let Some(draft) = ensured.record.soft_draft.clone() else {
            return Ok(ensured);
        };
        let store = self.open_store()?;
        ensured.record.soft_approved = Some(draft.clone());
        ensured.record.soft_version += 1;
        ensured.record.updated_at = chrono::Utc::now().timestamp();
        store.upsert(&ensured.record)?;
        store.log_review(
            &ensured.record.workspace_id,
            "approve",
            ensured.record.fingerprint.as_deref().unwrap_or(""),
            Some(&serde_json::json!({
                "draft": draft,
                "soft_version": ensured.record.soft_version
            })),
        )?;
        Ok(ensured)
    }

    pub fn reject_soft(&self, workspace: &Path) -> Result<EnsuredProfile> {
        let mut ensured = self.ensure_profile(workspace)?;
        let store = self.open_store()?;
        ensured.record.soft_draft = None;
        ensured.record.updated_at = chrono::Utc::now().timestamp();
        store.upsert(&ensured.record)?;
        store.log_review(
            &ensured.record.workspace_id,
            "reject",
            ensured.record.fingerprint.as_deref().unwrap_or(""),
            Some(&serde_json::json!({"reason": "manual_reject"})),
        )?;
        Ok(ensured)
    }

    pub fn load_profile(&self, workspace: &Path) -> Result<Option<ProfileRecord>> {
        let workspace_id = compute_workspace_id(Some(workspace));
        self.open_store()?.read(&workspace_id)
    }

    /// True when the recent failed runs of this workspace repeat the same
    /// failure reason at least `threshold` times.
    pub fn should_propose_on_failure(
        &self,
        workspace: &Path,
        threshold: usize,
        limit: usize,
    ) -> bool {
        let mut run_dirs: Vec<PathBuf> = Vec::new();
        let ws_dir = layout::workspace_dir(&self.root, Some(workspace));
        let exec_root = ws_dir.join("executions");
        if let Ok(plans) = std::fs::read_dir(&exec_root) {
            for plan in plans.flatten() {
                if let Ok(runs) = std::fs::read_dir(plan.path().join("runs")) {
                    run_dirs.extend(runs.flatten().map(|e| e.path()).filter(|p| p.is_dir()));
                }
            }
        }
        run_dirs.sort_by_key(|path| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
        });
        run_dirs.reverse();

        let mut reason_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        let mut checked = 0;
        for run_dir in run_dirs {
            if checked >= limit {
                break;
            }
            let verification: Value =
                fsio::read_json_or(&run_dir.join("verification_result.json"), Value::Null);
            if verification.is_null() {
                continue;
            }
            if verification.get("passed").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            for reason in verification
                .get("reasons")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[])
            {
                if let Some(kind) = reason.get("type").and_then(Value::as_str) {
                    *reason_counts.entry(kind.to_string()).or_default() += 1;
                }
            }
            checked += 1;
        }
        reason_counts.values().any(|count| *count >= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aipl_core::fsio::write_json;
    use serde_json::json;

    fn service(tmp: &tempfile::TempDir) -> ProfileService {
        let mut config = EngineConfig::default();
        config.db_path = Some(tmp.path().join("aipl.db"));
        ProfileService::new(tmp.path(), config)
    }

    #[test]
    fn test_ensure_profile_created_then_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        let svc = service(&tmp);

        let first = svc.ensure_profile(&ws).unwrap();
        assert!(first.created);
        assert!(!first.fingerprint_changed);
        assert_eq!(first.record.workspace_id.len(), 16);

        let second = svc.ensure_profile(&ws).unwrap();
        assert!(!second.created);
        assert!(!second.fingerprint_changed);
        assert_eq!(second.record.fingerprint, first.record.fingerprint);
    }

    #[test]
    fn test_ensure_profile_detects_fingerprint_change() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        let svc = service(&tmp);

        svc.ensure_profile(&ws).unwrap();
        std::fs::write(ws.join("Cargo.toml"), "[package]\nname = \"x\"\n").unwrap();
        let ensured = svc.ensure_profile(&ws).unwrap();
        assert!(ensured.fingerprint_changed);
    }

    #[test]
    fn test_user_policy_overrides_effective_hard() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(
            ws.join("aipl.policy.json"),
            r#"{"allowed_commands": ["cargo"], "command_timeout": 42, "max_concurrency": 0}"#,
        )
        .unwrap();
        let svc = service(&tmp);
        let ensured = svc.ensure_profile(&ws).unwrap();
        assert_eq!(ensured.effective_hard.allowed_commands, vec!["cargo"]);
        assert_eq!(ensured.effective_hard.command_timeout, 42);
        // invalid max_concurrency rejected with a reason, default kept
        assert_eq!(ensured.effective_hard.max_concurrency, 2);
        assert_eq!(ensured.hard_validation_reasons.len(), 1);
        assert_eq!(ensured.hard_validation_reasons[0].kind, "invalid_hard_value");
    }

    #[test]
    fn test_soft_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        let svc = service(&tmp);

        let proposed = svc.propose_soft(&ws, "new_workspace").unwrap();
        assert!(proposed.record.soft_draft.is_some());
        assert_eq!(proposed.record.soft_version, 0);

        let approved = svc.approve_soft(&ws).unwrap();
        assert!(approved.record.soft_approved.is_some());
        assert_eq!(approved.record.soft_version, 1);

        svc.propose_soft(&ws, "fingerprint_changed").unwrap();
        let rejected = svc.reject_soft(&ws).unwrap();
        assert!(rejected.record.soft_draft.is_none());
        // approved draft survives a reject of the next draft
        assert!(rejected.record.soft_approved.is_some());
    }

    #[test]
    fn test_approve_without_draft_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        let svc = service(&tmp);
        let ensured = svc.approve_soft(&ws).unwrap();
        assert!(ensured.record.soft_approved.is_none());
        assert_eq!(ensured.record.soft_version, 0);
    }

    #[test]
    fn test_should_propose_on_failure_counts_repeated_reasons() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        let svc = service(&tmp);

        for run in ["run-1", "run-2"] {
            let run_dir = layout::run_dir(tmp.path(), Some(&ws), "plan-1", run);
            write_json(
                &run_dir.join("verification_result.json"),
                &json!({"passed": false, "reasons": [{"type": "command_failed"}]}),
            )
            .unwrap();
        }
        assert!(svc.should_propose_on_failure(&ws, 2, 20));
        assert!(!svc.should_propose_on_failure(&ws, 3, 20));
    }

    #[test]
    fn test_should_propose_ignores_passed_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        let svc = service(&tmp);
        let run_dir = layout::run_dir(tmp.path(), Some(&ws), "plan-1", "run-1");
        write_json(
            &run_dir.join("verification_result.json"),
            &json!({"passed": true, "reasons": []}),
        )
        .unwrap();
        assert!(!svc.should_propose_on_failure(&ws, 1, 20));
    }
}
