//! Run policy assembly: effective hard policy + detected checks, persisted
//! as the run's `policy.json` and `capabilities.json`.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use aipl_profile::{EnsuredProfile, ProfileService, detect_workspace};

/// The policy a run executes under; written verbatim to `policy.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPolicy {
    #[serde(default)]
    pub allow_write: Vec<String>,

    #[serde(default)]
    pub deny_write: Vec<String>,

    #[serde(default)]
    pub allowed_commands: Vec<String>,

    #[serde(default)]
    pub command_timeout: u64,

    #[serde(default)]
    pub max_concurrency: u32,

    #[serde(default)]
    pub checks: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

pub struct LoadedPolicy {
    pub policy: RunPolicy,
    pub source: String,
    pub profile: Option<EnsuredProfile>,
    pub capabilities: Option<Value>,
}

/// Build the run policy for a workspace: ensure the profile (proposing a
/// soft draft on first sight or fingerprint change), merge the hard policy,
/// and attach workspace-detected fallback checks.
pub fn load_policy(
    profile_service: &ProfileService,
    workspace: Option<&Path>,
) -> Result<LoadedPolicy> {
    let Some(workspace) = workspace else {
        return Ok(LoadedPolicy {
            policy: RunPolicy::default(),
            source: "none".to_string(),
            profile: None,
            capabilities: None,
        });
    };
    let mut profile = profile_service.ensure_profile(workspace)?;
    if profile.created {
        profile = profile_service.propose_soft(workspace, "new_workspace")?;
    } else if profile.fingerprint_changed {
        profile = profile_service.propose_soft(workspace, "fingerprint_changed")?;
    }
    let detection = detect_workspace(workspace);
    let effective = &profile.effective_hard;
    let policy = RunPolicy {
        allow_write: effective.allow_write.clone(),
        deny_write: effective.deny_write.clone(),
        allowed_commands: effective.allowed_commands.clone(),
        command_timeout: effective.command_timeout,
        max_concurrency: effective.max_concurrency,
        checks: detection.checks.clone(),
        workspace_id: Some(profile.record.workspace_id.clone()),
        fingerprint: profile.record.fingerprint.clone(),
    };
    info!(
        workspace_id = %profile.record.workspace_id,
        fingerprint = profile.record.fingerprint.as_deref().unwrap_or(""),
        "policy loaded from profile"
    );
    Ok(LoadedPolicy {
        policy,
        source: "profile".to_string(),
        capabilities: Some(serde_json::json!({
            "workspace": workspace.to_string_lossy(),
            "capabilities": detection.capabilities,
        })),
        profile: Some(profile),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aipl_core::env::EngineConfig;

    fn service(tmp: &tempfile::TempDir) -> ProfileService {
        let mut config = EngineConfig::default();
        config.db_path = Some(tmp.path().join("aipl.db"));
        ProfileService::new(tmp.path(), config)
    }

    #[test]
    fn test_no_workspace_yields_empty_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = load_policy(&service(&tmp), None).unwrap();
        assert_eq!(loaded.source, "none");
        assert!(loaded.profile.is_none());
        assert!(loaded.policy.allowed_commands.is_empty());
    }

    #[test]
    fn test_policy_from_python_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("project");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("requirements.txt"), "pytest\n").unwrap();
        std::fs::write(ws.join("pytest.ini"), "[pytest]\n").unwrap();

        let loaded = load_policy(&service(&tmp), Some(&ws)).unwrap();
        assert_eq!(loaded.source, "profile");
        assert_eq!(loaded.policy.command_timeout, 300);
        assert_eq!(loaded.policy.checks.len(), 1);
        assert_eq!(loaded.policy.checks[0]["cmd"], "python -m pytest -q");
        // new workspace proposes a soft draft
        let profile = loaded.profile.unwrap();
        assert!(profile.record.soft_draft.is_some());
        assert_eq!(loaded.capabilities.unwrap()["capabilities"]["project_type"], "python");
    }
}
