//! Chain mode: dependent tasks in one batch see earlier work without
//! touching main. Each stage inherits from the snapshot of the previous
//! successful run; the first inherits from the main workspace.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::copy_tree;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainMeta {
    pub batch_id: String,
    pub main_root: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_completed_run: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_snapshot: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_run: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub updated_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InheritSource {
    pub source: String,
    pub snapshot_path: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherited_from_run: Option<String>,
}

pub struct ChainManager {
    chains_dir: PathBuf,
}

impl ChainManager {
    pub fn new(root: &Path) -> Self {
        Self {
            chains_dir: root.join("artifacts").join("chains"),
        }
    }

    fn chain_dir(&self, batch_id: &str) -> PathBuf {
        self.chains_dir.join(batch_id)
    }

    fn meta_path(&self, batch_id: &str) -> PathBuf {
        self.chain_dir(batch_id).join("meta.json")
    }

    /// Initialize a chain from the main workspace, recording the initial
    /// snapshot every later stage can fall back to.
    pub fn create_chain(&self, batch_id: &str, main_root: &Path) -> Result<ChainMeta> {
        let chain_dir = self.chain_dir(batch_id);
        let initial = chain_dir.join("snapshots").join("initial");
        if initial.exists() {
            std::fs::remove_dir_all(&initial)?;
        }
        copy_tree(main_root, &initial)?;
        let meta = ChainMeta {
            batch_id: batch_id.to_string(),
            main_root: main_root.to_string_lossy().to_string(),
            latest_completed_run: None,
            latest_snapshot: Some(initial.to_string_lossy().to_string()),
            last_failed_run: None,
            last_error: None,
            updated_at: aipl_core::now_ts(),
        };
        aipl_core::fsio::write_json(&self.meta_path(batch_id), &meta)?;
        Ok(meta)
    }

    pub fn ensure_chain(&self, batch_id: &str, main_root: &Path) -> Result<ChainMeta> {
        let existing: ChainMeta =
            aipl_core::fsio::read_json_or(&self.meta_path(batch_id), ChainMeta::default());
        if !existing.batch_id.is_empty() {
            return Ok(existing);
        }
        self.create_chain(batch_id, main_root)
    }

    pub fn inherit_source(&self, batch_id: &str) -> Option<InheritSource> {
        let meta: ChainMeta =
            aipl_core::fsio::read_json_or(&self.meta_path(batch_id), ChainMeta::default());
        let snapshot = meta.latest_snapshot?;
        Some(InheritSource {
            source: meta
                .latest_completed_run
                .as_ref()
                .map(|run| format!("run_{run}"))
                .unwrap_or_else(|| "initial".to_string()),
            snapshot_path: PathBuf::from(snapshot),
            inherited_from_run: meta.latest_completed_run,
        })
    }

    /// Materialize a stage for the next run in the batch from the latest
    /// snapshot.
    pub fn create_run_stage(&self, batch_id: &str, stage_root: &Path) -> Result<InheritSource> {
        let source = self
            .inherit_source(batch_id)
            .ok_or_else(|| anyhow::anyhow!("chain '{batch_id}' has no snapshot"))?;
        if stage_root.exists() {
            std::fs::remove_dir_all(stage_root)?;
        }
        copy_tree(&source.snapshot_path, stage_root)?;
        Ok(source)
    }

    /// Record a successful run: its stage becomes the batch's new snapshot.
    pub fn complete_run(&self, batch_id: &str, run_id: &str, stage_root: &Path) -> Result<ChainMeta> {
        let snapshot = self.chain_dir(batch_id).join("snapshots").join(run_id);
        if snapshot.exists() {
            std::fs::remove_dir_all(&snapshot)?;
        }
        copy_tree(stage_root, &snapshot)?;
        let mut meta: ChainMeta =
            aipl_core::fsio::read_json_or(&self.meta_path(batch_id), ChainMeta::default());
        meta.latest_completed_run = Some(run_id.to_string());
        meta.latest_snapshot = Some(snapshot.to_string_lossy().to_string());
        meta.updated_at = aipl_core::now_ts();
        aipl_core::fsio::write_json(&self.meta_path(batch_id), &meta)?;
        Ok(meta)
    }

    pub fn fail_run(&self, batch_id: &str, run_id: &str, error: &str) -> Result<ChainMeta> {
        let mut meta: ChainMeta =
            aipl_core::fsio::read_json_or(&self.meta_path(batch_id), ChainMeta::default());
        meta.last_failed_run = Some(run_id.to_string());
        meta.last_error = Some(error.to_string());
        meta.updated_at = aipl_core::now_ts();
        aipl_core::fsio::write_json(&self.meta_path(batch_id), &meta)?;
        Ok(meta)
    }
}
