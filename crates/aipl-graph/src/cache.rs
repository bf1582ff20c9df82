//! Stat-based (mtime+size) parse cache for the code graph, keyed by
//! workspace fingerprint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::scan::FileMeta;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedEntry {
    pub mtime_ms: i64,
    pub size: u64,
    pub meta: FileMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default)]
    pub files: BTreeMap<String, CachedEntry>,

    #[serde(default)]
    pub updated_at: f64,
}

impl GraphCache {
    pub fn load(path: &Path) -> Self {
        aipl_core::fsio::read_json_or(path, GraphCache::default())
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        aipl_core::fsio::write_json(path, self)
    }

    /// A cached parse is reusable when mtime and size both match.
    pub fn lookup(&self, rel_path: &str, mtime_ms: i64, size: u64) -> Option<&FileMeta> {
        let entry = self.files.get(rel_path)?;
        (entry.mtime_ms == mtime_ms && entry.size == size).then_some(&entry.meta)
    }

    pub fn insert(&mut self, rel_path: String, mtime_ms: i64, size: u64, meta: FileMeta) {
        self.files.insert(rel_path, CachedEntry { mtime_ms, size, meta });
    }

    /// Drop entries for files no longer present in the scan.
    pub fn retain_paths(&mut self, live: &std::collections::BTreeSet<String>) {
        self.files.retain(|path, _| live.contains(path));
    }
}

/// Cache file location: `<cache_root>/artifacts/code-graph-cache-<fp16>.json`.
pub fn cache_path(cache_root: &Path, fingerprint: Option<&str>) -> PathBuf {
    let tag = fingerprint
        .map(|fp| fp.chars().take(16).collect::<String>())
        .unwrap_or_else(|| "nofp".to_string());
    cache_root
        .join("artifacts")
        .join(format!("code-graph-cache-{tag}.json"))
}

/// File mtime in milliseconds; 0 when unavailable.
pub fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::PyImport;
    use std::collections::BTreeSet;

    fn meta() -> FileMeta {
        FileMeta::Python {
            imports: vec![PyImport {
                module: Some("os".into()),
                level: 0,
                names: vec![],
            }],
        }
    }

    #[test]
    fn test_lookup_requires_matching_stat() {
        let mut cache = GraphCache::default();
        cache.insert("a.py".into(), 1000, 42, meta());
        assert!(cache.lookup("a.py", 1000, 42).is_some());
        assert!(cache.lookup("a.py", 1001, 42).is_none());
        assert!(cache.lookup("a.py", 1000, 43).is_none());
        assert!(cache.lookup("b.py", 1000, 42).is_none());
    }

    #[test]
    fn test_retain_paths_drops_dead_entries() {
        let mut cache = GraphCache::default();
        cache.insert("a.py".into(), 1, 1, meta());
        cache.insert("b.py".into(), 1, 1, meta());
        let live: BTreeSet<String> = ["a.py".to_string()].into();
        cache.retain_paths(&live);
        assert!(cache.files.contains_key("a.py"));
        assert!(!cache.files.contains_key("b.py"));
    }

    #[test]
    fn test_cache_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cache = GraphCache {
            fingerprint: Some("abc".into()),
            ..Default::default()
        };
        cache.insert("a.py".into(), 5, 6, meta());
        let path = cache_path(tmp.path(), Some("abcdef0123456789deadbeef"));
        cache.save(&path).unwrap();
        assert!(path
            .to_string_lossy()
            .ends_with("artifacts/code-graph-cache-abcdef0123456789.json"));
        let loaded = GraphCache::load(&path);
        assert_eq!(loaded.files, cache.files);
    }

    #[test]
    fn test_cache_path_without_fingerprint() {
        let path = cache_path(Path::new("/root"), None);
        assert!(path.to_string_lossy().ends_with("code-graph-cache-nofp.json"));
    }
}
