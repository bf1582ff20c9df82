//! Workspace scanning and per-language import extraction.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::graph::JS_TS_EXTS;

pub const MAX_FILE_BYTES: u64 = 512 * 1024;

pub const EXCLUDE_DIRS: [&str; 11] = [
    ".git",
    ".idea",
    ".vscode",
    ".venv",
    "__pycache__",
    "artifacts",
    "build",
    "dist",
    "node_modules",
    "outputs",
    "target",
];

/// Parsed, unresolved import information for one source file. Resolution
/// happens later against the full file set, so this is what the cache keeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "lang", rename_all = "snake_case")]
pub enum FileMeta {
    Python { imports: Vec<PyImport> },
    Java { package: String, imports: Vec<String> },
    Js { specs: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PyImport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Leading-dot count of a relative import; 0 for absolute.
    #[serde(default)]
    pub level: u32,

    #[serde(default)]
    pub names: Vec<String>,
}

impl FileMeta {
    pub fn lang(&self) -> &'static str {
        match self {
            FileMeta::Python { .. } => "python",
            FileMeta::Java { .. } => "java",
            FileMeta::Js { .. } => "js",
        }
    }
}

pub fn lang_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy();
    match ext.as_ref() {
        "py" => Some("python"),
        "java" => Some("java"),
        "ts" | "tsx" | "js" | "jsx" => Some("js"),
        _ => None,
    }
}

/// Walk the workspace for source files, honoring the exclusion list and the
/// file-size cap. Returns workspace-relative forward-slash paths.
pub fn scan_source_files(workspace_root: &Path) -> Vec<PathBuf> {
    let walker = ignore::WalkBuilder::new(workspace_root)
        .standard_filters(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_some_and(|t| t.is_dir())
                && EXCLUDE_DIRS.contains(&name.as_ref()))
        })
        .build();
    let mut files = Vec::new();
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.path();
        if lang_for_path(path).is_none() {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(workspace_root) {
            files.push(rel.to_path_buf());
        }
    }
    files.sort();
    files
}

/// Parse a source file into its unresolved import meta.
pub fn parse_file_meta(lang: &str, text: &str) -> FileMeta {
    match lang {
        "python" => FileMeta::Python {
            imports: parse_python_imports(text),
        },
        "java" => FileMeta::Java {
            package: parse_java_package(text),
            imports: parse_java_imports(text),
        },
        _ => FileMeta::Js {
            specs: parse_js_imports(text),
        },
    }
}

fn py_from_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^from\s+(\.*)([A-Za-z0-9_.]*)\s+import\s+(.+)$").expect("static regex")
    })
}

fn py_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^import\s+([A-Za-z0-9_.]+)").expect("static regex"))
}

pub fn parse_python_imports(text: &str) -> Vec<PyImport> {
    let mut imports = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(caps) = py_from_re().captures(line) {
            let level = caps[1].len() as u32;
            let module = if caps[2].is_empty() {
                None
            } else {
                Some(caps[2].to_string())
            };
            let names: Vec<String> = caps[3]
                .split(',')
                .map(|name| {
                    name.trim()
                        .split(" as ")
                        .next()
                        .unwrap_or("")
                        .trim()
                        .to_string()
                })
                .filter(|name| !name.is_empty() && name != "*")
                .collect();
            imports.push(PyImport {
                module,
                level,
                names,
            });
        } else if let Some(caps) = py_import_re().captures(line) {
            let module = caps[1].split(" as ").next().unwrap_or("").trim();
            imports.push(PyImport {
                module: Some(module.to_string()),
                level: 0,
                names: Vec::new(),
            });
        }
    }
    imports
}

pub fn parse_java_package(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^package\s+([A-Za-z0-9_.]+)\s*;").expect("static regex"));
    for line in text.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            return caps[1].to_string();
        }
    }
    String::new()
}

pub fn parse_java_imports(text: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^import\s+(?:static\s+)?([A-Za-z0-9_.*]+)\s*;").expect("static regex")
    });
    text.lines()
        .filter_map(|line| re.captures(line.trim()))
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn parse_js_imports(text: &str) -> Vec<String> {
    static FROM_RE: OnceLock<Regex> = OnceLock::new();
    static REQUIRE_RE: OnceLock<Regex> = OnceLock::new();
    let from_re =
        FROM_RE.get_or_init(|| Regex::new(r#"from\s+['"]([^'"]+)['"]"#).expect("static regex"));
    let require_re = REQUIRE_RE
        .get_or_init(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("static regex"));
    let mut specs: Vec<String> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for caps in from_re.captures_iter(text).chain(require_re.captures_iter(text)) {
        let spec = caps[1].to_string();
        if seen.insert(spec.clone()) {
            specs.push(spec);
        }
    }
    specs
}

fn python_search_roots(workspace_root: &Path) -> Vec<PathBuf> {
    let mut roots = vec![workspace_root.to_path_buf()];
    let src = workspace_root.join("src");
    if src.exists() {
        roots.push(src);
    }
    roots
}

fn expand_python_candidates(base: &Path) -> Vec<PathBuf> {
    if base.extension().is_some_and(|ext| ext == "py") {
        vec![base.to_path_buf()]
    } else {
        vec![base.with_extension("py"), base.join("__init__.py")]
    }
}

fn to_rel(workspace_root: &Path, candidate: &Path) -> Option<String> {
    if !candidate.is_file() {
        return None;
    }
    let rel = candidate.strip_prefix(workspace_root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

/// Resolve one Python import from `rel_path` to workspace-relative files.
pub fn resolve_python_import(
    workspace_root: &Path,
    rel_path: &str,
    import: &PyImport,
) -> Vec<String> {
    let rel_dir = Path::new(rel_path).parent().unwrap_or(Path::new(""));
    let mut candidates: Vec<PathBuf> = Vec::new();

    if import.level > 0 {
        let mut base = workspace_root.join(rel_dir);
        for _ in 0..import.level {
            base = base.parent().map(Path::to_path_buf).unwrap_or(base);
        }
        if let Some(module) = &import.module {
            base = base.join(module.replace('.', "/"));
        }
        candidates.extend(expand_python_candidates(&base));
        if import.module.is_none() {
            for name in &import.names {
                candidates.extend(expand_python_candidates(&base.join(name)));
            }
        }
    } else if let Some(module) = &import.module {
        let mod_path = module.replace('.', "/");
        for root in python_search_roots(workspace_root) {
            candidates.extend(expand_python_candidates(&root.join(&mod_path)));
            for name in &import.names {
                candidates.extend(expand_python_candidates(&root.join(&mod_path).join(name)));
            }
        }
    }

    let mut resolved = Vec::new();
    let mut seen = BTreeSet::new();
    for candidate in candidates {
        if let Some(rel) = to_rel(workspace_root, &candidate) {
            if seen.insert(rel.clone()) {
                resolved.push(rel);
            }
        }
    }
    resolved
}

/// Resolve one JS/TS import spec. Only relative (`./`, `../`) and
/// root-anchored (`/src/...`) specs resolve; bare package names are external.
pub fn resolve_js_import(workspace_root: &Path, rel_path: &str, spec: &str) -> Vec<String> {
    let spec = spec.trim();
    if spec.is_empty() || !(spec.starts_with('.') || spec.starts_with('/')) {
        return Vec::new();
    }
    let base = if let Some(anchored) = spec.strip_prefix('/') {
        workspace_root.join(anchored)
    } else {
        let joined = workspace_root
            .join(Path::new(rel_path).parent().unwrap_or(Path::new("")))
            .join(spec);
        normalize_dots(&joined)
    };

    let mut candidates: Vec<PathBuf> = Vec::new();
    if base.extension().is_some() {
        candidates.push(base.clone());
    } else {
        for ext in JS_TS_EXTS.iter().chain([".d.ts"].iter()) {
            let mut with_ext = base.as_os_str().to_owned();
            with_ext.push(ext);
            candidates.push(PathBuf::from(with_ext));
            candidates.push(base.join(format!("index{ext}")));
        }
    }

    let mut resolved = Vec::new();
    let mut seen = BTreeSet::new();
    for candidate in candidates {
        if let Some(rel) = to_rel(workspace_root, &candidate) {
            if seen.insert(rel.clone()) {
                resolved.push(rel);
            }
        }
    }
    resolved
}

/// Collapse `.` and `..` segments lexically (no symlink resolution).
fn normalize_dots(path: &Path) -> PathBuf {
    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    let mut prefix = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::Normal(seg) => parts.push(seg.to_owned()),
            std::path::Component::ParentDir => {
                parts.pop();
            }
            std::path::Component::CurDir => {}
            other => prefix.push(other.as_os_str()),
        }
    }
    for part in parts {
        prefix.push(part);
    }
    prefix
}
