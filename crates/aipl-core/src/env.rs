//! Environment configuration (`AIPL_*` knobs), read once per process.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyMode {
    #[default]
    Enforce,
    ReportOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoChecksBehavior {
    #[default]
    Fail,
    Warn,
    Skip,
}

/// Snapshot of every environment knob the engine honors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stale_seconds: u64,
    pub stale_auto_reset: bool,
    pub allowed_commands: Vec<String>,
    pub deny_commands: Vec<String>,
    pub command_timeout: u64,
    pub deny_write: Vec<String>,
    pub max_concurrency: u32,
    pub policy_mode: PolicyMode,
    pub no_checks_behavior: NoChecksBehavior,
    pub require_execution: bool,
    pub allow_skip_tests: bool,
    pub allow_shell_commands: bool,
    pub max_output_bytes: usize,
    pub http_timeout: u64,
    pub http_retries: u32,
    pub http_soft_fail: bool,
    pub code_graph_cache: bool,
    pub code_graph_watch: bool,
    pub code_graph_cache_root: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub default_workspace: Option<PathBuf>,
    pub disable_tests: bool,
    pub allow_tests: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_seconds: 3600,
            stale_auto_reset: false,
            allowed_commands: default_allowed_commands(),
            deny_commands: Vec::new(),
            command_timeout: 300,
            deny_write: default_deny_write(),
            max_concurrency: 2,
            policy_mode: PolicyMode::Enforce,
            no_checks_behavior: NoChecksBehavior::Fail,
            require_execution: true,
            allow_skip_tests: false,
            allow_shell_commands: true,
            max_output_bytes: 10 * 1024 * 1024,
            http_timeout: 30,
            http_retries: 3,
            http_soft_fail: false,
            code_graph_cache: true,
            code_graph_watch: false,
            code_graph_cache_root: None,
            db_path: None,
            default_workspace: None,
            disable_tests: false,
            allow_tests: false,
        }
    }
}

pub fn default_allowed_commands() -> Vec<String> {
    ["python", "pytest", "mvn", "gradle", "npm", "node", "pnpm", "yarn"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn default_deny_write() -> Vec<String> {
    [
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        ".venv",
        "__pycache__",
        "artifacts",
        "runs",
        "outputs",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => default,
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|raw| !raw.trim().is_empty()).map(PathBuf::from)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stale_seconds: env_u64("AIPL_STALE_SECONDS", defaults.stale_seconds),
            stale_auto_reset: env_bool("AIPL_STALE_AUTO_RESET", defaults.stale_auto_reset),
            allowed_commands: env_list("AIPL_ALLOWED_COMMANDS", defaults.allowed_commands),
            deny_commands: env_list("AIPL_DENY_COMMANDS", defaults.deny_commands),
            command_timeout: env_u64("AIPL_COMMAND_TIMEOUT", defaults.command_timeout),
            deny_write: env_list("AIPL_DENY_WRITE", defaults.deny_write),
            max_concurrency: env_u64("AIPL_MAX_CONCURRENCY", defaults.max_concurrency as u64)
                as u32,
            policy_mode: match std::env::var("AIPL_POLICY_MODE").as_deref() {
                Ok("report-only") => PolicyMode::ReportOnly,
                _ => PolicyMode::Enforce,
            },
            no_checks_behavior: match std::env::var("AIPL_NO_CHECKS_BEHAVIOR")
                .map(|raw| raw.to_lowercase())
                .as_deref()
            {
                Ok("warn") => NoChecksBehavior::Warn,
                Ok("skip") => NoChecksBehavior::Skip,
                _ => NoChecksBehavior::Fail,
            },
            require_execution: env_bool("AIPL_REQUIRE_EXECUTION", defaults.require_execution),
            allow_skip_tests: env_bool("AIPL_ALLOW_SKIP_TESTS", defaults.allow_skip_tests),
            allow_shell_commands: env_bool(
                "AIPL_ALLOW_SHELL_COMMANDS",
                defaults.allow_shell_commands,
            ),
            max_output_bytes: env_usize("AIPL_MAX_OUTPUT_BYTES", defaults.max_output_bytes),
            http_timeout: env_u64("AIPL_HTTP_TIMEOUT", defaults.http_timeout),
            http_retries: env_u64("AIPL_HTTP_RETRIES", defaults.http_retries as u64) as u32,
            http_soft_fail: env_bool("AIPL_HTTP_SOFT_FAIL", defaults.http_soft_fail),
            code_graph_cache: env_bool("AIPL_CODE_GRAPH_CACHE", defaults.code_graph_cache),
            code_graph_watch: env_bool("AIPL_CODE_GRAPH_WATCH", defaults.code_graph_watch),
            code_graph_cache_root: env_path("AIPL_CODE_GRAPH_CACHE_ROOT"),
            db_path: env_path("AIPL_DB_PATH"),
            default_workspace: env_path("AIPL_DEFAULT_WORKSPACE"),
            disable_tests: env_bool("AIPL_DISABLE_TESTS", defaults.disable_tests),
            allow_tests: env_bool("AIPL_ALLOW_TESTS", defaults.allow_tests),
        }
    }
}
