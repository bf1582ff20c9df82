//! Workspace capability detection: project type, suggested commands, and the
//! default checks the policy layer falls back to.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_DENY: [&str; 7] = [
    ".git",
    "node_modules",
    "target",
    "dist",
    ".venv",
    "__pycache__",
    "outputs",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedCommand {
    pub cmd: String,
    pub kind: String,
    pub source: String,
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceCapabilities {
    pub project_type: String,
    pub detected: Vec<String>,
    pub commands: Vec<DetectedCommand>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceDetection {
    pub project_type: String,
    pub allow_write: Vec<String>,
    pub deny_write: Vec<String>,
    pub checks: Vec<Value>,
    pub capabilities: WorkspaceCapabilities,
}

fn push_command(commands: &mut Vec<DetectedCommand>, cmd: &str, kind: &str, source: &str, timeout: u64) {
    if cmd.is_empty() {
        return;
    }
    commands.push(DetectedCommand {
        cmd: cmd.to_string(),
        kind: kind.to_string(),
        source: source.to_string(),
        timeout,
    });
}

/// Prefer the first test command; fall back to one command each of build,
/// lint, typecheck, smoke.
fn select_checks(commands: &[DetectedCommand]) -> Vec<Value> {
    if let Some(test) = commands.iter().find(|c| c.kind == "test") {
        return vec![serde_json::json!({
            "type": "command", "cmd": test.cmd, "timeout": test.timeout
        })];
    }
    let mut checks = Vec::new();
    for kind in ["build", "lint", "typecheck", "smoke"] {
        if let Some(cmd) = commands.iter().find(|c| c.kind == kind) {
            checks.push(serde_json::json!({
                "type": "command", "cmd": cmd.cmd, "timeout": cmd.timeout
            }));
        }
    }
    checks
}

/// Detect project features from manifest files only; conservative by design.
pub fn detect_workspace(workspace: &Path) -> WorkspaceDetection {
    let exists = |name: &str| workspace.join(name).exists();
    let mut commands: Vec<DetectedCommand> = Vec::new();
    let mut detected: Vec<String> = Vec::new();
    let mut allow_write: Vec<String> = Vec::new();
    let project_type;

    if exists("pom.xml") {
        project_type = "maven";
        detected.push("pom.xml".into());
        push_command(&mut commands, "mvn -q test", "test", "pom.xml", 900);
        push_command(&mut commands, "mvn -q -DskipTests package", "build", "pom.xml", 900);
        allow_write = vec!["src/main/java".into(), "src/test/java".into()];
    } else if exists("build.gradle") || exists("build.gradle.kts") {
        project_type = "gradle";
        detected.push(
            if exists("build.gradle") { "build.gradle" } else { "build.gradle.kts" }.into(),
        );
        push_command(&mut commands, "gradle test", "test", "gradle", 900);
        push_command(&mut commands, "gradle build", "build", "gradle", 900);
        allow_write = vec!["src/main/java".into(), "src/test/java".into()];
    } else if exists("package.json") {
        project_type = "node";
        detected.push("package.json".into());
        let pkg: Value = aipl_core::fsio::read_json_or(&workspace.join("package.json"), Value::Null);
        if let Some(scripts) = pkg.get("scripts").and_then(Value::as_object) {
            let mut names: Vec<&String> = scripts.keys().collect();
            names.sort();
            for name in names {
                let cmd = format!("npm run {name}");
                if name == "test" || name.starts_with("test:") {
                    push_command(&mut commands, &cmd, "test", "package.json", 600);
                } else if name == "build" || name.starts_with("build:") {
                    push_command(&mut commands, &cmd, "build", "package.json", 600);
                } else if name == "lint" || name.starts_with("lint:") {
                    push_command(&mut commands, &cmd, "lint", "package.json", 600);
                } else if name == "start" || name == "dev" {
                    push_command(&mut commands, &format!("{cmd} -- --help"), "smoke", "package.json", 300);
                }
            }
        }
        if exists("tsconfig.json") {
            detected.push("tsconfig.json".into());
            push_command(&mut commands, "npm exec -- tsc --noEmit", "typecheck", "tsconfig.json", 600);
        }
        allow_write = vec!["src".into(), "tests".into(), "test".into()];
    } else if exists("pyproject.toml") || exists("requirements.txt") {
        project_type = "python";
        if exists("pyproject.toml") {
            detected.push("pyproject.toml".into());
            if let Ok(text) = std::fs::read_to_string(workspace.join("pyproject.toml")) {
                if let Ok(data) = text.parse::<toml::Value>() {
                    if data.get("tool").and_then(|t| t.get("pytest")).is_some() {
                        push_command(&mut commands, "python -m pytest -q", "test", "pyproject.toml", 600);
                    }
                }
            }
        }
        if exists("requirements.txt") {
            detected.push("requirements.txt".into());
        }
        if exists("pytest.ini") || exists("tests") {
            detected.push(if exists("pytest.ini") { "pytest.ini" } else { "tests" }.into());
            push_command(&mut commands, "python -m pytest -q", "test", "tests", 600);
        }
        push_command(&mut commands, "python -m compileall .", "build", "python", 300);
        allow_write = vec!["src".into(), "tests".into(), String::new()];
    } else {
        project_type = "unknown";
        allow_write = vec![String::new()];
    }

    let checks = select_checks(&commands);
    WorkspaceDetection {
        project_type: project_type.to_string(),
        allow_write,
        deny_write: DEFAULT_DENY.iter().map(|s| s.to_string()).collect(),
        checks,
        capabilities: WorkspaceCapabilities {
            project_type: project_type.to_string(),
            detected,
            commands,
        },
    }
}
