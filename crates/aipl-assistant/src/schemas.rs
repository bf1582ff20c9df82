//! Output schemas for the two assistant invocations: planning (a task list)
//! and fixing (writes + commands). Responses must validate before any side
//! effect is considered.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use aipl_core::AppError;
use aipl_verify::schema::validate_schema;

/// Schema for `plan` invocations.
pub fn plan_schema() -> Value {
    json!({
        "type": "object",
        "required": ["tasks"],
        "properties": {
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id", "title"],
                    "properties": {
                        "id": {"type": "string"},
                        "title": {"type": "string"},
                        "type": {"type": "string"},
                        "priority": {"type": "integer"},
                        "dependencies": {"type": "array", "items": {"type": "string"}},
                        "acceptance_criteria": {"type": "array", "items": {"type": "string"}},
                        "checks": {"type": "array", "items": {"type": "object"}},
                        "estimated_minutes": {"type": "integer"}
                    }
                }
            }
        }
    })
}

/// Schema for `fix` invocations.
pub fn fix_schema() -> Value {
    json!({
        "type": "object",
        "required": ["writes", "commands"],
        "properties": {
            "writes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["target", "path"],
                    "properties": {
                        "target": {"enum": ["workspace", "run"]},
                        "path": {"type": "string"},
                        "content": {"type": "string"}
                    }
                }
            },
            "commands": {"type": "array"},
            "summary": {"type": "string"},
            "produced": {"type": "array", "items": {"type": "string"}}
        }
    })
}

/// Persist a schema under the run directory and return its path.
pub fn write_schema_file(run_dir: &Path, name: &str, schema: &Value) -> std::io::Result<PathBuf> {
    let path = run_dir.join(format!("{name}.schema.json"));
    aipl_core::fsio::write_json(&path, schema)?;
    Ok(path)
}

/// Parsed fix response; writes and commands stay raw until the policy layer
/// validates them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FixResponse {
    #[serde(default)]
    pub writes: Vec<Value>,

    #[serde(default)]
    pub commands: Vec<Value>,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub produced: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanResponse {
    #[serde(default)]
    pub tasks: Vec<Value>,
}

fn parse_validated(response_text: &str, schema: &Value) -> Result<Value, AppError> {
    let value: Value = serde_json::from_str(response_text)
        .map_err(|err| AppError::AssistantSchemaMismatch(format!("invalid json: {err}")))?;
    validate_schema(&value, schema).map_err(AppError::AssistantSchemaMismatch)?;
    Ok(value)
}

pub fn parse_plan_response(response_text: &str) -> Result<PlanResponse, AppError> {
    let value = parse_validated(response_text, &plan_schema())?;
    serde_json::from_value(value)
        .map_err(|err| AppError::AssistantSchemaMismatch(err.to_string()))
}

pub fn parse_fix_response(response_text: &str) -> Result<FixResponse, AppError> {
    let value = parse_validated(response_text, &fix_schema())?;
    serde_json::from_value(value)
        .map_err(|err| AppError::AssistantSchemaMismatch(err.to_string()))
}
