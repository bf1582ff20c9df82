//! The single-JSON-object envelope every command prints.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub ok: bool,
    pub ts: i64,
    pub trace_id: String,

    pub data: Option<Value>,
    pub error: Option<String>,
}

impl Envelope {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            ts: chrono::Utc::now().timestamp(),
            trace_id: aipl_core::ids::new_trace_id(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            ts: chrono::Utc::now().timestamp(),
            trace_id: aipl_core::ids::new_trace_id(),
            data: None,
            error: Some(error.to_string()),
        }
    }

    pub fn print(&self) {
        println!(
            "{}",
            serde_json::to_string(self).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_shape() {
        let env = Envelope::success(json!({"run_id": "run-1"}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["ok"], true);
        assert!(value["ts"].is_i64());
        assert!(value["trace_id"].as_str().unwrap().starts_with("trc_"));
        assert_eq!(value["trace_id"].as_str().unwrap().len(), 16);
        assert_eq!(value["data"]["run_id"], "run-1");
        assert!(value["error"].is_null());
    }

    #[test]
    fn test_failure_shape() {
        let env = Envelope::failure("run not found");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"], "run not found");
        assert!(value["data"].is_null());
    }
}
