//! Structured failure reasons.
//!
//! Verification and validation never throw; they accumulate `Reason` records
//! with a closed `type` vocabulary plus free-form evidence fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reason {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Reason {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Attach a field. Null values are dropped so serialized reasons stay
    /// minimal, matching the append-only event discipline.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.fields.insert(key.to_string(), value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Soft checks downgrade their reason to a warning instead of failing the
    /// verification.
    pub fn as_warning(mut self) -> Self {
        self.fields
            .insert("severity".to_string(), Value::String("warning".into()));
        self
    }

    pub fn is_warning(&self) -> bool {
        self.get("severity").and_then(Value::as_str) == Some("warning")
    }
}
