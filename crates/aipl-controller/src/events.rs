//! Per-run append-only event log plus cursor-based reads for external
//! consumers.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value, json};

pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join("events.jsonl"),
        }
    }

    /// Append one event. `extra` fields are merged over `{type, ts}`.
    pub fn emit(&self, event_type: &str, extra: Value) {
        let mut payload = Map::new();
        payload.insert("type".into(), json!(event_type));
        payload.insert("ts".into(), json!(aipl_core::now_ts()));
        if let Value::Object(extra) = extra {
            for (key, value) in extra {
                if !value.is_null() {
                    payload.insert(key, value);
                }
            }
        }
        let _ = aipl_core::fsio::append_jsonl(&self.path, &Value::Object(payload));
    }

    pub fn read_all(&self) -> Vec<Value> {
        aipl_core::fsio::read_jsonl(&self.path).unwrap_or_default()
    }
}

/// One page of events for `events --cursor --limit`.
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub cursor: usize,
    pub next_cursor: usize,
    pub events: Vec<Value>,
}

/// Read events starting after line-offset `cursor`; event ids are 1-based
/// line offsets and strictly increasing.
pub fn read_events(run_dir: &Path, cursor: usize, limit: usize) -> EventPage {
    let all = EventLog::new(run_dir).read_all();
    let events: Vec<Value> = all
        .into_iter()
        .enumerate()
        .skip(cursor)
        .take(limit)
        .map(|(idx, mut event)| {
            if let Some(map) = event.as_object_mut() {
                map.insert("id".into(), json!(idx + 1));
            }
            event
        })
        .collect();
    let next_cursor = cursor + events.len();
    EventPage {
        cursor,
        next_cursor,
        events,
    }
}
