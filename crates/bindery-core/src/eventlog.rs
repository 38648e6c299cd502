use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// Structured audit-event sink.
///
/// Events are appended as JSON lines to the configured file; with no file
/// configured they go to the process log instead. Never fails the request.
pub struct EventLog {
    file: Option<Mutex<File>>,
}

impl EventLog {
    pub fn new(path: &str) -> Self {
        let file = if path.is_empty() {
            None
        } else {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => Some(Mutex::new(f)),
                Err(e) => {
                    warn!("could not open event log {path}: {e}; falling back to process log");
                    None
                }
            }
        };
        Self { file }
    }

    pub fn emit(&self, schema: &str, version: u32, payload: Map<String, Value>) {
        let mut record = Map::new();
        record.insert("schema".into(), json!(schema));
        record.insert("version".into(), json!(version));
        record.insert("timestamp".into(), json!(chrono::Utc::now().to_rfc3339()));
        record.extend(payload);
        let line = Value::Object(record).to_string();

        match &self.file {
            Some(file) => {
                let mut f = file.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = writeln!(f, "{line}") {
                    warn!("event log write failed: {e}");
                }
            }
            None => info!(target: "eventlog", "{line}"),
        }
    }
}
