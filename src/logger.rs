use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

/// What the traffic log records for each exchange with Uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    /// Request and response bodies.
    Full,
    /// Method, path and status only.
    Headers,
}

/// Append-only NDJSON log of dispatched operations. Bearer tokens never reach it.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { mode, file })
    }

    pub fn log_request(&mut self, op_id: Uuid, attempt: u32, method: &str, path: &str, body: Option<&Value>) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "op": op_id.to_string(),
            "attempt": attempt,
            "method": method,
            "path": path,
        });
        if self.mode == MessageLogMode::Full {
            entry["body"] = body.cloned().unwrap_or(Value::Null);
        }
        self.write_line(&entry);
    }

    pub fn log_response(&mut self, op_id: Uuid, status: u16, body: &Value) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "resp",
            "op": op_id.to_string(),
            "status": status,
        });
        if self.mode == MessageLogMode::Full {
            entry["body"] = body.clone();
        }
        self.write_line(&entry);
    }

    pub fn log_failure(&mut self, op_id: Uuid, error: &str) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "fail",
            "op": op_id.to_string(),
            "error": error,
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write traffic log entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn full_mode_records_bodies() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        let op = Uuid::new_v4();
        logger.log_request(op, 1, "PUT", "/api/v1/systems/1/parameters", Some(&json!({"settings": {"47011": "1"}})));
        logger.log_response(op, 200, &json!([{"status": "DONE"}]));

        let lines = read_lines(tmp.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["dir"], "req");
        assert_eq!(lines[0]["method"], "PUT");
        assert_eq!(lines[0]["body"]["settings"]["47011"], "1");
        assert_eq!(lines[1]["status"], 200);
        assert_eq!(lines[0]["op"], lines[1]["op"]);
        assert!(lines[0]["ts"].as_str().is_some());
    }

    #[test]
    fn headers_mode_omits_bodies() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Headers, tmp.path()).unwrap();
        let op = Uuid::new_v4();
        logger.log_request(op, 2, "GET", "/api/v1/systems/1", None);
        logger.log_response(op, 429, &json!({"message": "slow down"}));

        let lines = read_lines(tmp.path());
        assert!(lines[0].get("body").is_none());
        assert!(lines[1].get("body").is_none());
        assert_eq!(lines[0]["attempt"], 2);
    }

    #[test]
    fn failures_are_logged() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        logger.log_failure(Uuid::new_v4(), "request timed out");

        let lines = read_lines(tmp.path());
        assert_eq!(lines[0]["dir"], "fail");
        assert_eq!(lines[0]["error"], "request timed out");
    }
}
