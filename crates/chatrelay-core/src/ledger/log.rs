//! Capture log - append-only JSON lines
//!
//! The file is opened, written and closed for every record, so a crash
//! between records never loses an earlier one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use super::{LedgerEntry, LedgerError, LedgerStats};
use crate::types::BoundingBox;

/// Value of `capture_method` in session-start records
pub const CAPTURE_METHOD: &str = "chrome_cdp";

// ========== Records ==========

#[derive(Debug, Clone, Serialize)]
pub struct TargetSelectors {
    pub user_messages: Vec<String>,
    pub ai_messages: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SessionStartRecord<'a> {
    session_start: String,
    url: &'a str,
    capture_method: &'a str,
    cdp_endpoint: &'a str,
    target_selectors: &'a TargetSelectors,
}

#[derive(Debug, Serialize)]
struct MessageRecord<'a> {
    timestamp: String,
    message_id: String,
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
    html_snippet: &'a str,
    element_location: Option<&'a BoundingBox>,
}

#[derive(Debug, Serialize)]
struct SessionEndRecord {
    session_end: String,
    total_messages_captured: usize,
    total_user_messages: usize,
    total_ai_messages: usize,
    last_user_index_written: i64,
    last_ai_index_written: i64,
    total_loops: u64,
}

/// -1 marks "nothing written yet" in session-end records
fn index_or_none(index: Option<usize>) -> i64 {
    index.map(|i| i as i64).unwrap_or(-1)
}

// ========== CaptureLog ==========

#[derive(Debug, Clone)]
pub struct CaptureLog {
    path: PathBuf,
}

impl CaptureLog {
    /// Bind to a log file; the parent directory is created if missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_session_start(
        &self,
        url: &str,
        cdp_endpoint: &str,
        selectors: &TargetSelectors,
    ) -> Result<(), LedgerError> {
        self.append(&SessionStartRecord {
            session_start: Utc::now().to_rfc3339(),
            url,
            capture_method: CAPTURE_METHOD,
            cdp_endpoint,
            target_selectors: selectors,
        })
    }

    pub fn append_message(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        self.append(&MessageRecord {
            timestamp: entry.timestamp.to_rfc3339(),
            message_id: entry.message_id(),
            kind: entry.role.as_str(),
            content: &entry.content,
            html_snippet: &entry.html_snippet,
            element_location: entry.element_location.as_ref(),
        })
    }

    pub fn append_session_end(&self, stats: &LedgerStats, total_loops: u64) -> Result<(), LedgerError> {
        self.append(&SessionEndRecord {
            session_end: Utc::now().to_rfc3339(),
            total_messages_captured: stats.total_user + stats.total_assistant,
            total_user_messages: stats.total_user,
            total_ai_messages: stats.total_assistant,
            last_user_index_written: index_or_none(stats.last_user_index),
            last_ai_index_written: index_or_none(stats.last_assistant_index),
            total_loops,
        })
    }

    fn append<T: Serialize>(&self, record: &T) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use tempfile::tempdir;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_records_are_appended_in_order() {
        let dir = tempdir().unwrap();
        let log = CaptureLog::open(dir.path().join("nested/capture.jsonl")).unwrap();

        let selectors = TargetSelectors {
            user_messages: vec!["[data-testid=\"chatOutput\"]".into()],
            ai_messages: vec![".ai-message".into()],
        };
        log.append_session_start("https://chat.example/chat", "http://127.0.0.1:9222", &selectors)
            .unwrap();

        let entry = LedgerEntry {
            role: Role::Assistant,
            index: 0,
            timestamp: Utc::now(),
            content: "Hello there!".into(),
            html_snippet: "<p>Hello there!</p>".into(),
            element_location: Some(BoundingBox {
                x: 1.0,
                y: 2.0,
                width: 3.0,
                height: 4.0,
            }),
        };
        log.append_message(&entry).unwrap();

        let stats = LedgerStats {
            total_user: 0,
            total_assistant: 1,
            last_user_index: None,
            last_assistant_index: Some(0),
        };
        log.append_session_end(&stats, 7).unwrap();

        let lines = read_lines(log.path());
        assert_eq!(lines.len(), 3);

        assert_eq!(lines[0]["capture_method"], CAPTURE_METHOD);
        assert_eq!(lines[0]["target_selectors"]["ai_messages"][0], ".ai-message");

        assert_eq!(lines[1]["message_id"], "ai_0");
        assert_eq!(lines[1]["type"], "ai");
        assert_eq!(lines[1]["content"], "Hello there!");
        assert_eq!(lines[1]["element_location"]["width"], 3.0);

        assert_eq!(lines[2]["total_messages_captured"], 1);
        assert_eq!(lines[2]["last_user_index_written"], -1);
        assert_eq!(lines[2]["last_ai_index_written"], 0);
        assert_eq!(lines[2]["total_loops"], 7);
    }

    #[test]
    fn test_existing_content_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        fs::write(&path, "{\"earlier\":true}\n").unwrap();

        let log = CaptureLog::open(&path).unwrap();
        log.append_session_end(&LedgerStats::default(), 0).unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["earlier"], true);
    }
}
