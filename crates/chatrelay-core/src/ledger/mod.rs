//! Message Ledger
//!
//! Per-role, append-only, index-keyed record of captured messages. Indices
//! mirror the block positions on the page: index `n` of a role is the `n`-th
//! block of that role. The index is the only dedup key; equal content at two
//! positions is two entries.
//!
//! A ledger can start past index 0 (`seek`) when earlier blocks belong to a
//! previous session; those positions are skipped, never written.
//!
//! Each entry is persisted to the capture log before the index advances. A
//! failed write leaves the ledger untouched so the next poll retries the same
//! position.

mod log;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::types::{BoundingBox, MessageBlock, Role};

pub use log::{CaptureLog, TargetSelectors, CAPTURE_METHOD};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{role} entries must continue at index {expected}, got {got}")]
    OutOfOrder {
        role: Role,
        expected: usize,
        got: usize,
    },

    #[error("capture log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One finalized message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub role: Role,
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub html_snippet: String,
    pub element_location: Option<BoundingBox>,
}

impl LedgerEntry {
    /// `<role>_<index>`, e.g. `ai_3`
    pub fn message_id(&self) -> String {
        format!("{}_{}", self.role, self.index)
    }
}

/// Counts for the session-end record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub total_user: usize,
    pub total_assistant: usize,
    pub last_user_index: Option<usize>,
    pub last_assistant_index: Option<usize>,
}

#[derive(Debug, Default)]
pub struct MessageLedger {
    user: Vec<LedgerEntry>,
    assistant: Vec<LedgerEntry>,
    /// First index of each role this ledger is responsible for
    user_start: usize,
    assistant_start: usize,
    log: Option<CaptureLog>,
}

impl MessageLedger {
    /// In-memory ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger persisting every entry to `log`
    pub fn with_log(log: CaptureLog) -> Self {
        Self {
            log: Some(log),
            ..Self::default()
        }
    }

    pub fn log(&self) -> Option<&CaptureLog> {
        self.log.as_ref()
    }

    /// Index the next entry of `role` must carry
    pub fn next_index(&self, role: Role) -> usize {
        let start = match role {
            Role::User => self.user_start,
            Role::Assistant => self.assistant_start,
        };
        start + self.entries(role).len()
    }

    /// `None` until the first entry of `role` is written
    pub fn last_written_index(&self, role: Role) -> Option<usize> {
        self.entries(role).last().map(|e| e.index)
    }

    /// Skip positions below `index` without persisting them. Never moves
    /// backwards.
    pub fn seek(&mut self, role: Role, index: usize) {
        let next = self.next_index(role);
        if index <= next {
            return;
        }
        match role {
            Role::User => self.user_start += index - next,
            Role::Assistant => self.assistant_start += index - next,
        }
        debug!(role = %role, next_index = index, "Ledger cursor moved past visible history");
    }

    pub fn entries(&self, role: Role) -> &[LedgerEntry] {
        match role {
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }

    /// Append `blocks` starting at `first_index`, which must equal
    /// `next_index(role)`. Returns how many entries were written.
    pub fn record(
        &mut self,
        role: Role,
        first_index: usize,
        blocks: &[MessageBlock],
    ) -> Result<usize, LedgerError> {
        let expected = self.next_index(role);
        if first_index != expected {
            return Err(LedgerError::OutOfOrder {
                role,
                expected,
                got: first_index,
            });
        }

        for (offset, block) in blocks.iter().enumerate() {
            let entry = LedgerEntry {
                role,
                index: first_index + offset,
                timestamp: Utc::now(),
                content: block.content.clone(),
                html_snippet: block.html_snippet.clone(),
                element_location: block.element_location,
            };
            if let Some(log) = &self.log {
                log.append_message(&entry)?;
            }
            debug!(message_id = %entry.message_id(), len = entry.content.len(), "Ledger entry written");
            match role {
                Role::User => self.user.push(entry),
                Role::Assistant => self.assistant.push(entry),
            }
        }

        if !blocks.is_empty() {
            info!(role = %role, count = blocks.len(), last_index = ?self.last_written_index(role), "Messages captured");
        }
        Ok(blocks.len())
    }

    /// Record every visible block past the last written position
    pub fn record_observed(&mut self, role: Role, visible: &[MessageBlock]) -> Result<usize, LedgerError> {
        let next = self.next_index(role);
        match visible.get(next..) {
            Some(fresh) if !fresh.is_empty() => self.record(role, next, fresh),
            _ => Ok(0),
        }
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            total_user: self.user.len(),
            total_assistant: self.assistant.len(),
            last_user_index: self.last_written_index(Role::User),
            last_assistant_index: self.last_written_index(Role::Assistant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn blocks(texts: &[&str]) -> Vec<MessageBlock> {
        texts.iter().map(|t| MessageBlock::new(*t)).collect()
    }

    #[test]
    fn test_indices_are_contiguous() {
        let mut ledger = MessageLedger::new();
        let writes = [
            (Role::User, "a"),
            (Role::Assistant, "b"),
            (Role::User, "c"),
            (Role::User, "c"),
            (Role::Assistant, "d"),
        ];
        for (role, text) in writes {
            let next = ledger.next_index(role);
            ledger.record(role, next, &blocks(&[text])).unwrap();
        }

        for role in [Role::User, Role::Assistant] {
            let entries = ledger.entries(role);
            let indices: Vec<_> = entries.iter().map(|e| e.index).collect();
            let expected: Vec<_> = (0..entries.len()).collect();
            assert_eq!(indices, expected);
            assert_eq!(ledger.last_written_index(role), Some(entries.len() - 1));
        }
        // equal content is not deduplicated
        assert_eq!(ledger.entries(Role::User).len(), 3);
    }

    #[test]
    fn test_rejects_gap_and_rewrite() {
        let mut ledger = MessageLedger::new();
        ledger.record(Role::User, 0, &blocks(&["first"])).unwrap();

        let err = ledger.record(Role::User, 2, &blocks(&["skip"])).unwrap_err();
        assert!(matches!(err, LedgerError::OutOfOrder { expected: 1, got: 2, .. }));

        let err = ledger.record(Role::User, 0, &blocks(&["again"])).unwrap_err();
        assert!(matches!(err, LedgerError::OutOfOrder { expected: 1, got: 0, .. }));

        assert_eq!(ledger.entries(Role::User).len(), 1);
    }

    #[test]
    fn test_record_observed_catches_up() {
        let mut ledger = MessageLedger::new();
        assert_eq!(ledger.last_written_index(Role::User), None);

        assert_eq!(ledger.record_observed(Role::User, &blocks(&["a", "b"])).unwrap(), 2);
        assert_eq!(ledger.record_observed(Role::User, &blocks(&["a", "b"])).unwrap(), 0);
        assert_eq!(ledger.record_observed(Role::User, &blocks(&["a"])).unwrap(), 0);
        assert_eq!(ledger.record_observed(Role::User, &blocks(&["a", "b", "c"])).unwrap(), 1);

        let stats = ledger.stats();
        assert_eq!(stats.total_user, 3);
        assert_eq!(stats.last_user_index, Some(2));
        assert_eq!(stats.last_assistant_index, None);
    }

    #[test]
    fn test_persists_each_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        let mut ledger = MessageLedger::with_log(CaptureLog::open(&path).unwrap());

        ledger.record_observed(Role::User, &blocks(&["hi", "there"])).unwrap();
        ledger.record_observed(Role::Assistant, &blocks(&["reply"])).unwrap();

        let ids: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["message_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["user_0", "user_1", "ai_0"]);
    }

    #[test]
    fn test_seek_skips_history_without_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        let mut ledger = MessageLedger::with_log(CaptureLog::open(&path).unwrap());

        ledger.seek(Role::User, 2);
        ledger.seek(Role::User, 1);
        assert_eq!(ledger.next_index(Role::User), 2);
        assert_eq!(ledger.last_written_index(Role::User), None);
        assert!(!path.exists());

        assert_eq!(ledger.record_observed(Role::User, &blocks(&["a", "b", "c"])).unwrap(), 1);
        let err = ledger.record(Role::User, 0, &blocks(&["a"])).unwrap_err();
        assert!(matches!(err, LedgerError::OutOfOrder { expected: 3, got: 0, .. }));

        let entries = ledger.entries(Role::User);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[0].content, "c");
        assert_eq!(ledger.stats().last_user_index, Some(2));

        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("\"message_id\":\"user_2\""));
    }

    #[test]
    fn test_failed_write_does_not_advance() {
        let dir = tempdir().unwrap();
        // a directory cannot be opened for append
        let log = CaptureLog::open(dir.path()).unwrap();
        let mut ledger = MessageLedger::with_log(log);

        assert!(ledger.record_observed(Role::User, &blocks(&["x"])).is_err());
        assert_eq!(ledger.next_index(Role::User), 0);
    }
}
