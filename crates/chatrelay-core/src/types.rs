//! Core types for chatrelay
//!
//! Shared between the capture engine, the ledger and the browser collaborators.

use serde::{Deserialize, Serialize};

// ============ Roles ============

/// Author of a rendered chat block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "ai")]
    Assistant,
}

impl Role {
    /// Tag used in message ids and the `type` field of log records
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "ai",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Snapshot ============

/// Element position reported by the page, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// One visible message block captured at a poll instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBlock {
    /// Visible text of the block, trimmed
    pub content: String,
    /// Leading part of the block's inner HTML (at most 500 chars)
    pub html_snippet: String,
    /// Where the block was rendered, if the page reported it
    pub element_location: Option<BoundingBox>,
}

impl MessageBlock {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            html_snippet: String::new(),
            element_location: None,
        }
    }
}

/// Ordered user/assistant blocks plus the in-progress indicator text,
/// captured in one poll
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub user: Vec<MessageBlock>,
    pub assistant: Vec<MessageBlock>,
    pub loading_text: String,
}

impl Snapshot {
    /// Raw text of the last assistant block, empty if there is none
    pub fn last_assistant_text(&self) -> &str {
        self.assistant
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_tags() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "ai");
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"ai\"");
    }

    #[test]
    fn test_last_assistant_text() {
        let mut snap = Snapshot::default();
        assert_eq!(snap.last_assistant_text(), "");

        snap.assistant.push(MessageBlock::new("first"));
        snap.assistant.push(MessageBlock::new("second"));
        assert_eq!(snap.last_assistant_text(), "second");
    }
}
