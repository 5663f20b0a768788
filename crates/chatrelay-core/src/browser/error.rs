//! Error types for browser collaborators.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to the browser or querying the page.
///
/// Inside the poll loop every one of these is transient: the iteration is
/// logged and skipped.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// Failed to reach the DevTools endpoint or one of its targets.
    #[error("failed to connect to Chrome DevTools at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// No usable chat page could be selected or opened.
    #[error("no chat page available: {reason}")]
    NoPage { reason: String },

    /// A CDP command returned an error response.
    #[error("CDP error {code}: {message}")]
    Cdp { code: i64, message: String },

    /// A CDP command timed out waiting for a response.
    #[error("CDP command '{method}' timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    /// Serialization or unexpected message shape.
    #[error("CDP protocol error: {detail}")]
    Protocol { detail: String },

    /// Page script threw.
    #[error("JavaScript exception: {message}")]
    JsException { message: String },

    /// The chat input never appeared.
    #[error("chat textbox not found within {0:?}")]
    TextboxTimeout(Duration),
}

impl BrowserError {
    /// True when the failure means the browser itself is unreachable, as
    /// opposed to a single query going wrong.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            BrowserError::ConnectionFailed { .. } | BrowserError::NoPage { .. }
        )
    }
}
