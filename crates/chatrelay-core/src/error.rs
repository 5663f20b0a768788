//! Capture errors surfaced to callers

use std::time::Duration;

use crate::browser::BrowserError;
use crate::ledger::LedgerError;

/// Failures of a send/receive cycle.
///
/// Transient poll errors never appear here: the poll loop logs and skips them.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Message cannot be empty.")]
    EmptyInput,

    #[error("Cannot reach chat page: {0}")]
    ConnectionFailure(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Timed out waiting for AI response after {0:?}")]
    TimedOut(Duration),

    #[error("Capture stopped by shutdown signal")]
    Shutdown,

    #[error("Capture failed: {0}")]
    Fatal(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl CaptureError {
    /// Stable machine-readable tag for the transport layer
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::EmptyInput => "empty_input",
            CaptureError::ConnectionFailure(_) => "connection_failure",
            CaptureError::SendFailed(_) => "send_failed",
            CaptureError::TimedOut(_) => "timed_out",
            CaptureError::Shutdown => "shutdown",
            CaptureError::Fatal(_) => "fatal",
            CaptureError::Ledger(_) => "ledger",
        }
    }
}

impl From<BrowserError> for CaptureError {
    fn from(e: BrowserError) -> Self {
        if e.is_connection() {
            CaptureError::ConnectionFailure(e.to_string())
        } else {
            CaptureError::Fatal(e.to_string())
        }
    }
}
