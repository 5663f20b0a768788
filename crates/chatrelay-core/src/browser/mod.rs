//! Browser collaborators
//!
//! The capture engine never touches the DOM directly. It talks to a page
//! through two capabilities:
//!
//! - `ElementLocator`: find/fill the chat input, read the stop-generating and
//!   loading indicators
//! - `SnapshotSource`: list the rendered user/assistant blocks
//!
//! Both are resolved through ordered selector chains; absence is `None` or an
//! empty list, never an error. `cdp` provides the Chrome DevTools backed
//! implementation.

mod cdp;
mod discovery;
mod error;
mod page;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{MessageBlock, Role};

pub use cdp::CdpClient;
pub use discovery::{score_page_url, CdpBrowser, PageTarget};
pub use error::BrowserError;
pub use page::{strip_reply_chrome, CdpPage};

/// Located chat input: which frame it lives in and which selector matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextboxHandle {
    /// 0 = top document, n = n-th same-origin iframe
    pub frame_index: usize,
    pub selector: String,
}

/// Input-side capabilities of a chat page
#[async_trait]
pub trait ElementLocator: Send + Sync {
    /// Wait until any textbox-like element is present
    async fn wait_for_textbox(&self, timeout: Duration) -> Result<(), BrowserError>;

    /// First textbox matched by the selector chain, searching frames in order
    async fn find_textbox(&self) -> Result<Option<TextboxHandle>, BrowserError>;

    /// Focus the textbox and remove its current contents
    async fn focus_and_clear(&self, handle: &TextboxHandle) -> Result<(), BrowserError>;

    /// Assign the value directly and fire input/change events
    async fn set_value(&self, handle: &TextboxHandle, text: &str) -> Result<(), BrowserError>;

    /// Insert text through the browser's native input pipeline
    async fn insert_text(&self, text: &str) -> Result<(), BrowserError>;

    /// Current value/text content of the textbox
    async fn read_value(&self, handle: &TextboxHandle) -> Result<String, BrowserError>;

    async fn press_enter(&self) -> Result<(), BrowserError>;

    /// Whether the "stop generating" affordance is rendered
    async fn is_stop_generating_visible(&self) -> Result<bool, BrowserError>;

    /// Text of the last in-progress indicator node, trimmed; empty if absent
    async fn loading_indicator_text(&self) -> Result<String, BrowserError>;
}

/// Read-side capability of a chat page
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Ordered visible blocks for one role
    async fn list_messages(&self, role: Role) -> Result<Vec<MessageBlock>, BrowserError>;

    /// Current page URL, for log records
    async fn url(&self) -> Result<String, BrowserError>;
}

/// A page usable for a conversation
pub trait ChatPage: ElementLocator + SnapshotSource {}

impl<T: ElementLocator + SnapshotSource> ChatPage for T {}

/// Provides chat pages. The engine borrows pages and never closes them.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Pick the best existing chat tab, or open one
    async fn select_best_page(&self) -> Result<Arc<dyn ChatPage>, BrowserError>;

    /// Endpoint description for the session-start record
    fn endpoint(&self) -> String;
}
