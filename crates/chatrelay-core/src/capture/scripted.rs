//! Scripted in-memory chat page for tests
//!
//! Each `list_messages(Role::User)` call serves the next frame; every other
//! read looks at the frame served last. The final frame repeats forever.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::browser::{BrowserError, ElementLocator, SnapshotSource, TextboxHandle};
use crate::types::{MessageBlock, Role};

#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub user: Vec<String>,
    pub assistant: Vec<String>,
    pub loading: String,
    pub stop: bool,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, texts: &[&str]) -> Self {
        self.user = texts.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn assistant(mut self, texts: &[&str]) -> Self {
        self.assistant = texts.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn loading(mut self, text: &str) -> Self {
        self.loading = text.to_string();
        self
    }

    pub fn stop(mut self, visible: bool) -> Self {
        self.stop = visible;
        self
    }
}

#[derive(Debug, Default)]
struct PageState {
    served: usize,
    textbox_value: String,
    sent: Vec<String>,
    fail_after: usize,
    failing_polls: usize,
}

pub struct ScriptedPage {
    frames: Vec<Frame>,
    has_textbox: bool,
    accepts_input: bool,
    state: Mutex<PageState>,
}

impl ScriptedPage {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: if frames.is_empty() { vec![Frame::new()] } else { frames },
            has_textbox: true,
            accepts_input: true,
            state: Mutex::new(PageState::default()),
        }
    }

    /// Textbox swallows every keystroke
    pub fn ignoring_input(mut self) -> Self {
        self.accepts_input = false;
        self
    }

    pub fn without_textbox(mut self) -> Self {
        self.has_textbox = false;
        self
    }

    /// After `after` successful user-list reads, the next `n` fail
    pub fn failing_polls(self, after: usize, n: usize) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.fail_after = after;
            state.failing_polls = n;
        }
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    fn current(&self) -> &Frame {
        let served = self.state.lock().unwrap().served;
        let idx = served.saturating_sub(1).min(self.frames.len() - 1);
        &self.frames[idx]
    }
}

fn blocks(texts: &[String]) -> Vec<MessageBlock> {
    texts
        .iter()
        .map(|t| MessageBlock {
            content: t.clone(),
            html_snippet: format!("<div>{}</div>", t),
            element_location: None,
        })
        .collect()
}

#[async_trait]
impl ElementLocator for ScriptedPage {
    async fn wait_for_textbox(&self, timeout: Duration) -> Result<(), BrowserError> {
        if self.has_textbox {
            Ok(())
        } else {
            Err(BrowserError::TextboxTimeout(timeout))
        }
    }

    async fn find_textbox(&self) -> Result<Option<TextboxHandle>, BrowserError> {
        Ok(self.has_textbox.then(|| TextboxHandle {
            frame_index: 0,
            selector: "[role=\"textbox\"]".to_string(),
        }))
    }

    async fn focus_and_clear(&self, _handle: &TextboxHandle) -> Result<(), BrowserError> {
        self.state.lock().unwrap().textbox_value.clear();
        Ok(())
    }

    async fn set_value(&self, _handle: &TextboxHandle, text: &str) -> Result<(), BrowserError> {
        if self.accepts_input {
            self.state.lock().unwrap().textbox_value = text.to_string();
        }
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<(), BrowserError> {
        if self.accepts_input {
            self.state.lock().unwrap().textbox_value.push_str(text);
        }
        Ok(())
    }

    async fn read_value(&self, _handle: &TextboxHandle) -> Result<String, BrowserError> {
        Ok(self.state.lock().unwrap().textbox_value.clone())
    }

    async fn press_enter(&self) -> Result<(), BrowserError> {
        let mut state = self.state.lock().unwrap();
        let value = std::mem::take(&mut state.textbox_value);
        state.sent.push(value);
        Ok(())
    }

    async fn is_stop_generating_visible(&self) -> Result<bool, BrowserError> {
        Ok(self.current().stop)
    }

    async fn loading_indicator_text(&self) -> Result<String, BrowserError> {
        Ok(self.current().loading.clone())
    }
}

#[async_trait]
impl SnapshotSource for ScriptedPage {
    async fn list_messages(&self, role: Role) -> Result<Vec<MessageBlock>, BrowserError> {
        if role == Role::User {
            let mut state = self.state.lock().unwrap();
            if state.served >= state.fail_after && state.failing_polls > 0 {
                state.failing_polls -= 1;
                return Err(BrowserError::Protocol {
                    detail: "scripted failure".to_string(),
                });
            }
            state.served += 1;
            drop(state);
        }
        let frame = self.current();
        Ok(match role {
            Role::User => blocks(&frame.user),
            Role::Assistant => blocks(&frame.assistant),
        })
    }

    async fn url(&self) -> Result<String, BrowserError> {
        Ok("https://chat.example/chat".to_string())
    }
}
