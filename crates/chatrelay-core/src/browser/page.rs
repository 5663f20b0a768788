//! CDP-backed chat page
//!
//! All DOM work happens in small scripts run through `Runtime.evaluate`.
//! Selector chains are embedded as JSON literals; each script searches the
//! top document first, then every same-origin iframe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use super::cdp::CdpClient;
use super::error::BrowserError;
use super::{ElementLocator, SnapshotSource, TextboxHandle};
use crate::config::SelectorConfig;
use crate::types::{BoundingBox, MessageBlock, Role};

const HTML_SNIPPET_CHARS: usize = 500;
const TEXTBOX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Speaker label the assistant UI prepends to each reply
const REPLY_LABEL: &str = "Copilot said";

static TRAILING_AFFORDANCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*Edit in a page\s*$").expect("valid regex"));

/// Remove assistant UI chrome from a reply's visible text
pub fn strip_reply_chrome(text: &str) -> String {
    let mut out = text.to_string();
    if out.contains(REPLY_LABEL) {
        out = out.replace(REPLY_LABEL, "").trim().to_string();
    }
    TRAILING_AFFORDANCE.replace(&out, "").trim().to_string()
}

// ========== Script helpers ==========

/// Defines `docs()`: top document plus reachable iframe documents
const DOCS_PRELUDE: &str = r#"
const docs = () => {
  const out = [document];
  for (const f of document.querySelectorAll('iframe')) {
    try { if (f.contentDocument) out.push(f.contentDocument); } catch (e) {}
  }
  return out;
};
const query = (doc, sel) => { try { return Array.from(doc.querySelectorAll(sel)); } catch (e) { return []; } };
"#;

fn script(selectors: &[String], body: &str) -> String {
    // a Vec<String> always serializes
    let sels = serde_json::to_string(selectors).unwrap_or_else(|_| "[]".to_string());
    format!("(() => {{ {DOCS_PRELUDE} const sels = {sels}; {body} }})()")
}

fn handle_script(handle: &TextboxHandle, body: &str) -> String {
    let sel = serde_json::to_string(&handle.selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(() => {{ {DOCS_PRELUDE} const doc = docs()[{frame}]; const el = doc ? query(doc, {sel})[0] : null; \
         if (!el) return null; \
         const isField = el.tagName === 'TEXTAREA' || el.tagName === 'INPUT'; {body} }})()",
        frame = handle.frame_index,
    )
}

/// Unwrap a `Runtime.evaluate` result into its by-value payload
fn evaluation_value(result: Value) -> Result<Value, BrowserError> {
    if let Some(details) = result.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .and_then(Value::as_str)
            .or_else(|| details.get("text").and_then(Value::as_str))
            .unwrap_or("unknown exception")
            .to_string();
        return Err(BrowserError::JsException { message });
    }
    Ok(result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(default)]
    text: String,
    #[serde(default)]
    html: String,
    rect: Option<BoundingBox>,
}

#[derive(Debug, Deserialize)]
struct RawTextbox {
    frame: usize,
    selector: String,
}

/// Turn the listing script's output into message blocks
fn blocks_from_value(role: Role, value: Value) -> Result<Vec<MessageBlock>, BrowserError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawBlock> = serde_json::from_value(value).map_err(|e| BrowserError::Protocol {
        detail: format!("unexpected message listing: {e}"),
    })?;

    Ok(raw
        .into_iter()
        .filter_map(|b| {
            let text = match role {
                Role::User => b.text.trim().to_string(),
                Role::Assistant => strip_reply_chrome(&b.text),
            };
            if text.is_empty() {
                return None;
            }
            Some(MessageBlock {
                content: text,
                html_snippet: b.html.chars().take(HTML_SNIPPET_CHARS).collect(),
                element_location: b.rect,
            })
        })
        .collect())
}

// ========== CdpPage ==========

pub struct CdpPage {
    client: Arc<CdpClient>,
    selectors: SelectorConfig,
}

impl CdpPage {
    pub fn new(client: Arc<CdpClient>, selectors: SelectorConfig) -> Self {
        Self { client, selectors }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn evaluate(&self, expression: String) -> Result<Value, BrowserError> {
        trace!(len = expression.len(), "Runtime.evaluate");
        let result = self
            .client
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        evaluation_value(result)
    }

    async fn key_event(&self, kind: &str) -> Result<(), BrowserError> {
        let mut params = json!({
            "type": kind,
            "key": "Enter",
            "code": "Enter",
            "windowsVirtualKeyCode": 13,
            "nativeVirtualKeyCode": 13,
        });
        if kind == "keyDown" {
            params["text"] = json!("\r");
        }
        self.client.send("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }
}

#[async_trait]
impl ElementLocator for CdpPage {
    async fn wait_for_textbox(&self, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.find_textbox().await?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::TextboxTimeout(timeout));
            }
            tokio::time::sleep(TEXTBOX_POLL_INTERVAL).await;
        }
    }

    async fn find_textbox(&self) -> Result<Option<TextboxHandle>, BrowserError> {
        let value = self
            .evaluate(script(
                &self.selectors.textbox,
                r#"const all = docs();
for (let i = 0; i < all.length; i++) {
  for (const s of sels) {
    if (query(all[i], s).length > 0) return { frame: i, selector: s };
  }
}
return null;"#,
            ))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let raw: RawTextbox = serde_json::from_value(value).map_err(|e| BrowserError::Protocol {
            detail: format!("unexpected textbox lookup result: {e}"),
        })?;
        debug!(frame = raw.frame, selector = %raw.selector, "Textbox found");
        Ok(Some(TextboxHandle {
            frame_index: raw.frame,
            selector: raw.selector,
        }))
    }

    async fn focus_and_clear(&self, handle: &TextboxHandle) -> Result<(), BrowserError> {
        self.evaluate(handle_script(
            handle,
            r#"el.focus();
if (isField) { el.value = ''; } else { el.textContent = ''; }
el.dispatchEvent(new Event('input', { bubbles: true }));
return true;"#,
        ))
        .await?;
        Ok(())
    }

    async fn set_value(&self, handle: &TextboxHandle, text: &str) -> Result<(), BrowserError> {
        let literal = serde_json::to_string(text).map_err(|e| BrowserError::Protocol {
            detail: format!("failed to encode message: {e}"),
        })?;
        self.evaluate(handle_script(
            handle,
            &format!(
                r#"el.focus();
if (isField) {{ el.value = {literal}; }} else {{ el.textContent = {literal}; }}
el.dispatchEvent(new Event('input', {{ bubbles: true }}));
el.dispatchEvent(new Event('change', {{ bubbles: true }}));
return true;"#
            ),
        ))
        .await?;
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<(), BrowserError> {
        self.client.send("Input.insertText", json!({ "text": text })).await?;
        Ok(())
    }

    async fn read_value(&self, handle: &TextboxHandle) -> Result<String, BrowserError> {
        let value = self
            .evaluate(handle_script(
                handle,
                "return isField ? el.value : (el.innerText || el.textContent || '');",
            ))
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn press_enter(&self) -> Result<(), BrowserError> {
        self.key_event("keyDown").await?;
        self.key_event("keyUp").await
    }

    async fn is_stop_generating_visible(&self) -> Result<bool, BrowserError> {
        let value = self
            .evaluate(script(
                &self.selectors.stop_generating,
                "return docs().some(d => sels.some(s => query(d, s).length > 0));",
            ))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn loading_indicator_text(&self) -> Result<String, BrowserError> {
        let value = self
            .evaluate(script(
                &self.selectors.loading_indicator,
                r#"const found = [];
for (const d of docs()) { for (const s of sels) { found.push(...query(d, s)); } }
if (found.length === 0) return '';
return (found[found.length - 1].innerText || '').trim();"#,
            ))
            .await?;
        Ok(value.as_str().unwrap_or_default().trim().to_string())
    }
}

#[async_trait]
impl SnapshotSource for CdpPage {
    async fn list_messages(&self, role: Role) -> Result<Vec<MessageBlock>, BrowserError> {
        let selectors = match role {
            Role::User => &self.selectors.user_messages,
            Role::Assistant => &self.selectors.assistant_messages,
        };
        let value = self
            .evaluate(script(
                selectors,
                r#"for (const s of sels) {
  const els = docs().flatMap(d => query(d, s));
  if (els.length === 0) continue;
  return els.map(el => {
    const r = el.getBoundingClientRect();
    return {
      text: el.innerText || '',
      html: el.innerHTML || '',
      rect: { x: r.x, y: r.y, width: r.width, height: r.height },
    };
  });
}
return [];"#,
            ))
            .await?;
        blocks_from_value(role, value)
    }

    async fn url(&self) -> Result<String, BrowserError> {
        let value = self.evaluate("location.href".to_string()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}
