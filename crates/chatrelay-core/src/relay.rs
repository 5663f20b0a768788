//! Chat Relay - page provisioning and single-flight access
//!
//! Owns the browser connection and hands out conversation sessions. One gate
//! serializes every send/receive cycle against the shared page: a blocking
//! request holds it for the duration of the call, a stream holds it until
//! its worker ends.
//!
//! Request sessions share one capture log, so each one only ledgers the
//! exchange it sends; history already on the page was written by an earlier
//! session.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bridge::StreamBridge;
use crate::browser::{BrowserSession, CdpBrowser};
use crate::capture::{ConversationSession, SessionOptions, TurnLimits};
use crate::config::RelayConfig;
use crate::error::CaptureError;
use crate::ledger::{CaptureLog, MessageLedger};

pub struct ChatRelay {
    config: RelayConfig,
    browser: Arc<dyn BrowserSession>,
    options: SessionOptions,
    gate: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
}

impl ChatRelay {
    /// Relay backed by Chrome DevTools at `config.cdp_endpoint`
    pub fn new(config: RelayConfig) -> Self {
        let browser: Arc<dyn BrowserSession> = Arc::new(CdpBrowser::new(&config));
        Self::with_browser(config, browser)
    }

    pub fn with_browser(config: RelayConfig, browser: Arc<dyn BrowserSession>) -> Self {
        Self {
            options: SessionOptions::from_config(&config),
            config,
            browser,
            gate: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Shutdown flag shared with every session this relay opens
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// A send/receive cycle currently owns the page
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Select a page and start a session on it, logging to `capture_log`
    pub async fn open_session(&self) -> Result<ConversationSession, CaptureError> {
        self.start_session(self.options.clone()).await
    }

    /// Session for one request: ledgers only the exchange it sends
    async fn open_request_session(&self) -> Result<ConversationSession, CaptureError> {
        let options = SessionOptions {
            record_history: false,
            ..self.options.clone()
        };
        self.start_session(options).await
    }

    async fn start_session(&self, options: SessionOptions) -> Result<ConversationSession, CaptureError> {
        let page = self.browser.select_best_page().await?;
        let ledger = match CaptureLog::open(&self.config.capture_log) {
            Ok(log) => MessageLedger::with_log(log),
            Err(e) => {
                warn!(path = ?self.config.capture_log, error = %e, "Capture log unavailable, ledgering in memory only");
                MessageLedger::new()
            }
        };
        let session = ConversationSession::open(page, self.browser.endpoint(), ledger, options).await;
        Ok(session.with_running(Arc::clone(&self.running)))
    }

    /// Send one message and wait for the finalized reply.
    ///
    /// `timeout` overrides the configured blocking deadline.
    pub async fn send_and_wait(&self, message: &str, timeout: Option<Duration>) -> Result<String, CaptureError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(CaptureError::EmptyInput);
        }

        let _guard = self.gate.lock().await;
        let mut limits = TurnLimits::from(&self.config.blocking);
        if let Some(timeout) = timeout {
            limits = limits.with_timeout(timeout);
        }

        let mut session = self.open_request_session().await?;
        info!(session = %session.id(), len = message.len(), "Blocking send");
        session.send_and_wait(message, &limits).await
    }

    /// Start a streamed reply. Failures before the first delta become the
    /// bridge's terminal error frame.
    pub async fn open_stream(&self, message: &str) -> StreamBridge {
        let message = message.trim();
        if message.is_empty() {
            return StreamBridge::failed(&CaptureError::EmptyInput);
        }

        let guard = Arc::clone(&self.gate).lock_owned().await;
        let mut session = match self.open_request_session().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to open streaming session");
                return StreamBridge::failed(&e);
            }
        };
        session.hold(guard);
        info!(session = %session.id(), len = message.len(), "Streaming send");
        StreamBridge::new(session.stream_response(message.to_string(), TurnLimits::from(&self.config.streaming)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::StreamFrame;
    use crate::browser::{BrowserError, ChatPage};
    use crate::capture::scripted::{Frame, ScriptedPage};
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct FakeBrowser {
        page: Option<Arc<ScriptedPage>>,
    }

    #[async_trait]
    impl BrowserSession for FakeBrowser {
        async fn select_best_page(&self) -> Result<Arc<dyn ChatPage>, BrowserError> {
            match &self.page {
                Some(page) => {
                    let page: Arc<dyn ChatPage> = page.clone();
                    Ok(page)
                }
                None => Err(BrowserError::ConnectionFailed {
                    url: "http://127.0.0.1:9222".into(),
                    reason: "connection refused".into(),
                }),
            }
        }

        fn endpoint(&self) -> String {
            "http://127.0.0.1:9222".to_string()
        }
    }

    fn relay_for(page: Option<Arc<ScriptedPage>>, dir: &std::path::Path) -> ChatRelay {
        let mut config = RelayConfig::default();
        config.capture_log = dir.join("capture.jsonl");
        config.blocking.poll_interval_ms = 1;
        config.streaming.poll_interval_ms = 1;
        config.streaming.buffer_capacity = 1;
        let options = SessionOptions {
            submit_settle: Duration::ZERO,
            submit_retry_delay: Duration::ZERO,
            ..SessionOptions::from_config(&config)
        };
        ChatRelay::with_browser(config, Arc::new(FakeBrowser { page })).with_options(options)
    }

    fn reply_frames() -> Vec<Frame> {
        vec![
            Frame::new(),
            Frame::new().user(&["hi"]).assistant(&["Hel"]).stop(true),
            Frame::new().user(&["hi"]).assistant(&["Hello!"]).stop(true),
            Frame::new().user(&["hi"]).assistant(&["Hello!"]),
        ]
    }

    async fn drain(mut bridge: StreamBridge) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = bridge.next_frame().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_send_and_wait() {
        let dir = tempdir().unwrap();
        let page = Arc::new(ScriptedPage::new(reply_frames()));
        let relay = relay_for(Some(page.clone()), dir.path());

        let reply = relay.send_and_wait("  hi  ", None).await.unwrap();
        assert_eq!(reply, "Hello!");
        assert_eq!(page.sent(), vec!["hi".to_string()]);
        assert!(!relay.is_busy());

        let log = std::fs::read_to_string(dir.path().join("capture.jsonl")).unwrap();
        assert!(log.lines().next().unwrap().contains("session_start"));
        assert!(log.lines().last().unwrap().contains("session_end"));
    }

    #[tokio::test]
    async fn test_sequential_requests_log_unique_ids() {
        let dir = tempdir().unwrap();
        let first = Arc::new(ScriptedPage::new(reply_frames()));
        relay_for(Some(first), dir.path()).send_and_wait("hi", None).await.unwrap();

        // same conversation, one exchange later
        let second = Arc::new(ScriptedPage::new(vec![
            Frame::new().user(&["hi"]).assistant(&["Hello!"]),
            Frame::new().user(&["hi", "again"]).assistant(&["Hello!", "Welcome back"]).stop(true),
            Frame::new().user(&["hi", "again"]).assistant(&["Hello!", "Welcome back, friend!"]).stop(true),
            Frame::new().user(&["hi", "again"]).assistant(&["Hello!", "Welcome back, friend!"]),
        ]));
        let reply = relay_for(Some(second), dir.path()).send_and_wait("again", None).await.unwrap();
        assert_eq!(reply, "Welcome back, friend!");

        let ids: Vec<String> = std::fs::read_to_string(dir.path().join("capture.jsonl"))
            .unwrap()
            .lines()
            .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["message_id"].as_str().map(String::from))
            .collect();
        assert_eq!(ids, vec!["user_0", "ai_0", "user_1", "ai_1"]);
    }

    #[tokio::test]
    async fn test_empty_message_never_reaches_page() {
        let dir = tempdir().unwrap();
        let page = Arc::new(ScriptedPage::new(reply_frames()));
        let relay = relay_for(Some(page.clone()), dir.path());

        let err = relay.send_and_wait(" \n\t", None).await.unwrap_err();
        assert!(matches!(err, CaptureError::EmptyInput));

        let frames = drain(relay.open_stream("").await).await;
        assert_eq!(frames[0], StreamFrame::Start);
        assert_eq!(
            frames[1],
            StreamFrame::Error {
                error: "Message cannot be empty.".to_string()
            }
        );
        assert!(page.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stream_frames_and_gate_release() {
        let dir = tempdir().unwrap();
        let page = Arc::new(ScriptedPage::new(reply_frames()));
        let relay = relay_for(Some(page), dir.path());

        let bridge = relay.open_stream("hi").await;
        assert!(relay.is_busy());

        let frames = drain(bridge).await;
        assert_eq!(frames.first(), Some(&StreamFrame::Start));
        assert_eq!(frames.last(), Some(&StreamFrame::End));
        let text: String = frames
            .iter()
            .filter_map(|f| match f {
                StreamFrame::Data { content, replace: false } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello!");

        for _ in 0..100 {
            if !relay.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!relay.is_busy());
    }

    #[tokio::test]
    async fn test_unreachable_browser() {
        let dir = tempdir().unwrap();
        let relay = relay_for(None, dir.path());

        let err = relay.send_and_wait("hi", None).await.unwrap_err();
        assert!(matches!(err, CaptureError::ConnectionFailure(_)));

        let frames = drain(relay.open_stream("hi").await).await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[1], StreamFrame::Error { error } if error.contains("connection refused")));
        assert!(!relay.is_busy());
    }
}
