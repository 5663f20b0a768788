//! Conversation Session - send, poll, detect, emit, persist
//!
//! One session drives one sequential poll loop against a borrowed chat page.
//! A turn walks `Idle → Sending → AwaitingFirstDelta → Streaming →
//! Finalizing → Done`, or ends in `TimedOut` / `Failed`.
//!
//! Per poll:
//! 1. ledger any newly visible user blocks
//! 2. read the loading indicator and the last assistant block, prefer the
//!    indicator, normalize
//! 3. skip polls that still show the pre-send baseline
//! 4. observe the stop indicator, then feed the stability tracker
//! 5. emit a delta on change; finalize when the detector says so
//!
//! Query failures inside a poll are logged and the poll is skipped.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures_util::Stream;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::delta::{compute_delta, Delta};
use super::normalizer::Normalizer;
use super::stability::{StabilityDetector, StreamTracker};
use crate::browser::{BrowserError, ChatPage};
use crate::config::{RelayConfig, SelfTestConfig, TurnTiming};
use crate::error::CaptureError;
use crate::ledger::{MessageLedger, TargetSelectors};
use crate::types::{MessageBlock, Role, Snapshot};

/// Characters of the message that must show up in the textbox before Enter
const VERIFY_PREFIX_CHARS: usize = 10;

// ========== TurnState ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    AwaitingFirstDelta,
    Streaming,
    Finalizing,
    Done,
    TimedOut,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Done | TurnState::TimedOut | TurnState::Failed)
    }
}

// ========== Options ==========

/// Cadence and deadline of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimits {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Deltas buffered between the poll worker and the consumer
    pub buffer_capacity: usize,
}

impl TurnLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<&TurnTiming> for TurnLimits {
    fn from(timing: &TurnTiming) -> Self {
        Self {
            poll_interval: timing.poll_interval(),
            timeout: timing.timeout(),
            buffer_capacity: timing.buffer_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub stable_threshold: u32,
    pub textbox_wait: Duration,
    pub submit_attempts: u32,
    /// Pause between the textbox appearing and the first attempt
    pub submit_settle: Duration,
    pub submit_retry_delay: Duration,
    pub continuous_interval: Duration,
    pub error_backoff: Duration,
    pub self_test: SelfTestConfig,
    /// Ledger blocks already on the page when a turn starts. Off, the ledger
    /// starts at the pre-send counts and only the new exchange is written.
    pub record_history: bool,
    pub normalizer: Normalizer,
    pub target_selectors: TargetSelectors,
}

impl SessionOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            stable_threshold: config.stable_threshold,
            textbox_wait: config.textbox_wait(),
            submit_attempts: config.submit_attempts,
            submit_settle: Duration::from_secs(1),
            submit_retry_delay: Duration::from_secs(1),
            continuous_interval: Duration::from_millis(config.continuous.poll_interval_ms.max(1)),
            error_backoff: Duration::from_millis(config.continuous.error_backoff_ms),
            self_test: config.self_test.clone(),
            record_history: true,
            normalizer: Normalizer::with_prefixes(config.boilerplate_prefixes.iter().cloned()),
            target_selectors: TargetSelectors {
                user_messages: config.selectors.user_messages.clone(),
                ai_messages: config.selectors.assistant_messages.clone(),
            },
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

// ========== DeltaStream ==========

/// Worker → consumer hand-off
#[derive(Debug)]
enum StreamEvent {
    Delta(Delta),
    Done(String),
    Failed(CaptureError),
}

/// Lazy, finite, non-restartable sequence of deltas for one turn.
///
/// Yields `Ok(delta)` items in poll order. Ends with `None` after success or
/// with one `Err` item on failure.
#[derive(Debug)]
pub struct DeltaStream {
    rx: mpsc::Receiver<StreamEvent>,
    finished: bool,
    final_text: Option<String>,
}

impl DeltaStream {
    /// Final canonical text, once the stream ended successfully
    pub fn final_text(&self) -> Option<&str> {
        self.final_text.as_deref()
    }
}

impl Stream for DeltaStream {
    type Item = Result<Delta, CaptureError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let item = match ready!(self.rx.poll_recv(cx)) {
            Some(StreamEvent::Delta(delta)) => Some(Ok(delta)),
            Some(StreamEvent::Done(text)) => {
                self.finished = true;
                self.final_text = Some(text);
                None
            }
            Some(StreamEvent::Failed(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                Some(Err(CaptureError::Fatal(
                    "stream worker exited without a result".to_string(),
                )))
            }
        };
        Poll::Ready(item)
    }
}

// ========== Turn bookkeeping ==========

/// Page state right before the send
#[derive(Debug, Clone)]
struct Baseline {
    assistant_count: usize,
    last_assistant: String,
    loading_text: String,
}

impl Baseline {
    fn capture(snapshot: &Snapshot, normalizer: &Normalizer) -> Self {
        Self {
            assistant_count: snapshot.assistant.len(),
            last_assistant: normalizer.normalize(snapshot.last_assistant_text()),
            loading_text: snapshot.loading_text.clone(),
        }
    }

    /// Whether this poll still shows pre-send content
    fn is_idle(&self, snapshot: &Snapshot, latest: &str) -> bool {
        if !snapshot.loading_text.is_empty() {
            snapshot.loading_text == self.loading_text
        } else {
            snapshot.assistant.len() <= self.assistant_count && latest == self.last_assistant
        }
    }
}

struct Turn {
    baseline: Baseline,
    tracker: StreamTracker,
    /// Accumulated text as seen by a stream consumer
    emitted: String,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct PollStep {
    delta: Option<Delta>,
    finished: Option<String>,
}

enum SubmitOutcome {
    Sent,
    NoTextbox,
    NotVerified,
}

async fn emit(sink: Option<&mpsc::Sender<StreamEvent>>, delta: Delta) -> Result<(), CaptureError> {
    if let Some(tx) = sink {
        tx.send(StreamEvent::Delta(delta))
            .await
            .map_err(|_| CaptureError::Fatal("stream consumer went away".to_string()))?;
    }
    Ok(())
}

// ========== ConversationSession ==========

pub struct ConversationSession {
    id: String,
    page: Arc<dyn ChatPage>,
    endpoint: String,
    ledger: MessageLedger,
    options: SessionOptions,
    running: Arc<AtomicBool>,
    state: TurnState,
    loops: u64,
    /// Per assistant index, for continuous capture
    assistant_trackers: HashMap<usize, StreamTracker>,
    gate: Option<OwnedMutexGuard<()>>,
    ended: bool,
}

impl ConversationSession {
    /// Start a session on a borrowed page and write the session-start record
    pub async fn open(
        page: Arc<dyn ChatPage>,
        endpoint: impl Into<String>,
        ledger: MessageLedger,
        options: SessionOptions,
    ) -> Self {
        let session = Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            page,
            endpoint: endpoint.into(),
            ledger,
            options,
            running: Arc::new(AtomicBool::new(true)),
            state: TurnState::Idle,
            loops: 0,
            assistant_trackers: HashMap::new(),
            gate: None,
            ended: false,
        };

        let url = match session.page.url().await {
            Ok(url) => url,
            Err(e) => {
                warn!(session = %session.id, error = %e, "Failed to read page URL");
                "n/a".to_string()
            }
        };
        if let Some(log) = session.ledger.log() {
            if let Err(e) = log.append_session_start(&url, &session.endpoint, &session.options.target_selectors) {
                warn!(session = %session.id, error = %e, "Failed to write session start record");
            }
        }
        info!(session = %session.id, url = %url, endpoint = %session.endpoint, "Session opened");
        session
    }

    /// Share a shutdown flag; clearing it stops the loop at the next poll
    pub fn with_running(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    /// Keep a gate guard alive for the lifetime of the session
    pub fn hold(&mut self, guard: OwnedMutexGuard<()>) {
        self.gate = Some(guard);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn total_loops(&self) -> u64 {
        self.loops
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&mut self, next: TurnState) {
        if self.state != next {
            info!(session = %self.id, from = ?self.state, to = ?next, "Turn state");
            self.state = next;
        }
    }

    async fn snapshot(&self) -> Result<Snapshot, BrowserError> {
        let user = self.page.list_messages(Role::User).await?;
        let assistant = self.page.list_messages(Role::Assistant).await?;
        let loading_text = self.page.loading_indicator_text().await?;
        Ok(Snapshot {
            user,
            assistant,
            loading_text,
        })
    }

    // ===== Submit =====

    /// Enter `message` into the chat input and press Enter.
    ///
    /// Fails with `SendFailed` when the text cannot be verified as entered
    /// within the configured attempts.
    pub async fn submit(&self, message: &str) -> Result<(), CaptureError> {
        if let Err(e) = self.page.wait_for_textbox(self.options.textbox_wait).await {
            return Err(if e.is_connection() {
                e.into()
            } else {
                CaptureError::SendFailed(e.to_string())
            });
        }
        sleep(self.options.submit_settle).await;

        let prefix: String = message.chars().take(VERIFY_PREFIX_CHARS).collect();
        let mut last_error = "Failed to send message".to_string();

        for attempt in 1..=self.options.submit_attempts.max(1) {
            match self.try_submit(message, &prefix).await {
                Ok(SubmitOutcome::Sent) => {
                    info!(session = %self.id, attempt, sent_at = %Utc::now().to_rfc3339(), "Message sent");
                    return Ok(());
                }
                Ok(SubmitOutcome::NoTextbox) => last_error = "Chat textbox not found".to_string(),
                Ok(SubmitOutcome::NotVerified) => last_error = "Message not set in textbox".to_string(),
                Err(e) if e.is_connection() => return Err(e.into()),
                Err(e) => last_error = e.to_string(),
            }
            debug!(session = %self.id, attempt, reason = %last_error, "Submit attempt failed");
            sleep(self.options.submit_retry_delay).await;
        }

        warn!(session = %self.id, reason = %last_error, "Failed to send message");
        Err(CaptureError::SendFailed(last_error))
    }

    async fn try_submit(&self, message: &str, prefix: &str) -> Result<SubmitOutcome, BrowserError> {
        let Some(textbox) = self.page.find_textbox().await? else {
            return Ok(SubmitOutcome::NoTextbox);
        };

        self.page.focus_and_clear(&textbox).await?;
        self.page.set_value(&textbox, message).await?;
        let mut value = self.page.read_value(&textbox).await?;

        if !value.contains(prefix) {
            debug!(session = %self.id, selector = %textbox.selector, "Direct assignment not reflected, typing instead");
            self.page.focus_and_clear(&textbox).await?;
            self.page.insert_text(message).await?;
            value = self.page.read_value(&textbox).await?;
        }

        if !value.contains(prefix) {
            return Ok(SubmitOutcome::NotVerified);
        }
        self.page.press_enter().await?;
        Ok(SubmitOutcome::Sent)
    }

    // ===== Turns =====

    /// Send and block until the reply finalizes
    pub async fn send_and_wait(&mut self, message: &str, limits: &TurnLimits) -> Result<String, CaptureError> {
        self.run_turn(message, limits, None).await
    }

    /// Send on a dedicated worker and hand deltas over as they appear.
    ///
    /// The session moves into the worker and is dropped (writing its
    /// session-end record) when the turn ends.
    pub fn stream_response(mut self, message: String, limits: TurnLimits) -> DeltaStream {
        let (tx, rx) = mpsc::channel(limits.buffer_capacity.max(1));
        tokio::spawn(async move {
            let event = match self.run_turn(&message, &limits, Some(&tx)).await {
                Ok(text) => StreamEvent::Done(text),
                Err(e) => StreamEvent::Failed(e),
            };
            if tx.send(event).await.is_err() {
                debug!(session = %self.id, "Stream consumer gone before terminal event");
            }
        });
        DeltaStream {
            rx,
            finished: false,
            final_text: None,
        }
    }

    async fn run_turn(
        &mut self,
        message: &str,
        limits: &TurnLimits,
        sink: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<String, CaptureError> {
        if message.trim().is_empty() {
            return Err(CaptureError::EmptyInput);
        }

        self.set_state(TurnState::Sending);
        let result = self.drive_turn(message, limits, sink).await;
        match &result {
            Ok(text) => {
                info!(session = %self.id, len = text.len(), "Reply finalized");
                self.set_state(TurnState::Done);
            }
            Err(CaptureError::TimedOut(after)) => {
                warn!(session = %self.id, after = ?after, "Timed out waiting for reply");
                self.set_state(TurnState::TimedOut);
            }
            Err(e) => {
                error!(session = %self.id, kind = e.kind(), error = %e, "Turn failed");
                self.set_state(TurnState::Failed);
            }
        }
        result
    }

    async fn drive_turn(
        &mut self,
        message: &str,
        limits: &TurnLimits,
        sink: Option<&mpsc::Sender<StreamEvent>>,
    ) -> Result<String, CaptureError> {
        let snapshot = self.snapshot().await?;
        if self.options.record_history {
            self.record_user(&snapshot.user);
        } else {
            self.ledger.seek(Role::User, snapshot.user.len());
            self.ledger.seek(Role::Assistant, snapshot.assistant.len());
        }
        let baseline = Baseline::capture(&snapshot, &self.options.normalizer);
        debug!(
            session = %self.id,
            assistant_count = baseline.assistant_count,
            baseline_len = baseline.last_assistant.len(),
            "Baseline captured"
        );

        self.submit(message).await?;
        let mut turn = Turn {
            tracker: StreamTracker::new(baseline.last_assistant.clone()),
            baseline,
            emitted: String::new(),
            sent_at: Instant::now(),
        };
        self.set_state(TurnState::AwaitingFirstDelta);

        let detector = StabilityDetector::new(self.options.stable_threshold);
        let deadline = turn.sent_at + limits.timeout;

        loop {
            if !self.is_running() {
                return Err(CaptureError::Shutdown);
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::TimedOut(limits.timeout));
            }
            sleep(limits.poll_interval).await;
            self.loops += 1;

            let step = match self.poll_turn(&mut turn, &detector).await {
                Ok(step) => step,
                Err(e) => {
                    warn!(session = %self.id, error = %e, "Poll failed, retrying");
                    continue;
                }
            };

            if let Some(delta) = step.delta {
                emit(sink, delta).await?;
            }
            if let Some(text) = step.finished {
                if let Some(delta) = compute_delta(&turn.emitted, &text) {
                    debug!(session = %self.id, replace = delta.is_replace(), "Reconciling emitted text");
                    emit(sink, delta).await?;
                }
                return Ok(text);
            }
        }
    }

    async fn poll_turn(&mut self, turn: &mut Turn, detector: &StabilityDetector) -> Result<PollStep, CaptureError> {
        let snapshot = self.snapshot().await?;
        self.record_user(&snapshot.user);

        let raw = if snapshot.loading_text.is_empty() {
            snapshot.last_assistant_text()
        } else {
            snapshot.loading_text.as_str()
        };
        let latest = self.options.normalizer.normalize(raw);

        if latest.is_empty() || turn.baseline.is_idle(&snapshot, &latest) {
            let stop = self.page.is_stop_generating_visible().await?;
            turn.tracker.mark_stop_indicator(stop);
            return Ok(PollStep::default());
        }

        let stop = self.page.is_stop_generating_visible().await?;
        turn.tracker.mark_stop_indicator(stop);

        let mut step = PollStep::default();
        if turn.tracker.observe(&latest) {
            if self.state == TurnState::AwaitingFirstDelta {
                info!(
                    session = %self.id,
                    latency_ms = turn.sent_at.elapsed().as_millis() as u64,
                    "First token received"
                );
                self.set_state(TurnState::Streaming);
            }
            info!(session = %self.id, len = latest.len(), "Content update");
            step.delta = compute_delta(&turn.emitted, &latest);
            turn.emitted = latest;
        }

        if detector.should_finalize(&turn.tracker, stop) {
            step.finished = self.finalize(turn, &snapshot);
        }
        Ok(step)
    }

    /// Ledger visible user blocks; a failed write is retried on the next poll
    fn record_user(&mut self, visible: &[MessageBlock]) {
        if let Err(e) = self.ledger.record_observed(Role::User, visible) {
            warn!(session = %self.id, error = %e, "Failed to ledger user messages");
        }
    }

    /// Ledger the reply. `None` while the message list has not caught up.
    ///
    /// A failed write is logged; the reply is still returned.
    fn finalize(&mut self, turn: &Turn, snapshot: &Snapshot) -> Option<String> {
        let last = snapshot.assistant.last()?;
        let text = self.options.normalizer.normalize(&last.content);
        let is_new = snapshot.assistant.len() > turn.baseline.assistant_count || text != turn.baseline.last_assistant;
        if text.is_empty() || !is_new {
            return None;
        }

        self.set_state(TurnState::Finalizing);
        let next = self.ledger.next_index(Role::Assistant);
        let mut fresh: Vec<MessageBlock> = snapshot.assistant.get(next..).map(<[_]>::to_vec).unwrap_or_default();
        match fresh.last_mut() {
            Some(block) => block.content = text.clone(),
            None => fresh.push(MessageBlock {
                content: text.clone(),
                html_snippet: last.html_snippet.clone(),
                element_location: last.element_location,
            }),
        }
        if let Err(e) = self.ledger.record(Role::Assistant, next, &fresh) {
            error!(session = %self.id, index = next, error = %e, "Failed to ledger reply");
        }
        Some(text)
    }

    // ===== Continuous capture =====

    /// One capture pass: ledger new user blocks and finished assistant blocks
    pub async fn capture_messages(&mut self) -> Result<usize, CaptureError> {
        let snapshot = self.snapshot().await?;
        let mut written = self.ledger.record_observed(Role::User, &snapshot.user)?;

        if !snapshot.loading_text.is_empty() {
            return Ok(written);
        }

        let detector = StabilityDetector::new(self.options.self_test.stable_threshold);
        let next = self.ledger.next_index(Role::Assistant);
        let last_index = snapshot.assistant.len().saturating_sub(1);
        let mut ready = 0;

        for (index, block) in snapshot.assistant.iter().enumerate().skip(next) {
            let canonical = self.options.normalizer.normalize(&block.content);
            let tracker = self
                .assistant_trackers
                .entry(index)
                .or_insert_with(|| StreamTracker::new(""));
            tracker.observe(&canonical);

            let readiness = detector.readiness(tracker, &canonical);
            if index < last_index || readiness.is_ready() {
                ready += 1;
            } else {
                debug!(
                    session = %self.id,
                    index,
                    len = canonical.len(),
                    stable_polls = tracker.stable_unchanged_polls,
                    "Assistant message still streaming"
                );
                break;
            }
        }

        if ready > 0 {
            written += self.ledger.record(Role::Assistant, next, &snapshot.assistant[next..next + ready])?;
            self.assistant_trackers.retain(|index, _| *index >= next + ready);
        }
        Ok(written)
    }

    /// Send the self-test message and wait until both sides were captured
    pub async fn run_self_test(&mut self) -> Result<bool, CaptureError> {
        let start = self.ledger.stats();
        let message = self.options.self_test.message.clone();
        info!(session = %self.id, "Running capture self-test");
        self.submit(&message).await?;

        let deadline = Instant::now() + Duration::from_secs(self.options.self_test.timeout_secs);
        while Instant::now() < deadline {
            if !self.is_running() {
                return Err(CaptureError::Shutdown);
            }
            sleep(self.options.continuous_interval).await;
            self.loops += 1;
            if let Err(e) = self.capture_messages().await {
                warn!(session = %self.id, error = %e, "Self-test capture failed");
                continue;
            }
            let now = self.ledger.stats();
            if now.total_user > start.total_user && now.total_assistant > start.total_assistant {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Capture until the running flag is cleared
    pub async fn run_capture(&mut self) -> Result<(), CaptureError> {
        if self.options.self_test.enabled {
            match self.run_self_test().await {
                Ok(true) => info!(session = %self.id, "Self-test passed"),
                Ok(false) => warn!(session = %self.id, "Self-test did not capture both messages"),
                Err(CaptureError::Shutdown) => return Ok(()),
                Err(e) => warn!(session = %self.id, error = %e, "Self-test failed"),
            }
        }

        info!(session = %self.id, interval = ?self.options.continuous_interval, "Continuous capture started");
        while self.is_running() {
            match self.capture_messages().await {
                Ok(0) => {}
                Ok(n) => debug!(session = %self.id, count = n, "Captured messages"),
                Err(e) => {
                    warn!(session = %self.id, error = %e, "Capture pass failed");
                    sleep(self.options.error_backoff).await;
                }
            }
            self.loops += 1;
            sleep(self.options.continuous_interval).await;
        }
        info!(session = %self.id, loops = self.loops, "Continuous capture stopped");
        Ok(())
    }

    /// Write the session-end record; later calls are no-ops
    pub fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        let stats = self.ledger.stats();
        if let Some(log) = self.ledger.log() {
            if let Err(e) = log.append_session_end(&stats, self.loops) {
                warn!(session = %self.id, error = %e, "Failed to write session end record");
            }
        }
        info!(
            session = %self.id,
            user = stats.total_user,
            assistant = stats.total_assistant,
            loops = self.loops,
            "Session ended"
        );
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.finish();
    }
}
