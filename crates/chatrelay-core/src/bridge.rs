//! Stream Bridge - pull-based framing of a delta stream
//!
//! Every bridge yields exactly one `Start`, then one `Data` per delta in
//! order, then exactly one `End` or `Error`, then nothing. The producer runs
//! on its own worker; the consumer pulls at its own pace through the bounded
//! channel behind the stream.

use futures_util::{Stream, StreamExt};
use serde::Serialize;

use crate::capture::{Delta, DeltaStream};
use crate::error::CaptureError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Start,
    Data {
        content: String,
        /// Content supersedes everything sent before
        replace: bool,
    },
    End,
    Error {
        error: String,
    },
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::End | StreamFrame::Error { .. })
    }
}

impl From<Delta> for StreamFrame {
    fn from(delta: Delta) -> Self {
        StreamFrame::Data {
            replace: delta.is_replace(),
            content: delta.text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Streaming,
    Closed,
}

pub struct StreamBridge<S = DeltaStream> {
    source: Option<S>,
    failure: Option<String>,
    phase: Phase,
}

impl<S> StreamBridge<S>
where
    S: Stream<Item = Result<Delta, CaptureError>> + Unpin,
{
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            failure: None,
            phase: Phase::Fresh,
        }
    }

    /// A bridge whose producer never started: `Start`, then `Error`
    pub fn failed(error: &CaptureError) -> Self {
        Self {
            source: None,
            failure: Some(error.to_string()),
            phase: Phase::Fresh,
        }
    }

    /// Next frame, `None` once the terminal frame was delivered
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        match self.phase {
            Phase::Closed => None,
            Phase::Fresh => {
                self.phase = Phase::Streaming;
                Some(StreamFrame::Start)
            }
            Phase::Streaming => {
                let frame = match self.source.as_mut() {
                    None => StreamFrame::Error {
                        error: self
                            .failure
                            .take()
                            .unwrap_or_else(|| "stream unavailable".to_string()),
                    },
                    Some(source) => match source.next().await {
                        Some(Ok(delta)) => return Some(delta.into()),
                        Some(Err(e)) => StreamFrame::Error { error: e.to_string() },
                        None => StreamFrame::End,
                    },
                };
                self.close();
                Some(frame)
            }
        }
    }

    fn close(&mut self) {
        self.phase = Phase::Closed;
        // dropping the source lets the worker see a closed channel
        self.source = None;
    }
}
