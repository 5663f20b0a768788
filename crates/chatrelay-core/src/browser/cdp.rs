//! CDP client - JSON-RPC over the DevTools WebSocket
//!
//! Commands carry auto-incrementing ids; a background reader task routes each
//! response to the waiting caller. Browser events are only traced: the
//! capture engine polls instead of subscribing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::error::BrowserError;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type CommandResult = Result<Value, BrowserError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<CommandResult>>>>;

// ========== Wire types ==========

#[derive(Debug, Serialize)]
struct CdpCommand<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct CdpResponseError {
    code: i64,
    message: String,
}

/// Classified inbound message
#[derive(Debug)]
enum Incoming {
    Response { id: u64, result: CommandResult },
    Event { method: String },
    Ignored,
}

fn parse_incoming(text: &str) -> Incoming {
    let json: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Unparseable CDP message");
            return Incoming::Ignored;
        }
    };

    if let Some(id) = json.get("id").and_then(Value::as_u64) {
        let error = json
            .get("error")
            .and_then(|e| serde_json::from_value::<CdpResponseError>(e.clone()).ok());
        let result = match error {
            Some(err) => Err(BrowserError::Cdp {
                code: err.code,
                message: err.message,
            }),
            None => Ok(json.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Incoming::Response { id, result };
    }

    match json.get("method").and_then(Value::as_str) {
        Some(method) => Incoming::Event {
            method: method.to_string(),
        },
        None => Incoming::Ignored,
    }
}

// ========== CdpClient ==========

pub struct CdpClient {
    url: String,
    next_id: AtomicU64,
    pending: PendingMap,
    writer: Mutex<SplitSink<WsStream, Message>>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a target's `webSocketDebuggerUrl`
    pub async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| BrowserError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: e.to_string(),
            })?;
        let (writer, reader) = ws.split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        info!(url = %ws_url, "CDP connected");
        Ok(Self {
            url: ws_url.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            connected,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// False once the socket closed or failed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        self.send_with_timeout(method, params, DEFAULT_COMMAND_TIMEOUT).await
    }

    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BrowserError> {
        if !self.is_connected() {
            return Err(BrowserError::ConnectionFailed {
                url: self.url.clone(),
                reason: "socket closed".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&CdpCommand { id, method, params }).map_err(|e| BrowserError::Protocol {
            detail: format!("failed to encode {method}: {e}"),
        })?;

        // register before sending so a fast response is never missed
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let sent = self.writer.lock().await.send(Message::Text(json.into())).await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(BrowserError::ConnectionFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            });
        }
        debug!(id, method, "CDP command sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrowserError::ConnectionFailed {
                url: self.url.clone(),
                reason: "connection dropped while waiting for response".to_string(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(BrowserError::Timeout {
                    method: method.to_string(),
                    duration: timeout,
                })
            }
        }
    }

    async fn read_loop(
        mut reader: SplitStream<WsStream>,
        pending: PendingMap,
        connected: Arc<AtomicBool>,
    ) {
        while let Some(msg) = reader.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t.to_string(),
                Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                    Ok(s) => s,
                    Err(_) => continue,
                },
                Ok(Message::Close(_)) => {
                    info!("CDP socket closed by browser");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "CDP socket read failed");
                    break;
                }
            };

            match parse_incoming(&text) {
                Incoming::Response { id, result } => match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!(id, "Response for unknown command"),
                },
                Incoming::Event { method } => trace!(method = %method, "CDP event"),
                Incoming::Ignored => {}
            }
        }

        connected.store(false, Ordering::SeqCst);
        // waiting callers see a closed channel
        pending.lock().await.clear();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
