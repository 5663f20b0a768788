//! WebSocket transport
//!
//! - Requests: `ws://host:port/send`
//! - Stream events: `ws://host:port/events/<streamId>`
//!
//! Messages on `/send` (client → server):
//! - { type: "send", message: string, timeoutSecs?: number }
//! - { type: "open_stream", message: string }
//!
//! Replies (server → client):
//! - { type: "response", response: string }
//! - { type: "stream_id", streamId: string }
//! - { type: "error", kind: string, error: string }
//!
//! `/events/<streamId>` is single-use and sends start/data/end/error frames.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chatrelay_core::{CaptureError, ChatRelay, StreamFrame, StreamRegistry};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{Request as WsRequest, Response as WsResponse};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{error, info, warn};

const INVALID_STREAM_ID: &str = "Invalid or expired stream id.";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// WebSocket server options
pub struct RelayServerOptions {
    pub port: u16,
    pub relay: Arc<ChatRelay>,
    /// Lifetime of an unconsumed stream id
    pub stream_ttl: Duration,
}

pub struct RelayServer {
    port: u16,
    relay: Arc<ChatRelay>,
    streams: Arc<StreamRegistry<String>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
    Send,
    Events { stream_id: &'a str },
    Invalid,
}

fn parse_route(path: &str) -> Route<'_> {
    if path == "/send" {
        return Route::Send;
    }
    if let Some(stream_id) = path.strip_prefix("/events/") {
        if !stream_id.is_empty() && !stream_id.contains('/') {
            return Route::Events { stream_id };
        }
    }
    Route::Invalid
}

fn close_frame(code: u16, reason: impl Into<String>) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into().into(),
    }
}

async fn send_json<S: Serialize>(ws_tx: &mut WsSink, msg: &S) -> anyhow::Result<()> {
    let text = serde_json::to_string(msg)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}

/// Requests on `/send`
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientRequest {
    Send {
        message: String,
        #[serde(rename = "timeoutSecs", default)]
        timeout_secs: Option<u64>,
    },
    OpenStream {
        message: String,
    },
}

/// Replies on `/send`
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerReply {
    Response {
        response: String,
    },
    StreamId {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    Error {
        kind: String,
        error: String,
    },
}

impl From<&CaptureError> for ServerReply {
    fn from(e: &CaptureError) -> Self {
        ServerReply::Error {
            kind: e.kind().to_string(),
            error: e.to_string(),
        }
    }
}

impl RelayServer {
    pub fn new(options: RelayServerOptions) -> Self {
        Self {
            port: options.port,
            relay: options.relay,
            streams: Arc::new(StreamRegistry::new(options.stream_ttl)),
            shutdown_tx: None,
        }
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;

        info!(port = local.port(), "Relay WebSocket server started");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let relay = Arc::clone(&self.relay);
        let streams = Arc::clone(&self.streams);

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let relay = Arc::clone(&relay);
                                let streams = Arc::clone(&streams);
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(stream, addr, relay, streams).await {
                                        error!(?e, ?addr, "WebSocket connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(?e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Relay WebSocket server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local)
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let purged = self.streams.purge_expired().await;
        info!(purged, "Relay WebSocket server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<ChatRelay>,
        streams: Arc<StreamRegistry<String>>,
    ) -> anyhow::Result<()> {
        let path_cell = Arc::new(StdMutex::new(String::new()));
        let path_cell2 = Arc::clone(&path_cell);

        let ws_stream = accept_hdr_async(stream, move |req: &WsRequest, resp: WsResponse| {
            if let Ok(mut path) = path_cell2.lock() {
                *path = req.uri().path().to_string();
            }
            Ok(resp)
        })
        .await?;

        let path = path_cell
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|_| "/".to_string());

        match parse_route(&path) {
            Route::Send => Self::handle_requests(addr, ws_stream, relay, streams).await,
            Route::Events { stream_id } => Self::handle_events(addr, ws_stream, relay, streams, stream_id).await,
            Route::Invalid => {
                let (mut ws_tx, _ws_rx) = ws_stream.split();
                let _ = ws_tx
                    .send(Message::Close(Some(close_frame(
                        4000,
                        "Invalid URL. Use /send or /events/<streamId>",
                    ))))
                    .await;
                warn!(?addr, %path, "Invalid WebSocket URL");
                Ok(())
            }
        }
    }

    async fn handle_requests(
        addr: SocketAddr,
        ws_stream: WebSocketStream<TcpStream>,
        relay: Arc<ChatRelay>,
        streams: Arc<StreamRegistry<String>>,
    ) -> anyhow::Result<()> {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(?addr, "Client connected");

        while let Some(msg) = ws_rx.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(?addr, error = %e, "WebSocket error");
                    break;
                }
            };

            let reply = match serde_json::from_str::<ClientRequest>(&text) {
                Ok(ClientRequest::Send { message, timeout_secs }) => {
                    let timeout = timeout_secs.map(Duration::from_secs);
                    match relay.send_and_wait(&message, timeout).await {
                        Ok(response) => ServerReply::Response { response },
                        Err(e) => {
                            warn!(?addr, kind = e.kind(), error = %e, "Send failed");
                            ServerReply::from(&e)
                        }
                    }
                }
                Ok(ClientRequest::OpenStream { message }) => {
                    let message = message.trim();
                    if message.is_empty() {
                        ServerReply::from(&CaptureError::EmptyInput)
                    } else {
                        let stream_id = streams.register(message.to_string()).await;
                        info!(?addr, stream_id = %stream_id, "Stream registered");
                        ServerReply::StreamId { stream_id }
                    }
                }
                Err(e) => ServerReply::Error {
                    kind: "bad_request".to_string(),
                    error: format!("Invalid request: {}", e),
                },
            };

            if send_json(&mut ws_tx, &reply).await.is_err() {
                break;
            }
        }

        info!(?addr, "Client disconnected");
        Ok(())
    }

    async fn handle_events(
        addr: SocketAddr,
        ws_stream: WebSocketStream<TcpStream>,
        relay: Arc<ChatRelay>,
        streams: Arc<StreamRegistry<String>>,
        stream_id: &str,
    ) -> anyhow::Result<()> {
        let (mut ws_tx, _ws_rx) = ws_stream.split();

        let message = match streams.take(stream_id).await {
            Some(m) => m,
            None => {
                warn!(?addr, stream_id, "Unknown stream id");
                let frame = StreamFrame::Error {
                    error: INVALID_STREAM_ID.to_string(),
                };
                let _ = send_json(&mut ws_tx, &frame).await;
                let _ = ws_tx.send(Message::Close(Some(close_frame(1000, "done")))).await;
                return Ok(());
            }
        };

        info!(?addr, stream_id, "Stream consumer attached");
        let mut bridge = relay.open_stream(&message).await;
        let mut frames = 0usize;
        while let Some(frame) = bridge.next_frame().await {
            frames += 1;
            if let Err(e) = send_json(&mut ws_tx, &frame).await {
                // dropping the bridge stops the producer
                warn!(?addr, stream_id, error = %e, "Stream consumer went away");
                return Ok(());
            }
        }

        let _ = ws_tx.send(Message::Close(Some(close_frame(1000, "done")))).await;
        info!(?addr, stream_id, frames, "Stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::RelayConfig;
    use tokio_tungstenite::connect_async;

    #[test]
    fn test_parse_route() {
        assert_eq!(parse_route("/send"), Route::Send);
        assert_eq!(parse_route("/events/abc123"), Route::Events { stream_id: "abc123" });
        assert_eq!(parse_route("/events/"), Route::Invalid);
        assert_eq!(parse_route("/events/a/b"), Route::Invalid);
        assert_eq!(parse_route("/"), Route::Invalid);
    }

    #[test]
    fn test_request_parsing() {
        let req: ClientRequest = serde_json::from_str(r#"{"type":"send","message":"hi","timeoutSecs":30}"#).unwrap();
        assert_eq!(
            req,
            ClientRequest::Send {
                message: "hi".into(),
                timeout_secs: Some(30)
            }
        );
        let req: ClientRequest = serde_json::from_str(r#"{"type":"open_stream","message":"hi"}"#).unwrap();
        assert_eq!(req, ClientRequest::OpenStream { message: "hi".into() });
    }

    #[test]
    fn test_reply_shapes() {
        let json = serde_json::to_value(ServerReply::StreamId {
            stream_id: "abc".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "stream_id");
        assert_eq!(json["streamId"], "abc");

        let json = serde_json::to_value(ServerReply::from(&CaptureError::EmptyInput)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "empty_input");
        assert_eq!(json["error"], "Message cannot be empty.");
    }

    async fn start_server() -> (RelayServer, SocketAddr) {
        let config = RelayConfig {
            cdp_endpoint: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let mut server = RelayServer::new(RelayServerOptions {
            port: 0,
            relay: Arc::new(ChatRelay::new(config)),
            stream_ttl: Duration::from_secs(60),
        });
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn next_json(
        rx: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    ) -> serde_json::Value {
        loop {
            match rx.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_stream_id() {
        let (mut server, addr) = start_server().await;
        let url = format!("ws://127.0.0.1:{}/events/doesnotexist", addr.port());
        let (ws, _) = connect_async(url).await.unwrap();
        let (_tx, mut rx) = ws.split();

        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error"], INVALID_STREAM_ID);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stream_id_is_single_use() {
        let (mut server, addr) = start_server().await;
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/send", addr.port())).await.unwrap();
        let (mut tx, mut rx) = ws.split();

        tx.send(Message::Text(r#"{"type":"open_stream","message":"  "}"#.to_string()))
            .await
            .unwrap();
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["kind"], "empty_input");

        tx.send(Message::Text(r#"{"type":"open_stream","message":"hello"}"#.to_string()))
            .await
            .unwrap();
        let reply = next_json(&mut rx).await;
        assert_eq!(reply["type"], "stream_id");
        let id = reply["streamId"].as_str().unwrap().to_string();

        // browser is unreachable: start, then a connection error
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/events/{}", addr.port(), id)).await.unwrap();
        let (_etx, mut erx) = ws.split();
        assert_eq!(next_json(&mut erx).await["type"], "start");
        let end = next_json(&mut erx).await;
        assert_eq!(end["type"], "error");
        assert!(end["error"].as_str().unwrap().contains("Cannot reach chat page"));

        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/events/{}", addr.port(), id)).await.unwrap();
        let (_etx, mut erx) = ws.split();
        assert_eq!(next_json(&mut erx).await["error"], INVALID_STREAM_ID);
        server.stop().await;
    }
}
