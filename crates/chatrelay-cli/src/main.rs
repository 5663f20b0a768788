//! chatrelay-cli - send one message through a running chatrelay daemon
//!
//! Usage:
//!   chatrelay-cli "What is on my calendar today?"
//!   chatrelay-cli --stream "Draft a status update" --host localhost --port 9230

use std::io::{stdout, Write};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 9230;

#[derive(Parser, Debug)]
#[command(name = "chatrelay-cli")]
#[command(about = "Send a message through the chatrelay daemon")]
#[command(version)]
struct Args {
    /// Message to send
    message: String,

    /// Print the reply as it streams in
    #[arg(short, long)]
    stream: bool,

    /// WebSocket server host
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// WebSocket server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Reply deadline in seconds (blocking mode only)
    #[arg(short, long)]
    timeout: Option<u64>,
}

/// Requests to the daemon
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request<'a> {
    Send {
        message: &'a str,
        #[serde(rename = "timeoutSecs", skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    OpenStream {
        message: &'a str,
    },
}

/// Replies on `/send`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Response {
        response: String,
    },
    StreamId {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    Error {
        #[serde(default)]
        kind: Option<String>,
        error: String,
    },
}

/// Frames on `/events/<id>`
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Start,
    Data {
        content: String,
        #[serde(default)]
        replace: bool,
    },
    End,
    Error {
        error: String,
    },
}

/// Tracks what has been printed so a replace can redraw it
#[derive(Debug, Default)]
struct Printed {
    text: String,
}

impl Printed {
    /// Text to write for a data frame
    fn apply(&mut self, content: &str, replace: bool) -> String {
        if replace {
            self.text = content.to_string();
            format!("\n\x1b[90m[reply revised]\x1b[0m\n{}", content)
        } else {
            self.text.push_str(content);
            content.to_string()
        }
    }
}

async fn request(base: &str, req: &Request<'_>) -> Result<Reply> {
    let (ws_stream, _) = connect_async(format!("{}/send", base))
        .await
        .context("Failed to connect to chatrelay daemon")?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let json = serde_json::to_string(req)?;
    ws_tx.send(WsMessage::Text(json.into())).await?;

    while let Some(msg) = ws_rx.next().await {
        match msg? {
            WsMessage::Text(text) => {
                let reply = serde_json::from_str::<Reply>(&text).with_context(|| format!("Unexpected reply: {}", text))?;
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                return Ok(reply);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(anyhow!("Connection closed before a reply arrived"))
}

async fn stream(base: &str, stream_id: &str) -> Result<()> {
    let (ws_stream, _) = connect_async(format!("{}/events/{}", base, stream_id))
        .await
        .context("Failed to attach to stream")?;
    let (_ws_tx, mut ws_rx) = ws_stream.split();

    let mut printed = Printed::default();
    while let Some(msg) = ws_rx.next().await {
        let text = match msg? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<Frame>(&text)? {
            Frame::Start => {}
            Frame::Data { content, replace } => {
                print!("{}", printed.apply(&content, replace));
                stdout().flush()?;
            }
            Frame::End => {
                if printed.text.is_empty() {
                    eprint!("\x1b[90m(empty reply)\x1b[0m");
                }
                println!();
                return Ok(());
            }
            Frame::Error { error } => {
                println!();
                bail!(error);
            }
        }
    }
    bail!("Stream closed without an end frame")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let base = format!("ws://{}:{}", args.host, args.port);

    let req = if args.stream {
        Request::OpenStream { message: &args.message }
    } else {
        Request::Send {
            message: &args.message,
            timeout_secs: args.timeout,
        }
    };

    let result = match request(&base, &req).await {
        Ok(Reply::Response { response }) => {
            println!("{}", response);
            Ok(())
        }
        Ok(Reply::StreamId { stream_id }) => stream(&base, &stream_id).await,
        Ok(Reply::Error { kind, error }) => Err(anyhow!("{} ({})", error, kind.unwrap_or_else(|| "error".to_string()))),
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("\x1b[31mError: {}\x1b[0m", e);
        std::process::exit(1);
    }
    Ok(())
}
