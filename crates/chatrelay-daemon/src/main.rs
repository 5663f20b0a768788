//! chatrelay - chat page relay daemon
//!
//! Usage:
//!   chatrelay                 # serve the WebSocket API (default)
//!   chatrelay serve --port 9230
//!   chatrelay capture         # ledger the conversation until Ctrl+C

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chatrelay_core::browser::CdpBrowser;
use chatrelay_core::config::default_home;
use chatrelay_core::{ChatRelay, RelayConfig};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use server::{RelayServer, RelayServerOptions};

#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(about = "Relay a live browser chat page as a send/stream API")]
#[command(version)]
struct Cli {
    /// Config file (default: $CHATRELAY_CONFIG or ~/.chatrelay/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Chrome DevTools endpoint, e.g. http://127.0.0.1:9222
    #[arg(long, global = true)]
    cdp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve /send and /events/<id> over WebSocket
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Continuously ledger the open conversation into the capture log
    Capture {
        /// Skip the startup self-test message
        #[arg(long)]
        no_self_test: bool,

        /// Capture log file (JSONL)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("CHATRELAY_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn load_config(cli: &Cli) -> Result<RelayConfig> {
    load_config_with(cli, |key| std::env::var(key).ok())
}

/// Config file from `--config` or `CHATRELAY_CONFIG`, then `CHATRELAY_*`
/// overrides, then CLI flags
fn load_config_with<F>(cli: &Cli, lookup: F) -> Result<RelayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let path = cli.config.clone().or_else(|| lookup("CHATRELAY_CONFIG").map(PathBuf::from));
    let mut config = match path {
        Some(path) => RelayConfig::load(&path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RelayConfig::load(&default_home().join("config.yaml")).context("Failed to load config")?,
    };
    config.apply_overrides(lookup);
    if let Some(endpoint) = &cli.cdp_endpoint {
        config.cdp_endpoint = endpoint.clone();
    }
    Ok(config)
}

/// Clear `running` on SIGINT/SIGTERM
fn spawn_signal_listener(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Cannot install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received");
        running.store(false, Ordering::SeqCst);
    });
}

async fn serve(config: RelayConfig, port: Option<u16>, running: Arc<AtomicBool>) -> Result<()> {
    let port = port.unwrap_or(config.port);
    let stream_ttl = config.stream_token_ttl();
    let relay = Arc::new(ChatRelay::new(config).with_running(Arc::clone(&running)));

    let mut server = RelayServer::new(RelayServerOptions {
        port,
        relay,
        stream_ttl,
    });
    let addr = server
        .start()
        .await
        .with_context(|| format!("Failed to bind WebSocket port {}", port))?;
    info!(addr = %addr, "chatrelay listening");

    let mut tick = tokio::time::interval(std::time::Duration::from_millis(250));
    while running.load(Ordering::SeqCst) {
        tick.tick().await;
    }

    server.stop().await;
    Ok(())
}

async fn capture(mut config: RelayConfig, no_self_test: bool, output: Option<PathBuf>, running: Arc<AtomicBool>) -> Result<()> {
    if no_self_test {
        config.self_test.enabled = false;
    }
    if let Some(path) = output {
        config.capture_log = path;
    }
    info!(log = %config.capture_log.display(), endpoint = %config.cdp_endpoint, "Starting continuous capture");

    let browser = CdpBrowser::connect(&config)
        .await
        .with_context(|| format!("Chrome DevTools not reachable at {}", config.cdp_endpoint))?;
    let relay = ChatRelay::with_browser(config, Arc::new(browser)).with_running(running);
    let mut session = relay.open_session().await.context("Failed to open chat page")?;
    let result = session.run_capture().await;
    session.finish();
    result.context("Capture loop failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = default_home();
    std::fs::create_dir_all(&home).ok();

    // stderr + daily-rotated file
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "chatrelay.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "DAEMON PANIC: {}", payload);
    }));

    let config = load_config(&cli)?;
    let running = Arc::new(AtomicBool::new(true));
    spawn_signal_listener(Arc::clone(&running));

    let result = match cli.command {
        Some(Command::Capture { no_self_test, output }) => capture(config, no_self_test, output, running).await,
        Some(Command::Serve { port }) => serve(config, port, running).await,
        None => serve(config, None, running).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "chatrelay exited with error");
    }
    info!("chatrelay stopped");
    result
}
