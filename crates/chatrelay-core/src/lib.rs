//! chatrelay-core - incremental capture of a live chat page
//!
//! Polls a chat web page over Chrome DevTools, detects when the assistant's
//! reply stops growing and exposes it as a blocking call or a delta stream.
//! Every captured message is ledgered once per page position into an
//! append-only JSONL log.
//!
//! # Example
//!
//! ```no_run
//! use chatrelay_core::{ChatRelay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let relay = ChatRelay::new(RelayConfig::load_default()?);
//!     let reply = relay.send_and_wait("Summarize today's meetings", None).await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod browser;
pub mod capture;
pub mod config;
pub mod error;
pub mod ledger;
pub mod registry;
pub mod relay;
pub mod types;

pub use bridge::{StreamBridge, StreamFrame};
pub use capture::{ConversationSession, Delta, DeltaKind, DeltaStream, TurnLimits, TurnState};
pub use config::RelayConfig;
pub use error::CaptureError;
pub use ledger::{CaptureLog, MessageLedger};
pub use registry::StreamRegistry;
pub use relay::ChatRelay;
pub use types::{MessageBlock, Role, Snapshot};
