//! Capture engine: normalize, detect stability, compute deltas, drive turns

pub mod delta;
pub mod normalizer;
pub mod session;
pub mod stability;

#[cfg(test)]
pub(crate) mod scripted;

pub use delta::{compute_delta, Delta, DeltaKind};
pub use normalizer::{normalize, Normalizer};
pub use session::{ConversationSession, DeltaStream, SessionOptions, TurnLimits, TurnState};
pub use stability::{looks_complete, Readiness, StabilityDetector, StreamTracker};
