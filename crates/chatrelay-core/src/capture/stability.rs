//! Stability Detector - decides when a rendering reply has settled
//!
//! Combines three signals:
//! - a stable-length counter over the last few polls
//! - a punctuation heuristic for "looks finished"
//! - the page's stop-generating affordance

use std::collections::VecDeque;

/// Length history kept per tracked stream
const LENGTH_HISTORY: usize = 5;

/// Default unchanged polls before a reply counts as stable
pub const DEFAULT_STABLE_THRESHOLD: u32 = 6;

/// Threshold used by the startup self-test and continuous capture
pub const SELF_TEST_STABLE_THRESHOLD: u32 = 3;

/// Shortest text the completeness heuristic will accept
pub const DEFAULT_COMPLETE_MIN_CHARS: usize = 10;

const COMPLETE_ENDINGS: &[char] = &['.', '!', '?', ':', ')', '"', '`'];

/// Trailing character left behind when the "Edit in a page" affordance is
/// only partially rendered
const TRUNCATION_ARTIFACT: char = 'E';

// ========== Completeness heuristic ==========

/// Punctuation heuristic with the default length floor
pub fn looks_complete(text: &str) -> bool {
    looks_complete_with(text, DEFAULT_COMPLETE_MIN_CHARS)
}

/// Punctuation heuristic with an explicit length floor (in chars)
pub fn looks_complete_with(text: &str, min_chars: usize) -> bool {
    if text.trim().is_empty() || text.ends_with(' ') {
        return false;
    }
    let text = text.trim();
    if text.ends_with(TRUNCATION_ARTIFACT) || text.chars().count() < min_chars {
        return false;
    }
    text.ends_with(COMPLETE_ENDINGS)
}

// ========== StreamTracker ==========

/// Per in-flight assistant message state
#[derive(Debug, Clone)]
pub struct StreamTracker {
    pub last_canonical: String,
    pub first_delta_seen: bool,
    pub stable_unchanged_polls: u32,
    pub saw_stop_indicator: bool,
    lengths: VecDeque<usize>,
}

impl StreamTracker {
    /// Start tracking from the pre-send baseline text
    pub fn new(baseline: impl Into<String>) -> Self {
        Self {
            last_canonical: baseline.into(),
            first_delta_seen: false,
            stable_unchanged_polls: 0,
            saw_stop_indicator: false,
            lengths: VecDeque::with_capacity(LENGTH_HISTORY),
        }
    }

    /// Feed one poll's canonical text. Returns true when the text changed.
    pub fn observe(&mut self, canonical: &str) -> bool {
        let len = canonical.chars().count();
        if self.lengths.len() == LENGTH_HISTORY {
            self.lengths.pop_front();
        }
        self.lengths.push_back(len);

        if canonical != self.last_canonical {
            self.last_canonical = canonical.to_string();
            self.first_delta_seen = true;
            self.stable_unchanged_polls = 0;
            return true;
        }

        let mut recent = self.lengths.iter().rev();
        match (recent.next(), recent.next()) {
            (Some(cur), Some(prev)) if cur == prev => self.stable_unchanged_polls += 1,
            _ => self.stable_unchanged_polls = 0,
        }
        false
    }

    /// Remember that the stop indicator was visible at least once
    pub fn mark_stop_indicator(&mut self, visible: bool) {
        self.saw_stop_indicator |= visible;
    }

    /// Most recent lengths, oldest first
    pub fn recent_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.lengths.iter().copied()
    }
}

// ========== StabilityDetector ==========

/// Why a message is (or is not) considered ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub stable: bool,
    pub complete: bool,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.stable || self.complete
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    threshold: u32,
    complete_min_chars: usize,
}

impl Default for StabilityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_STABLE_THRESHOLD)
    }
}

impl StabilityDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            complete_min_chars: DEFAULT_COMPLETE_MIN_CHARS,
        }
    }

    pub fn with_complete_min_chars(mut self, min_chars: usize) -> Self {
        self.complete_min_chars = min_chars;
        self
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_stable(&self, tracker: &StreamTracker) -> bool {
        tracker.stable_unchanged_polls >= self.threshold
    }

    /// Fast-path readiness used by continuous capture: stable counter or
    /// punctuation heuristic, whichever fires first
    pub fn readiness(&self, tracker: &StreamTracker, text: &str) -> Readiness {
        Readiness {
            stable: self.is_stable(tracker),
            complete: looks_complete_with(text, self.complete_min_chars),
        }
    }

    /// Finalize rule for a sent turn.
    ///
    /// `stop_visible` is this poll's observation; a visible indicator always
    /// blocks finalization.
    pub fn should_finalize(&self, tracker: &StreamTracker, stop_visible: bool) -> bool {
        if !tracker.first_delta_seen || stop_visible || tracker.last_canonical.is_empty() {
            return false;
        }
        tracker.saw_stop_indicator || self.is_stable(tracker)
    }
}
