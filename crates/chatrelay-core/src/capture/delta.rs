//! Delta Computer
//!
//! The emitted unit is always new canonical text: either the unseen suffix
//! or, when earlier text was re-rendered, the whole current text flagged as a
//! replacement.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// Text continues what was emitted before
    Append,
    /// Text supersedes everything emitted before
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub text: String,
}

impl Delta {
    pub fn append(text: impl Into<String>) -> Self {
        Self {
            kind: DeltaKind::Append,
            text: text.into(),
        }
    }

    pub fn replace(text: impl Into<String>) -> Self {
        Self {
            kind: DeltaKind::Replace,
            text: text.into(),
        }
    }

    pub fn is_replace(&self) -> bool {
        self.kind == DeltaKind::Replace
    }

    /// Apply to a consumer-side accumulation
    pub fn apply_to(&self, acc: &mut String) {
        if self.is_replace() {
            acc.clear();
        }
        acc.push_str(&self.text);
    }
}

/// Difference between two canonical snapshots; `None` when they are equal
pub fn compute_delta(previous: &str, current: &str) -> Option<Delta> {
    if previous == current {
        return None;
    }
    match current.strip_prefix(previous) {
        Some(suffix) => Some(Delta::append(suffix)),
        None => Some(Delta::replace(current)),
    }
}
