//! Text Normalizer - canonical text for snapshot comparison
//!
//! Strips page chrome that the locator sometimes captures together with a
//! reply (branding, "generating response" banners, reasoning timers, date
//! headers) so that superficial re-renders compare equal.

use once_cell::sync::Lazy;

// ========== Patterns ==========

/// Line prefixes that never belong to reply content
pub const DEFAULT_BOILERPLATE_PREFIXES: &[&str] = &[
    "Copilot",
    "Generating response",
    "Reasoned for",
    "Get a quick answer",
    "You said:",
    "Today",
];

/// Label line rendered between speaker name and content
const SEPARATOR_TOKEN: &str = ":";

static DEFAULT_NORMALIZER: Lazy<Normalizer> = Lazy::new(Normalizer::default);

// ========== Normalizer ==========

/// Line-based cleaner producing canonical text
#[derive(Debug, Clone)]
pub struct Normalizer {
    prefixes: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::with_prefixes(DEFAULT_BOILERPLATE_PREFIXES.iter().copied())
    }
}

impl Normalizer {
    /// Create a normalizer with a custom boilerplate prefix set
    pub fn with_prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    /// Normalize raw extracted text.
    ///
    /// Blank lines inside the text are kept; only the edges are trimmed.
    pub fn normalize(&self, raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }

        let mut cleaned: Vec<&str> = Vec::new();
        for line in raw.lines() {
            let line = line.trim_end();
            let stripped = line.trim();
            if stripped.is_empty() {
                cleaned.push("");
                continue;
            }
            if self.is_boilerplate(stripped) {
                continue;
            }
            cleaned.push(line);
        }

        cleaned.join("\n").trim().to_string()
    }

    fn is_boilerplate(&self, stripped: &str) -> bool {
        stripped == SEPARATOR_TOKEN || self.prefixes.iter().any(|p| stripped.starts_with(p.as_str()))
    }
}

/// Normalize with the default prefix set
pub fn normalize(raw: &str) -> String {
    DEFAULT_NORMALIZER.normalize(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_boilerplate_lines() {
        let raw = "Copilot\n:\nGenerating response\nHere is the answer.\n\nSecond paragraph.";
        assert_eq!(normalize(raw), "Here is the answer.\n\nSecond paragraph.");
    }

    #[test]
    fn test_prefix_match_uses_trimmed_line() {
        let raw = "   Reasoned for 4 seconds\nBody";
        assert_eq!(normalize(raw), "Body");
    }

    #[test]
    fn test_keeps_inner_blank_lines_and_indentation() {
        let raw = "\n\nfn main() {\n    body();\n\n}\n\n";
        assert_eq!(normalize(raw), "fn main() {\n    body();\n\n}");
    }

    #[test]
    fn test_trailing_whitespace_removed_per_line() {
        assert_eq!(normalize("a  \r\nb\t"), "a\nb");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   \n  \n"), "");
    }

    #[test]
    fn test_only_boilerplate_yields_empty() {
        let raw = "Copilot said\nToday\nYou said: hi\n:\nGet a quick answer";
        assert_eq!(normalize(raw), "");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "",
            "plain",
            "  leading\n\n\ntrailing  ",
            "Copilot\nanswer\n:\n\n  indented\n",
            "Today\n\nx\r\ny",
            "a\n\n\n\nb",
        ];
        for raw in samples {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_custom_prefixes() {
        let n = Normalizer::with_prefixes(["Assistant:", ""]);
        assert_eq!(n.normalize("Assistant: thinking\nCopilot stays"), "Copilot stays");
    }
}
