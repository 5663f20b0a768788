//! Relay configuration (loaded from ~/.chatrelay/config.yaml)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::normalizer::DEFAULT_BOILERPLATE_PREFIXES;
use crate::capture::stability::{DEFAULT_STABLE_THRESHOLD, SELF_TEST_STABLE_THRESHOLD};

pub const DEFAULT_CDP_ENDPOINT: &str = "http://127.0.0.1:9222";
pub const DEFAULT_CHAT_URL: &str = "https://m365.cloud.microsoft/chat/";
pub const DEFAULT_PORT: u16 = 9230;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// `~/.chatrelay`, or `./.chatrelay` when there is no home directory
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatrelay")
}

/// `$CHATRELAY_CONFIG`, else `~/.chatrelay/config.yaml`
pub fn config_path() -> PathBuf {
    std::env::var("CHATRELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_home().join("config.yaml"))
}

// ========== Sections ==========

/// Poll cadence and deadline of a send/receive mode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnTiming {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    /// Deltas buffered between the poll worker and a slow consumer
    pub buffer_capacity: usize,
}

impl TurnTiming {
    fn with(poll_interval_ms: u64, timeout_secs: u64) -> Self {
        Self {
            poll_interval_ms,
            timeout_secs,
            buffer_capacity: 32,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TurnTiming {
    fn default() -> Self {
        Self::with(150, 180)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContinuousConfig {
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            error_backoff_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SelfTestConfig {
    pub enabled: bool,
    pub message: String,
    pub timeout_secs: u64,
    pub stable_threshold: u32,
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message: "Please reply with a short greeting for capture test.".to_string(),
            timeout_secs: 60,
            stable_threshold: SELF_TEST_STABLE_THRESHOLD,
        }
    }
}

/// Ordered fallback chains; the first selector with any match wins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorConfig {
    pub textbox: Vec<String>,
    pub user_messages: Vec<String>,
    pub assistant_messages: Vec<String>,
    pub stop_generating: Vec<String>,
    pub loading_indicator: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            textbox: strings(&[
                r#"[data-testid="chatQuestion"] [role="textbox"]"#,
                r#"[data-testid="chatQuestion"] [contenteditable="true"]"#,
                r#"[data-testid="chatQuestion"] textarea"#,
                r#"[data-testid="chatQuestion"] input[type="text"]"#,
                r#"[data-testid="bizchat-input-section"] [role="textbox"]"#,
                r#"[data-testid="bizchat-input-section"] [contenteditable="true"]"#,
                r#"[role="textbox"]"#,
                r#"[contenteditable="true"]"#,
                "textarea",
                r#"input[type="text"]"#,
            ]),
            user_messages: strings(&[
                r#"[data-testid="chatOutput"]"#,
                r#"[data-content="user-message"]"#,
                r#"[data-testid="user-message"]"#,
                ".user-message",
            ]),
            assistant_messages: strings(&[
                r#"[data-testid="copilot-message-reply-div"]"#,
                r#"[data-testid="m365-chat-llm-web-ui-chat-message"]"#,
                r#"[data-testid="copilot-message-div"]"#,
                r#"[data-testid="lastChatMessage"]"#,
                r#"[data-testid="markdown-reply"]"#,
                r#"[data-content="ai-message"]"#,
                r#"[data-testid="bot-message"]"#,
                r#"[data-testid="ai-message"]"#,
                ".ai-message",
                ".bot-message",
            ]),
            stop_generating: strings(&[
                r#"[aria-label="Stop generating"]"#,
                r#"button[aria-label="Stop generating"]"#,
            ]),
            loading_indicator: strings(&[r#"[data-testid="loading-message"]"#]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageScoringRule {
    pub url_contains: String,
    pub score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PageScoringConfig {
    /// Every matching rule adds its score
    pub rules: Vec<PageScoringRule>,
    /// Added when the page already renders a textbox
    pub textbox_bonus: i32,
}

impl Default for PageScoringConfig {
    fn default() -> Self {
        let rule = |url_contains: &str, score| PageScoringRule {
            url_contains: url_contains.to_string(),
            score,
        };
        Self {
            rules: vec![
                rule("m365.cloud.microsoft/chat", 7),
                rule("m365.cloud.microsoft.com/chat", 6),
                rule("/chat", 4),
                rule("copilot.microsoft.com", 2),
                rule("m365.cloud.microsoft.com", 2),
            ],
            textbox_bonus: 5,
        }
    }
}

// ========== RelayConfig ==========

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub cdp_endpoint: String,
    pub chat_url: String,
    pub capture_log: PathBuf,
    pub port: u16,
    pub auto_select_page: bool,
    pub blocking: TurnTiming,
    pub streaming: TurnTiming,
    pub continuous: ContinuousConfig,
    pub stable_threshold: u32,
    pub self_test: SelfTestConfig,
    pub textbox_wait_secs: u64,
    pub submit_attempts: u32,
    pub stream_token_ttl_secs: u64,
    pub selectors: SelectorConfig,
    pub page_scoring: PageScoringConfig,
    pub boilerplate_prefixes: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cdp_endpoint: DEFAULT_CDP_ENDPOINT.to_string(),
            chat_url: DEFAULT_CHAT_URL.to_string(),
            capture_log: default_home().join("capture.jsonl"),
            port: DEFAULT_PORT,
            auto_select_page: true,
            blocking: TurnTiming::with(150, 180),
            streaming: TurnTiming::with(100, 180),
            continuous: ContinuousConfig::default(),
            stable_threshold: DEFAULT_STABLE_THRESHOLD,
            self_test: SelfTestConfig::default(),
            textbox_wait_secs: 30,
            submit_attempts: 3,
            stream_token_ttl_secs: 300,
            selectors: SelectorConfig::default(),
            page_scoring: PageScoringConfig::default(),
            boilerplate_prefixes: strings(DEFAULT_BOILERPLATE_PREFIXES),
        }
    }
}

impl RelayConfig {
    /// Load from YAML. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = ?path, "No relay config found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = ?path, "Relay config loaded");
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Load from `config_path()` and apply process environment overrides
    pub fn load_default() -> Result<Self, ConfigError> {
        let mut config = Self::load(&config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `CHATRELAY_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("CHATRELAY_CDP_ENDPOINT").filter(|v| !v.is_empty()) {
            self.cdp_endpoint = endpoint;
        }
        if let Some(port) = lookup("CHATRELAY_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(path) = lookup("CHATRELAY_LOG_FILE").filter(|v| !v.is_empty()) {
            self.capture_log = PathBuf::from(path);
        }
    }

    pub fn textbox_wait(&self) -> Duration {
        Duration::from_secs(self.textbox_wait_secs)
    }

    pub fn stream_token_ttl(&self) -> Duration {
        Duration::from_secs(self.stream_token_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.cdp_endpoint, "http://127.0.0.1:9222");
        assert_eq!(config.blocking.poll_interval(), Duration::from_millis(150));
        assert_eq!(config.streaming.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.streaming.timeout(), Duration::from_secs(180));
        assert_eq!(config.stable_threshold, 6);
        assert_eq!(config.self_test.stable_threshold, 3);
        assert_eq!(config.selectors.textbox.len(), 10);
        assert_eq!(config.selectors.assistant_messages[0], r#"[data-testid="copilot-message-reply-div"]"#);
        assert_eq!(config.page_scoring.textbox_bonus, 5);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r##"
cdpEndpoint: http://10.0.0.2:9333
stableThreshold: 4
streaming:
  pollIntervalMs: 50
selectors:
  stopGenerating:
    - "#stop"
"##;
        let config = RelayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cdp_endpoint, "http://10.0.0.2:9333");
        assert_eq!(config.stable_threshold, 4);
        assert_eq!(config.streaming.poll_interval_ms, 50);
        assert_eq!(config.streaming.timeout_secs, 180);
        assert_eq!(config.selectors.stop_generating, vec!["#stop".to_string()]);
        assert_eq!(config.selectors.user_messages.len(), 4);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: [not, a, number]").unwrap();
        let err = RelayConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHATRELAY_CDP_ENDPOINT", "http://browser:9222"),
            ("CHATRELAY_PORT", "9999"),
            ("CHATRELAY_LOG_FILE", "/tmp/relay.jsonl"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.cdp_endpoint, "http://browser:9222");
        assert_eq!(config.port, 9999);
        assert_eq!(config.capture_log, PathBuf::from("/tmp/relay.jsonl"));

        let mut config = RelayConfig::default();
        config.apply_overrides(|k| (k == "CHATRELAY_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.port, DEFAULT_PORT);
    }
}
