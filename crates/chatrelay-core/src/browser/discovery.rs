//! Target discovery - find or open the chat tab over the DevTools HTTP API

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::cdp::CdpClient;
use super::error::BrowserError;
use super::page::CdpPage;
use super::{BrowserSession, ChatPage, ElementLocator};
use crate::config::{PageScoringRule, RelayConfig, SelectorConfig};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

static WS_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(wss?://)([^/]+)(/.*)?$").expect("valid regex"));

/// Entry of `/json/list`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    pub web_socket_debugger_url: Option<String>,
}

impl PageTarget {
    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }
}

/// URL score of a tab; every matching rule adds up. `None` for DevTools pages.
pub fn score_page_url(url: &str, rules: &[PageScoringRule]) -> Option<i32> {
    if url.starts_with("devtools://") {
        return None;
    }
    Some(
        rules
            .iter()
            .filter(|r| url.contains(&r.url_contains))
            .map(|r| r.score)
            .sum(),
    )
}

/// Point a target's debugger URL at the endpoint we actually reach the browser on
fn rewrite_ws_host(ws_url: &str, endpoint: &str) -> String {
    let host = match reqwest::Url::parse(endpoint) {
        Ok(url) => match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            _ => return ws_url.to_string(),
        },
        Err(_) => return ws_url.to_string(),
    };
    WS_URL
        .replace(ws_url, |caps: &regex::Captures| {
            format!(
                "{}{}{}",
                &caps[1],
                host,
                caps.get(3).map(|m| m.as_str()).unwrap_or("")
            )
        })
        .into_owned()
}

// ========== CdpBrowser ==========

pub struct CdpBrowser {
    endpoint: String,
    chat_url: String,
    auto_select: bool,
    selectors: SelectorConfig,
    rules: Vec<PageScoringRule>,
    textbox_bonus: i32,
    http: reqwest::Client,
    /// Connected pages by target id
    pages: Mutex<HashMap<String, Arc<CdpPage>>>,
}

impl CdpBrowser {
    pub fn new(config: &RelayConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint: config.cdp_endpoint.trim_end_matches('/').to_string(),
            chat_url: config.chat_url.clone(),
            auto_select: config.auto_select_page,
            selectors: config.selectors.clone(),
            rules: config.page_scoring.rules.clone(),
            textbox_bonus: config.page_scoring.textbox_bonus,
            http,
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Build a browser handle and verify the endpoint answers
    pub async fn connect(config: &RelayConfig) -> Result<Self, BrowserError> {
        let browser = Self::new(config);
        let version = browser.version().await?;
        info!(endpoint = %browser.endpoint, browser = %version, "Connected to Chrome DevTools");
        Ok(browser)
    }

    fn connection_error(&self, reason: impl ToString) -> BrowserError {
        BrowserError::ConnectionFailed {
            url: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    /// Browser product string from `/json/version`
    pub async fn version(&self) -> Result<String, BrowserError> {
        let resp: serde_json::Value = self
            .http
            .get(format!("{}/json/version", self.endpoint))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?
            .json()
            .await
            .map_err(|e| self.connection_error(e))?;
        Ok(resp
            .get("Browser")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    pub async fn list_targets(&self) -> Result<Vec<PageTarget>, BrowserError> {
        let targets: Vec<PageTarget> = self
            .http
            .get(format!("{}/json/list", self.endpoint))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?
            .json()
            .await
            .map_err(|e| BrowserError::Protocol {
                detail: format!("unexpected /json/list body: {e}"),
            })?;
        Ok(targets.into_iter().filter(PageTarget::is_page).collect())
    }

    async fn open_target(&self, url: &str) -> Result<PageTarget, BrowserError> {
        info!(url = %url, "Opening new chat tab");
        self.http
            .put(format!("{}/json/new?{}", self.endpoint, url))
            .send()
            .await
            .map_err(|e| self.connection_error(e))?
            .json()
            .await
            .map_err(|e| BrowserError::Protocol {
                detail: format!("unexpected /json/new body: {e}"),
            })
    }

    async fn attach(&self, target: &PageTarget) -> Result<Arc<CdpPage>, BrowserError> {
        let mut pages = self.pages.lock().await;
        if let Some(page) = pages.get(&target.id) {
            if page.is_connected() {
                return Ok(Arc::clone(page));
            }
            debug!(target = %target.id, "Cached page disconnected, reconnecting");
        }

        let ws_url = target
            .web_socket_debugger_url
            .as_deref()
            .ok_or_else(|| BrowserError::NoPage {
                reason: format!("target {} is already being debugged", target.id),
            })?;
        let client = CdpClient::connect(&rewrite_ws_host(ws_url, &self.endpoint)).await?;
        let page = Arc::new(CdpPage::new(Arc::new(client), self.selectors.clone()));
        pages.insert(target.id.clone(), Arc::clone(&page));
        Ok(page)
    }

    async fn score(&self, target: &PageTarget) -> Option<(i32, Arc<CdpPage>)> {
        let mut score = score_page_url(&target.url, &self.rules)?;
        let page = match self.attach(target).await {
            Ok(p) => p,
            Err(e) => {
                warn!(target = %target.id, error = %e, "Skipping unreachable tab");
                return None;
            }
        };
        if let Ok(Some(_)) = page.find_textbox().await {
            score += self.textbox_bonus;
        }
        debug!(url = %target.url, score, "Scored tab");
        Some((score, page))
    }
}

#[async_trait]
impl BrowserSession for CdpBrowser {
    async fn select_best_page(&self) -> Result<Arc<dyn ChatPage>, BrowserError> {
        let targets = self.list_targets().await?;

        if !self.auto_select {
            if let Some(target) = targets.first() {
                let page: Arc<dyn ChatPage> = self.attach(target).await?;
                return Ok(page);
            }
        } else {
            let mut best: Option<(i32, Arc<CdpPage>, &str)> = None;
            for target in &targets {
                if let Some((score, page)) = self.score(target).await {
                    // ties keep the earlier tab
                    if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                        best = Some((score, page, target.url.as_str()));
                    }
                }
            }
            if let Some((score, page, url)) = best.filter(|(s, _, _)| *s > 0) {
                info!(url = %url, score, "Selected existing chat tab");
                let page: Arc<dyn ChatPage> = page;
                return Ok(page);
            }
        }

        let target = self.open_target(&self.chat_url).await?;
        let page: Arc<dyn ChatPage> = self.attach(&target).await?;
        Ok(page)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}
