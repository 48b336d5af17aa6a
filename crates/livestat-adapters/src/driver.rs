//! Page driver capability: the browser surface the scrape adapters rely on.
//!
//! `WebDriverPage` drives a real browser over WebDriver. `HtmlSnapshotDriver`
//! answers the same queries from captured markup, which is how extraction is
//! exercised without a browser.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fantoccini::{Client, ClientBuilder, Locator};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("starting webdriver session: {0}")]
    Session(#[from] fantoccini::error::NewSessionError),
    #[error("webdriver command failed: {0}")]
    Command(#[from] fantoccini::error::CmdError),
    #[error("invalid selector {selector}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;
    async fn current_url(&self) -> Result<String, DriverError>;
    async fn page_source(&self) -> Result<String, DriverError>;
    /// Trimmed text content of every element matching `selector`.
    async fn query_all_text(&self, selector: &str) -> Result<Vec<String>, DriverError>;
    /// For every `parent` match, the trimmed texts of its `child` matches.
    async fn query_children_text(
        &self,
        parent: &str,
        child: &str,
    ) -> Result<Vec<Vec<String>>, DriverError>;
}

/// Bounds on how long a scrape waits for a page to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageWait {
    pub navigation_timeout_ms: u64,
    pub ceiling_ms: u64,
    pub interval_ms: u64,
    pub settle_ms: u64,
    pub min_page_len: usize,
}

impl Default for PageWait {
    fn default() -> Self {
        Self {
            navigation_timeout_ms: 30_000,
            ceiling_ms: 10_000,
            interval_ms: 500,
            settle_ms: 500,
            min_page_len: 5_000,
        }
    }
}

impl PageWait {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Content-readiness signal: any data marker present, or the page is past
/// the minimum size (and contains `page_marker`, when one is given).
#[derive(Debug, Clone, Copy)]
pub struct ReadinessProbe {
    pub data_markers: &'static [&'static str],
    pub page_marker: Option<&'static str>,
}

impl ReadinessProbe {
    pub fn is_ready(&self, source: &str, min_page_len: usize) -> bool {
        if self.data_markers.iter().any(|m| source.contains(m)) {
            return true;
        }
        source.len() > min_page_len && self.page_marker.map_or(true, |m| source.contains(m))
    }
}

/// Navigates (a timeout here is logged, not fatal) and then polls until the
/// probe reports ready or the ceiling passes. Returns whether content was seen.
pub async fn open_and_wait(
    driver: &dyn PageDriver,
    url: &str,
    probe: &ReadinessProbe,
    wait: &PageWait,
) -> bool {
    match tokio::time::timeout(wait.navigation_timeout(), driver.navigate(url)).await {
        Ok(Ok(())) => debug!(url, "page loaded"),
        Ok(Err(err)) => warn!(url, error = %err, "navigation reported an error; continuing"),
        Err(_) => warn!(url, "navigation timed out; continuing"),
    }

    let mut waited = Duration::ZERO;
    while waited < wait.ceiling() {
        match driver.page_source().await {
            Ok(source) if probe.is_ready(&source, wait.min_page_len) => {
                tokio::time::sleep(wait.settle()).await;
                debug!(url, waited_ms = waited.as_millis() as u64, "page content ready");
                return true;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(url, error = %err, "reading page while waiting failed");
                return false;
            }
        }
        tokio::time::sleep(wait.interval()).await;
        waited += wait.interval();
    }
    warn!(url, "page content not detected before ceiling; extracting anyway");
    false
}

/// Persistent-profile browser settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub profile_dir: PathBuf,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub locale: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            profile_dir: PathBuf::from("./browser_data"),
            headless: true,
            window_width: 1920,
            window_height: 1080,
            locale: "zh-CN".to_string(),
        }
    }
}

impl BrowserConfig {
    pub fn capabilities(&self, headless: bool) -> Map<String, JsonValue> {
        let mut args = vec![
            format!("--user-data-dir={}", self.profile_dir.display()),
            format!("--window-size={},{}", self.window_width, self.window_height),
            format!("--lang={}", self.locale),
            "--disable-blink-features=AutomationControlled".to_string(),
        ];
        if headless {
            args.push("--headless=new".to_string());
        }
        let mut caps = Map::new();
        caps.insert("goog:chromeOptions".to_string(), json!({ "args": args }));
        caps
    }
}

/// One WebDriver session bound to the configured browser profile.
pub struct WebDriverPage {
    client: Client,
}

impl WebDriverPage {
    pub async fn launch(config: &BrowserConfig, headless: bool) -> Result<Self, DriverError> {
        let client = ClientBuilder::native()
            .capabilities(config.capabilities(headless))
            .connect(&config.webdriver_url)
            .await?;
        Ok(Self { client })
    }

    pub async fn user_agent(&self) -> Result<String, DriverError> {
        let value = self
            .client
            .execute("return navigator.userAgent;", Vec::new())
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn cookies(&self) -> Result<Vec<(String, String)>, DriverError> {
        let cookies = self.client.get_all_cookies().await?;
        Ok(cookies
            .iter()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect())
    }

    /// Ends the session; the browser flushes profile storage on exit.
    pub async fn close(self) -> Result<(), DriverError> {
        self.client.close().await?;
        Ok(())
    }
}

#[async_trait]
impl PageDriver for WebDriverPage {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.client.goto(url).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.client.current_url().await?.to_string())
    }

    async fn page_source(&self) -> Result<String, DriverError> {
        Ok(self.client.source().await?)
    }

    async fn query_all_text(&self, selector: &str) -> Result<Vec<String>, DriverError> {
        let elements = self.client.find_all(Locator::Css(selector)).await?;
        let mut out = Vec::with_capacity(elements.len());
        for element in elements {
            let text = element.prop("textContent").await?.unwrap_or_default();
            out.push(text.trim().to_string());
        }
        Ok(out)
    }

    async fn query_children_text(
        &self,
        parent: &str,
        child: &str,
    ) -> Result<Vec<Vec<String>>, DriverError> {
        let parents = self.client.find_all(Locator::Css(parent)).await?;
        let mut out = Vec::with_capacity(parents.len());
        for parent in parents {
            let mut texts = Vec::new();
            for element in parent.find_all(Locator::Css(child)).await? {
                let text = element.prop("textContent").await?.unwrap_or_default();
                texts.push(text.trim().to_string());
            }
            out.push(texts);
        }
        Ok(out)
    }
}

/// Serves captured markup. Each navigation picks the first snapshot whose
/// pattern occurs in the requested URL.
#[derive(Debug, Default)]
pub struct HtmlSnapshotDriver {
    snapshots: Vec<(String, String)>,
    current: Mutex<Option<(String, String)>>,
}

impl HtmlSnapshotDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, url_pattern: impl Into<String>, html: impl Into<String>) -> Self {
        self.snapshots.push((url_pattern.into(), html.into()));
        self
    }

    fn current_html(&self) -> Result<String, DriverError> {
        let guard = self
            .current
            .lock()
            .map_err(|_| DriverError::Message("snapshot driver lock poisoned".to_string()))?;
        guard
            .as_ref()
            .map(|(_, html)| html.clone())
            .ok_or_else(|| DriverError::Message("no page loaded".to_string()))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, DriverError> {
    Selector::parse(selector).map_err(|e| DriverError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl PageDriver for HtmlSnapshotDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let snapshot = self
            .snapshots
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map(|(_, html)| html.clone())
            .ok_or_else(|| DriverError::Message(format!("no snapshot matches {url}")))?;
        let mut guard = self
            .current
            .lock()
            .map_err(|_| DriverError::Message("snapshot driver lock poisoned".to_string()))?;
        *guard = Some((url.to_string(), snapshot));
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let guard = self
            .current
            .lock()
            .map_err(|_| DriverError::Message("snapshot driver lock poisoned".to_string()))?;
        Ok(guard.as_ref().map(|(url, _)| url.clone()).unwrap_or_default())
    }

    async fn page_source(&self) -> Result<String, DriverError> {
        self.current_html()
    }

    async fn query_all_text(&self, selector: &str) -> Result<Vec<String>, DriverError> {
        let sel = parse_selector(selector)?;
        let document = Html::parse_document(&self.current_html()?);
        Ok(document
            .select(&sel)
            .map(|n| n.text().collect::<String>().trim().to_string())
            .collect())
    }

    async fn query_children_text(
        &self,
        parent: &str,
        child: &str,
    ) -> Result<Vec<Vec<String>>, DriverError> {
        let parent_sel = parse_selector(parent)?;
        let child_sel = parse_selector(child)?;
        let document = Html::parse_document(&self.current_html()?);
        Ok(document
            .select(&parent_sel)
            .map(|p| {
                p.select(&child_sel)
                    .map(|c| c.text().collect::<String>().trim().to_string())
                    .collect()
            })
            .collect())
    }
}
