use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use super::driver::{BrowserDriver, PageDriver, ScrollTarget};
use crate::config::BrowserConfig;
use crate::error::{ScraperError, ScraperResult};

const BLANK_DOCUMENT: &str = "<html><head></head><body></body></html>";

/// A fetched document
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects
    pub url: Url,
    pub html: String,
}

/// Where a static page gets its markup from
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &Url) -> ScraperResult<FetchedPage>;

    /// Same configuration, empty cookie jar
    fn fork(&self) -> ScraperResult<Arc<dyn PageSource>>;
}

/// Fetches pages over HTTP with retries and a per-source cookie jar
pub struct HttpPageSource {
    client: Client,
    config: BrowserConfig,
}

impl HttpPageSource {
    pub fn new(config: &BrowserConfig) -> ScraperResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert("Accept-Language", HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| ScraperError::browser(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn fetch_once(&self, url: &Url) -> Result<reqwest::Response, reqwest::Error> {
        self.client.get(url.as_str()).send().await
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, url: &Url) -> ScraperResult<FetchedPage> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!("HTTP GET attempt {} for: {}", attempt, url);

            match self.fetch_once(url).await {
                Ok(response) if response.status().is_success() => {
                    let final_url = response.url().clone();
                    let html = response
                        .text()
                        .await
                        .map_err(|e| ScraperError::browser(format!("failed to read {}: {}", url, e)))?;
                    return Ok(FetchedPage { url: final_url, html });
                }
                Ok(response) if response.status().is_server_error() && attempt < attempts => {
                    warn!("Server error {} for {}, retrying...", response.status(), url);
                    last_error = Some(format!("server error {}", response.status()));
                }
                Ok(response) => {
                    return Err(ScraperError::browser(format!("HTTP {} for {}", response.status(), url)));
                }
                Err(e) => {
                    warn!("HTTP request failed for {} (attempt {}): {}", url, attempt, e);
                    last_error = Some(e.to_string());
                }
            }

            if attempt < attempts {
                let delay = Duration::from_secs(self.config.retry_delay_seconds * attempt as u64);
                tokio::time::sleep(delay).await;
            }
        }

        Err(ScraperError::browser(format!(
            "failed to fetch {}: {}",
            url,
            last_error.unwrap_or_else(|| "all retry attempts failed".to_string())
        )))
    }

    fn fork(&self) -> ScraperResult<Arc<dyn PageSource>> {
        Ok(Arc::new(Self::new(&self.config)?))
    }
}

/// Serves canned documents keyed by URL, with optional artificial latency
#[derive(Clone, Default)]
pub struct FixturePageSource {
    pages: Arc<DashMap<String, String>>,
    fetched: Arc<Mutex<Vec<String>>>,
    latency: Duration,
}

impl FixturePageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.insert(url, html);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Adds or replaces a document
    pub fn insert(&self, url: &str, html: &str) {
        let key = Url::parse(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string());
        self.pages.insert(key, html.to_string());
    }

    /// URLs fetched so far, in order
    pub async fn fetched(&self) -> Vec<String> {
        self.fetched.lock().await.clone()
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    async fn fetch(&self, url: &Url) -> ScraperResult<FetchedPage> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.fetched.lock().await.push(url.to_string());

        let html = self
            .pages
            .get(url.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ScraperError::browser(format!("HTTP 404 for {}", url)))?;

        Ok(FetchedPage { url: url.clone(), html })
    }

    fn fork(&self) -> ScraperResult<Arc<dyn PageSource>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Browserless driver: pages are fetched documents queried with CSS selectors
///
/// Clicking a link follows its `href`; typed text is kept per selector.
/// Script evaluation is not supported.
pub struct StaticBrowser {
    source: Arc<dyn PageSource>,
    history: Arc<Mutex<Vec<String>>>,
    next_page: AtomicUsize,
}

impl StaticBrowser {
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self {
            source,
            history: Arc::new(Mutex::new(Vec::new())),
            next_page: AtomicUsize::new(1),
        }
    }

    pub fn http(config: &BrowserConfig) -> ScraperResult<Self> {
        Ok(Self::new(Arc::new(HttpPageSource::new(config)?)))
    }

    /// Every action performed on pages of this browser, as `page<N> <action>`
    pub async fn history(&self) -> Vec<String> {
        self.history.lock().await.clone()
    }
}

#[async_trait]
impl BrowserDriver for StaticBrowser {
    async fn new_page(&self) -> ScraperResult<Box<dyn PageDriver>> {
        let id = self.next_page.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticPage {
            id,
            source: Mutex::new(self.source.fork()?),
            state: Mutex::new(PageState::default()),
            history: self.history.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Default)]
struct PageState {
    url: Option<Url>,
    html: Option<String>,
    inputs: HashMap<String, String>,
    closed: bool,
}

struct StaticPage {
    id: usize,
    source: Mutex<Arc<dyn PageSource>>,
    state: Mutex<PageState>,
    history: Arc<Mutex<Vec<String>>>,
}

fn parse_selector(selector: &str) -> ScraperResult<Selector> {
    Selector::parse(selector).map_err(|_| ScraperError::InvalidSelector {
        selector: selector.to_string(),
    })
}

/// Runs `f` against the first element matching `selector`
///
/// Parsing happens here so no parsed document is held across an await.
fn with_first<T>(html: &str, selector: &str, f: impl FnOnce(Option<ElementRef<'_>>) -> T) -> ScraperResult<T> {
    let selector = parse_selector(selector)?;
    let document = Html::parse_document(html);
    let result = f(document.select(&selector).next());
    Ok(result)
}

fn missing_element(selector: &str) -> ScraperError {
    ScraperError::browser(format!("no element matches '{}'", selector))
}

impl StaticPage {
    async fn record(&self, action: String) {
        self.history.lock().await.push(format!("page{} {}", self.id, action));
    }

    async fn document(&self) -> ScraperResult<String> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(ScraperError::browser(format!("page{} is closed", self.id)));
        }
        Ok(state.html.clone().unwrap_or_else(|| BLANK_DOCUMENT.to_string()))
    }

    async fn resolve_url(&self, url: &str) -> ScraperResult<Url> {
        match Url::parse(url) {
            Ok(parsed) => Ok(parsed),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let state = self.state.lock().await;
                state
                    .url
                    .as_ref()
                    .and_then(|base| base.join(url).ok())
                    .ok_or_else(|| ScraperError::browser(format!("cannot resolve relative URL '{}'", url)))
            }
            Err(e) => Err(ScraperError::browser(format!("invalid URL '{}': {}", url, e))),
        }
    }

    async fn load(&self, url: Url) -> ScraperResult<()> {
        let source = self.source.lock().await.clone();
        let fetched = source.fetch(&url).await?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ScraperError::browser(format!("page{} is closed", self.id)));
        }
        state.url = Some(fetched.url);
        state.html = Some(fetched.html);
        state.inputs.clear();
        Ok(())
    }
}

#[async_trait]
impl PageDriver for StaticPage {
    async fn navigate(&self, url: &str) -> ScraperResult<()> {
        let target = self.resolve_url(url).await?;
        self.record(format!("navigate {}", target)).await;
        self.load(target).await
    }

    async fn current_url(&self) -> ScraperResult<Option<String>> {
        Ok(self.state.lock().await.url.as_ref().map(|u| u.to_string()))
    }

    async fn content(&self) -> ScraperResult<String> {
        self.document().await
    }

    async fn exists(&self, selector: &str) -> ScraperResult<bool> {
        let html = self.document().await?;
        with_first(&html, selector, |el| el.is_some())
    }

    async fn click(&self, selector: &str) -> ScraperResult<()> {
        let html = self.document().await?;
        let href = with_first(&html, selector, |el| {
            el.map(|el| {
                let link = el.value().name() == "a";
                (link, el.value().attr("href").map(str::to_string))
            })
        })?
        .ok_or_else(|| missing_element(selector))?;

        self.record(format!("click {}", selector)).await;

        match href {
            (true, Some(href)) if !href.starts_with('#') && !href.starts_with("javascript:") => {
                let target = self.resolve_url(&href).await?;
                self.record(format!("navigate {}", target)).await;
                self.load(target).await
            }
            _ => Ok(()),
        }
    }

    async fn type_text(&self, selector: &str, text: &str, clear: bool) -> ScraperResult<()> {
        let html = self.document().await?;
        if !with_first(&html, selector, |el| el.is_some())? {
            return Err(missing_element(selector));
        }

        self.record(format!("type {} {:?}", selector, text)).await;
        let mut state = self.state.lock().await;
        let entry = state.inputs.entry(selector.to_string()).or_default();
        if clear {
            entry.clear();
        }
        entry.push_str(text);
        Ok(())
    }

    async fn scroll(&self, target: ScrollTarget<'_>) -> ScraperResult<()> {
        match target {
            ScrollTarget::Top => self.record("scroll top".to_string()).await,
            ScrollTarget::Bottom => self.record("scroll bottom".to_string()).await,
            ScrollTarget::Element(selector) => {
                if !self.exists(selector).await? {
                    return Err(missing_element(selector));
                }
                self.record(format!("scroll {}", selector)).await;
            }
        }
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> ScraperResult<Value> {
        Err(ScraperError::unavailable(
            "script evaluation requires the playwright driver",
        ))
    }

    async fn text_content(&self, selector: &str) -> ScraperResult<Option<String>> {
        let html = self.document().await?;
        let typed = self.state.lock().await.inputs.get(selector).cloned();
        with_first(&html, selector, |el| {
            el.map(|el| match (el.value().name(), typed) {
                ("input" | "textarea", Some(typed)) => typed,
                _ => el.text().collect::<String>().trim().to_string(),
            })
        })
    }

    async fn attribute(&self, selector: &str, name: &str) -> ScraperResult<Option<String>> {
        let html = self.document().await?;
        if name == "value" {
            if let Some(typed) = self.state.lock().await.inputs.get(selector).cloned() {
                return Ok(Some(typed));
            }
        }
        with_first(&html, selector, |el| {
            el.and_then(|el| el.value().attr(name).map(str::to_string))
        })
    }

    async fn delete_cookies(&self) -> ScraperResult<()> {
        let mut source = self.source.lock().await;
        *source = source.fork()?;
        drop(source);
        self.record("delete cookies".to_string()).await;
        Ok(())
    }

    async fn close(&self) -> ScraperResult<()> {
        self.state.lock().await.closed = true;
        self.record("close".to_string()).await;
        Ok(())
    }
}
