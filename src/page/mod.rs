use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::{ScraperError, ScraperResult};
use crate::program::PageActionType;
use crate::values::condition::as_text;
use crate::values::{ElementReader, ResolveContext};

pub mod browser;
pub mod driver;
pub mod locator;
pub mod simplifier;
pub mod static_driver;

pub use browser::launch_browser;
pub use driver::{BrowserDriver, PageDriver, ScrollTarget};
pub use locator::{ElementLocator, KeywordLocator};
pub use static_driver::{FixturePageSource, HttpPageSource, PageSource, StaticBrowser};

/// What a page action changed besides the page itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    /// Index of a page the action added to the pool
    pub opened_page: Option<usize>,
    /// Return value of `Evaluate`
    pub result: Option<Value>,
}

/// Drives the pages of one run
///
/// Pages are addressed by their position in the pool; `Navigate` with
/// `newPage` appends to it. Every action is bounded by a timeout.
pub struct PageActionExecutor {
    browser: Arc<dyn BrowserDriver>,
    pages: RwLock<Vec<Arc<dyn PageDriver>>>,
    locator: Option<Arc<dyn ElementLocator>>,
    config: BrowserConfig,
    snapshot_max_bytes: usize,
}

/// Text form of a resolved value used as a URL or typed input
fn display_text(value: &Value) -> String {
    match as_text(value) {
        Some(text) => text,
        None if value.is_null() => String::new(),
        None => value.to_string(),
    }
}

impl PageActionExecutor {
    pub fn new(browser: Arc<dyn BrowserDriver>, config: &BrowserConfig) -> Self {
        Self {
            browser,
            pages: RwLock::new(Vec::new()),
            locator: None,
            config: config.clone(),
            snapshot_max_bytes: simplifier::DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_locator(mut self, locator: Arc<dyn ElementLocator>, snapshot_max_bytes: usize) -> Self {
        self.locator = Some(locator);
        self.snapshot_max_bytes = snapshot_max_bytes;
        self
    }

    pub async fn page_count(&self) -> usize {
        self.pages.read().await.len()
    }

    async fn page(&self, page_index: usize) -> ScraperResult<Arc<dyn PageDriver>> {
        let pages = self.pages.read().await;
        pages
            .get(page_index)
            .cloned()
            .ok_or(ScraperError::PageIndexOutOfRange {
                page_index,
                open_pages: pages.len(),
            })
    }

    async fn open_page(&self) -> ScraperResult<(usize, Arc<dyn PageDriver>)> {
        let page: Arc<dyn PageDriver> = Arc::from(self.browser.new_page().await?);
        let mut pages = self.pages.write().await;
        pages.push(page.clone());
        let index = pages.len() - 1;
        info!("Opened page {} with {} driver", index, self.browser.name());
        Ok((index, page))
    }

    /// Polls until `selector` matches or `timeout` elapses
    async fn wait_for(&self, page: &dyn PageDriver, page_index: usize, selector: &str, timeout: Duration) -> ScraperResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if page.exists(selector).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ScraperError::ElementNotFound {
                    selector: selector.to_string(),
                    page_index,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn bounded<T>(
        &self,
        action: &PageActionType,
        target: Option<&str>,
        limit: Duration,
        work: impl Future<Output = ScraperResult<T>>,
    ) -> ScraperResult<T> {
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = limit.as_millis() as u64;
                warn!("{} timed out after {}ms", action.name(), timeout_ms);
                Err(match action {
                    PageActionType::Navigate { .. } => ScraperError::NavigationTimeout {
                        url: target.unwrap_or_default().to_string(),
                        timeout_ms,
                    },
                    _ => ScraperError::ActionTimeout {
                        action: action.name().to_string(),
                        timeout_ms,
                    },
                })
            }
        }
    }

    fn limit(&self, timeout_ms: Option<u64>, default: Duration) -> Duration {
        timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Simplified markup of a page, the only form handed to the locator
    pub async fn snapshot(&self, page_index: usize) -> ScraperResult<String> {
        let page = self.page(page_index).await?;
        let html = page.content().await?;
        let base_uri = page.current_url().await?.unwrap_or_default();
        Ok(simplifier::simplify(&html, &base_uri, self.snapshot_max_bytes))
    }

    async fn smart_click(&self, page: &dyn PageDriver, page_index: usize, description: &str) -> ScraperResult<()> {
        let locator = match &self.locator {
            Some(locator) if locator.is_available().await => locator.clone(),
            _ => return Err(ScraperError::unavailable("smart click requires an AI-assisted locator")),
        };

        let snapshot = self.snapshot(page_index).await?;
        let selector = locator
            .locate(&snapshot, description)
            .await?
            .ok_or_else(|| ScraperError::ElementNotFound {
                selector: format!("<{}>", description),
                page_index,
            })?;

        debug!("Smart click resolved '{}' to {}", description, selector);
        page.click(&selector).await
    }

    /// Runs one page action; values it carries are resolved through `resolver`
    pub async fn execute(
        &self,
        page_index: usize,
        action: &PageActionType,
        resolver: &ResolveContext<'_>,
    ) -> ScraperResult<ActionOutcome> {
        let mut outcome = ActionOutcome::default();

        match action {
            PageActionType::Navigate { url, new_page, timeout_ms } => {
                let url = display_text(&resolver.resolve(url).await?);
                // Page 0 is opened on first use; other indexes must already exist
                let open = *new_page || (page_index == 0 && self.page_count().await == 0);
                let limit = self.limit(*timeout_ms, self.config.navigation_timeout());
                let (index, page) = if open {
                    let (index, page) = self.bounded(action, Some(&url), limit, self.open_page()).await?;
                    outcome.opened_page = Some(index);
                    (index, page)
                } else {
                    (page_index, self.page(page_index).await?)
                };

                debug!("Navigating page {} to {}", index, url);
                self.bounded(action, Some(&url), limit, page.navigate(&url)).await?;
            }
            PageActionType::Wait {
                duration_ms,
                selector,
                timeout_ms,
            } => {
                if let Some(ms) = duration_ms {
                    let pause = Duration::from_millis(*ms).min(self.config.max_wait());
                    tokio::time::sleep(pause).await;
                }
                if let Some(selector) = selector {
                    let page = self.page(page_index).await?;
                    let limit = self
                        .limit(*timeout_ms, self.config.element_timeout())
                        .min(self.config.max_wait());
                    self.wait_for(page.as_ref(), page_index, selector, limit).await?;
                }
            }
            PageActionType::Click {
                selector,
                smart_fallback,
                timeout_ms,
            } => {
                let page = self.page(page_index).await?;
                let limit = self.limit(*timeout_ms, self.config.action_timeout());
                let work = async {
                    match self
                        .wait_for(page.as_ref(), page_index, selector, self.config.element_timeout())
                        .await
                    {
                        Ok(()) => page.click(selector).await,
                        Err(ScraperError::ElementNotFound { .. }) if smart_fallback.is_some() => {
                            let description = smart_fallback.as_deref().unwrap_or_default();
                            info!("Selector {} not found, falling back to smart click", selector);
                            self.smart_click(page.as_ref(), page_index, description).await
                        }
                        Err(e) => Err(e),
                    }
                };
                self.bounded(action, None, limit, work).await?;
            }
            PageActionType::SmartClick { description } => {
                let page = self.page(page_index).await?;
                let work = self.smart_click(page.as_ref(), page_index, description);
                self.bounded(action, None, self.config.action_timeout(), work).await?;
            }
            PageActionType::Type {
                selector,
                text,
                clear,
                timeout_ms,
            } => {
                let text = display_text(&resolver.resolve(text).await?);
                let page = self.page(page_index).await?;
                let limit = self.limit(*timeout_ms, self.config.action_timeout());
                let work = async {
                    self.wait_for(page.as_ref(), page_index, selector, self.config.element_timeout())
                        .await?;
                    page.type_text(selector, &text, *clear).await
                };
                self.bounded(action, None, limit, work).await?;
            }
            PageActionType::ScrollToBottom | PageActionType::ScrollToTop => {
                let page = self.page(page_index).await?;
                let target = match action {
                    PageActionType::ScrollToTop => ScrollTarget::Top,
                    _ => ScrollTarget::Bottom,
                };
                self.bounded(action, None, self.config.action_timeout(), page.scroll(target))
                    .await?;
            }
            PageActionType::ScrollToElement { selector } => {
                let page = self.page(page_index).await?;
                let work = async {
                    self.wait_for(page.as_ref(), page_index, selector, self.config.element_timeout())
                        .await?;
                    page.scroll(ScrollTarget::Element(selector)).await
                };
                self.bounded(action, None, self.config.action_timeout(), work).await?;
            }
            PageActionType::Evaluate { script } => {
                let page = self.page(page_index).await?;
                let result = self
                    .bounded(action, None, self.config.action_timeout(), page.evaluate(script))
                    .await?;
                outcome.result = Some(result);
            }
        }

        Ok(outcome)
    }

    pub async fn delete_cookies(&self, page_index: usize) -> ScraperResult<()> {
        let page = self.page(page_index).await?;
        let limit = self.config.action_timeout();
        match tokio::time::timeout(limit, page.delete_cookies()).await {
            Ok(result) => result,
            Err(_) => Err(ScraperError::ActionTimeout {
                action: "DeleteCookies".to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Closes every page; failures are logged, not returned
    pub async fn close_all(&self) {
        let pages: Vec<_> = self.pages.write().await.drain(..).collect();
        for (index, page) in pages.iter().enumerate() {
            match tokio::time::timeout(self.config.action_timeout(), page.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to close page {}: {}", index, e),
                Err(_) => warn!("Closing page {} timed out", index),
            }
        }
    }
}

#[async_trait]
impl ElementReader for PageActionExecutor {
    async fn read_text(&self, page_index: usize, selector: &str) -> ScraperResult<String> {
        let page = self.page(page_index).await?;
        self.wait_for(page.as_ref(), page_index, selector, self.config.element_timeout())
            .await?;
        page.text_content(selector)
            .await?
            .ok_or_else(|| ScraperError::ElementNotFound {
                selector: selector.to_string(),
                page_index,
            })
    }

    async fn read_attribute(&self, page_index: usize, selector: &str, attribute: &str) -> ScraperResult<Option<String>> {
        let page = self.page(page_index).await?;
        self.wait_for(page.as_ref(), page_index, selector, self.config.element_timeout())
            .await?;
        page.attribute(selector, attribute).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::program::ScraperValue;
    use crate::store::MemoryDataStore;

    fn fast_config() -> BrowserConfig {
        BrowserConfig {
            element_timeout_ms: 50,
            poll_interval_ms: 10,
            ..BrowserConfig::default()
        }
    }

    fn shop() -> FixturePageSource {
        FixturePageSource::new()
            .with_page(
                "https://shop.test/",
                r#"<html><body><h1>Shop</h1><a href="/deals">Today's deals</a><input name="q"></body></html>"#,
            )
            .with_page("https://shop.test/deals", "<html><body><h1>Deals</h1></body></html>")
    }

    fn navigate(url: &str, new_page: bool) -> PageActionType {
        PageActionType::Navigate {
            url: ScraperValue::literal(url),
            new_page,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_navigate_opens_and_reuses_pages() {
        let browser = Arc::new(StaticBrowser::new(Arc::new(shop())));
        let executor = PageActionExecutor::new(browser.clone(), &fast_config());
        let store = MemoryDataStore::new();
        let ctx = ResolveContext::new(&store, &executor, None);

        let first = executor.execute(0, &navigate("https://shop.test/", false), &ctx).await.unwrap();
        assert_eq!(first.opened_page, Some(0));

        let again = executor.execute(0, &navigate("https://shop.test/deals", false), &ctx).await.unwrap();
        assert_eq!(again.opened_page, None);

        let second = executor.execute(0, &navigate("https://shop.test/", true), &ctx).await.unwrap();
        assert_eq!(second.opened_page, Some(1));

        assert_eq!(executor.read_text(0, "h1").await.unwrap(), "Deals");
        assert_eq!(executor.read_text(1, "h1").await.unwrap(), "Shop");

        let err = executor.read_text(2, "h1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PageIndexOutOfRange);
        let err = executor.read_text(0, "h2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ElementNotFound);

        executor.close_all().await;
        assert_eq!(executor.page_count().await, 0);
    }

    #[tokio::test]
    async fn test_smart_click_requires_locator() {
        let browser = Arc::new(StaticBrowser::new(Arc::new(shop())));
        let executor = PageActionExecutor::new(browser.clone(), &fast_config());
        let store = MemoryDataStore::new();
        let ctx = ResolveContext::new(&store, &executor, None);
        executor.execute(0, &navigate("https://shop.test/", false), &ctx).await.unwrap();

        let smart = PageActionType::SmartClick {
            description: "deals".into(),
        };
        let err = executor.execute(0, &smart, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FeatureUnavailable);
    }

    #[tokio::test]
    async fn test_click_falls_back_to_locator() {
        let browser = Arc::new(StaticBrowser::new(Arc::new(shop())));
        let executor = PageActionExecutor::new(browser.clone(), &fast_config())
            .with_locator(Arc::new(KeywordLocator::new()), simplifier::DEFAULT_MAX_BYTES);
        let store = MemoryDataStore::new();
        let ctx = ResolveContext::new(&store, &executor, None);
        executor.execute(0, &navigate("https://shop.test/", false), &ctx).await.unwrap();

        let click = PageActionType::Click {
            selector: "#deals".into(),
            smart_fallback: Some("today's deals".into()),
            timeout_ms: None,
        };
        executor.execute(0, &click, &ctx).await.unwrap();
        assert_eq!(executor.read_text(0, "h1").await.unwrap(), "Deals");
        assert!(browser
            .history()
            .await
            .contains(&r#"page1 click a[href$="/deals"]"#.to_string()));
    }

    #[tokio::test]
    async fn test_slow_navigation_times_out() {
        let source = shop().with_latency(Duration::from_millis(200));
        let executor = PageActionExecutor::new(Arc::new(StaticBrowser::new(Arc::new(source))), &fast_config());
        let store = MemoryDataStore::new();
        let ctx = ResolveContext::new(&store, &executor, None);

        let action = PageActionType::Navigate {
            url: ScraperValue::literal("https://shop.test/"),
            new_page: false,
            timeout_ms: Some(20),
        };
        let err = executor.execute(0, &action, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NavigationTimeout);
    }

    /// A browser whose pages never finish opening
    struct StuckBrowser;

    #[async_trait]
    impl BrowserDriver for StuckBrowser {
        async fn new_page(&self) -> ScraperResult<Box<dyn PageDriver>> {
            futures::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_page_open_is_bounded() {
        let config = BrowserConfig {
            navigation_timeout_ms: 30,
            ..fast_config()
        };
        let executor = PageActionExecutor::new(Arc::new(StuckBrowser), &config);
        let store = MemoryDataStore::new();
        let ctx = ResolveContext::new(&store, &executor, None);

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(0, &navigate("https://shop.test/", false), &ctx),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NavigationTimeout);
        assert_eq!(executor.page_count().await, 0);
    }

    #[tokio::test]
    async fn test_navigate_to_unopened_index_fails() {
        let browser = Arc::new(StaticBrowser::new(Arc::new(shop())));
        let executor = PageActionExecutor::new(browser.clone(), &fast_config());
        let store = MemoryDataStore::new();
        let ctx = ResolveContext::new(&store, &executor, None);

        let err = executor
            .execute(3, &navigate("https://shop.test/", false), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PageIndexOutOfRange);
        assert_eq!(executor.page_count().await, 0);
        assert!(browser.history().await.is_empty());

        let opened = executor.execute(3, &navigate("https://shop.test/", true), &ctx).await.unwrap();
        assert_eq!(opened.opened_page, Some(0));
    }

    #[tokio::test]
    async fn test_type_resolves_text() {
        let executor = PageActionExecutor::new(Arc::new(StaticBrowser::new(Arc::new(shop()))), &fast_config());
        let store = MemoryDataStore::new();
        let ctx = ResolveContext::new(&store, &executor, None);
        executor.execute(0, &navigate("https://shop.test/", false), &ctx).await.unwrap();

        let action = PageActionType::Type {
            selector: "input[name=q]".into(),
            text: ScraperValue::literal(42),
            clear: true,
            timeout_ms: None,
        };
        executor.execute(0, &action, &ctx).await.unwrap();
        assert_eq!(
            executor.read_attribute(0, "input[name=q]", "value").await.unwrap().as_deref(),
            Some("42")
        );

        let wait = PageActionType::Wait {
            duration_ms: None,
            selector: Some(".never".into()),
            timeout_ms: Some(30),
        };
        let err = executor.execute(0, &wait, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ElementNotFound);
    }
}
