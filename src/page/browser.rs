#[cfg(feature = "browser")]
use async_trait::async_trait;
#[cfg(feature = "browser")]
use playwright::api::{Browser, BrowserContext, Page};
#[cfg(feature = "browser")]
use playwright::Playwright;
#[cfg(feature = "browser")]
use serde_json::Value;
#[cfg(feature = "browser")]
use tracing::{debug, warn};

use std::sync::Arc;

use super::driver::BrowserDriver;
#[cfg(feature = "browser")]
use super::driver::{PageDriver, ScrollTarget};
use super::static_driver::StaticBrowser;
use crate::config::{BrowserConfig, DriverKind};
#[cfg(feature = "browser")]
use crate::error::ScraperError;
use crate::error::ScraperResult;

#[cfg(feature = "browser")]
fn driver_error(e: impl std::fmt::Display) -> ScraperError {
    ScraperError::browser(e.to_string())
}

/// Chromium driven through Playwright; every page gets its own context
#[cfg(feature = "browser")]
pub struct PlaywrightBrowser {
    _playwright: Playwright,
    browser: Browser,
    user_agent: String,
}

// Ensure PlaywrightBrowser is Send + Sync
#[cfg(feature = "browser")]
unsafe impl Send for PlaywrightBrowser {}
#[cfg(feature = "browser")]
unsafe impl Sync for PlaywrightBrowser {}

#[cfg(feature = "browser")]
impl PlaywrightBrowser {
    pub async fn launch(config: &BrowserConfig) -> ScraperResult<Self> {
        debug!("Launching Chromium (headless: {})", config.headless);

        let playwright = Playwright::initialize().await.map_err(driver_error)?;
        let browser = playwright
            .chromium()
            .launcher()
            .headless(config.headless)
            .launch()
            .await
            .map_err(driver_error)?;

        Ok(Self {
            _playwright: playwright,
            browser,
            user_agent: config.user_agent.clone(),
        })
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl BrowserDriver for PlaywrightBrowser {
    async fn new_page(&self) -> ScraperResult<Box<dyn PageDriver>> {
        let context = self
            .browser
            .context_builder()
            .user_agent(&self.user_agent)
            .build()
            .await
            .map_err(driver_error)?;
        let page = context.new_page().await.map_err(driver_error)?;
        Ok(Box::new(PlaywrightPage { context, page }))
    }

    fn name(&self) -> &'static str {
        "playwright"
    }
}

#[cfg(feature = "browser")]
struct PlaywrightPage {
    context: BrowserContext,
    page: Page,
}

#[cfg(feature = "browser")]
unsafe impl Send for PlaywrightPage {}
#[cfg(feature = "browser")]
unsafe impl Sync for PlaywrightPage {}

#[cfg(feature = "browser")]
impl PlaywrightPage {
    async fn eval<T: serde::Serialize + Send>(&self, script: &str, arg: T) -> ScraperResult<Value> {
        self.page
            .evaluate::<T, Value>(script, arg)
            .await
            .map_err(driver_error)
    }

    async fn require(&self, selector: &str) -> ScraperResult<()> {
        if self.exists(selector).await? {
            Ok(())
        } else {
            Err(ScraperError::browser(format!("no element matches '{}'", selector)))
        }
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl PageDriver for PlaywrightPage {
    async fn navigate(&self, url: &str) -> ScraperResult<()> {
        self.page.goto_builder(url).goto().await.map_err(driver_error)?;
        Ok(())
    }

    async fn current_url(&self) -> ScraperResult<Option<String>> {
        let href = self.eval("() => window.location.href", ()).await?;
        Ok(href.as_str().filter(|h| *h != "about:blank").map(str::to_string))
    }

    async fn content(&self) -> ScraperResult<String> {
        let html = self.eval("() => document.documentElement.outerHTML", ()).await?;
        Ok(html.as_str().unwrap_or_default().to_string())
    }

    async fn exists(&self, selector: &str) -> ScraperResult<bool> {
        let found = self
            .eval(
                "s => { try { return document.querySelector(s) !== null; } catch (e) { return null; } }",
                selector,
            )
            .await?;
        found.as_bool().ok_or_else(|| ScraperError::InvalidSelector {
            selector: selector.to_string(),
        })
    }

    async fn click(&self, selector: &str) -> ScraperResult<()> {
        self.require(selector).await?;
        self.eval("s => document.querySelector(s).click()", selector).await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str, clear: bool) -> ScraperResult<()> {
        self.require(selector).await?;
        let script = r#"([s, text, clear]) => {
            const el = document.querySelector(s);
            el.focus();
            el.value = clear ? text : (el.value || '') + text;
            el.dispatchEvent(new Event('input', { bubbles: true }));
            el.dispatchEvent(new Event('change', { bubbles: true }));
        }"#;
        self.eval(script, (selector, text, clear)).await?;
        Ok(())
    }

    async fn scroll(&self, target: ScrollTarget<'_>) -> ScraperResult<()> {
        match target {
            ScrollTarget::Top => self.eval("() => window.scrollTo(0, 0)", ()).await?,
            ScrollTarget::Bottom => {
                self.eval("() => window.scrollTo(0, document.body.scrollHeight)", ())
                    .await?
            }
            ScrollTarget::Element(selector) => {
                self.require(selector).await?;
                self.eval("s => document.querySelector(s).scrollIntoView()", selector)
                    .await?
            }
        };
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> ScraperResult<Value> {
        self.eval(script, ()).await
    }

    async fn text_content(&self, selector: &str) -> ScraperResult<Option<String>> {
        let script = r#"s => {
            const el = document.querySelector(s);
            if (!el) return null;
            if (el.tagName === 'INPUT' || el.tagName === 'TEXTAREA') return el.value;
            return (el.textContent || '').trim();
        }"#;
        let text = self.eval(script, selector).await?;
        Ok(text.as_str().map(str::to_string))
    }

    async fn attribute(&self, selector: &str, name: &str) -> ScraperResult<Option<String>> {
        let script = r#"([s, name]) => {
            const el = document.querySelector(s);
            if (!el) return null;
            if (name === 'value' && 'value' in el) return el.value;
            return el.getAttribute(name);
        }"#;
        let value = self.eval(script, (selector, name)).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn delete_cookies(&self) -> ScraperResult<()> {
        self.context.clear_cookies().await.map_err(driver_error)
    }

    async fn close(&self) -> ScraperResult<()> {
        if let Err(e) = self.context.close().await {
            warn!("Failed to close browser context: {}", e);
        }
        Ok(())
    }
}

/// Connects the driver selected in the configuration
pub async fn launch_browser(config: &BrowserConfig) -> ScraperResult<Arc<dyn BrowserDriver>> {
    match config.driver {
        DriverKind::Static => Ok(Arc::new(StaticBrowser::http(config)?)),
        #[cfg(feature = "browser")]
        DriverKind::Playwright => Ok(Arc::new(PlaywrightBrowser::launch(config).await?)),
        #[cfg(not(feature = "browser"))]
        DriverKind::Playwright => Err(crate::error::ScraperError::unavailable(
            "the playwright driver requires the 'browser' feature",
        )),
    }
}
