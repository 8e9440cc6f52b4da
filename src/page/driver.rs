use async_trait::async_trait;
use serde_json::Value;

use crate::error::ScraperResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollTarget<'a> {
    Top,
    Bottom,
    Element(&'a str),
}

/// One addressable page or tab
///
/// Calls are not bounded by the driver itself; the page action executor
/// wraps every call in its own timeout.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> ScraperResult<()>;

    async fn current_url(&self) -> ScraperResult<Option<String>>;

    /// Serialized markup of the current document
    async fn content(&self) -> ScraperResult<String>;

    async fn exists(&self, selector: &str) -> ScraperResult<bool>;

    async fn click(&self, selector: &str) -> ScraperResult<()>;

    async fn type_text(&self, selector: &str, text: &str, clear: bool) -> ScraperResult<()>;

    async fn scroll(&self, target: ScrollTarget<'_>) -> ScraperResult<()>;

    async fn evaluate(&self, script: &str) -> ScraperResult<Value>;

    /// `None` when no element matches
    async fn text_content(&self, selector: &str) -> ScraperResult<Option<String>>;

    /// `None` when no element matches or it lacks the attribute
    async fn attribute(&self, selector: &str, name: &str) -> ScraperResult<Option<String>>;

    async fn delete_cookies(&self) -> ScraperResult<()>;

    async fn close(&self) -> ScraperResult<()>;
}

/// Opens pages; each run owns the pages it opens
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn new_page(&self) -> ScraperResult<Box<dyn PageDriver>>;

    fn name(&self) -> &'static str;
}
