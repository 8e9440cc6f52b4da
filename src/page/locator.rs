use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::debug;

use crate::config::AiConfig;
use crate::error::ScraperResult;

/// AI-assisted element location from a simplified page snapshot
#[async_trait]
pub trait ElementLocator: Send + Sync {
    /// Checked before every use; an unavailable locator is never queried
    async fn is_available(&self) -> bool;

    /// A CSS selector for the element `instruction` describes, if any
    async fn locate(&self, snapshot: &str, instruction: &str) -> ScraperResult<Option<String>>;
}

const CANDIDATES: &str = "a, button, input, textarea, select, [role=button]";

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "to", "on", "of", "and", "or", "for", "in", "at", "with", "please", "click", "press",
    "tap", "select", "choose", "button", "link", "field", "element",
];

/// Ranks interactive elements by word overlap with the instruction
///
/// Runs locally without a model, so it is available whenever AI-assisted
/// actions are enabled.
#[derive(Debug, Default)]
pub struct KeywordLocator;

impl KeywordLocator {
    pub fn new() -> Self {
        Self
    }

    pub fn from_config(config: &AiConfig) -> Option<Self> {
        config.enabled.then(Self::new)
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn element_words(element: ElementRef<'_>) -> HashSet<String> {
    let value = element.value();
    let mut text: String = element.text().collect::<Vec<_>>().join(" ");
    for attr in ["id", "name", "placeholder", "title", "alt", "value", "data-testid", "type", "href"] {
        if let Some(v) = value.attr(attr) {
            text.push(' ');
            text.push_str(v);
        }
    }
    tokens(&text).into_iter().collect()
}

fn css_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn is_plain_ident(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Path of `:nth-of-type` steps from `<html>`
fn structural_path(element: ElementRef<'_>) -> String {
    let mut steps = Vec::new();
    let mut current = Some(element);

    while let Some(el) = current {
        let name = el.value().name();
        let position = el
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .filter(|sibling| sibling.value().name() == name)
            .count()
            + 1;
        steps.push(if name == "html" {
            name.to_string()
        } else {
            format!("{}:nth-of-type({})", name, position)
        });
        current = el.parent().and_then(ElementRef::wrap);
    }

    steps.reverse();
    steps.join(" > ")
}

/// Candidate selectors for `element`, most stable first
fn selector_candidates(element: ElementRef<'_>) -> Vec<String> {
    let value = element.value();
    let tag = value.name();
    let mut candidates = Vec::new();

    if let Some(id) = value.attr("id").filter(|id| is_plain_ident(id)) {
        candidates.push(format!("#{}", id));
    }
    for attr in ["data-testid", "name", "placeholder", "title", "value"] {
        if let Some(v) = value.attr(attr).filter(|v| !v.is_empty()) {
            candidates.push(format!("{}[{}=\"{}\"]", tag, attr, css_escape(v)));
        }
    }
    if let Some(href) = value.attr("href") {
        // Snapshot links are absolute while the live page may use relative ones
        let suffix = url::Url::parse(href)
            .ok()
            .map(|u| {
                let mut path = u.path().to_string();
                if let Some(query) = u.query() {
                    path.push('?');
                    path.push_str(query);
                }
                path
            })
            .unwrap_or_else(|| href.to_string());
        if !suffix.is_empty() && suffix != "/" {
            candidates.push(format!("{}[href$=\"{}\"]", tag, css_escape(&suffix)));
        }
    }
    candidates.push(structural_path(element));
    candidates
}

/// First candidate that selects exactly `element` first in the snapshot
fn unique_selector(document: &Html, element: ElementRef<'_>) -> Option<String> {
    selector_candidates(element).into_iter().find(|candidate| {
        Selector::parse(candidate)
            .ok()
            .and_then(|selector| document.select(&selector).next())
            .is_some_and(|first| first.id() == element.id())
    })
}

/// Synchronous core of [`KeywordLocator::locate`]
pub fn locate_in_snapshot(snapshot: &str, instruction: &str) -> Option<String> {
    let wanted: Vec<String> = tokens(instruction);
    if wanted.is_empty() {
        return None;
    }

    let document = Html::parse_document(snapshot);
    let candidates = Selector::parse(CANDIDATES).ok()?;

    let mut best: Option<(usize, ElementRef<'_>)> = None;
    for element in document.select(&candidates) {
        let words = element_words(element);
        let score = wanted.iter().filter(|w| words.contains(*w)).count();
        if score > 0 && best.map_or(true, |(top, _)| score > top) {
            best = Some((score, element));
        }
    }

    let (score, element) = best?;
    debug!("Best keyword match scored {}/{}", score, wanted.len());
    unique_selector(&document, element)
}

#[async_trait]
impl ElementLocator for KeywordLocator {
    async fn is_available(&self) -> bool {
        true
    }

    async fn locate(&self, snapshot: &str, instruction: &str) -> ScraperResult<Option<String>> {
        Ok(locate_in_snapshot(snapshot, instruction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = r#"<html><head></head><body>
        <nav><a href="https://shop.test/">Home</a><a href="https://shop.test/cart">Cart</a></nav>
        <form><input name="q" placeholder="Search products"><button>Go</button></form>
        <div><button>Add to basket</button><button>Add to wishlist</button></div>
    </body></html>"#;

    #[test]
    fn test_prefers_best_overlap() {
        let selector = locate_in_snapshot(SNAPSHOT, "Click the add to wishlist button").unwrap();
        assert_eq!(selector, "html > body:nth-of-type(1) > div:nth-of-type(1) > button:nth-of-type(2)");
    }

    #[test]
    fn test_attribute_selectors() {
        assert_eq!(
            locate_in_snapshot(SNAPSHOT, "search products").as_deref(),
            Some(r#"input[name="q"]"#)
        );
        assert_eq!(
            locate_in_snapshot(SNAPSHOT, "open the cart").as_deref(),
            Some(r#"a[href$="/cart"]"#)
        );
    }

    #[test]
    fn test_no_match() {
        assert_eq!(locate_in_snapshot(SNAPSHOT, "logout"), None);
        assert_eq!(locate_in_snapshot(SNAPSHOT, "click the button"), None);
    }

    #[tokio::test]
    async fn test_disabled_by_config() {
        let mut config = crate::config::AppConfig::default().ai;
        assert!(KeywordLocator::from_config(&config).is_none());
        config.enabled = true;
        let locator = KeywordLocator::from_config(&config).unwrap();
        assert!(locator.is_available().await);
    }
}
