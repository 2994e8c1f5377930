pub mod behavior;
pub mod session;

// Re-export common types
pub use session::{BrowserLauncher, BrowserSession};

use async_trait::async_trait;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::crawler::errors::ModeError;

/// Snapshot of a DOM element returned by a query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ElementData {
    pub text: String,
    /// Outer HTML
    pub html: String,
}

impl ElementData {
    pub fn new(text: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            html: html.into(),
        }
    }

    /// Attribute of the element itself, read from its outer HTML
    pub fn attr(&self, name: &str) -> Option<String> {
        let fragment = Html::parse_fragment(&self.html);
        let element = fragment
            .root_element()
            .children()
            .find_map(ElementRef::wrap)?;
        element.value().attr(name).map(str::to_string)
    }
}

/// Cookie as exchanged with the browser
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: bool,
}

impl BrowserCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

/// Browser capability used by mode handlers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), ModeError>;

    /// Elements matching a CSS selector, possibly none
    async fn query(&self, selector: &str) -> Result<Vec<ElementData>, ModeError>;

    /// First element matching `selector`, waiting up to `timeout` for it to appear
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<ElementData, ModeError>;

    async fn title(&self) -> Result<String, ModeError>;

    async fn current_url(&self) -> Result<String, ModeError>;

    async fn source(&self) -> Result<String, ModeError>;

    /// Run a script in the page and return its JSON result
    async fn execute(&self, script: &str) -> Result<serde_json::Value, ModeError>;

    /// Scroll vertically by `distance` pixels (negative scrolls up)
    async fn scroll(&self, distance: i64) -> Result<(), ModeError>;

    async fn scroll_to(&self, selector: &str) -> Result<(), ModeError>;

    async fn click(&self, selector: &str) -> Result<(), ModeError>;

    /// Whether an element matching `selector` is displayed within `timeout`
    async fn is_visible(&self, selector: &str, timeout: Duration) -> Result<bool, ModeError>;

    async fn refresh(&self) -> Result<(), ModeError>;

    async fn back(&self) -> Result<(), ModeError>;

    async fn forward(&self) -> Result<(), ModeError>;

    async fn cookies(&self) -> Result<Vec<BrowserCookie>, ModeError>;

    async fn add_cookies(&self, cookies: &[BrowserCookie]) -> Result<(), ModeError>;

    async fn delete_cookies(&self) -> Result<(), ModeError>;

    async fn local_storage(&self) -> Result<BTreeMap<String, String>, ModeError>;

    async fn set_local_storage(&self, items: &BTreeMap<String, String>) -> Result<(), ModeError>;

    async fn clear_local_storage(&self) -> Result<(), ModeError>;

    async fn close(&mut self) -> Result<(), ModeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_reads_outer_element() {
        let link = ElementData::new("Next", r#"<a href="/page/2" class="next"><span>Next</span></a>"#);

        assert_eq!(link.attr("href").as_deref(), Some("/page/2"));
        assert_eq!(link.attr("class").as_deref(), Some("next"));
        assert_eq!(link.attr("title"), None);
    }

    #[test]
    fn test_cookie_json_omits_unset_scope() {
        let cookie = BrowserCookie::new("consent", "yes");
        assert_eq!(
            serde_json::to_value(&cookie).unwrap(),
            serde_json::json!({"name": "consent", "value": "yes", "secure": false})
        );

        let parsed: BrowserCookie =
            serde_json::from_str(r#"{"name": "sid", "value": "1", "domain": ".example.com"}"#).unwrap();
        assert_eq!(parsed.domain.as_deref(), Some(".example.com"));
        assert!(!parsed.secure);
    }

    #[test]
    fn test_attr_on_empty_html() {
        assert_eq!(ElementData::default().attr("href"), None);
    }
}
