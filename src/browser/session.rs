use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thirtyfour::prelude::*;
use thirtyfour::Cookie;
use tracing::{debug, error, info};

use crate::browser::behavior::human_scroll;
use crate::browser::{BrowserCookie, ElementData, PageDriver};
use crate::cli::config::{BrowserSettings, InterceptorSettings};
use crate::crawler::context::{Session, SessionLauncher};
use crate::crawler::errors::ModeError;
use crate::modes::ModeDescriptor;
use crate::proxy::Interceptor;

/// Messages WebDriver uses once the browser itself is gone
const SESSION_LOST: &[&str] = &[
    "invalid session id",
    "chrome not reachable",
    "session deleted",
    "no such window",
    "disconnected",
    "connection refused",
];

/// Map a WebDriver failure to a page error, or a browser error when the session is lost
fn driver_error(action: &str, e: WebDriverError) -> ModeError {
    let message = format!("{}: {}", action, e);
    let lowered = message.to_lowercase();
    if SESSION_LOST.iter().any(|needle| lowered.contains(needle)) {
        ModeError::Browser(message)
    } else {
        ModeError::Page(message)
    }
}

const READ_LOCAL_STORAGE: &str = "return Object.assign({}, window.localStorage);";
const WRITE_LOCAL_STORAGE: &str =
    "for (const [key, value] of Object.entries(arguments[0])) { window.localStorage.setItem(key, value); }";
const CLEAR_LOCAL_STORAGE: &str = "window.localStorage.clear();";

/// Flatten a script result into storage entries; non-string values keep their JSON text
fn storage_entries(value: Value) -> BTreeMap<String, String> {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(text) => (key, text),
                other => (key, other.to_string()),
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn to_webdriver_cookie(cookie: &BrowserCookie) -> Cookie<'static> {
    let mut converted = Cookie::new(cookie.name.clone(), cookie.value.clone());
    if let Some(domain) = &cookie.domain {
        converted.set_domain(domain.clone());
    }
    if let Some(path) = &cookie.path {
        converted.set_path(path.clone());
    }
    converted.set_secure(cookie.secure);
    converted
}

fn from_webdriver_cookie(cookie: &Cookie<'_>) -> BrowserCookie {
    BrowserCookie {
        name: cookie.name().to_string(),
        value: cookie.value().to_string(),
        domain: cookie.domain().map(str::to_string),
        path: cookie.path().map(str::to_string),
        secure: cookie.secure().unwrap_or(false),
    }
}

/// Chrome arguments for a session, optionally routed through a proxy
pub fn chrome_arguments(config: &BrowserSettings, proxy: Option<&str>) -> Vec<String> {
    let mut args = vec![
        format!("--window-size={},{}", config.window_width, config.window_height),
        format!("--lang={}", config.lang),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={}", user_agent));
    }

    if let Some(proxy) = proxy {
        args.push(format!("--proxy-server={}", proxy));
        // Chrome skips the proxy for loopback hosts unless told otherwise
        args.push("--proxy-bypass-list=<-loopback>".to_string());
    }

    args.extend(config.arguments.iter().cloned());
    args
}

/// WebDriver-backed browser session
pub struct BrowserSession {
    driver: Option<WebDriver>,
}

impl BrowserSession {
    /// Start a Chrome session on the configured WebDriver server
    pub async fn connect(config: &BrowserSettings, proxy: Option<&str>) -> Result<Self, ModeError> {
        let mut caps = DesiredCapabilities::chrome();

        for arg in chrome_arguments(config, proxy) {
            caps.add_chrome_arg(&arg)
                .map_err(|e| driver_error("Invalid Chrome argument", e))?;
        }

        if config.headless {
            caps.set_headless()
                .map_err(|e| driver_error("Cannot enable headless mode", e))?;
        }

        caps.add_chrome_option("excludeSwitches", serde_json::json!(["enable-automation"]))
            .map_err(|e| driver_error("Cannot set Chrome options", e))?;
        caps.add_chrome_option("useAutomationExtension", false)
            .map_err(|e| driver_error("Cannot set Chrome options", e))?;

        let driver = WebDriver::new(&config.webdriver_url, caps)
            .await
            .map_err(|e| ModeError::Browser(format!("Failed to connect to WebDriver at {}: {}", config.webdriver_url, e)))?;

        if let Err(e) = driver
            .set_page_load_timeout(Duration::from_secs(config.page_load_timeout_secs))
            .await
        {
            driver.quit().await.ok();
            return Err(ModeError::Browser(format!("Failed to set page load timeout: {}", e)));
        }

        info!("Browser session started on {}", config.webdriver_url);

        Ok(Self { driver: Some(driver) })
    }

    fn driver(&self) -> Result<&WebDriver, ModeError> {
        self.driver
            .as_ref()
            .ok_or_else(|| ModeError::Browser("browser session already closed".to_string()))
    }

    async fn element_data(element: &WebElement) -> Result<ElementData, ModeError> {
        let text = element
            .text()
            .await
            .map_err(|e| driver_error("Failed to read element text", e))?;
        let html = element
            .outer_html()
            .await
            .map_err(|e| driver_error("Failed to read element HTML", e))?;
        Ok(ElementData { text, html })
    }
}

#[async_trait]
impl PageDriver for BrowserSession {
    async fn navigate(&self, url: &str) -> Result<(), ModeError> {
        debug!("Navigating to: {}", url);
        self.driver()?
            .goto(url)
            .await
            .map_err(|e| driver_error(&format!("Failed to navigate to URL: {}", url), e))
    }

    async fn query(&self, selector: &str) -> Result<Vec<ElementData>, ModeError> {
        let elements = self
            .driver()?
            .find_all(By::Css(selector))
            .await
            .map_err(|e| driver_error(&format!("Failed to query '{}'", selector), e))?;

        let mut data = Vec::with_capacity(elements.len());
        for element in &elements {
            data.push(Self::element_data(element).await?);
        }
        Ok(data)
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<ElementData, ModeError> {
        let element = self
            .driver()?
            .query(By::Css(selector))
            .wait(timeout, Duration::from_millis(250))
            .first()
            .await
            .map_err(|e| driver_error(&format!("Element not found: {}", selector), e))?;

        Self::element_data(&element).await
    }

    async fn title(&self) -> Result<String, ModeError> {
        self.driver()?
            .title()
            .await
            .map_err(|e| driver_error("Failed to get page title", e))
    }

    async fn current_url(&self) -> Result<String, ModeError> {
        self.driver()?
            .current_url()
            .await
            .map(|url| url.to_string())
            .map_err(|e| driver_error("Failed to get current URL", e))
    }

    async fn source(&self) -> Result<String, ModeError> {
        self.driver()?
            .source()
            .await
            .map_err(|e| driver_error("Failed to get page source", e))
    }

    async fn execute(&self, script: &str) -> Result<serde_json::Value, ModeError> {
        let result = self
            .driver()?
            .execute(script, Vec::new())
            .await
            .map_err(|e| driver_error("Failed to execute JavaScript", e))?;

        Ok(result.json().clone())
    }

    async fn scroll(&self, distance: i64) -> Result<(), ModeError> {
        human_scroll(self.driver()?, distance)
            .await
            .map_err(|e| driver_error("Failed to scroll", e))
    }

    async fn scroll_to(&self, selector: &str) -> Result<(), ModeError> {
        let element = self
            .driver()?
            .find(By::Css(selector))
            .await
            .map_err(|e| driver_error(&format!("Element not found: {}", selector), e))?;
        element
            .scroll_into_view()
            .await
            .map_err(|e| driver_error(&format!("Failed to scroll to '{}'", selector), e))
    }

    async fn click(&self, selector: &str) -> Result<(), ModeError> {
        debug!("Clicking {}", selector);
        let element = self
            .driver()?
            .find(By::Css(selector))
            .await
            .map_err(|e| driver_error(&format!("Element not found: {}", selector), e))?;
        element
            .click()
            .await
            .map_err(|e| driver_error(&format!("Failed to click '{}'", selector), e))
    }

    async fn is_visible(&self, selector: &str, timeout: Duration) -> Result<bool, ModeError> {
        self.driver()?
            .query(By::Css(selector))
            .wait(timeout, Duration::from_millis(250))
            .and_displayed()
            .exists()
            .await
            .map_err(|e| driver_error(&format!("Failed to check visibility of '{}'", selector), e))
    }

    async fn refresh(&self) -> Result<(), ModeError> {
        self.driver()?
            .refresh()
            .await
            .map_err(|e| driver_error("Failed to refresh page", e))
    }

    async fn back(&self) -> Result<(), ModeError> {
        self.driver()?
            .back()
            .await
            .map_err(|e| driver_error("Failed to navigate back", e))
    }

    async fn forward(&self) -> Result<(), ModeError> {
        self.driver()?
            .forward()
            .await
            .map_err(|e| driver_error("Failed to navigate forward", e))
    }

    async fn cookies(&self) -> Result<Vec<BrowserCookie>, ModeError> {
        let cookies = self
            .driver()?
            .get_all_cookies()
            .await
            .map_err(|e| driver_error("Failed to read cookies", e))?;
        Ok(cookies.iter().map(from_webdriver_cookie).collect())
    }

    async fn add_cookies(&self, cookies: &[BrowserCookie]) -> Result<(), ModeError> {
        let driver = self.driver()?;
        for cookie in cookies {
            driver
                .add_cookie(to_webdriver_cookie(cookie))
                .await
                .map_err(|e| driver_error(&format!("Failed to add cookie '{}'", cookie.name), e))?;
        }
        Ok(())
    }

    async fn delete_cookies(&self) -> Result<(), ModeError> {
        self.driver()?
            .delete_all_cookies()
            .await
            .map_err(|e| driver_error("Failed to delete cookies", e))
    }

    async fn local_storage(&self) -> Result<BTreeMap<String, String>, ModeError> {
        Ok(storage_entries(self.execute(READ_LOCAL_STORAGE).await?))
    }

    async fn set_local_storage(&self, items: &BTreeMap<String, String>) -> Result<(), ModeError> {
        let entries: serde_json::Map<String, Value> = items
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();

        self.driver()?
            .execute(WRITE_LOCAL_STORAGE, vec![Value::Object(entries)])
            .await
            .map(|_| ())
            .map_err(|e| driver_error("Failed to write local storage", e))
    }

    async fn clear_local_storage(&self) -> Result<(), ModeError> {
        self.execute(CLEAR_LOCAL_STORAGE).await.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), ModeError> {
        if let Some(driver) = self.driver.take() {
            driver
                .quit()
                .await
                .map_err(|e| ModeError::Browser(format!("Error closing browser session: {}", e)))?;
            debug!("Browser session closed");
        }
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Spawn a task to quit the driver
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing browser session during drop: {}", e);
                }
            });
        }
    }
}

/// Starts the interceptor and a Chrome session routed through it for browser modes
pub struct BrowserLauncher {
    browser: BrowserSettings,
    interceptor: InterceptorSettings,
}

impl BrowserLauncher {
    pub fn new(browser: BrowserSettings, interceptor: InterceptorSettings) -> Self {
        Self { browser, interceptor }
    }
}

#[async_trait]
impl SessionLauncher for BrowserLauncher {
    async fn launch(&self, mode: &ModeDescriptor) -> Result<Session, ModeError> {
        if !mode.uses_browser() {
            return Ok(Session::detached());
        }

        let mut interceptor = if self.interceptor.enabled {
            Some(Interceptor::start_with(&self.interceptor).await?)
        } else {
            None
        };

        let proxy = interceptor.as_ref().map(Interceptor::proxy_url);
        match BrowserSession::connect(&self.browser, proxy.as_deref()).await {
            Ok(driver) => Ok(Session::new(Some(Box::new(driver)), interceptor)),
            Err(e) => {
                if let Some(interceptor) = interceptor.as_mut() {
                    interceptor.stop().await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrome_arguments_route_through_proxy() {
        let config = BrowserSettings {
            user_agent: Some("TestBot/1.0".to_string()),
            arguments: vec!["--disable-dev-shm-usage".to_string()],
            ..BrowserSettings::default()
        };

        let args = chrome_arguments(&config, Some("http://127.0.0.1:8080"));

        assert!(args.contains(&"--window-size=1920,1080".to_string()));
        assert!(args.contains(&"--lang=en".to_string()));
        assert!(args.contains(&"--user-agent=TestBot/1.0".to_string()));
        assert!(args.contains(&"--proxy-server=http://127.0.0.1:8080".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--disable-dev-shm-usage"));
    }

    #[test]
    fn test_storage_entries_keep_strings() {
        let entries = storage_entries(serde_json::json!({"token": "abc", "visits": 3}));

        assert_eq!(entries.get("token").map(String::as_str), Some("abc"));
        assert_eq!(entries.get("visits").map(String::as_str), Some("3"));
        assert!(storage_entries(Value::Null).is_empty());
    }

    #[test]
    fn test_cookie_conversion_keeps_scope() {
        let cookie = BrowserCookie {
            domain: Some(".example.com".to_string()),
            path: Some("/".to_string()),
            secure: true,
            ..BrowserCookie::new("sid", "42")
        };

        assert_eq!(from_webdriver_cookie(&to_webdriver_cookie(&cookie)), cookie);
    }

    #[test]
    fn test_no_proxy_arguments_without_interceptor() {
        let args = chrome_arguments(&BrowserSettings::default(), None);
        assert!(!args.iter().any(|a| a.starts_with("--proxy")));
    }

    #[tokio::test]
    async fn test_http_modes_get_a_detached_session() {
        struct Noop;

        #[async_trait]
        impl crate::modes::Producer for Noop {
            async fn produce(
                &self,
                _ctx: &mut crate::crawler::context::ModeContext<'_>,
            ) -> Result<Vec<crate::modes::Document>, ModeError> {
                Ok(Vec::new())
            }
        }

        let launcher = BrowserLauncher::new(BrowserSettings::default(), InterceptorSettings::default());
        let session = launcher
            .launch(&ModeDescriptor::producer("seeds", Noop))
            .await
            .unwrap();

        assert!(!session.has_browser());
        assert!(session.interceptor().is_none());
    }
}
