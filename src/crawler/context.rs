use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::browser::{BrowserCookie, PageDriver};
use crate::crawler::errors::ModeError;
use crate::crawler::scheduler::random_between;
use crate::modes::ModeDescriptor;
use crate::net::RetryClient;
use crate::proxy::{Interceptor, InterceptorError};

/// Browser-side resources owned by one mode run
#[derive(Default)]
pub struct Session {
    driver: Option<Box<dyn PageDriver>>,
    interceptor: Option<Interceptor>,
}

impl Session {
    pub fn new(driver: Option<Box<dyn PageDriver>>, interceptor: Option<Interceptor>) -> Self {
        Self { driver, interceptor }
    }

    /// Session without browser nor interceptor, for HTTP-only modes
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn has_browser(&self) -> bool {
        self.driver.is_some()
    }

    pub fn interceptor(&self) -> Option<&Interceptor> {
        self.interceptor.as_ref()
    }

    /// Drop traffic captured by earlier invocations
    pub async fn reset_capture(&self) {
        if let Some(interceptor) = &self.interceptor {
            interceptor.clear().await;
        }
    }

    /// Quit the browser and stop the interceptor; safe to call twice
    pub async fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.close().await {
                warn!("{}", e);
            }
        }

        if let Some(mut interceptor) = self.interceptor.take() {
            interceptor.stop().await;
        }
    }
}

/// Creates the session a mode runs with
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, mode: &ModeDescriptor) -> Result<Session, ModeError>;
}

/// Launcher without a browser backend; browser modes are refused
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpOnly;

#[async_trait]
impl SessionLauncher for HttpOnly {
    async fn launch(&self, mode: &ModeDescriptor) -> Result<Session, ModeError> {
        if mode.uses_browser() {
            return Err(ModeError::Browser(format!(
                "mode '{}' needs a browser but no browser backend is configured",
                mode.name()
            )));
        }
        Ok(Session::detached())
    }
}

/// Cookies and local storage of the current origin, kept between page loads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserState {
    pub cookies: Vec<BrowserCookie>,
    pub local_storage: BTreeMap<String, String>,
}

/// What a handler gets to work with during one invocation
pub struct ModeContext<'a> {
    mode: &'a str,
    session: &'a Session,
    http: &'a RetryClient,
}

impl<'a> ModeContext<'a> {
    pub fn new(mode: &'a str, session: &'a Session, http: &'a RetryClient) -> Self {
        Self { mode, session, http }
    }

    /// Name of the running mode
    pub fn mode(&self) -> &str {
        self.mode
    }

    pub fn http(&self) -> &RetryClient {
        self.http
    }

    pub fn driver(&self) -> Result<&dyn PageDriver, ModeError> {
        self.session.driver.as_deref().ok_or_else(|| {
            ModeError::Browser(format!(
                "mode '{}' has no browser session; declare it with_browser()",
                self.mode
            ))
        })
    }

    pub fn interceptor(&self) -> Result<&Interceptor, ModeError> {
        self.session
            .interceptor
            .as_ref()
            .ok_or(ModeError::Interceptor(InterceptorError::NotRunning))
    }

    /// Navigate with a fresh capture, so the interceptor only holds this page's traffic
    pub async fn load_page(&self, url: &str) -> Result<(), ModeError> {
        self.session.reset_capture().await;
        self.driver()?.navigate(url).await
    }

    /// Click `selector` once it is displayed; fails without clicking if it never shows up within `wait`
    pub async fn click(&self, selector: &str, wait: Duration) -> Result<(), ModeError> {
        let driver = self.driver()?;
        if !driver.is_visible(selector, wait).await? {
            return Err(ModeError::Page(format!(
                "'{}' was not visible after {}ms",
                selector,
                wait.as_millis()
            )));
        }
        driver.click(selector).await
    }

    pub async fn reload(&self) -> Result<(), ModeError> {
        self.session.reset_capture().await;
        self.driver()?.refresh().await
    }

    pub async fn go_back(&self) -> Result<(), ModeError> {
        self.session.reset_capture().await;
        self.driver()?.back().await
    }

    pub async fn go_forward(&self) -> Result<(), ModeError> {
        self.session.reset_capture().await;
        self.driver()?.forward().await
    }

    pub async fn save_state(&self) -> Result<BrowserState, ModeError> {
        let driver = self.driver()?;
        Ok(BrowserState {
            cookies: driver.cookies().await?,
            local_storage: driver.local_storage().await?,
        })
    }

    /// Replace the current origin's cookies and local storage with `state`
    pub async fn restore_state(&self, state: &BrowserState) -> Result<(), ModeError> {
        let driver = self.driver()?;
        driver.delete_cookies().await?;
        driver.add_cookies(&state.cookies).await?;
        driver.clear_local_storage().await?;
        driver.set_local_storage(&state.local_storage).await
    }

    /// Random pause between `min` and `max`
    pub async fn pause(&self, min: Duration, max: Duration) {
        let delay = random_between(min, max);
        debug!("[{}] Pausing {}ms", self.mode, delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::MockPageDriver;
    use crate::net::{RetryPolicy, Transport};
    use std::sync::Arc;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn send(
            &self,
            _request: crate::net::HttpRequest,
        ) -> Result<crate::net::HttpResponse, crate::net::TransportError> {
            Err(crate::net::TransportError::Connect("offline".into()))
        }
    }

    fn http() -> RetryClient {
        RetryClient::new(Arc::new(Offline), RetryPolicy::default())
    }

    #[test]
    fn test_detached_session_has_no_driver() {
        let session = Session::detached();
        let http = http();
        let ctx = ModeContext::new("links", &session, &http);

        assert!(matches!(ctx.driver(), Err(ModeError::Browser(_))));
        assert!(matches!(
            ctx.interceptor(),
            Err(ModeError::Interceptor(InterceptorError::NotRunning))
        ));
        assert_eq!(ctx.mode(), "links");
    }

    #[tokio::test]
    async fn test_load_page_navigates_driver() {
        let mut driver = MockPageDriver::new();
        driver
            .expect_navigate()
            .withf(|url| url.to_string() == "https://example.com/")
            .times(1)
            .returning(|_| Ok(()));
        driver.expect_close().times(1).returning(|| Ok(()));

        let mut session = Session::new(Some(Box::new(driver)), None);
        let http = http();
        {
            let ctx = ModeContext::new("pages", &session, &http);
            ctx.load_page("https://example.com/").await.unwrap();
        }

        session.close().await;
        assert!(!session.has_browser());
        // Second close is a no-op
        session.close().await;
    }

    #[tokio::test]
    async fn test_click_waits_for_visibility() {
        let mut driver = MockPageDriver::new();
        driver
            .expect_is_visible()
            .withf(|selector, _| selector == "#accept")
            .times(1)
            .returning(|_, _| Ok(true));
        driver
            .expect_is_visible()
            .withf(|selector, _| selector == "#missing")
            .times(1)
            .returning(|_, _| Ok(false));
        driver
            .expect_click()
            .withf(|selector| selector == "#accept")
            .times(1)
            .returning(|_| Ok(()));

        let session = Session::new(Some(Box::new(driver)), None);
        let http = http();
        let ctx = ModeContext::new("pages", &session, &http);

        ctx.click("#accept", Duration::from_secs(1)).await.unwrap();
        let err = ctx.click("#missing", Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, ModeError::Page(ref message) if message.contains("#missing")));
    }

    #[tokio::test]
    async fn test_history_calls_reach_driver() {
        let mut driver = MockPageDriver::new();
        driver.expect_refresh().times(1).returning(|| Ok(()));
        driver.expect_back().times(1).returning(|| Ok(()));
        driver.expect_forward().times(1).returning(|| Ok(()));

        let session = Session::new(Some(Box::new(driver)), None);
        let http = http();
        let ctx = ModeContext::new("pages", &session, &http);

        ctx.reload().await.unwrap();
        ctx.go_back().await.unwrap();
        ctx.go_forward().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_restores_what_was_saved() {
        let mut saved_storage = BTreeMap::new();
        saved_storage.insert("token".to_string(), "abc".to_string());
        let storage = saved_storage.clone();

        let mut driver = MockPageDriver::new();
        driver
            .expect_cookies()
            .times(1)
            .returning(|| Ok(vec![BrowserCookie::new("sid", "42")]));
        driver
            .expect_local_storage()
            .times(1)
            .returning(move || Ok(storage.clone()));
        driver.expect_delete_cookies().times(1).returning(|| Ok(()));
        driver
            .expect_add_cookies()
            .withf(|cookies| cookies.len() == 1 && cookies[0].name == "sid" && cookies[0].value == "42")
            .times(1)
            .returning(|_| Ok(()));
        driver.expect_clear_local_storage().times(1).returning(|| Ok(()));
        driver
            .expect_set_local_storage()
            .withf(|items| items.get("token").map(String::as_str) == Some("abc"))
            .times(1)
            .returning(|_| Ok(()));

        let session = Session::new(Some(Box::new(driver)), None);
        let http = http();
        let ctx = ModeContext::new("pages", &session, &http);

        let state = ctx.save_state().await.unwrap();
        assert_eq!(state.local_storage, saved_storage);
        ctx.restore_state(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_only_refuses_browser_modes() {
        struct Noop;

        #[async_trait]
        impl crate::modes::Producer for Noop {
            async fn produce(
                &self,
                _ctx: &mut ModeContext<'_>,
            ) -> Result<Vec<crate::modes::Document>, ModeError> {
                Ok(Vec::new())
            }
        }

        let launcher = HttpOnly;
        let browser_mode = ModeDescriptor::producer("pages", Noop).with_browser();
        assert!(matches!(launcher.launch(&browser_mode).await, Err(ModeError::Browser(_))));

        let http_mode = ModeDescriptor::producer("seeds", Noop);
        assert!(!launcher.launch(&http_mode).await.unwrap().has_browser());
    }
}
