//! Modes shipped with the `relay` binary: a small crawl pipeline
//! `seeds -> links -> {pages, traffic}`.

use anyhow::anyhow;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::{CrawlSettings, ScraperConfig};
use crate::crawler::context::ModeContext;
use crate::crawler::errors::ModeError;
use crate::crawler::scheduler::{normalize_url, LinkFilter};
use crate::modes::{Document, ModeDescriptor, ModeRegistry, Producer, RegistryError, Transformer};

/// Register every built-in mode
pub fn register_all(registry: &mut ModeRegistry, config: &ScraperConfig) -> Result<(), RegistryError> {
    registry.register(ModeDescriptor::producer("seeds", Seeds::new(&config.crawl)))?;
    registry.register(ModeDescriptor::transformer("links", "seeds", Links::new(&config.crawl)))?;
    registry.register(ModeDescriptor::transformer("pages", "links", Pages).with_browser())?;
    registry.register(ModeDescriptor::transformer("traffic", "links", Traffic).with_browser())?;
    Ok(())
}

/// Start URLs from `crawl.seeds`
pub struct Seeds {
    seeds: Vec<String>,
}

impl Seeds {
    pub fn new(settings: &CrawlSettings) -> Self {
        Self {
            seeds: settings.seeds.clone(),
        }
    }
}

#[async_trait]
impl Producer for Seeds {
    async fn produce(&self, _ctx: &mut ModeContext<'_>) -> Result<Vec<Document>, ModeError> {
        if self.seeds.is_empty() {
            return Err(ModeError::Handler(anyhow!("crawl.seeds is empty")));
        }

        let mut records = Vec::with_capacity(self.seeds.len());
        for seed in &self.seeds {
            match Url::parse(seed) {
                Ok(url) => records.push(Document::new(url.to_string())),
                Err(e) => warn!("Skipping invalid seed {}: {}", seed, e),
            }
        }
        Ok(records)
    }
}

/// Fetches each page over HTTP and emits the links worth following
pub struct Links {
    filter: Mutex<LinkFilter>,
}

impl Links {
    pub fn new(settings: &CrawlSettings) -> Self {
        Self {
            filter: Mutex::new(LinkFilter::new(settings)),
        }
    }
}

/// Absolute targets and anchor texts of every `a[href]` in `html`
pub fn extract_links(html: &str, base: &Url) -> Vec<(Url, String)> {
    let document = Html::parse_document(html);
    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(_) => return Vec::new(),
    };

    document
        .select(&selector)
        .filter_map(|anchor| {
            let href = anchor.value().attr("href")?;
            let target = base.join(href.trim()).ok()?;
            let text = anchor.text().collect::<Vec<_>>().join(" ");
            Some((target, text.split_whitespace().collect::<Vec<_>>().join(" ")))
        })
        .collect()
}

#[async_trait]
impl Transformer for Links {
    async fn transform(
        &self,
        ctx: &mut ModeContext<'_>,
        input: Document,
    ) -> Result<Vec<Document>, ModeError> {
        let response = ctx.http().get(&input.link).await?;
        if !response.ok() {
            return Err(ModeError::page(format!(
                "HTTP status {} for {}",
                response.status, input.link
            )));
        }

        let base = Url::parse(&response.url)
            .map_err(|e| ModeError::page(format!("Bad final URL {}: {}", response.url, e)))?;
        let candidates = extract_links(&response.text(), &base);

        let mut filter = self.filter.lock().await;
        let records: Vec<Document> = candidates
            .into_iter()
            .filter(|(target, _)| filter.accept(target.as_str()))
            .map(|(target, text)| {
                Document::new(normalize_url(&target))
                    .with("source", input.link.clone())
                    .with("text", text)
            })
            .collect();

        debug!("Found {} new links on {}", records.len(), input.link);
        Ok(records)
    }
}

/// Loads each link in the browser and records what it ended up on
pub struct Pages;

#[async_trait]
impl Transformer for Pages {
    async fn transform(
        &self,
        ctx: &mut ModeContext<'_>,
        input: Document,
    ) -> Result<Vec<Document>, ModeError> {
        ctx.load_page(&input.link).await?;

        let driver = ctx.driver()?;
        driver.scroll(600).await?;
        let title = driver.title().await?;
        let final_url = driver.current_url().await?;

        Ok(vec![Document::new(input.link)
            .with("title", title)
            .with("final_url", final_url)])
    }
}

/// Loads each link and reports the background fetch/XHR endpoints it called
pub struct Traffic;

#[async_trait]
impl Transformer for Traffic {
    async fn transform(
        &self,
        ctx: &mut ModeContext<'_>,
        input: Document,
    ) -> Result<Vec<Document>, ModeError> {
        ctx.load_page(&input.link).await?;
        // Give late XHRs a chance to land
        ctx.pause(Duration::from_millis(1500), Duration::from_millis(2500)).await;

        let interceptor = ctx.interceptor()?;
        let captured = interceptor.requests().await;
        let endpoints: Vec<serde_json::Value> = interceptor
            .fetches()
            .await
            .iter()
            .map(|r| json!({ "url": r.url, "method": r.method, "status": r.status() }))
            .collect();

        debug!(
            "{}: {} fetch calls out of {} captured requests",
            input.link,
            endpoints.len(),
            captured.len()
        );

        Ok(vec![Document::new(input.link)
            .with("endpoints", endpoints)
            .with("captured", captured.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::HttpSettings;
    use crate::crawler::context::Session;
    use crate::net::{ReqwestTransport, RetryClient, RetryPolicy};
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> RetryClient {
        let transport = ReqwestTransport::new(&HttpSettings::default()).unwrap();
        RetryClient::new(Arc::new(transport), RetryPolicy::fixed(1, Duration::ZERO))
    }

    #[test]
    fn test_register_all() {
        let mut registry = ModeRegistry::new();
        register_all(&mut registry, &ScraperConfig::default()).unwrap();

        assert_eq!(registry.names(), vec!["links", "pages", "seeds", "traffic"]);
        assert!(registry.resolve("traffic").unwrap().uses_browser());
        assert!(!registry.resolve("links").unwrap().uses_browser());
        assert_eq!(registry.validate_chain("pages").unwrap().len(), 3);
    }

    #[test]
    fn test_extract_links_resolves_relative_targets() {
        let base = Url::parse("https://example.com/blog/").unwrap();
        let html = r#"
            <a href="/about">About   us</a>
            <a href="post-1.html"><b>First</b> post</a>
            <a>no target</a>
            <a href="https://other.org/x">Elsewhere</a>
        "#;

        let links = extract_links(html, &base);
        let targets: Vec<&str> = links.iter().map(|(url, _)| url.as_str()).collect();

        assert_eq!(
            targets,
            vec![
                "https://example.com/about",
                "https://example.com/blog/post-1.html",
                "https://other.org/x"
            ]
        );
        assert_eq!(links[0].1, "About us");
        assert_eq!(links[1].1, "First post");
    }

    #[tokio::test]
    async fn test_seeds_skip_invalid_urls() {
        let settings = CrawlSettings {
            seeds: vec!["https://example.com".into(), "not a url".into()],
            ..CrawlSettings::default()
        };
        let session = Session::detached();
        let http = http();
        let mut ctx = ModeContext::new("seeds", &session, &http);

        let records = Seeds::new(&settings).produce(&mut ctx).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].link, "https://example.com/");

        let empty = Seeds::new(&CrawlSettings::default()).produce(&mut ctx).await;
        assert!(matches!(empty, Err(ModeError::Handler(_))));
    }

    #[tokio::test]
    async fn test_links_follow_filters_across_records() {
        let server = MockServer::start().await;
        let page = r#"<html><body>
            <a href="/a">A</a>
            <a href="/b#top">B</a>
            <a href="/c/?page=2&amp;lang=en">C</a>
            <a href="/logo.png">Logo</a>
            <a href="https://elsewhere.org/">Out</a>
        </body></html>"#;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(page, "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(r#"<a href="/b">B again</a>"#, "text/html"))
            .mount(&server)
            .await;

        let settings = CrawlSettings {
            allowed_domains: vec!["127.0.0.1".into()],
            exclude: vec![r"\.png$".into()],
            ..CrawlSettings::default()
        };
        let links = Links::new(&settings);
        let session = Session::detached();
        let http = http();
        let mut ctx = ModeContext::new("links", &session, &http);

        let first = links
            .transform(&mut ctx, Document::new(format!("{}/", server.uri())))
            .await
            .unwrap();
        let targets: Vec<String> = first.iter().map(|d| d.link.clone()).collect();
        assert_eq!(
            targets,
            vec![
                format!("{}/a", server.uri()),
                format!("{}/b", server.uri()),
                format!("{}/c?lang=en&page=2", server.uri()),
            ]
        );
        assert_eq!(first[0].get_str("text"), Some("A"));

        // /b was already accepted from the first page
        let second = links
            .transform(&mut ctx, Document::new(format!("{}/a", server.uri())))
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_links_error_status_fails_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let links = Links::new(&CrawlSettings::default());
        let session = Session::detached();
        let http = http();
        let mut ctx = ModeContext::new("links", &session, &http);

        let result = links
            .transform(&mut ctx, Document::new(format!("{}/gone", server.uri())))
            .await;
        assert!(matches!(result, Err(ModeError::Page(_))));
    }
}
