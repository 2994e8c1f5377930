use rand::Rng;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::CrawlSettings;

/// Randomized pause between consecutive handler invocations
#[derive(Debug, Clone)]
pub struct Throttle {
    min: Duration,
    max: Duration,
    started: bool,
}

impl Throttle {
    pub fn new(min: Duration, max: Duration) -> Self {
        // Swapped bounds are tolerated rather than rejected
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            started: false,
        }
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    /// Delay to wait before the next invocation; `None` before the first one
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.started {
            self.started = true;
            return None;
        }

        Some(random_between(self.min, self.max))
    }

    /// Sleep for [`next_delay`](Self::next_delay)
    pub async fn pause(&mut self) {
        if let Some(delay) = self.next_delay() {
            debug!("Throttling for {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
        }
    }
}

/// Uniformly random duration in `[min, max]`
pub fn random_between(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }

    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Decides which discovered links are worth following
pub struct LinkFilter {
    /// Set of already seen URLs to avoid duplicates
    seen_urls: HashSet<String>,

    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,

    /// Allowed domains (if empty, any domain is allowed)
    allowed_domains: HashSet<String>,
}

fn compile(patterns: &[String], label: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Invalid {} pattern '{}': {}", label, pattern, e);
                None
            }
        })
        .collect()
}

impl LinkFilter {
    pub fn new(settings: &CrawlSettings) -> Self {
        Self {
            seen_urls: HashSet::new(),
            include_patterns: compile(&settings.include, "include"),
            exclude_patterns: compile(&settings.exclude, "exclude"),
            allowed_domains: settings
                .allowed_domains
                .iter()
                .map(|domain| domain.to_lowercase())
                .collect(),
        }
    }

    /// Whether `url` passes the filters and has not been accepted before
    pub fn accept(&mut self, url: &str) -> bool {
        let parsed = match Url::parse(url) {
            Ok(url) => url,
            Err(e) => {
                debug!("Skipping invalid URL {}: {}", url, e);
                return false;
            }
        };

        if !matches!(parsed.scheme(), "http" | "https") {
            debug!("Skipping non-HTTP URL: {}", url);
            return false;
        }

        let normalized = normalize_url(&parsed);

        if self.seen_urls.contains(&normalized) {
            debug!("Skipping already seen URL: {}", normalized);
            return false;
        }

        if !self.allowed_domains.is_empty() {
            let host = parsed.host_str().unwrap_or_default();
            let allowed = self
                .allowed_domains
                .iter()
                .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)));
            if !allowed {
                debug!("Skipping URL from non-allowed domain: {}", host);
                return false;
            }
        }

        if self.exclude_patterns.iter().any(|p| p.is_match(&normalized)) {
            debug!("Skipping URL matching exclusion pattern: {}", normalized);
            return false;
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(&normalized))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", normalized);
            return false;
        }

        self.seen_urls.insert(normalized);
        true
    }

    pub fn seen_count(&self) -> usize {
        self.seen_urls.len()
    }
}

/// Canonical form used for duplicate detection.
///
/// The url crate already lowercases the host and drops default ports;
/// on top of that the fragment goes, query pairs are sorted and a
/// trailing slash on a non-root path is removed.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut pairs: Vec<(String, String)> = normalized
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        pairs.sort();
        normalized.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(path.trim_end_matches('/'));
    }

    normalized.to_string()
}
