pub mod retry;
pub mod transport;

// Re-export common types
pub use retry::{RequestError, RequestOptions, RetryClient, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Ordered header collection with case-insensitive lookup.
///
/// Original casing is kept for display and forwarding, but every lookup,
/// insertion and removal compares names ASCII case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name`, in insertion order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set `name`, replacing any existing value regardless of casing
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Add a value without touching existing ones (e.g. repeated `Set-Cookie`)
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Media type of the `Content-Type` header, lowercased and without parameters
    pub fn content_type(&self) -> Option<String> {
        self.get("content-type").map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Copy from a reqwest/hyper header map; non UTF-8 values are decoded lossily
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Self::new();
        for (name, value) in map {
            headers.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        headers
    }

    /// Build a header map, skipping entries that are not valid HTTP headers
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.0 {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json; charset=utf-8");

        assert_eq!(headers.get("content-type"), Some("application/json; charset=utf-8"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json; charset=utf-8"));
        assert_eq!(headers.content_type().as_deref(), Some("application/json"));
    }

    #[test]
    fn test_insert_replaces_other_casing() {
        let mut headers = Headers::new();
        headers.insert("x-token", "a");
        headers.insert("X-Token", "b");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-token"), Some("b"));

        headers.append("set-cookie", "a=1");
        headers.append("Set-Cookie", "b=2");
        assert_eq!(headers.get_all("SET-COOKIE").count(), 2);
    }

    #[test]
    fn test_header_map_round_trip_keeps_values() {
        let headers: Headers = vec![("Accept", "text/html"), ("X-Requested-With", "XMLHttpRequest")]
            .into_iter()
            .collect();

        let map = headers.to_header_map();
        assert_eq!(map.get("accept").and_then(|v| v.to_str().ok()), Some("text/html"));

        let back = Headers::from_header_map(&map);
        assert_eq!(back.get("x-requested-with"), Some("XMLHttpRequest"));
    }
}
